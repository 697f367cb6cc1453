//! Daemon configuration: defaults, an optional JSON file, then CLI overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use sip_transaction::{EngineConfig, TimerDefaults, TransactionLimits};
use sip_transport::FramerLimits;

/// Stream framing limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    pub chunk_size: usize,
    pub max_line_length: usize,
    pub max_headers: usize,
    pub max_message_size: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        let limits = FramerLimits::default();
        Self {
            chunk_size: limits.chunk_size,
            max_line_length: limits.max_line_length,
            max_headers: limits.max_headers,
            max_message_size: limits.max_message_size,
        }
    }
}

/// Timer base values in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub trying_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        let timers = TimerDefaults::default();
        Self {
            t1_ms: timers.t1.as_millis() as u64,
            t2_ms: timers.t2.as_millis() as u64,
            t4_ms: timers.t4.as_millis() as u64,
            trying_ms: timers.trying.as_millis() as u64,
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// UDP bind address
    pub udp_bind: String,

    /// TCP bind address; `None` disables the TCP listener
    pub tcp_bind: Option<String>,

    pub framing: FramingConfig,

    pub timers: TimerConfig,

    pub max_server_transactions: usize,

    pub max_client_transactions: usize,

    /// Hand responses that match no transaction to the TU instead of dropping them
    pub report_stray_responses: bool,

    /// Open stream connections allowed at once
    pub max_connections: usize,

    /// Seconds a stream connection may stay idle before it is closed
    pub idle_timeout_secs: u64,

    /// User-Agent / Server header value
    pub user_agent: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let limits = TransactionLimits::default();
        Self {
            udp_bind: "0.0.0.0:5060".to_string(),
            tcp_bind: Some("0.0.0.0:5060".to_string()),
            framing: FramingConfig::default(),
            timers: TimerConfig::default(),
            max_server_transactions: limits.max_server_transactions,
            max_client_transactions: limits.max_client_transactions,
            report_stray_responses: false,
            max_connections: 1000,
            idle_timeout_secs: 300,
            user_agent: "siphond/0.1".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.framing.chunk_size > 0, "framing.chunk_size must be positive");
        anyhow::ensure!(self.timers.t1_ms > 0, "timers.t1_ms must be positive");
        anyhow::ensure!(
            self.timers.t2_ms >= self.timers.t1_ms,
            "timers.t2_ms must not be below timers.t1_ms"
        );
        Ok(())
    }

    pub fn framer_limits(&self) -> FramerLimits {
        FramerLimits {
            chunk_size: self.framing.chunk_size,
            max_line_length: self.framing.max_line_length,
            max_headers: self.framing.max_headers,
            max_message_size: self.framing.max_message_size,
        }
    }

    pub fn timer_defaults(&self) -> TimerDefaults {
        TimerDefaults {
            t1: Duration::from_millis(self.timers.t1_ms),
            t2: Duration::from_millis(self.timers.t2_ms),
            t4: Duration::from_millis(self.timers.t4_ms),
            trying: Duration::from_millis(self.timers.trying_ms),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            timers: self.timer_defaults(),
            limits: TransactionLimits::new(
                self.max_server_transactions,
                self.max_client_transactions,
            ),
            discard_stray_responses: !self.report_stray_responses,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_library_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.framer_limits(), FramerLimits::default());
        assert_eq!(config.engine_config(), EngineConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"udp_bind": "127.0.0.1:5080", "timers": {{"t1_ms": 100}}, "framing": {{"max_headers": 64}}}}"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.udp_bind, "127.0.0.1:5080");
        assert_eq!(config.tcp_bind.as_deref(), Some("0.0.0.0:5060"));
        assert_eq!(config.timer_defaults().t1, Duration::from_millis(100));
        assert_eq!(config.timer_defaults().t2, Duration::from_secs(4));
        assert_eq!(config.framer_limits().max_headers, 64);
        assert_eq!(config.framer_limits().chunk_size, 2048);
    }

    #[test]
    fn stray_reporting_flips_discard_flag() {
        let config = DaemonConfig::from_json(r#"{"report_stray_responses": true}"#).unwrap();
        assert!(!config.engine_config().discard_stray_responses);
    }

    #[test]
    fn null_tcp_bind_disables_tcp() {
        let config = DaemonConfig::from_json(r#"{"tcp_bind": null}"#).unwrap();
        assert!(config.tcp_bind.is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(DaemonConfig::from_json(r#"{"timers": {"t1_ms": 0}}"#).is_err());
        assert!(DaemonConfig::from_json(r#"{"timers": {"t1_ms": 5000, "t2_ms": 4000}}"#).is_err());
        assert!(DaemonConfig::from_json(r#"{"framing": {"chunk_size": 0}}"#).is_err());
        assert!(DaemonConfig::from_json("not json").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }
}
