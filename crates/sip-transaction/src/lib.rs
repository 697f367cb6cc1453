// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer.
//!
//! Four pure state machines ([`fsm`]) wrapped in a [`Transaction`] sum type,
//! stored in a [`TransactionTable`] and driven by the single-worker
//! [`TransactionEngine`]. Machines never touch sockets or clocks: they return
//! [`fsm::Action`]s that the engine applies through its collaborators.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::{distributions::Alphanumeric, Rng};
use sip_core::{parse_cseq, Headers, Method, Request, Response, SipMessage};
use smol_str::SmolStr;

pub mod engine;
pub mod fsm;
pub mod metrics;
pub mod table;
pub mod timers;
pub mod transaction;

pub use engine::{
    EngineConfig, EngineInput, TimerFired, TimerService, TokioTimerService, TransactionEngine,
    TransactionLimits, TuCommand, TuEvent,
};
pub use metrics::{TransactionKind, TransactionMetrics, TransactionOutcome};
pub use fsm::{
    Action, ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent, ClientNonInviteFsm,
    Delivery, ServerInviteEvent, ServerInviteFsm, ServerNonInviteEvent, ServerNonInviteFsm,
};
pub use table::TransactionTable;
pub use timers::TimerDefaults;
pub use transaction::{Machine, Transaction};

/// RFC 3261 branch prefix marking a globally unique branch.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// Extracts the `branch=` parameter from a Via header string.
pub fn branch_from_via(via: &str) -> Option<&str> {
    header_param(via, "branch")
}

/// Returns the `sent-by` part of a Via value (`host[:port]`).
pub fn sent_by_from_via(via: &str) -> Option<&str> {
    let (_, rest) = via.trim().split_once(char::is_whitespace)?;
    let sent_by = rest.split(';').next()?.trim();
    (!sent_by.is_empty()).then_some(sent_by)
}

/// Returns the branch ID for the given message, if one is present.
pub fn branch_id(headers: &Headers) -> Option<SmolStr> {
    let via = headers.get("Via")?;
    let branch = branch_from_via(via)?;
    Some(SmolStr::new(branch))
}

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{}{}", MAGIC_COOKIE, suffix))
}

/// Appends a fresh magic-cookie branch to the top Via when it has none.
///
/// Returns `false` when the request has no Via to stamp.
pub fn ensure_branch(request: &mut Request) -> bool {
    let mut fields = std::mem::take(request.headers_mut()).into_inner();
    let stamped = match fields
        .iter_mut()
        .find(|h| h.name.eq_ignore_ascii_case("Via"))
    {
        Some(top) => {
            if branch_from_via(&top.value).is_none() {
                top.value = SmolStr::new(format!("{};branch={}", top.value, generate_branch_id()));
            }
            true
        }
        None => false,
    };
    *request.headers_mut() = Headers::from_vec(fields);
    stamped
}

fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    value.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let key = split.next()?.trim();
        let val = split.next()?.trim();
        key.eq_ignore_ascii_case(name).then_some(val)
    })
}

/// URI of a name-addr or addr-spec header value, parameters removed.
fn header_uri(value: &str) -> &str {
    let value = value.trim();
    if let Some(start) = value.find('<') {
        let rest = &value[start + 1..];
        return rest.split('>').next().unwrap_or(rest).trim();
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// Timers referenced by the transaction state machines (RFC 3261 §17, RFC 6026).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionTimer {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
    /// Sends 100 Trying when the TU has not answered an INVITE in time.
    Trying,
}

/// Client INVITE transaction states (RFC 3261 Figure 5, RFC 6026).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Accepted,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7, RFC 6026).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Accepted,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Unique key identifying a transaction (branch or legacy hash + method + direction).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId {
    pub key: SmolStr,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionId {
    /// Derives the id for a message.
    ///
    /// Uses the top Via branch when it carries the magic cookie and falls back
    /// to the RFC 2543 matching fields otherwise. ACK is folded onto INVITE so
    /// the ACK for a failure response finds its INVITE transaction; CANCEL keeps
    /// its own method.
    pub fn from_message(message: &SipMessage, is_server: bool) -> Option<Self> {
        match message {
            SipMessage::Request(req) => Self::derive(req.headers(), req.method().clone(), is_server),
            SipMessage::Response(res) => Self::response_id(res, is_server),
        }
    }

    /// Server-side id of an inbound request.
    pub fn for_request(request: &Request) -> Option<Self> {
        Self::derive(request.headers(), request.method().clone(), true)
    }

    /// Client-side id of a request the TU is sending.
    pub fn for_client_request(request: &Request) -> Option<Self> {
        Self::derive(request.headers(), request.method().clone(), false)
    }

    /// Client-side id a response belongs to.
    pub fn for_response(response: &Response) -> Option<Self> {
        Self::response_id(response, false)
    }

    fn response_id(response: &Response, is_server: bool) -> Option<Self> {
        let (_, method) = response.headers().get("CSeq").and_then(|v| parse_cseq(v))?;
        Self::derive(response.headers(), method, is_server)
    }

    fn derive(headers: &Headers, method: Method, is_server: bool) -> Option<Self> {
        let method = match method {
            Method::Ack => Method::Invite,
            other => other,
        };
        let key = match branch_id(headers) {
            Some(branch) if branch.starts_with(MAGIC_COOKIE) => branch,
            _ => legacy_key(headers)?,
        };
        Some(Self {
            key,
            method,
            is_server,
        })
    }

    /// The same transaction key under another method (CANCEL → INVITE lookup).
    pub fn with_method(&self, method: Method) -> Self {
        Self {
            key: self.key.clone(),
            method,
            is_server: self.is_server,
        }
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = if self.is_server { "server" } else { "client" };
        write!(f, "{}/{}/{}", self.key, self.method, role)
    }
}

/// Hash of the pre-RFC 3261 matching fields: To URI (tag removed), From tag,
/// Call-ID, CSeq number and top Via sent-by.
fn legacy_key(headers: &Headers) -> Option<SmolStr> {
    let to = header_uri(headers.get("To")?);
    let from_tag = headers
        .get("From")
        .and_then(|from| header_param(from, "tag"))
        .unwrap_or_default();
    let call_id = headers.get("Call-ID")?;
    let (number, _) = headers.get("CSeq").and_then(|v| parse_cseq(v))?;
    let sent_by = headers
        .get("Via")
        .and_then(|via| sent_by_from_via(via))
        .unwrap_or_default();

    let mut hasher = DefaultHasher::new();
    to.hash(&mut hasher);
    from_tag.hash(&mut hasher);
    call_id.as_str().hash(&mut hasher);
    number.hash(&mut hasher);
    sent_by.to_ascii_lowercase().hash(&mut hasher);
    Some(SmolStr::new(format!("legacy-{:016x}", hasher.finish())))
}
