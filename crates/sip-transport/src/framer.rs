// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Incremental message framing for stream transports.
//!
//! A [`StreamFramer`] owns the parse state of one connection. Bytes arrive in
//! arbitrary chunks through [`StreamFramer::supply_bytes`] (copying) or
//! [`StreamFramer::write_target`] + [`StreamFramer::commit_written`] (reading
//! straight into the framer's buffer); every completed frame is pushed onto the
//! inbound queue as an [`InboundMessage`].
//!
//! ```text
//! AwaitingStart
//!   ├─ CRLFCRLF            → keep-alive ping, stay
//!   ├─ CRLF + other        → keep-alive pong, consumed
//!   ├─ first byte 0..=3    → ReadingBinaryBody (STUN, 20 + length bytes)
//!   └─ otherwise           → ReadingHeaders
//! ReadingHeaders           → ReadingBody once CRLFCRLF and Content-Length are seen
//! ReadingBody / Binary     → emit, leftover re-enters AwaitingStart immediately
//! ```
//!
//! A framing error is fatal for the connection: the framer drops everything it
//! buffered and the caller closes the socket.

use bytes::{Buf, Bytes, BytesMut};
use sip_core::{MessageError, NonSipFrame, SipMessage, WireMessage};
use sip_observe::transport_metrics;
use sip_parse::{check_mandatory, find_head_end, parse_head, MessageHead, ParseError, HEAD_TERMINATOR};
use smol_str::SmolStr;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::{Endpoint, InboundMessage};

const KEEPALIVE_PING: &[u8] = b"\r\n\r\n";
const KEEPALIVE_PONG: &[u8] = b"\r\n";
const STUN_HEADER_LEN: usize = 20;

/// Buffer sizing and size limits applied while framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerLimits {
    /// Capacity of a fresh receive buffer and minimum slack kept for leftovers.
    pub chunk_size: usize,
    /// Longest header line accepted while the header block is incomplete.
    pub max_line_length: usize,
    /// Header lines allowed in one message.
    pub max_headers: usize,
    /// Largest frame (head plus body) accepted.
    pub max_message_size: usize,
}

impl Default for FramerLimits {
    fn default() -> Self {
        Self {
            chunk_size: 2048,
            max_line_length: 8 * 1024,
            max_headers: sip_parse::DEFAULT_MAX_HEADERS,
            max_message_size: 10 * 1024 * 1024,
        }
    }
}

/// Observable parse phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParsePhase {
    AwaitingStart,
    ReadingHeaders,
    ReadingBody,
    /// Length-prefixed non-SIP frame (STUN) still arriving.
    ReadingBinaryBody,
}

/// Conditions that make a byte stream unrecoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("malformed start line")]
    MalformedStartLine,
    #[error("malformed header block: {0}")]
    MalformedHeaders(ParseError),
    #[error("too many header lines (max {max})")]
    TooManyHeaders { max: usize },
    #[error("header line longer than {max} bytes")]
    HeaderLineTooLong { max: usize },
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(SmolStr),
    #[error("message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("body shorter than Content-Length (declared {declared}, available {available})")]
    TruncatedBody { declared: usize, available: usize },
    #[error("invalid binary frame length {0}")]
    InvalidBinaryFrame(usize),
    #[error("inbound queue closed")]
    QueueClosed,
}

impl From<ParseError> for FramingError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::MalformedStartLine => FramingError::MalformedStartLine,
            ParseError::TooManyHeaders { max } => FramingError::TooManyHeaders { max },
            ParseError::MissingContentLength => FramingError::MissingContentLength,
            ParseError::InvalidContentLength(value) => FramingError::InvalidContentLength(value),
            ParseError::TruncatedBody {
                declared,
                available,
            } => FramingError::TruncatedBody {
                declared,
                available,
            },
            ParseError::Message(MessageError::BodyTooLarge { max, actual }) => {
                FramingError::MessageTooLarge { size: actual, max }
            }
            other => FramingError::MalformedHeaders(other),
        }
    }
}

enum State {
    AwaitingStart,
    ReadingHeaders {
        /// Prefix of `pending` already searched for the header terminator.
        scanned: usize,
    },
    ReadingBody {
        head: MessageHead,
        body_start: usize,
        frame_len: usize,
    },
    ReadingBinaryBody,
}

enum Start {
    NeedMore,
    Ping,
    Pong,
    Binary,
    Sip,
}

/// Per-connection framer.
pub struct StreamFramer {
    endpoint: Endpoint,
    limits: FramerLimits,
    state: State,
    pending: BytesMut,
    inbound: UnboundedSender<InboundMessage>,
}

impl StreamFramer {
    pub fn new(
        endpoint: Endpoint,
        limits: FramerLimits,
        inbound: UnboundedSender<InboundMessage>,
    ) -> Self {
        Self {
            endpoint,
            limits,
            state: State::AwaitingStart,
            pending: BytesMut::new(),
            inbound,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn phase(&self) -> ParsePhase {
        match self.state {
            State::AwaitingStart => ParsePhase::AwaitingStart,
            State::ReadingHeaders { .. } => ParsePhase::ReadingHeaders,
            State::ReadingBody { .. } => ParsePhase::ReadingBody,
            State::ReadingBinaryBody => ParsePhase::ReadingBinaryBody,
        }
    }

    /// Bytes retained for the next frame.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Bytes still missing before the current body or binary frame completes;
    /// zero outside those phases.
    pub fn bytes_still_needed(&self) -> usize {
        match &self.state {
            State::ReadingBody { frame_len, .. } => frame_len.saturating_sub(self.pending.len()),
            State::ReadingBinaryBody => self
                .binary_frame_len()
                .map_or(STUN_HEADER_LEN, |len| len)
                .saturating_sub(self.pending.len()),
            _ => 0,
        }
    }

    /// Feeds one chunk read from the connection.
    ///
    /// Completed messages are queued before this returns. On error every
    /// buffered byte is discarded and the connection must be closed.
    pub fn supply_bytes(&mut self, chunk: &[u8]) -> Result<(), FramingError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.pending.extend_from_slice(chunk);
        self.after_write(chunk.len())
    }

    /// Returns the buffer the next read should append to.
    ///
    /// Between messages this is a fresh buffer of `chunk_size` capacity;
    /// mid-message it is the in-progress buffer with spare room reserved.
    pub fn write_target(&mut self) -> &mut BytesMut {
        let chunk = self.limits.chunk_size.max(1);
        if self.pending.is_empty() && matches!(self.state, State::AwaitingStart) {
            if self.pending.capacity() < chunk {
                self.pending = BytesMut::with_capacity(chunk);
            }
        } else if self.pending.capacity() - self.pending.len() < chunk {
            self.pending.reserve(chunk);
        }
        &mut self.pending
    }

    /// Parses `written` bytes that were appended to [`Self::write_target`].
    pub fn commit_written(&mut self, written: usize) -> Result<(), FramingError> {
        if written == 0 {
            return Ok(());
        }
        self.after_write(written)
    }

    /// Discards all buffered state.
    pub fn reset(&mut self) {
        self.state = State::AwaitingStart;
        self.pending = BytesMut::new();
    }

    fn after_write(&mut self, written: usize) -> Result<(), FramingError> {
        transport_metrics().on_bytes_received(self.endpoint.transport.as_str(), written);
        let result = self.drain();
        if result.is_err() {
            self.reset();
        }
        result
    }

    /// Runs the parse loop until it needs more bytes.
    fn drain(&mut self) -> Result<(), FramingError> {
        loop {
            match std::mem::replace(&mut self.state, State::AwaitingStart) {
                State::AwaitingStart => {
                    if self.pending.is_empty() {
                        return Ok(());
                    }
                    match classify_start(&self.pending) {
                        Start::NeedMore => return Ok(()),
                        Start::Ping => {
                            self.pending.advance(KEEPALIVE_PING.len());
                            transport_metrics().on_keepalive(self.endpoint.transport.as_str());
                            self.emit(WireMessage::NonSip(NonSipFrame::KeepAlive))?;
                        }
                        Start::Pong => {
                            self.pending.advance(KEEPALIVE_PONG.len());
                            debug!(peer = %self.endpoint.peer, "keep-alive pong");
                        }
                        Start::Binary => self.state = State::ReadingBinaryBody,
                        Start::Sip => self.state = State::ReadingHeaders { scanned: 0 },
                    }
                }
                State::ReadingHeaders { scanned } => {
                    let from = scanned.saturating_sub(HEAD_TERMINATOR.len() - 1);
                    let Some(head_end) = find_head_end(&self.pending, from) else {
                        self.check_incomplete_head()?;
                        self.state = State::ReadingHeaders {
                            scanned: self.pending.len(),
                        };
                        return Ok(());
                    };
                    let head = parse_head(&self.pending[..head_end], self.limits.max_headers)?;
                    let body_start = head_end + HEAD_TERMINATOR.len();
                    let frame_len = body_start + head.content_length()?;
                    if frame_len > self.limits.max_message_size {
                        return Err(FramingError::MessageTooLarge {
                            size: frame_len,
                            max: self.limits.max_message_size,
                        });
                    }
                    self.state = State::ReadingBody {
                        head,
                        body_start,
                        frame_len,
                    };
                }
                State::ReadingBody {
                    head,
                    body_start,
                    frame_len,
                } => {
                    if self.pending.len() < frame_len {
                        self.grow_towards(frame_len);
                        self.state = State::ReadingBody {
                            head,
                            body_start,
                            frame_len,
                        };
                        return Ok(());
                    }
                    let frame = self.pending.split_to(frame_len).freeze();
                    self.keep_leftover();
                    self.complete(head, frame.slice(body_start..))?;
                }
                State::ReadingBinaryBody => {
                    let Some(frame_len) = self.binary_frame_len() else {
                        self.state = State::ReadingBinaryBody;
                        return Ok(());
                    };
                    let declared = frame_len - STUN_HEADER_LEN;
                    if declared % 4 != 0 {
                        return Err(FramingError::InvalidBinaryFrame(declared));
                    }
                    if self.pending.len() < frame_len {
                        self.grow_towards(frame_len);
                        self.state = State::ReadingBinaryBody;
                        return Ok(());
                    }
                    let frame = self.pending.split_to(frame_len).freeze();
                    self.keep_leftover();
                    transport_metrics().on_stun(self.endpoint.transport.as_str());
                    self.emit(WireMessage::NonSip(NonSipFrame::Stun(frame)))?;
                }
            }
        }
    }

    /// Attaches the body and queues the message unless it fails the sanity check.
    fn complete(&mut self, head: MessageHead, body: Bytes) -> Result<(), FramingError> {
        let message = head.into_message(body)?;
        let transport = self.endpoint.transport.as_str();
        if let Err(reason) = check_mandatory(&message) {
            debug!(peer = %self.endpoint.peer, %reason, "dropping message that failed sanity check");
            transport_metrics().on_dropped(transport, "sanity");
            return Ok(());
        }
        transport_metrics().on_frame(transport, message_kind(&message));
        self.emit(WireMessage::Sip(message))
    }

    fn emit(&self, message: WireMessage) -> Result<(), FramingError> {
        self.inbound
            .send(InboundMessage {
                endpoint: self.endpoint.clone(),
                message,
            })
            .map_err(|_| FramingError::QueueClosed)
    }

    /// Rejects header blocks that can no longer become valid.
    fn check_incomplete_head(&self) -> Result<(), FramingError> {
        if self.pending.len() > self.limits.max_message_size {
            return Err(FramingError::MessageTooLarge {
                size: self.pending.len(),
                max: self.limits.max_message_size,
            });
        }
        let line_start = memchr::memmem::rfind(&self.pending, b"\r\n").map_or(0, |pos| pos + 2);
        if self.pending.len() - line_start > self.limits.max_line_length {
            return Err(FramingError::HeaderLineTooLong {
                max: self.limits.max_line_length,
            });
        }
        Ok(())
    }

    fn binary_frame_len(&self) -> Option<usize> {
        if self.pending.len() < STUN_HEADER_LEN {
            return None;
        }
        let declared = u16::from_be_bytes([self.pending[2], self.pending[3]]);
        Some(STUN_HEADER_LEN + declared as usize)
    }

    /// Grows a partial frame's buffer by half again, never past the frame size.
    fn grow_towards(&mut self, frame_len: usize) {
        let len = self.pending.len();
        let target = (len * 3 / 2).min(frame_len).max(len);
        if self.pending.capacity() < target {
            self.pending.reserve(target - len);
        }
    }

    /// Keeps the bytes after a completed frame with slack for what follows.
    fn keep_leftover(&mut self) {
        let len = self.pending.len();
        if len == 0 {
            return;
        }
        let target = (len * 3 / 2).max(self.limits.chunk_size);
        if self.pending.capacity() < target {
            self.pending.reserve(target - len);
        }
    }
}

/// Decodes one datagram.
///
/// Returns `Ok(None)` for a keep-alive pong and for SIP messages that fail the
/// sanity check; both are dropped without affecting the socket.
pub fn decode_datagram(
    datagram: &Bytes,
    limits: &FramerLimits,
) -> Result<Option<WireMessage>, FramingError> {
    if datagram.len() > limits.max_message_size {
        return Err(FramingError::MessageTooLarge {
            size: datagram.len(),
            max: limits.max_message_size,
        });
    }
    match datagram.as_ref() {
        [] => return Ok(None),
        KEEPALIVE_PING => return Ok(Some(WireMessage::NonSip(NonSipFrame::KeepAlive))),
        KEEPALIVE_PONG => return Ok(None),
        [first, ..] if *first <= 3 => {
            if datagram.len() < STUN_HEADER_LEN {
                return Err(FramingError::InvalidBinaryFrame(datagram.len()));
            }
            let declared = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
            if declared % 4 != 0 || STUN_HEADER_LEN + declared != datagram.len() {
                return Err(FramingError::InvalidBinaryFrame(declared));
            }
            return Ok(Some(WireMessage::NonSip(NonSipFrame::Stun(datagram.clone()))));
        }
        _ => {}
    }
    let message = sip_parse::parse_message(datagram, limits.max_headers)?;
    if let Err(reason) = check_mandatory(&message) {
        debug!(%reason, "dropping datagram that failed sanity check");
        return Ok(None);
    }
    Ok(Some(WireMessage::Sip(message)))
}

fn classify_start(buf: &[u8]) -> Start {
    match buf.first() {
        None => Start::NeedMore,
        Some(b'\r') => {
            let prefix = &buf[..buf.len().min(KEEPALIVE_PING.len())];
            if KEEPALIVE_PING.starts_with(prefix) {
                if prefix.len() == KEEPALIVE_PING.len() {
                    Start::Ping
                } else {
                    Start::NeedMore
                }
            } else if buf.starts_with(KEEPALIVE_PONG) {
                Start::Pong
            } else {
                Start::Sip
            }
        }
        Some(0..=3) => Start::Binary,
        Some(_) => Start::Sip,
    }
}

fn message_kind(message: &SipMessage) -> &'static str {
    if message.is_request() {
        "request"
    } else {
        "response"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportKind;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    const OPTIONS: &[u8] = b"OPTIONS sip:a@b SIP/2.0\r\n\
Via: SIP/2.0/TCP client.example.com;branch=z9hG4bK776asdhds\r\n\
From: <sip:x@example.com>;tag=1\r\n\
To: <sip:a@b>\r\n\
Call-ID: x\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";

    const MESSAGE: &[u8] = b"MESSAGE sip:a@b SIP/2.0\r\n\
Via: SIP/2.0/TCP client.example.com;branch=z9hG4bKmsg\r\n\
From: <sip:x@example.com>;tag=1\r\n\
To: <sip:a@b>\r\n\
Call-ID: y\r\n\
CSeq: 2 MESSAGE\r\n\
Content-Length: 11\r\n\r\n\
hello world";

    fn framer() -> (StreamFramer, UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = unbounded_channel();
        let endpoint = Endpoint::new(TransportKind::Tcp, "127.0.0.1:5060".parse().unwrap());
        (StreamFramer::new(endpoint, FramerLimits::default(), tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<InboundMessage>) -> Vec<WireMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg.message);
        }
        out
    }

    fn stun_binding(body_len: u16) -> Vec<u8> {
        let mut frame = vec![0x00, 0x01];
        frame.extend_from_slice(&body_len.to_be_bytes());
        frame.extend_from_slice(&0x2112_A442u32.to_be_bytes());
        frame.extend_from_slice(&[7u8; 12]);
        frame.extend(std::iter::repeat(0xAB).take(body_len as usize));
        frame
    }

    #[test]
    fn emits_complete_message_from_one_chunk() {
        let (mut framer, mut rx) = framer();
        framer.supply_bytes(MESSAGE).unwrap();
        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        let WireMessage::Sip(msg) = &out[0] else {
            panic!("expected sip message");
        };
        assert_eq!(msg.body().as_ref(), b"hello world");
        assert_eq!(framer.phase(), ParsePhase::AwaitingStart);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn waits_in_reading_body_for_the_rest() {
        let (mut framer, mut rx) = framer();
        let split = MESSAGE.len() - 4;
        framer.supply_bytes(&MESSAGE[..split]).unwrap();
        assert_eq!(framer.phase(), ParsePhase::ReadingBody);
        assert_eq!(framer.bytes_still_needed(), 4);
        assert!(drain(&mut rx).is_empty());

        framer.supply_bytes(&MESSAGE[split..]).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(framer.bytes_still_needed(), 0);
    }

    #[test]
    fn leftover_bytes_are_parsed_without_another_read() {
        let (mut framer, mut rx) = framer();
        let mut stream = OPTIONS.to_vec();
        stream.extend_from_slice(MESSAGE);
        stream.extend_from_slice(&OPTIONS[..10]);
        framer.supply_bytes(&stream).unwrap();

        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(framer.pending(), &OPTIONS[..10]);
        assert_eq!(framer.phase(), ParsePhase::ReadingHeaders);
        assert!(framer.write_target().capacity() >= FramerLimits::default().chunk_size);
    }

    #[test]
    fn keepalive_ping_is_emitted_and_parsing_continues() {
        let (mut framer, mut rx) = framer();
        let mut stream = b"\r\n\r\n".to_vec();
        stream.extend_from_slice(OPTIONS);
        framer.supply_bytes(&stream).unwrap();

        let out = drain(&mut rx);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], WireMessage::NonSip(NonSipFrame::KeepAlive));
        assert!(matches!(out[1], WireMessage::Sip(_)));
    }

    #[test]
    fn split_keepalive_waits_for_all_four_bytes() {
        let (mut framer, mut rx) = framer();
        framer.supply_bytes(b"\r\n\r").unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(framer.pending(), b"\r\n\r");
        framer.supply_bytes(b"\n").unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![WireMessage::NonSip(NonSipFrame::KeepAlive)]
        );
    }

    #[test]
    fn keepalive_pong_is_consumed_silently() {
        let (mut framer, mut rx) = framer();
        let mut stream = b"\r\n".to_vec();
        stream.extend_from_slice(OPTIONS);
        framer.supply_bytes(&stream).unwrap();
        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], WireMessage::Sip(_)));
    }

    #[test]
    fn stun_frame_is_split_off_by_length() {
        let (mut framer, mut rx) = framer();
        let stun = stun_binding(8);
        let mut stream = stun.clone();
        stream.extend_from_slice(OPTIONS);
        framer.supply_bytes(&stream[..5]).unwrap();
        assert_eq!(framer.phase(), ParsePhase::ReadingBinaryBody);
        framer.supply_bytes(&stream[5..]).unwrap();

        let out = drain(&mut rx);
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0],
            WireMessage::NonSip(NonSipFrame::Stun(Bytes::from(stun)))
        );
        assert!(matches!(out[1], WireMessage::Sip(_)));
    }

    #[test]
    fn stun_length_must_be_word_aligned() {
        let (mut framer, _rx) = framer();
        let mut bad = stun_binding(0);
        bad[3] = 3;
        assert_eq!(
            framer.supply_bytes(&bad),
            Err(FramingError::InvalidBinaryFrame(3))
        );
    }

    #[test]
    fn malformed_header_is_fatal_and_clears_state() {
        let (mut framer, mut rx) = framer();
        let err = framer
            .supply_bytes(b"OPTIONS sip:a@b SIP/2.0\r\nthis is not a header\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, FramingError::MalformedHeaders(_)));
        assert!(framer.pending().is_empty());
        assert_eq!(framer.phase(), ParsePhase::AwaitingStart);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn missing_content_length_is_fatal() {
        let (mut framer, _rx) = framer();
        let err = framer
            .supply_bytes(b"OPTIONS sip:a@b SIP/2.0\r\nCall-ID: x\r\n\r\n")
            .unwrap_err();
        assert_eq!(err, FramingError::MissingContentLength);
    }

    #[test]
    fn unparseable_content_length_is_fatal() {
        let (mut framer, _rx) = framer();
        let err = framer
            .supply_bytes(b"OPTIONS sip:a@b SIP/2.0\r\nContent-Length: ten\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, FramingError::InvalidContentLength(_)));
    }

    #[test]
    fn oversized_content_length_is_rejected_before_buffering() {
        let (tx, _rx) = unbounded_channel();
        let limits = FramerLimits {
            max_message_size: 128,
            ..FramerLimits::default()
        };
        let endpoint = Endpoint::new(TransportKind::Tcp, "127.0.0.1:5060".parse().unwrap());
        let mut framer = StreamFramer::new(endpoint, limits, tx);
        let err = framer
            .supply_bytes(b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 4096\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, FramingError::MessageTooLarge { .. }));
    }

    #[test]
    fn body_over_message_cap_reports_its_real_size() {
        let (tx, _rx) = unbounded_channel();
        let limits = FramerLimits {
            max_message_size: 16 * 1024 * 1024,
            ..FramerLimits::default()
        };
        let endpoint = Endpoint::new(TransportKind::Tcp, "127.0.0.1:5060".parse().unwrap());
        let mut framer = StreamFramer::new(endpoint, limits, tx);
        let body_len = 11 * 1024 * 1024;
        let mut stream = format!(
            "MESSAGE sip:a@b SIP/2.0\r\nVia: SIP/2.0/TCP h;branch=z9hG4bKbig\r\n\
             From: <sip:x@h>;tag=1\r\nTo: <sip:a@b>\r\nCall-ID: big\r\n\
             CSeq: 1 MESSAGE\r\nMax-Forwards: 70\r\nContent-Length: {body_len}\r\n\r\n"
        )
        .into_bytes();
        stream.resize(stream.len() + body_len, b'x');

        let err = framer.supply_bytes(&stream).unwrap_err();
        assert_eq!(
            err,
            FramingError::MessageTooLarge {
                size: body_len,
                max: 10 * 1024 * 1024,
            }
        );
    }

    #[test]
    fn other_message_errors_stay_distinct() {
        let err = FramingError::from(ParseError::Message(MessageError::InvalidStatusCode {
            code: 42,
        }));
        assert!(matches!(err, FramingError::MalformedHeaders(ParseError::Message(_))));
    }

    #[test]
    fn endless_header_line_is_rejected() {
        let (tx, _rx) = unbounded_channel();
        let limits = FramerLimits {
            max_line_length: 64,
            ..FramerLimits::default()
        };
        let endpoint = Endpoint::new(TransportKind::Tcp, "127.0.0.1:5060".parse().unwrap());
        let mut framer = StreamFramer::new(endpoint, limits, tx);
        framer.supply_bytes(b"OPTIONS sip:a@b SIP/2.0\r\nSubject: ").unwrap();
        let err = framer.supply_bytes(&[b'x'; 80]).unwrap_err();
        assert_eq!(err, FramingError::HeaderLineTooLong { max: 64 });
    }

    #[test]
    fn insane_message_is_dropped_but_stream_survives() {
        let (mut framer, mut rx) = framer();
        let mut stream =
            b"OPTIONS sip:a@b SIP/2.0\r\nCall-ID: z\r\nContent-Length: 0\r\n\r\n".to_vec();
        stream.extend_from_slice(OPTIONS);
        framer.supply_bytes(&stream).unwrap();
        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        let WireMessage::Sip(msg) = &out[0] else {
            panic!("expected sip message");
        };
        assert_eq!(msg.call_id().map(|v| v.as_str()), Some("x"));
    }

    #[test]
    fn write_target_reads_in_place() {
        let (mut framer, mut rx) = framer();
        let target = framer.write_target();
        assert!(target.capacity() >= FramerLimits::default().chunk_size);
        target.extend_from_slice(OPTIONS);
        framer.commit_written(OPTIONS.len()).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn closed_queue_is_reported() {
        let (mut framer, rx) = framer();
        drop(rx);
        assert_eq!(framer.supply_bytes(OPTIONS), Err(FramingError::QueueClosed));
    }

    #[test]
    fn datagram_keepalive_and_pong() {
        let limits = FramerLimits::default();
        assert_eq!(
            decode_datagram(&Bytes::from_static(b"\r\n\r\n"), &limits),
            Ok(Some(WireMessage::NonSip(NonSipFrame::KeepAlive)))
        );
        assert_eq!(
            decode_datagram(&Bytes::from_static(b"\r\n"), &limits),
            Ok(None)
        );
    }

    #[test]
    fn datagram_stun_must_match_declared_length() {
        let limits = FramerLimits::default();
        let good = Bytes::from(stun_binding(4));
        assert!(matches!(
            decode_datagram(&good, &limits),
            Ok(Some(WireMessage::NonSip(NonSipFrame::Stun(_))))
        ));
        let mut short = stun_binding(4);
        short.pop();
        assert!(decode_datagram(&Bytes::from(short), &limits).is_err());
    }

    #[test]
    fn datagram_without_content_length_is_rejected() {
        let limits = FramerLimits::default();
        let data = Bytes::from_static(b"OPTIONS sip:a@b SIP/2.0\r\nCall-ID: x\r\n\r\n");
        assert_eq!(
            decode_datagram(&data, &limits),
            Err(FramingError::MissingContentLength)
        );
    }
}
