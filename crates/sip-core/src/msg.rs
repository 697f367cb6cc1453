// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method};

/// Protocol version token carried by every start line.
pub const SIP_VERSION: &str = "SIP/2.0";

const MAX_REASON_LENGTH: usize = 256;
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    InvalidStatusCode { code: u16 },
    ReasonTooLong { max: usize, actual: usize },
    InvalidReason(String),
    BodyTooLarge { max: usize, actual: usize },
    MissingHeader(&'static str),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStatusCode { code } => {
                write!(f, "invalid SIP status code: {} (must be 100-699)", code)
            }
            Self::ReasonTooLong { max, actual } => {
                write!(f, "reason phrase too long (max {}, got {})", max, actual)
            }
            Self::InvalidReason(msg) => write!(f, "invalid reason phrase: {}", msg),
            Self::BodyTooLarge { max, actual } => {
                write!(f, "body too large (max {}, got {})", max, actual)
            }
            Self::MissingHeader(name) => write!(f, "missing {} header", name),
        }
    }
}

impl std::error::Error for MessageError {}

/// Exact RFC 3261 bucketing of a status code.
///
/// Codes outside 100-699 have no class; the transaction layer ignores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseClass {
    /// 1xx
    Provisional,
    /// 2xx
    Success,
    /// 3xx-6xx
    Failure,
}

impl ResponseClass {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            100..=199 => Some(Self::Provisional),
            200..=299 => Some(Self::Success),
            300..=699 => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn is_final(self) -> bool {
        !matches!(self, Self::Provisional)
    }
}

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
///
/// The Request-URI is kept as the raw token from the wire; the transaction
/// layer only ever copies it into ACKs and CANCELs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    uri: SmolStr,
}

impl RequestLine {
    pub fn new(method: Method, uri: impl Into<SmolStr>) -> Self {
        Self {
            method,
            uri: uri.into(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason-Phrase`.
///
/// # Examples
///
/// ```
/// use sip_core::StatusLine;
///
/// let status = StatusLine::new(200, "OK").unwrap();
/// assert_eq!(status.code(), 200);
/// assert!(StatusLine::new(99, "Invalid").is_err());
/// assert!(StatusLine::new(200, "OK\r\nInjected").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    code: u16,
    reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line for a locally generated response.
    ///
    /// # Errors
    ///
    /// Fails when the code is outside 100-699 or the reason phrase contains
    /// control characters or exceeds the length limit.
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }
        let reason = reason.as_ref();
        validate_reason_phrase(reason)?;
        Ok(Self {
            code,
            reason: SmolStr::new(reason),
        })
    }

    /// Creates a status line exactly as received, without range checks.
    ///
    /// Out-of-range codes survive parsing so the sanity check and the state
    /// machines can make the drop decision themselves.
    pub fn from_wire(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn class(&self) -> Option<ResponseClass> {
        ResponseClass::from_code(self.code)
    }
}

/// A framed SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    start: RequestLine,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Builds a request from its components.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds the 10MB limit.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;
        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn start_line(&self) -> &RequestLine {
        &self.start
    }

    pub fn method(&self) -> &Method {
        self.start.method()
    }

    pub fn uri(&self) -> &str {
        self.start.uri()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_parts(self) -> (RequestLine, Headers, Bytes) {
        (self.start, self.headers, self.body)
    }
}

/// A framed SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    start: StatusLine,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Builds a response from its components.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds the 10MB limit.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;
        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn start_line(&self) -> &StatusLine {
        &self.start
    }

    pub fn code(&self) -> u16 {
        self.start.code()
    }

    pub fn reason(&self) -> &str {
        self.start.reason()
    }

    pub fn class(&self) -> Option<ResponseClass> {
        self.start.class()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_parts(self) -> (StatusLine, Headers, Bytes) {
        (self.start, self.headers, self.body)
    }
}

/// Either kind of SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => req.headers(),
            SipMessage::Response(res) => res.headers(),
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            SipMessage::Request(req) => req.body(),
            SipMessage::Response(res) => res.body(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            SipMessage::Request(req) => Some(req),
            SipMessage::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            SipMessage::Response(res) => Some(res),
            SipMessage::Request(_) => None,
        }
    }

    /// Returns the topmost Via value.
    pub fn top_via(&self) -> Option<&SmolStr> {
        self.headers().get("Via")
    }

    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers().get("Call-ID")
    }

    /// Parses the CSeq header into its sequence number and method.
    pub fn cseq(&self) -> Option<(u32, Method)> {
        parse_cseq(self.headers().get("CSeq")?)
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(res: Response) -> Self {
        SipMessage::Response(res)
    }
}

/// Traffic sharing a SIP socket that is not itself a SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonSipFrame {
    /// A CRLFCRLF keep-alive ping (RFC 5626 §3.5.1).
    KeepAlive,
    /// A complete STUN message, header included.
    Stun(Bytes),
}

/// Unit of output from the framer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Sip(SipMessage),
    NonSip(NonSipFrame),
}

/// Parses a CSeq value such as `"314159 INVITE"`.
pub fn parse_cseq(value: &str) -> Option<(u32, Method)> {
    let mut parts = value.split_whitespace();
    let number = parts.next()?.parse::<u32>().ok()?;
    let method = Method::from_token(parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    Some((number, method))
}

fn validate_reason_phrase(reason: &str) -> Result<(), MessageError> {
    if reason.len() > MAX_REASON_LENGTH {
        return Err(MessageError::ReasonTooLong {
            max: MAX_REASON_LENGTH,
            actual: reason.len(),
        });
    }
    if reason.chars().any(|c| c.is_control()) {
        return Err(MessageError::InvalidReason(
            "contains control characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_body_size(body: &Bytes) -> Result<(), MessageError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(MessageError::BodyTooLarge {
            max: MAX_BODY_SIZE,
            actual: body.len(),
        });
    }
    Ok(())
}
