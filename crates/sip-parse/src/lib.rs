// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Header-block scanning and serialization for SIP messages.
//!
//! The framer locates the end of a header block with [`find_head_end`], hands
//! the block to [`parse_head`], and uses [`MessageHead::content_length`] to
//! decide how many body bytes to wait for. [`parse_message`] does all three at
//! once for a self-contained datagram.

use bytes::{Bytes, BytesMut};
use memchr::memmem;
use sip_core::{
    Header, Headers, MessageError, Method, Request, RequestLine, Response, SipMessage,
    StatusLine, SIP_VERSION,
};
use smol_str::SmolStr;
use thiserror::Error;

/// Header lines accepted in one message before the block is rejected.
pub const DEFAULT_MAX_HEADERS: usize = 1024;

/// Blank line separating the header block from the body.
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

const MANDATORY_HEADERS: [&str; 5] = ["Via", "From", "To", "Call-ID", "CSeq"];
const SNIPPET_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("header block is not valid UTF-8")]
    InvalidUtf8,
    #[error("header block is not terminated by an empty line")]
    UnterminatedHead,
    #[error("malformed start line")]
    MalformedStartLine,
    #[error("malformed header line: {0:?}")]
    MalformedHeader(SmolStr),
    #[error("too many header lines (max {max})")]
    TooManyHeaders { max: usize },
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(SmolStr),
    #[error("body shorter than Content-Length (declared {declared}, available {available})")]
    TruncatedBody { declared: usize, available: usize },
    #[error("missing mandatory {0} header")]
    MissingHeader(&'static str),
    #[error("unparseable CSeq header")]
    InvalidCSeq,
    #[error("CSeq method does not match the request method")]
    CSeqMismatch,
    #[error("status code {0} outside 100-699")]
    StatusOutOfRange(u16),
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Start line of a message whose kind has been determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request(RequestLine),
    Response(StatusLine),
}

/// Parsed start line and headers of a message still waiting for its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub start: StartLine,
    pub headers: Headers,
}

impl MessageHead {
    /// Declared body length; see [`content_length`].
    pub fn content_length(&self) -> Result<usize, ParseError> {
        content_length(&self.headers)
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request(_))
    }

    /// Attaches the body, producing the finished message.
    pub fn into_message(self, body: Bytes) -> Result<SipMessage, ParseError> {
        let message = match self.start {
            StartLine::Request(line) => SipMessage::Request(Request::new(line, self.headers, body)?),
            StartLine::Response(line) => {
                SipMessage::Response(Response::new(line, self.headers, body)?)
            }
        };
        Ok(message)
    }
}

/// Returns the offset of the first CRLFCRLF at or after `from`.
pub fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    let window = buf.get(from..)?;
    memmem::find(window, HEAD_TERMINATOR).map(|pos| pos + from)
}

/// Scans a header block (start line and header lines, without the trailing
/// empty line).
///
/// Folded continuation lines (RFC 3261 §7.3.1) are joined with a single space
/// and compact header names are expanded. Any line that is not a header, a
/// continuation, or the start line rejects the whole block.
pub fn parse_head(head: &[u8], max_headers: usize) -> Result<MessageHead, ParseError> {
    let text = std::str::from_utf8(head).map_err(|_| ParseError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let first = lines.next().unwrap_or_default();
    let start = parse_start_line(first)?;
    let headers = parse_headers(lines, max_headers)?;
    Ok(MessageHead { start, headers })
}

/// Parses one self-contained message, such as a UDP datagram.
///
/// The body is sliced (not copied) out of `datagram` and truncated to the
/// declared Content-Length; a body shorter than declared is an error.
pub fn parse_message(datagram: &Bytes, max_headers: usize) -> Result<SipMessage, ParseError> {
    let head_end = find_head_end(datagram, 0).ok_or(ParseError::UnterminatedHead)?;
    let head = parse_head(&datagram[..head_end], max_headers)?;
    let declared = head.content_length()?;
    let body_start = head_end + HEAD_TERMINATOR.len();
    let available = datagram.len() - body_start;
    if declared > available {
        return Err(ParseError::TruncatedBody {
            declared,
            available,
        });
    }
    head.into_message(datagram.slice(body_start..body_start + declared))
}

/// Reads the declared body length.
///
/// A missing header or a value that is not a plain decimal number is an
/// error; repeated Content-Length headers must agree.
pub fn content_length(headers: &Headers) -> Result<usize, ParseError> {
    let mut values = headers.get_all("Content-Length");
    let first = values.next().ok_or(ParseError::MissingContentLength)?;
    let declared = parse_length_value(first)?;
    for other in values {
        if parse_length_value(other)? != declared {
            return Err(ParseError::InvalidContentLength(other.clone()));
        }
    }
    Ok(declared)
}

/// Basic sanity check applied to every framed message before it is handed to
/// the transaction layer.
pub fn check_mandatory(message: &SipMessage) -> Result<(), ParseError> {
    let headers = message.headers();
    for name in MANDATORY_HEADERS {
        if !headers.contains(name) {
            return Err(ParseError::MissingHeader(name));
        }
    }
    let (_, cseq_method) = message.cseq().ok_or(ParseError::InvalidCSeq)?;
    match message {
        SipMessage::Request(req) if req.method() != &cseq_method => Err(ParseError::CSeqMismatch),
        SipMessage::Response(res) if res.class().is_none() => {
            Err(ParseError::StatusOutOfRange(res.code()))
        }
        _ => Ok(()),
    }
}

/// Serializes a SIP request while normalising the `Content-Length` header.
pub fn serialize_request(req: &Request) -> Bytes {
    let mut buf = String::new();
    use std::fmt::Write;

    let _ = write!(
        buf,
        "{} {} {}\r\n",
        req.method().as_str(),
        req.uri(),
        SIP_VERSION
    );

    let mut has_max_forwards = false;
    for header in req.headers().iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        if header.name.eq_ignore_ascii_case("Max-Forwards") {
            has_max_forwards = true;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }

    if !has_max_forwards {
        buf.push_str("Max-Forwards: 70\r\n");
    }

    finish(buf, req.body())
}

/// Serializes a SIP response while normalising the `Content-Length` header.
pub fn serialize_response(res: &Response) -> Bytes {
    let mut buf = String::new();
    use std::fmt::Write;

    let _ = write!(buf, "{} {} {}\r\n", SIP_VERSION, res.code(), res.reason());

    for header in res.headers().iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value);
    }

    finish(buf, res.body())
}

pub fn serialize_message(message: &SipMessage) -> Bytes {
    match message {
        SipMessage::Request(req) => serialize_request(req),
        SipMessage::Response(res) => serialize_response(res),
    }
}

fn finish(mut head: String, body: &Bytes) -> Bytes {
    use std::fmt::Write;
    let _ = write!(head, "Content-Length: {}\r\n\r\n", body.len());
    let mut out = BytesMut::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body.as_ref());
    out.freeze()
}

fn parse_start_line(line: &str) -> Result<StartLine, ParseError> {
    let is_status = line
        .as_bytes()
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(b"SIP/"));
    let parsed = if is_status {
        parse_status_line(line).map(StartLine::Response)
    } else {
        parse_request_line(line).map(StartLine::Request)
    };
    parsed.ok_or(ParseError::MalformedStartLine)
}

/// Parses `Method SP Request-URI SP SIP-Version`.
fn parse_request_line(line: &str) -> Option<RequestLine> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line).ok()?;

    if !version_token.trim_end().eq_ignore_ascii_case(SIP_VERSION) {
        return None;
    }
    Some(RequestLine::new(Method::from_token(method_token), uri_token))
}

/// Parses `SIP-Version SP Status-Code SP Reason-Phrase`; the code must be
/// exactly three digits but is not range checked here.
fn parse_status_line(line: &str) -> Option<StatusLine> {
    use nom::{
        bytes::complete::{tag_no_case, take_while_m_n},
        character::complete::space1,
        combinator::{all_consuming, opt, rest},
        sequence::{preceded, tuple},
    };

    let mut parser = all_consuming(tuple((
        tag_no_case::<_, _, nom::error::Error<_>>(SIP_VERSION),
        space1::<_, nom::error::Error<_>>,
        take_while_m_n::<_, _, nom::error::Error<_>>(3, 3, |c: char| c.is_ascii_digit()),
        opt(preceded(
            space1::<_, nom::error::Error<_>>,
            rest::<_, nom::error::Error<_>>,
        )),
    )));
    let (_, (_, _, code, reason)) = parser(line.trim_end()).ok()?;
    let code = code.parse::<u16>().ok()?;
    Some(StatusLine::from_wire(code, reason.unwrap_or_default().trim()))
}

/// Parses SIP headers, handling folded continuation lines per RFC 3261 §7.3.1.
fn parse_headers<'a, I>(lines: I, max_headers: usize) -> Result<Headers, ParseError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers: Vec<Header> = Vec::new();
    let mut current: Option<(SmolStr, String)> = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.contains(&['\r', '\n'][..]) {
            return Err(ParseError::MalformedHeader(snippet(line)));
        }

        if line.starts_with(&[' ', '\t'][..]) {
            let (_, value) = current
                .as_mut()
                .ok_or_else(|| ParseError::MalformedHeader(snippet(line)))?;
            let folded = line.trim();
            if !folded.is_empty() {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(folded);
            }
            continue;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedHeader(snippet(line)))?;
        let name = name.trim_end();
        if name.is_empty() || !name.chars().all(is_token_char) {
            return Err(ParseError::MalformedHeader(snippet(line)));
        }

        if let Some((prev_name, prev_value)) = current.take() {
            headers.push(Header::new(prev_name, prev_value.trim()));
        }
        if headers.len() >= max_headers {
            return Err(ParseError::TooManyHeaders { max: max_headers });
        }
        current = Some((canonical_header_name(name), value.trim().to_owned()));
    }

    if let Some((name, value)) = current.take() {
        headers.push(Header::new(name, value.trim()));
    }

    Ok(Headers::from_vec(headers))
}

fn canonical_header_name(name: &str) -> SmolStr {
    if name.len() != 1 {
        return SmolStr::new(name);
    }
    let canonical = match name.to_ascii_lowercase().as_str() {
        "i" => "Call-ID",
        "f" => "From",
        "t" => "To",
        "m" => "Contact",
        "l" => "Content-Length",
        "s" => "Subject",
        "k" => "Supported",
        "o" => "Event",
        "e" => "Content-Encoding",
        "c" => "Content-Type",
        "v" => "Via",
        "r" => "Refer-To",
        "b" => "Referred-By",
        "x" => "Session-Expires",
        "a" => "Accept-Contact",
        "u" => "Allow-Events",
        _ => name,
    };
    SmolStr::new(canonical)
}

fn parse_length_value(value: &SmolStr) -> Result<usize, ParseError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidContentLength(value.clone()));
    }
    trimmed
        .parse::<usize>()
        .map_err(|_| ParseError::InvalidContentLength(value.clone()))
}

fn snippet(line: &str) -> SmolStr {
    let end = line
        .char_indices()
        .map(|(idx, c)| idx + c.len_utf8())
        .take_while(|end| *end <= SNIPPET_LEN)
        .last()
        .unwrap_or(0);
    SmolStr::new(&line[..end])
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '%' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '~'
        )
}

// Permissive URI character set: stop at whitespace.
fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}
