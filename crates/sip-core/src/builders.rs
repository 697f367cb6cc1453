// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Constructors for messages the transaction layer generates on its own:
//! responses to a received request (100 Trying, 408, 503) and the ACK for a
//! non-2xx final response (RFC 3261 §17.1.1.3).

use bytes::Bytes;

use crate::{
    headers::Headers,
    method::Method,
    msg::{MessageError, Request, RequestLine, Response, StatusLine},
};

const DIALOG_HEADERS: [&str; 4] = ["From", "To", "Call-ID", "CSeq"];

/// Builds a response to `request` that mirrors its Via stack and dialog headers.
///
/// # Errors
///
/// Fails when the code or reason phrase is not acceptable for a status line.
pub fn make_response(request: &Request, code: u16, reason: &str) -> Result<Response, MessageError> {
    let status = StatusLine::new(code, reason)?;
    let mut headers = Headers::new();
    for via in request.headers().get_all("Via") {
        headers.push("Via", via.clone());
    }
    for name in DIALOG_HEADERS {
        if let Some(value) = request.headers().get(name) {
            headers.push(name, value.clone());
        }
    }
    headers.push("Content-Length", "0");
    Response::new(status, headers, Bytes::new())
}

/// Builds the ACK a client INVITE transaction sends for a 3xx-6xx response.
///
/// The ACK reuses the INVITE's Request-URI, top Via, From, Call-ID and Route
/// set, takes To from the response (it carries the remote tag), and keeps the
/// INVITE's CSeq number.
///
/// # Errors
///
/// Fails with [`MessageError::MissingHeader`] when the INVITE lacks a Via or
/// a parseable CSeq.
pub fn make_failure_ack(invite: &Request, response: &Response) -> Result<Request, MessageError> {
    let invite_headers = invite.headers();
    let mut headers = Headers::new();

    let via = invite_headers
        .get("Via")
        .ok_or(MessageError::MissingHeader("Via"))?;
    headers.push("Via", via.clone());
    if let Some(from) = invite_headers.get("From") {
        headers.push("From", from.clone());
    }
    if let Some(to) = response.headers().get("To").or_else(|| invite_headers.get("To")) {
        headers.push("To", to.clone());
    }
    if let Some(call_id) = invite_headers.get("Call-ID") {
        headers.push("Call-ID", call_id.clone());
    }
    let (number, _) = invite_headers
        .get("CSeq")
        .and_then(|v| crate::msg::parse_cseq(v))
        .ok_or(MessageError::MissingHeader("CSeq"))?;
    headers.push("CSeq", format!("{} ACK", number));
    for route in invite_headers.get_all("Route") {
        headers.push("Route", route.clone());
    }
    headers.push("Max-Forwards", "70");
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Ack, invite.uri()),
        headers,
        Bytes::new(),
    )
}
