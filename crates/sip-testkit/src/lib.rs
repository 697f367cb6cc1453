// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness for the framing and transaction layers.
//!
//! Provides builders for well-formed requests and responses, their wire
//! encodings, STUN frames, and helpers for feeding a byte stream in arbitrary
//! chunk sizes.
//!
//! # Example
//! ```
//! use sip_testkit::build_options;
//! let req = build_options("sip:test@example.com", "z9hG4bKtest");
//! assert_eq!(req.method().as_str(), "OPTIONS");
//! ```

use bytes::Bytes;
use sip_core::{Headers, Method, Request, RequestLine, Response, StatusLine};
use sip_parse::{serialize_request, serialize_response};
use smol_str::SmolStr;

/// Generic request with the five mandatory headers, Max-Forwards and an empty body.
pub fn build_request(method: Method, uri: &str, branch: &str, call_id: &str, cseq: u32) -> Request {
    let mut headers = Headers::new();
    headers.push(
        SmolStr::new("Via"),
        SmolStr::new(format!(
            "SIP/2.0/UDP client.example.com:5060;branch={}",
            branch
        )),
    );
    headers.push(
        SmolStr::new("From"),
        SmolStr::new("<sip:alice@example.com>;tag=1234"),
    );
    headers.push(SmolStr::new("To"), SmolStr::new(format!("<{}>", uri)));
    headers.push(SmolStr::new("Call-ID"), SmolStr::new(call_id));
    headers.push(
        SmolStr::new("CSeq"),
        SmolStr::new(format!("{} {}", cseq, method.as_str())),
    );
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
    headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));

    Request::new(RequestLine::new(method, uri), headers, Bytes::new())
        .expect("empty body is within limits")
}

/// Constructs a minimal OPTIONS request for the provided URI string.
pub fn build_options(uri: &str, branch: &str) -> Request {
    build_request(Method::Options, uri, branch, "test-callid@example.com", 1)
}

/// Constructs a minimal INVITE request for the provided URI string.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Request {
    let request = build_request(Method::Invite, uri, branch, call_id, 1);
    let (line, mut headers, body) = request.into_parts();
    headers.push(
        SmolStr::new("Contact"),
        SmolStr::new("<sip:alice@client.example.com:5060>"),
    );
    Request::new(line, headers, body).expect("empty body is within limits")
}

/// CANCEL for `invite`: same Request-URI, top Via, Call-ID and CSeq number.
pub fn build_cancel(invite: &Request) -> Request {
    let mut headers = Headers::new();
    for name in ["Via", "From", "To", "Call-ID"] {
        if let Some(value) = invite.headers().get(name) {
            headers.push(SmolStr::new(name), value.clone());
        }
    }
    let number = invite
        .headers()
        .get("CSeq")
        .and_then(|v| sip_core::parse_cseq(v))
        .map(|(n, _)| n)
        .unwrap_or(1);
    headers.push(SmolStr::new("CSeq"), SmolStr::new(format!("{} CANCEL", number)));
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
    headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));
    Request::new(
        RequestLine::new(Method::Cancel, invite.uri()),
        headers,
        Bytes::new(),
    )
    .expect("empty body is within limits")
}

/// ACK for a 2xx: a new request with its own branch, CSeq number of the INVITE.
pub fn build_ack(invite: &Request, branch: &str, to: &str) -> Request {
    let mut headers = Headers::new();
    headers.push(
        SmolStr::new("Via"),
        SmolStr::new(format!(
            "SIP/2.0/UDP client.example.com:5060;branch={}",
            branch
        )),
    );
    if let Some(from) = invite.headers().get("From") {
        headers.push(SmolStr::new("From"), from.clone());
    }
    headers.push(SmolStr::new("To"), SmolStr::new(to));
    if let Some(call_id) = invite.headers().get("Call-ID") {
        headers.push(SmolStr::new("Call-ID"), call_id.clone());
    }
    headers.push(SmolStr::new("CSeq"), SmolStr::new("1 ACK"));
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
    headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));
    Request::new(
        RequestLine::new(Method::Ack, invite.uri()),
        headers,
        Bytes::new(),
    )
    .expect("empty body is within limits")
}

/// Response to `request` echoing its Via stack and dialog headers, with a To tag
/// added for anything above 100.
pub fn build_response_to(request: &Request, code: u16, reason: &str) -> Response {
    let mut response = sip_core::make_response(request, code, reason).expect("valid status");
    if code > 100 {
        if let Some(to) = response.headers().get("To").cloned() {
            if !to.contains(";tag=") {
                response
                    .headers_mut()
                    .set(SmolStr::new("To"), SmolStr::new(format!("{};tag=srv1", to)));
            }
        }
    }
    response
}

/// Constructs a minimal response with the given status code.
pub fn build_response(code: u16, reason: &str) -> Response {
    let mut headers = Headers::new();
    headers.push(
        SmolStr::new("Via"),
        SmolStr::new("SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKtest"),
    );
    headers.push(
        SmolStr::new("From"),
        SmolStr::new("<sip:alice@example.com>;tag=1234"),
    );
    headers.push(SmolStr::new("To"), SmolStr::new("<sip:bob@example.com>"));
    headers.push(
        SmolStr::new("Call-ID"),
        SmolStr::new("test-callid@example.com"),
    );
    headers.push(SmolStr::new("CSeq"), SmolStr::new("1 OPTIONS"));
    headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));

    Response::new(
        StatusLine::new(code, reason).expect("valid status"),
        headers,
        Bytes::new(),
    )
    .expect("empty body is within limits")
}

/// Replaces the body, keeping Content-Length in step.
pub fn with_body(request: Request, body: &'static [u8]) -> Request {
    let (line, mut headers, _) = request.into_parts();
    headers.set(SmolStr::new("Content-Length"), SmolStr::new(body.len().to_string()));
    Request::new(line, headers, Bytes::from_static(body)).expect("body within limits")
}

/// Serializes a request to bytes for transport-layer testing.
pub fn as_bytes(request: &Request) -> Bytes {
    serialize_request(request)
}

/// Serializes a response to bytes for transport-layer testing.
pub fn response_as_bytes(response: &Response) -> Bytes {
    serialize_response(response)
}

/// A STUN Binding Request with `attr_len` bytes of attribute payload.
pub fn stun_binding_request(attr_len: u16) -> Bytes {
    let mut frame = Vec::with_capacity(20 + attr_len as usize);
    frame.extend_from_slice(&0x0001u16.to_be_bytes());
    frame.extend_from_slice(&attr_len.to_be_bytes());
    frame.extend_from_slice(&0x2112_A442u32.to_be_bytes());
    frame.extend_from_slice(b"txn-id-12345");
    frame.extend(std::iter::repeat(0u8).take(attr_len as usize));
    Bytes::from(frame)
}

/// Splits `data` into consecutive chunks of at most `size` bytes.
pub fn chunked(data: &[u8], size: usize) -> Vec<Bytes> {
    data.chunks(size.max(1))
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Splits `data` at each of the given offsets (sorted, deduplicated, clamped).
pub fn split_at_offsets(data: &[u8], offsets: &[usize]) -> Vec<Bytes> {
    let mut cuts: Vec<usize> = offsets.iter().map(|o| (*o).min(data.len())).collect();
    cuts.sort_unstable();
    cuts.dedup();
    let mut parts = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        parts.push(Bytes::copy_from_slice(&data[start..cut]));
        start = cut;
    }
    parts.push(Bytes::copy_from_slice(&data[start..]));
    parts
}
