// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP value types shared by the framer and the transaction layer.
//!
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **Headers**: [`Headers`], an ordered multimap that keeps duplicates
//! - **Methods**: [`Method`]
//! - **Framer output**: [`WireMessage`] and the non-SIP [`NonSipFrame`]
//!
//! Bodies are [`Bytes`](bytes::Bytes) sliced from the receive buffer and
//! header text is [`SmolStr`](smol_str::SmolStr).

pub mod builders;
pub mod headers;
pub mod method;
pub mod msg;

pub use builders::{make_failure_ack, make_response};
pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{
    parse_cseq, MessageError, NonSipFrame, Request, RequestLine, Response, ResponseClass,
    SipMessage, StatusLine, WireMessage, SIP_VERSION,
};
