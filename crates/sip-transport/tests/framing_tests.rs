// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stream framing driven through the public API with realistic traffic.

use bytes::Bytes;
use proptest::prelude::*;
use sip_core::{NonSipFrame, SipMessage, WireMessage};
use sip_testkit::{
    as_bytes, build_invite, build_options, build_response_to, chunked, response_as_bytes,
    split_at_offsets, stun_binding_request, with_body,
};
use sip_transport::{Endpoint, FramerLimits, InboundMessage, ParsePhase, StreamFramer, TransportKind};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

fn new_framer(limits: FramerLimits) -> (StreamFramer, UnboundedReceiver<InboundMessage>) {
    let (tx, rx) = unbounded_channel();
    let endpoint = Endpoint::new(TransportKind::Tcp, "192.0.2.10:5060".parse().unwrap());
    (StreamFramer::new(endpoint, limits, tx), rx)
}

fn collect(rx: &mut UnboundedReceiver<InboundMessage>) -> Vec<WireMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg.message);
    }
    out
}

/// A mixed stream: keep-alive, request with body, STUN, response, keep-alive.
fn mixed_stream() -> (Vec<u8>, Vec<WireMessage>) {
    let invite = build_invite("sip:bob@example.com", "z9hG4bKmix1", "mix@example.com");
    let options = with_body(build_options("sip:bob@example.com", "z9hG4bKmix2"), b"v=0\r\n\r\nx");
    let ringing = build_response_to(&invite, 180, "Ringing");
    let stun = stun_binding_request(12);

    let mut stream = Vec::new();
    let mut expected = Vec::new();

    stream.extend_from_slice(b"\r\n\r\n");
    expected.push(WireMessage::NonSip(NonSipFrame::KeepAlive));

    let options_bytes = as_bytes(&options);
    stream.extend_from_slice(&options_bytes);
    expected.push(WireMessage::Sip(
        sip_parse::parse_message(&options_bytes, sip_parse::DEFAULT_MAX_HEADERS).unwrap(),
    ));

    stream.extend_from_slice(&stun);
    expected.push(WireMessage::NonSip(NonSipFrame::Stun(stun.clone())));

    let ringing_bytes = response_as_bytes(&ringing);
    stream.extend_from_slice(&ringing_bytes);
    expected.push(WireMessage::Sip(
        sip_parse::parse_message(&ringing_bytes, sip_parse::DEFAULT_MAX_HEADERS).unwrap(),
    ));

    stream.extend_from_slice(b"\r\n\r\n");
    expected.push(WireMessage::NonSip(NonSipFrame::KeepAlive));

    (stream, expected)
}

#[test]
fn single_chunk_yields_every_frame_in_order() {
    let (stream, expected) = mixed_stream();
    let (mut framer, mut rx) = new_framer(FramerLimits::default());
    framer.supply_bytes(&stream).unwrap();
    assert_eq!(collect(&mut rx), expected);
    assert_eq!(framer.phase(), ParsePhase::AwaitingStart);
}

#[test]
fn byte_at_a_time_yields_the_same_frames() {
    let (stream, expected) = mixed_stream();
    let (mut framer, mut rx) = new_framer(FramerLimits::default());
    for chunk in chunked(&stream, 1) {
        framer.supply_bytes(&chunk).unwrap();
    }
    assert_eq!(collect(&mut rx), expected);
}

#[test]
fn tiny_chunk_size_still_frames_large_bodies() {
    let body: &'static [u8] = Box::leak(vec![b'a'; 5000].into_boxed_slice());
    let request = with_body(build_options("sip:bob@example.com", "z9hG4bKbig"), body);
    let bytes = as_bytes(&request);
    let limits = FramerLimits {
        chunk_size: 16,
        ..FramerLimits::default()
    };
    let (mut framer, mut rx) = new_framer(limits);
    for chunk in chunked(&bytes, 700) {
        framer.supply_bytes(&chunk).unwrap();
    }
    let out = collect(&mut rx);
    assert_eq!(out.len(), 1);
    let WireMessage::Sip(SipMessage::Request(req)) = &out[0] else {
        panic!("expected request");
    };
    assert_eq!(req.body().len(), 5000);
}

#[test]
fn reading_into_write_target_matches_supply_bytes() {
    let (stream, expected) = mixed_stream();
    let (mut framer, mut rx) = new_framer(FramerLimits::default());
    for chunk in chunked(&stream, 37) {
        framer.write_target().extend_from_slice(&chunk);
        framer.commit_written(chunk.len()).unwrap();
    }
    assert_eq!(collect(&mut rx), expected);
}

#[test]
fn error_mid_stream_keeps_earlier_messages() {
    let mut stream = as_bytes(&build_options("sip:a@b", "z9hG4bKok")).to_vec();
    stream.extend_from_slice(b"INVITE sip:a@b SIP/2.0\r\nContent-Length: -1\r\n\r\n");
    let (mut framer, mut rx) = new_framer(FramerLimits::default());
    assert!(framer.supply_bytes(&stream).is_err());
    assert_eq!(collect(&mut rx).len(), 1);
    assert!(framer.pending().is_empty());
}

#[test]
fn inbound_carries_connection_endpoint() {
    let (mut framer, mut rx) = new_framer(FramerLimits::default());
    framer
        .supply_bytes(&as_bytes(&build_options("sip:a@b", "z9hG4bKep")))
        .unwrap();
    let msg = rx.try_recv().unwrap();
    assert_eq!(msg.endpoint.transport, TransportKind::Tcp);
    assert_eq!(msg.endpoint.peer.port(), 5060);
}

proptest! {
    #[test]
    fn framing_is_independent_of_chunk_boundaries(offsets in proptest::collection::vec(0usize..2000, 0..12)) {
        let (stream, expected) = mixed_stream();
        let (mut framer, mut rx) = new_framer(FramerLimits::default());
        for part in split_at_offsets(&stream, &offsets) {
            framer.supply_bytes(&part).unwrap();
        }
        prop_assert_eq!(collect(&mut rx), expected);
        prop_assert!(framer.pending().is_empty());
    }

    #[test]
    fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..512), size in 1usize..64) {
        let (mut framer, _rx) = new_framer(FramerLimits::default());
        for chunk in chunked(&data, size) {
            if framer.supply_bytes(&chunk).is_err() {
                prop_assert!(framer.pending().is_empty());
                break;
            }
        }
    }
}

#[test]
fn datagram_stun_round_trip_through_decoder() {
    let frame = stun_binding_request(4);
    let decoded = sip_transport::decode_datagram(&frame, &FramerLimits::default()).unwrap();
    assert_eq!(decoded, Some(WireMessage::NonSip(NonSipFrame::Stun(frame))));
}

#[test]
fn datagram_body_is_truncated_to_content_length() {
    let mut data = as_bytes(&with_body(build_options("sip:a@b", "z9hG4bKdg"), b"abc")).to_vec();
    data.extend_from_slice(b"trailing-garbage");
    let decoded = sip_transport::decode_datagram(&Bytes::from(data), &FramerLimits::default())
        .unwrap()
        .unwrap();
    let WireMessage::Sip(message) = decoded else {
        panic!("expected sip message");
    };
    assert_eq!(message.body().as_ref(), b"abc");
}
