#![no_main]
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use sip_parse::{parse_message, DEFAULT_MAX_HEADERS};
use sip_transport::{decode_datagram, Endpoint, FramerLimits, StreamFramer, TransportKind};
use tokio::sync::mpsc;

/// Feeds `data` to a fresh framer in `chunk`-sized pieces and collects what it emits.
fn frame(data: &[u8], chunk: usize) -> (Vec<sip_core::WireMessage>, Vec<u8>, bool) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let endpoint = Endpoint::new(TransportKind::Tcp, "127.0.0.1:5060".parse().unwrap());
    let limits = FramerLimits {
        max_message_size: 64 * 1024,
        ..FramerLimits::default()
    };
    let mut framer = StreamFramer::new(endpoint, limits, tx);
    let mut failed = false;
    for piece in data.chunks(chunk) {
        if framer.supply_bytes(piece).is_err() {
            failed = true;
            break;
        }
    }
    let mut emitted = Vec::new();
    while let Ok(message) = rx.try_recv() {
        emitted.push(message.message);
    }
    (emitted, framer.pending().to_vec(), failed)
}

fuzz_target!(|data: &[u8]| {
    // First byte picks the read size.
    let Some((&selector, stream)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(selector % 64) + 1;

    let (whole, whole_pending, whole_failed) = frame(stream, stream.len().max(1));
    let (chunked, chunked_pending, chunked_failed) = frame(stream, chunk);
    if !whole_failed && !chunked_failed {
        assert_eq!(whole, chunked, "chunking changed the framed messages");
        assert_eq!(whole_pending, chunked_pending);
    }

    let datagram = Bytes::copy_from_slice(stream);
    let _ = decode_datagram(&datagram, &FramerLimits::default());
    let _ = parse_message(&datagram, DEFAULT_MAX_HEADERS);
});
