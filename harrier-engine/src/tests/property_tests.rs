//! Property-based tests for the byte-level invariants:
//! record reassembly is fragmentation-invariant, and HTTP de-chunking
//! recovers the original body for arbitrary chunkings.

use crate::app::http::dechunk_http_message;
use crate::encryption::reassembly::RecordAssembler;
use proptest::prelude::*;

fn record_strategy() -> impl Strategy<Value = Vec<u8>> {
    (0x14u8..=0x17, prop::collection::vec(any::<u8>(), 0..300)).prop_map(|(content_type, body)| {
        let mut record = vec![content_type, 0x03, 0x03];
        record.extend_from_slice(&(body.len() as u16).to_be_bytes());
        record.extend_from_slice(&body);
        record
    })
}

fn stream_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(record_strategy(), 1..6)
}

/// Splits `stream` at the given fractions into contiguous fragments.
fn fragment(stream: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (stream.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();
    let mut fragments = Vec::new();
    let mut start = 0;
    for point in points {
        if point > start {
            fragments.push(stream[start..point].to_vec());
            start = point;
        }
    }
    if start < stream.len() {
        fragments.push(stream[start..].to_vec());
    }
    fragments
}

proptest! {
    /// For every byte-wise fragmentation of a TLS record stream, reassembly
    /// yields exactly the records of the unfragmented stream, in order, each
    /// exactly once.
    #[test]
    fn reassembly_is_fragmentation_invariant(
        records in stream_strategy(),
        cuts in prop::collection::vec(any::<usize>(), 0..24),
    ) {
        let stream: Vec<u8> = records.iter().flatten().copied().collect();
        let mut assembler = RecordAssembler::new();
        let mut reassembled = Vec::new();
        for fragment in fragment(&stream, &cuts) {
            let outcome = assembler.push(&fragment);
            prop_assert!(outcome.rejected.is_none());
            reassembled.extend(outcome.records);
        }
        prop_assert_eq!(reassembled, records);
        prop_assert!(assembler.is_idle());
    }

    /// De-chunking recovers the original body for arbitrary chunk sizes.
    #[test]
    fn dechunking_recovers_body(
        body in "[a-zA-Z0-9 ]{1,200}",
        sizes in prop::collection::vec(1usize..40, 1..10),
    ) {
        let mut message = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        let mut rest = body.as_bytes();
        let mut size_iter = sizes.iter().cycle();
        while !rest.is_empty() {
            let take = (*size_iter.next().unwrap()).min(rest.len());
            message.extend_from_slice(format!("{:x}\r\n", take).as_bytes());
            message.extend_from_slice(&rest[..take]);
            message.extend_from_slice(b"\r\n");
            rest = &rest[take..];
        }
        message.extend_from_slice(b"0\r\n\r\n");

        let dechunked = dechunk_http_message(&message);
        let recovered = &dechunked["HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".len()..];
        prop_assert_eq!(recovered, body);
    }
}
