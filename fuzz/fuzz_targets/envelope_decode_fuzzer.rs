//! Fuzz target for the versioned envelope codec
//!
//! Everything a peer or the checkpoint directory hands us goes through
//! `codec::decode`. Arbitrary bytes must never panic the decoder.
//!
//! # Strategy
//!
//! - Raw bytes: completely arbitrary input
//! - Valid header: correct magic and a chosen version/kind, random body
//! - Compressed: random bytes through `decompress`
//!
//! # Invariants
//!
//! - NEVER panic on malformed input
//! - A successful decode re-encodes and decodes to the same value
//! - Kind mismatches are rejected before the body is read

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use plansync_core::{ChecksumValues, ScenarioSnapshot, ScenarioSummary};
use plansync_harness::PlanDetail;
use plansync_proto::{
    codec::{self, FORMAT_VERSION, MAGIC, MIN_FORMAT_VERSION},
    PayloadKind, Transmission,
};

#[derive(Debug, Clone, Arbitrary)]
enum Input {
    Raw(Vec<u8>),
    WithHeader { version: u16, kind: u16, body: Vec<u8> },
    Compressed(Vec<u8>),
}

fuzz_target!(|input: Input| {
    match input {
        Input::Raw(bytes) => decode_all(&bytes),
        Input::WithHeader { version, kind, body } => {
            let version = MIN_FORMAT_VERSION + version % (FORMAT_VERSION - MIN_FORMAT_VERSION + 1);
            let mut bytes = Vec::with_capacity(8 + body.len());
            bytes.extend_from_slice(&MAGIC.to_be_bytes());
            bytes.extend_from_slice(&version.to_be_bytes());
            bytes.extend_from_slice(&kind.to_be_bytes());
            bytes.extend_from_slice(&body);

            let header = codec::read_header(&bytes).expect("valid header rejected");
            assert_eq!(header.version, version);

            if kind != PayloadKind::Transmission.as_u16() {
                assert!(codec::decode::<Transmission>(&bytes).is_err(), "kind mismatch accepted");
            }
            decode_all(&bytes);
        },
        Input::Compressed(bytes) => {
            if let Ok(inflated) = codec::decompress(&bytes) {
                decode_all(&inflated);
            }
        },
    }
});

fn decode_all(bytes: &[u8]) {
    if let Ok(transmission) = codec::decode::<Transmission>(bytes) {
        let again = codec::encode(&transmission).expect("re-encode transmission");
        assert_eq!(codec::decode::<Transmission>(&again).expect("decode re-encoded"), transmission);
    }
    if let Ok(values) = codec::decode::<ChecksumValues>(bytes) {
        let again = codec::encode(&values).expect("re-encode checksum");
        assert_eq!(codec::decode::<ChecksumValues>(&again).expect("decode re-encoded"), values);
    }
    let _ = codec::decode::<ScenarioSummary>(bytes);
    let _ = codec::decode::<ScenarioSnapshot<PlanDetail>>(bytes);
}
