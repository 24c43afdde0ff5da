//! Version-gated binary codec.
//!
//! Every persisted or transmitted entity is written as
//! `[magic][format version][kind][CBOR body]`. Readers branch on the version:
//! the current version decodes directly, older supported versions go through
//! [`Versioned::decode_legacy`], newer versions are rejected. Compatibility is
//! forward-only: old data always decodes into the current in-memory shape,
//! never the reverse.
//!
//! # Invariants
//!
//! - `decode(encode(x)) == x` for the current version.
//! - The header is checked before the body is touched.

use std::io::{Read, Write};

use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use serde::{Serialize, de::DeserializeOwned};

use crate::errors::{CodecError, Result};

/// Envelope magic ("PLNS").
pub const MAGIC: u32 = 0x504C_4E53;

/// Format version written by this build.
pub const FORMAT_VERSION: u16 = 3;

/// Oldest format version this build still reads.
pub const MIN_FORMAT_VERSION: u16 = 1;

/// Size of the fixed envelope header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Entity kinds carried in envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PayloadKind {
    /// A single transmission.
    Transmission = 0x0001,
    /// Undo checkpoint (detail + summary).
    Checkpoint = 0x0002,
    /// Full scenario snapshot for load/reload/replace.
    ScenarioSnapshot = 0x0003,
    /// Checksum values exchanged between peers.
    ChecksumValues = 0x0004,
    /// Scenario summary on its own.
    ScenarioSummary = 0x0005,
}

impl PayloadKind {
    /// Wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// An entity with a versioned wire representation.
pub trait Versioned: Serialize + DeserializeOwned {
    /// Envelope kind tag.
    const KIND: PayloadKind;

    /// Decode a body written by an older supported format version.
    ///
    /// The default rejects every legacy version.
    fn decode_legacy(version: u16, _body: &[u8]) -> Result<Self> {
        Err(CodecError::UnsupportedVersion {
            version,
            min: FORMAT_VERSION,
            max: FORMAT_VERSION,
        })
    }
}

/// Parsed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Format version the body was written with.
    pub version: u16,
    /// Raw kind tag.
    pub kind: u16,
}

/// Parse and validate the fixed header.
///
/// # Errors
///
/// - `TooShort` when fewer than [`HEADER_SIZE`] bytes are present
/// - `InvalidMagic` for foreign data
/// - `UnsupportedVersion` for versions outside
///   `MIN_FORMAT_VERSION..=FORMAT_VERSION`
pub fn read_header(bytes: &[u8]) -> Result<EnvelopeHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::TooShort { expected: HEADER_SIZE, actual: bytes.len() });
    }

    let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != MAGIC {
        return Err(CodecError::InvalidMagic(magic));
    }

    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
        return Err(CodecError::UnsupportedVersion {
            version,
            min: MIN_FORMAT_VERSION,
            max: FORMAT_VERSION,
        });
    }

    let kind = u16::from_be_bytes([bytes[6], bytes[7]]);
    Ok(EnvelopeHeader { version, kind })
}

/// Encode `value` at the current format version.
pub fn encode<T: Versioned>(value: &T) -> Result<Vec<u8>> {
    encode_with_version(value, FORMAT_VERSION)
}

/// Encode with an explicit version header. Only used to produce legacy
/// fixtures; production code always writes [`FORMAT_VERSION`].
pub fn encode_with_version<T: Versioned>(value: &T, version: u16) -> Result<Vec<u8>> {
    encode_envelope(T::KIND, version, value)
}

/// Encode any serializable value under an explicit kind and version.
///
/// Lets borrowed views (a checkpoint built from references to live state)
/// be written without cloning into the owned [`Versioned`] type.
pub fn encode_envelope<T: Serialize + ?Sized>(
    kind: PayloadKind,
    version: u16,
    value: &T,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_SIZE + 64);
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&kind.as_u16().to_be_bytes());
    ciborium::into_writer(value, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode a versioned envelope into the current shape of `T`.
pub fn decode<T: Versioned>(bytes: &[u8]) -> Result<T> {
    let header = read_header(bytes)?;
    if header.kind != T::KIND.as_u16() {
        return Err(CodecError::KindMismatch { expected: T::KIND.as_u16(), actual: header.kind });
    }

    let body = &bytes[HEADER_SIZE..];
    if header.version == FORMAT_VERSION {
        decode_body(body)
    } else {
        T::decode_legacy(header.version, body)
    }
}

/// CBOR-encode a bare body (no envelope).
pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// CBOR-decode a bare body (no envelope).
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    ciborium::from_reader(body).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Deflate-compress bytes.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::fast());
    encoder.write_all(bytes).map_err(|e| CodecError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| CodecError::Compression(e.to_string()))
}

/// Inflate bytes produced by [`compress`].
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 2);
    decoder.read_to_end(&mut out).map_err(|e| CodecError::Compression(e.to_string()))?;
    Ok(out)
}
