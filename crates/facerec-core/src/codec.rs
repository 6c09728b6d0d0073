//! Descriptor blob encoding: little-endian `f32` bytes, then standard base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

const F32_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("descriptor blob length {0} is not a multiple of 4")]
    Misaligned(usize),
}

/// Encode a descriptor as base64 over its raw little-endian `f32` bytes.
pub fn encode_descriptor(descriptor: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(descriptor.len() * F32_BYTES);
    for v in descriptor {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Decode a blob produced by [`encode_descriptor`]. Bit-exact.
pub fn decode_descriptor(b64: &str) -> Result<Vec<f32>, CodecError> {
    let bytes = STANDARD.decode(b64.trim())?;
    if bytes.len() % F32_BYTES != 0 {
        return Err(CodecError::Misaligned(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(F32_BYTES)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
