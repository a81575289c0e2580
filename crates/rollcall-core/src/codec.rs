//! Storage encoding for identity embeddings.
//!
//! Layout: magic `RCE1`, `u32` LE dimension tag, then `dim` little-endian
//! `f32` values. Values are stored bit-for-bit; there is no quantization.

use crate::types::Embedding;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"RCE1";
const HEADER_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("blob too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic bytes")]
    BadMagic,
    #[error("dimension tag {dim} does not match payload of {payload} bytes")]
    LengthMismatch { dim: usize, payload: usize },
    #[error("zero-dimension embedding")]
    ZeroDimension,
    #[error("non-finite value at index {0}")]
    NonFinite(usize),
    #[error("stored embedding is not unit length (norm {0})")]
    NotUnit(f64),
}

pub fn encode(embedding: &Embedding) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + embedding.dim() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(embedding.dim() as u32).to_le_bytes());
    for v in &embedding.values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode and validate a stored identity vector.
pub fn decode(bytes: &[u8]) -> Result<Embedding, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::TooShort(bytes.len()));
    }
    if &bytes[..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let dim = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if dim == 0 {
        return Err(CodecError::ZeroDimension);
    }
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != dim * 4 {
        return Err(CodecError::LengthMismatch {
            dim,
            payload: payload.len(),
        });
    }

    let mut values = Vec::with_capacity(dim);
    for (i, chunk) in payload.chunks_exact(4).enumerate() {
        let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !v.is_finite() {
            return Err(CodecError::NonFinite(i));
        }
        values.push(v);
    }

    let embedding = Embedding::new(values);
    if !embedding.is_unit() {
        return Err(CodecError::NotUnit(embedding.l2_norm()));
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_is_bit_exact() {
        let e = Embedding::new(vec![0.1, -0.7, 0.3, 0.6])
            .normalized()
            .unwrap();
        let bytes = encode(&e);
        assert_eq!(bytes.len(), 8 + 16);
        let back = decode(&bytes).unwrap();
        for (a, b) in e.values.iter().zip(back.values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let good = encode(&Embedding::new(vec![1.0, 0.0]));

        assert_eq!(decode(&good[..5]), Err(CodecError::TooShort(5)));

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        assert_eq!(decode(&bad_magic), Err(CodecError::BadMagic));

        assert_eq!(
            decode(&good[..good.len() - 1]),
            Err(CodecError::LengthMismatch { dim: 2, payload: 7 })
        );

        let unnormalized = encode(&Embedding::new(vec![2.0, 0.0]));
        assert!(matches!(decode(&unnormalized), Err(CodecError::NotUnit(_))));

        let nan = encode(&Embedding::new(vec![f32::NAN, 1.0]));
        assert_eq!(decode(&nan), Err(CodecError::NonFinite(0)));

        assert_eq!(decode(b"RCE1\0\0\0\0"), Err(CodecError::ZeroDimension));
    }
}
