//! Binary layouts for stored embeddings and sealed chunk text.
//!
//! Embeddings are raw little-endian IEEE-754 `f32` values, `4 * dims` bytes,
//! with no header. The sealed-text envelope is
//! `version(1) | nonce(12) | ciphertext | tag(16)`.

use bytemuck::{cast_slice, pod_collect_to_vec};

use crate::error::{DoclinkError, Result};

#[cfg(not(target_endian = "little"))]
compile_error!("the embedding codec stores native f32 bytes and requires a little-endian target");

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const ENVELOPE_VERSION: u8 = 1;

pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    cast_slice::<f32, u8>(vector).to_vec()
}

pub fn decode_embedding(bytes: &[u8], dims: usize) -> Result<Vec<f32>> {
    let expected = dims * std::mem::size_of::<f32>();
    if bytes.len() != expected {
        return Err(DoclinkError::malformed(format!(
            "embedding blob is {} bytes, expected {expected} for {dims} dimensions",
            bytes.len()
        )));
    }
    // Blobs read back from SQLite carry no alignment guarantee, so copy
    // instead of casting in place.
    Ok(pod_collect_to_vec::<u8, f32>(bytes))
}

/// AEAD output for one chunk: nonce, ciphertext and tag kept apart so the
/// store can persist them as explicit columns.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedText {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl std::fmt::Debug for SealedText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedText")
            .field("nonce_len", &self.nonce.len())
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

impl SealedText {
    pub fn from_parts(nonce: &[u8], ciphertext: Vec<u8>, tag: &[u8]) -> Result<Self> {
        let nonce: [u8; NONCE_LEN] = nonce.try_into().map_err(|_| {
            DoclinkError::malformed(format!(
                "nonce is {} bytes, expected {NONCE_LEN}",
                nonce.len()
            ))
        })?;
        let tag: [u8; TAG_LEN] = tag.try_into().map_err(|_| {
            DoclinkError::malformed(format!("tag is {} bytes, expected {TAG_LEN}", tag.len()))
        })?;
        Ok(Self {
            nonce,
            ciphertext,
            tag,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + NONCE_LEN + self.ciphertext.len() + TAG_LEN);
        out.push(ENVELOPE_VERSION);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Some((&version, rest)) = bytes.split_first() else {
            return Err(DoclinkError::malformed("empty envelope"));
        };
        if version != ENVELOPE_VERSION {
            return Err(DoclinkError::malformed(format!(
                "unsupported envelope version {version}"
            )));
        }
        if rest.len() < NONCE_LEN + TAG_LEN {
            return Err(DoclinkError::malformed(format!(
                "envelope too short: {} bytes",
                bytes.len()
            )));
        }
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        Self::from_parts(nonce, ciphertext.to_vec(), tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_roundtrip_is_exact() {
        let vector = vec![0.1f32, -2.5, f32::MIN_POSITIVE, 1e30, 0.0, -0.0];
        let bytes = encode_embedding(&vector);
        assert_eq!(bytes.len(), vector.len() * 4);
        let decoded = decode_embedding(&bytes, vector.len()).unwrap();
        assert_eq!(
            decoded.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            vector.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn embedding_layout_is_little_endian() {
        assert_eq!(encode_embedding(&[1.0]), vec![0x00, 0x00, 0x80, 0x3f]);
    }

    #[test]
    fn wrong_length_is_malformed() {
        let bytes = encode_embedding(&[1.0, 2.0, 3.0]);
        assert!(matches!(
            decode_embedding(&bytes, 4),
            Err(DoclinkError::MalformedRecord(_))
        ));
        assert!(matches!(
            decode_embedding(&bytes[..11], 3),
            Err(DoclinkError::MalformedRecord(_))
        ));
    }

    #[test]
    fn decode_handles_unaligned_input() {
        let mut padded = vec![0u8];
        padded.extend(encode_embedding(&[3.5, -1.25]));
        let decoded = decode_embedding(&padded[1..], 2).unwrap();
        assert_eq!(decoded, vec![3.5, -1.25]);
    }

    #[test]
    fn envelope_roundtrip_and_rejections() {
        let sealed = SealedText {
            nonce: [7u8; NONCE_LEN],
            ciphertext: b"opaque".to_vec(),
            tag: [9u8; TAG_LEN],
        };
        let bytes = sealed.to_bytes();
        assert_eq!(SealedText::from_bytes(&bytes).unwrap(), sealed);

        let mut wrong_version = bytes.clone();
        wrong_version[0] = 2;
        assert!(SealedText::from_bytes(&wrong_version).is_err());
        assert!(SealedText::from_bytes(&bytes[..NONCE_LEN]).is_err());
        assert!(SealedText::from_bytes(&[]).is_err());
    }

    #[test]
    fn from_parts_checks_lengths() {
        assert!(SealedText::from_parts(&[0u8; 11], Vec::new(), &[0u8; TAG_LEN]).is_err());
        assert!(SealedText::from_parts(&[0u8; NONCE_LEN], Vec::new(), &[0u8; 15]).is_err());
        assert!(SealedText::from_parts(&[0u8; NONCE_LEN], Vec::new(), &[0u8; TAG_LEN]).is_ok());
    }
}
