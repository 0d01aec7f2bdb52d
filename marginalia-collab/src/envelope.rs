//! Checksummed framing for replication blobs.
//!
//! ```text
//! ┌──────┬───────────────┬────────────────────┬──────────────────┐
//! │ tag  │ length (u64)  │ blake3 prefix      │ Yrs v1 update    │
//! │ 1 B  │ LE, 8 B       │ 8 B, of payload    │ `length` bytes   │
//! └──────┴───────────────┴────────────────────┴──────────────────┘
//! ```
//!
//! Every update and snapshot the store produces is sealed. Incoming blobs
//! are opened before anything reaches the Yrs decoder, which assumes its
//! input is well formed.

use thiserror::Error;

/// First byte of every sealed blob.
pub const TAG: u8 = 0xA7;

const LENGTH_LEN: usize = 8;
const CHECKSUM_LEN: usize = 8;
/// Bytes in front of the payload.
pub const HEADER_LEN: usize = 1 + LENGTH_LEN + CHECKSUM_LEN;

/// Why a blob was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("too short for an envelope ({0} bytes)")]
    Truncated(usize),
    #[error("unknown envelope tag {0:#04x}")]
    UnknownTag(u8),
    #[error("header declares {declared} payload bytes, found {actual}")]
    LengthMismatch { declared: u64, actual: usize },
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = blake3::hash(payload);
    let mut prefix = [0u8; CHECKSUM_LEN];
    prefix.copy_from_slice(&hash.as_bytes()[..CHECKSUM_LEN]);
    prefix
}

/// Frame `payload` with its length and checksum.
pub fn seal(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(TAG);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&checksum(payload));
    out.extend_from_slice(payload);
    out
}

/// Verify a sealed blob and return its payload.
pub fn open(bytes: &[u8]) -> Result<&[u8], EnvelopeError> {
    if bytes.len() < HEADER_LEN {
        return Err(EnvelopeError::Truncated(bytes.len()));
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    if header[0] != TAG {
        return Err(EnvelopeError::UnknownTag(header[0]));
    }

    let mut length = [0u8; LENGTH_LEN];
    length.copy_from_slice(&header[1..1 + LENGTH_LEN]);
    let declared = u64::from_le_bytes(length);
    if declared != payload.len() as u64 {
        return Err(EnvelopeError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    if header[1 + LENGTH_LEN..] != checksum(payload)[..] {
        return Err(EnvelopeError::ChecksumMismatch);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_returns_sealed_payload() {
        let sealed = seal(b"update bytes");
        assert_eq!(sealed.len(), HEADER_LEN + 12);
        assert_eq!(open(&sealed).unwrap(), b"update bytes");
        assert_eq!(open(&seal(&[])).unwrap(), b"");
    }

    #[test]
    fn test_short_input_rejected() {
        assert_eq!(open(&[]), Err(EnvelopeError::Truncated(0)));
        assert_eq!(open(&[TAG; 5]), Err(EnvelopeError::Truncated(5)));
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let mut sealed = seal(b"abc");
        sealed[0] = 0x01;
        assert_eq!(open(&sealed), Err(EnvelopeError::UnknownTag(0x01)));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let sealed = seal(b"abcdef");
        assert!(matches!(
            open(&sealed[..sealed.len() - 2]),
            Err(EnvelopeError::LengthMismatch { declared: 6, actual: 4 })
        ));
    }

    #[test]
    fn test_flipped_payload_byte_rejected() {
        let mut sealed = seal(b"abcdef");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x40;
        assert_eq!(open(&sealed), Err(EnvelopeError::ChecksumMismatch));
    }
}
