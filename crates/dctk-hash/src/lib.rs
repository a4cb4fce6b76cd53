//! # dctk-hash
//!
//! Tiger-tree content addressing for the Direct Connect network.
//!
//! This crate provides:
//! - The 192-bit [`TigerHash`] value and its base-32 text form
//! - The Tiger-tree (TTH) Merkle construction over 1024-byte leaves
//! - Streaming hashers with bounded memory for on-disk files
//! - The "TTH-leaves" stream peers use to verify partial downloads

mod tree;

pub use tree::{
    leaves_of_bytes, leaves_of_file, root_from_leaves, tth_of_bytes, tth_of_file, LeavesHasher,
    TreeDigest, TreeHasher, LEAF_SIZE, MAX_TTH_LEAVES,
};

use data_encoding::BASE32_NOPAD;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size of a Tiger digest in bytes.
pub const HASH_SIZE: usize = 24;

/// Length of a base-32 encoded Tiger digest, without padding.
pub const HASH_BASE32_LEN: usize = 39;

/// Hashing and encoding errors.
#[derive(Error, Debug)]
pub enum HashError {
    /// Not a valid base-32 string.
    #[error("invalid base-32 string: {0}")]
    InvalidBase32(String),

    /// Decoded value has the wrong length.
    #[error("invalid hash length: {0} bytes, expected {HASH_SIZE}")]
    InvalidLength(usize),

    /// I/O error while hashing a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for hashing operations.
pub type HashResult<T> = Result<T, HashError>;

/// A 192-bit Tiger digest, the content address of the Direct Connect network.
///
/// Equality is byte equality. The text form is RFC-4648 base-32, uppercase,
/// without padding: 24 bytes become exactly 39 characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TigerHash(pub [u8; HASH_SIZE]);

impl TigerHash {
    /// Wrap a raw 24-byte digest.
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a 39-character base-32 string.
    pub fn from_base32(s: &str) -> HashResult<Self> {
        let raw = base32_decode(s)?;
        Self::from_slice(&raw)
    }

    /// Build from a byte slice, checking the length.
    pub fn from_slice(raw: &[u8]) -> HashResult<Self> {
        if raw.len() != HASH_SIZE {
            return Err(HashError::InvalidLength(raw.len()));
        }
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(raw);
        Ok(Self(bytes))
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for TigerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base32_encode(&self.0))
    }
}

impl fmt::Debug for TigerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TigerHash({})", self)
    }
}

impl FromStr for TigerHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base32(s)
    }
}

/// Encode bytes as uppercase base-32 without padding.
pub fn base32_encode(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data)
}

/// Decode an uppercase base-32 string without padding.
pub fn base32_decode(s: &str) -> HashResult<Vec<u8>> {
    BASE32_NOPAD
        .decode(s.as_bytes())
        .map_err(|_| HashError::InvalidBase32(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base32_roundtrip() {
        let data = [0xABu8; HASH_SIZE];
        let encoded = base32_encode(&data);
        assert_eq!(encoded.len(), HASH_BASE32_LEN);
        assert_eq!(base32_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_tiger_hash_parse() {
        let s = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ";
        let h = TigerHash::from_base32(s).unwrap();
        assert_eq!(h.to_string(), s);
    }

    #[test]
    fn test_tiger_hash_rejects_bad_input() {
        assert!(TigerHash::from_base32("not base32 at all!").is_err());
        // Valid base-32 but wrong decoded length.
        assert!(TigerHash::from_base32("AAAA").is_err());
    }

    #[test]
    fn test_display_matches_from_str() {
        let h = TigerHash::new([7u8; HASH_SIZE]);
        let parsed: TigerHash = h.to_string().parse().unwrap();
        assert_eq!(parsed, h);
    }
}
