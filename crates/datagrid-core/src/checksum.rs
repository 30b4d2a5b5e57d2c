//! Content checksums.
//!
//! A file's checksum is recorded once and then treated as the file's
//! identity; a replica whose content disagrees with the recorded checksum
//! is corrupt, not a new version.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumKind {
    /// BLAKE3, the default for new files.
    Blake3,
    /// SHA-256, for sites that only expose SHA-2 digests.
    Sha256,
}

impl ChecksumKind {
    /// Canonical lowercase label used in the string form.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
            Self::Sha256 => "sha256",
        }
    }
}

/// Errors from checksum parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumError {
    /// Unknown algorithm label.
    #[error("unknown checksum algorithm {label:?}")]
    UnknownAlgorithm {
        /// The rejected label.
        label: String,
    },
    /// Digest was not valid lowercase hex of the expected length.
    #[error("invalid {kind} digest: {reason}")]
    InvalidDigest {
        /// Algorithm label of the rejected digest.
        kind: String,
        /// Why the digest was rejected.
        reason: String,
    },
    /// String form did not contain an `algorithm:hex` separator.
    #[error("malformed checksum {input:?}: expected algorithm:hex")]
    Malformed {
        /// The rejected input.
        input: String,
    },
}

/// A content checksum: algorithm plus lowercase hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    kind: ChecksumKind,
    hex: String,
}

impl Checksum {
    /// Expected hex digest length for an algorithm.
    fn hex_len(kind: ChecksumKind) -> usize {
        match kind {
            ChecksumKind::Blake3 => 64,
            ChecksumKind::Sha256 => 64,
        }
    }

    /// Build a checksum from an algorithm and a hex digest, validating the digest.
    pub fn new(kind: ChecksumKind, hex: &str) -> Result<Self, ChecksumError> {
        let expected = Self::hex_len(kind);
        if hex.len() != expected {
            return Err(ChecksumError::InvalidDigest {
                kind: kind.label().to_string(),
                reason: format!("expected {} hex chars, got {}", expected, hex.len()),
            });
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(ChecksumError::InvalidDigest {
                kind: kind.label().to_string(),
                reason: "expected lowercase hex".to_string(),
            });
        }
        Ok(Self {
            kind,
            hex: hex.to_string(),
        })
    }

    /// Compute the BLAKE3 checksum of a byte slice.
    pub fn blake3_of(data: &[u8]) -> Self {
        Self {
            kind: ChecksumKind::Blake3,
            hex: blake3::hash(data).to_hex().to_string(),
        }
    }

    /// Compute the SHA-256 checksum of a byte slice.
    pub fn sha256_of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        Self {
            kind: ChecksumKind::Sha256,
            hex,
        }
    }

    /// Compute a checksum of `data` with the same algorithm as `self`.
    pub fn recompute(&self, data: &[u8]) -> Self {
        match self.kind {
            ChecksumKind::Blake3 => Self::blake3_of(data),
            ChecksumKind::Sha256 => Self::sha256_of(data),
        }
    }

    /// True if `data` hashes to this checksum under its own algorithm.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.recompute(data) == *self
    }

    /// Parse a checksum from its `algorithm:hex` string form.
    pub fn parse(input: &str) -> Result<Self, ChecksumError> {
        let (label, hex) = input.split_once(':').ok_or_else(|| ChecksumError::Malformed {
            input: input.to_string(),
        })?;
        let kind = match label {
            "blake3" => ChecksumKind::Blake3,
            "sha256" => ChecksumKind::Sha256,
            other => {
                return Err(ChecksumError::UnknownAlgorithm {
                    label: other.to_string(),
                })
            }
        };
        Self::new(kind, hex)
    }

    /// The digest algorithm.
    pub fn kind(&self) -> ChecksumKind {
        self.kind
    }

    /// The lowercase hex digest.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.label(), self.hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_verify() {
        let sum = Checksum::blake3_of(b"hello world");
        assert!(sum.verify(b"hello world"));
        assert!(!sum.verify(b"hello worlds"));
    }

    #[test]
    fn test_sha256_known_vector() {
        let sum = Checksum::sha256_of(b"abc");
        assert_eq!(
            sum.hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_display_parse_round_trip() {
        let sum = Checksum::blake3_of(b"x");
        let parsed = Checksum::parse(&sum.to_string()).unwrap();
        assert_eq!(sum, parsed);
    }

    #[test]
    fn test_parse_unknown_algorithm() {
        let hex = "0".repeat(64);
        assert!(matches!(
            Checksum::parse(&format!("md5:{}", hex)),
            Err(ChecksumError::UnknownAlgorithm { .. })
        ));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            Checksum::parse("nodigest"),
            Err(ChecksumError::Malformed { .. })
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            Checksum::new(ChecksumKind::Blake3, "abcd"),
            Err(ChecksumError::InvalidDigest { .. })
        ));
    }

    #[test]
    fn test_uppercase_hex_rejected() {
        let hex = "A".repeat(64);
        assert!(matches!(
            Checksum::new(ChecksumKind::Sha256, &hex),
            Err(ChecksumError::InvalidDigest { .. })
        ));
    }

    #[test]
    fn test_recompute_preserves_kind() {
        let sum = Checksum::sha256_of(b"a");
        let other = sum.recompute(b"b");
        assert_eq!(other.kind(), ChecksumKind::Sha256);
        assert_ne!(sum, other);
    }

    #[test]
    fn test_distinct_algorithms_distinct_checksums() {
        let a = Checksum::blake3_of(b"same");
        let b = Checksum::sha256_of(b"same");
        assert_ne!(a, b);
    }
}
