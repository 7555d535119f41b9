//! Checksum algorithm tags and digest descriptors.
//!
//! Manifests name the algorithm their published digest was computed with;
//! the stager picks the matching hasher at verification time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Digest algorithms a manifest may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// MD5 (legacy manifests only).
    Md5,
    /// SHA-1 (legacy manifests only).
    Sha1,
    /// SHA-256 (default for new manifests).
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl ChecksumAlgorithm {
    /// Length of a hex digest produced by this algorithm.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha384" | "sha-384" => Ok(Self::Sha384),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            other => Err(ChecksumError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Errors validating a [`ChecksumSpec`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    /// The algorithm name is not one of the supported tags.
    #[error("unknown checksum algorithm '{0}'")]
    UnknownAlgorithm(String),

    /// The digest length does not match the algorithm.
    #[error("invalid {algorithm} digest: expected {expected} hex chars, got {actual}")]
    InvalidLength {
        /// Algorithm the digest claims to be.
        algorithm: ChecksumAlgorithm,
        /// Expected hex length.
        expected: usize,
        /// Actual length seen.
        actual: usize,
    },

    /// The digest contains non-hex characters.
    #[error("invalid digest: contains non-hex characters")]
    NotHex,
}

/// An expected digest together with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    /// Digest algorithm.
    pub algorithm: ChecksumAlgorithm,
    /// Lowercase hex digest.
    pub digest: String,
}

impl ChecksumSpec {
    /// Build a validated spec, normalizing the digest to lowercase.
    ///
    /// # Errors
    ///
    /// Returns [`ChecksumError`] when the digest length does not match the
    /// algorithm or contains non-hex characters.
    pub fn new(algorithm: ChecksumAlgorithm, digest: &str) -> Result<Self, ChecksumError> {
        let digest = digest.to_ascii_lowercase();
        if digest.len() != algorithm.hex_len() {
            return Err(ChecksumError::InvalidLength {
                algorithm,
                expected: algorithm.hex_len(),
                actual: digest.len(),
            });
        }
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChecksumError::NotHex);
        }
        Ok(Self { algorithm, digest })
    }

    /// Case-insensitive comparison against a computed hex digest.
    pub fn matches(&self, computed: &str) -> bool {
        self.digest.eq_ignore_ascii_case(computed)
    }
}
