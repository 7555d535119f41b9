//! Checksum computation and signature verification.
//!
//! The digest algorithm is chosen by the mod manifest ([`ChecksumAlgorithm`]);
//! signatures are ed25519 over the raw payload artifact, verified against a
//! publisher key configured on the session.

use std::io::Read;
use std::path::Path;

use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;

use modwright_schema::ChecksumAlgorithm;

/// Incremental hasher over a manifest-selected algorithm.
pub enum Hasher {
    /// MD5.
    Md5(Md5),
    /// SHA-1.
    Sha1(Sha1),
    /// SHA-256.
    Sha256(Sha256),
    /// SHA-384.
    Sha384(Sha384),
    /// SHA-512.
    Sha512(Sha512),
}

impl std::fmt::Debug for Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Hasher").field(&self.algorithm()).finish()
    }
}

impl Hasher {
    /// Start hashing with the given algorithm.
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Self::Md5(Md5::new()),
            ChecksumAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha384 => Self::Sha384(Sha384::new()),
            ChecksumAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    /// The algorithm this hasher runs.
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self {
            Self::Md5(_) => ChecksumAlgorithm::Md5,
            Self::Sha1(_) => ChecksumAlgorithm::Sha1,
            Self::Sha256(_) => ChecksumAlgorithm::Sha256,
            Self::Sha384(_) => ChecksumAlgorithm::Sha384,
            Self::Sha512(_) => ChecksumAlgorithm::Sha512,
        }
    }

    /// Feed a chunk.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// Finish and return the lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha384(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Stream a file through the selected digest.
///
/// # Errors
///
/// Propagates read errors.
pub fn compute_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 8192];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(hasher.finalize_hex())
}

/// Errors decoding or checking a payload signature.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The payload could not be read.
    #[error("signature check io error: {0}")]
    Io(#[from] std::io::Error),

    /// The signature is not valid base64.
    #[error("signature is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The decoded bytes are not an ed25519 signature.
    #[error("signature bytes are malformed")]
    Malformed,
}

/// Verify an ed25519 signature (base64) over the raw bytes of `path`.
///
/// Returns `Ok(false)` for a well-formed signature that does not match.
///
/// # Errors
///
/// [`SignatureError`] when the file cannot be read or the signature cannot
/// be decoded at all.
pub fn verify_signature(
    path: &Path,
    signature_b64: &str,
    key: &VerifyingKey,
) -> Result<bool, SignatureError> {
    let raw = base64::engine::general_purpose::STANDARD.decode(signature_b64.trim())?;
    let signature = Signature::from_slice(&raw).map_err(|_| SignatureError::Malformed)?;
    let payload = std::fs::read(path)?;
    Ok(key.verify(&payload, &signature).is_ok())
}
