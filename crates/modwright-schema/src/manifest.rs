//! Mod manifest wire format.
//!
//! A manifest is a JSON object shipped inside (or alongside) a mod payload:
//!
//! ```json
//! {
//!   "id": "shader-pack",
//!   "name": "Shader Pack",
//!   "version": "1.4.0",
//!   "author": "someone",
//!   "dependencies": [
//!     { "targetModId": "core-lib", "constraintExpression": ">=1.0.0,<2.0.0", "optional": false }
//!   ],
//!   "conflicts": ["legacy-shaders"],
//!   "payloadLocation": "https://mods.example/shader-pack-1.4.0.zip",
//!   "checksum": { "algorithm": "sha256", "digest": "..." }
//! }
//! ```
//!
//! Parsing is strict about constraint expressions (they are compiled into
//! [`Constraint`] values up front) and lenient about optional fields.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{ChecksumError, ChecksumSpec};
use crate::types::{DependencyConstraint, ModDescriptor, ModId, ModVersion, PayloadLocation};
use crate::version::{Constraint, ConstraintError};

/// Errors raised while reading a manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The file could not be read.
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid JSON or misses required fields.
    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),

    /// A dependency constraint expression did not parse.
    #[error("dependency on '{target}': {source}")]
    Constraint {
        /// The dependency target the bad expression points at.
        target: ModId,
        /// The underlying parse failure.
        #[source]
        source: ConstraintError,
    },

    /// The checksum block is inconsistent.
    #[error("manifest checksum: {0}")]
    Checksum(#[from] ChecksumError),

    /// A required field is empty.
    #[error("manifest field '{0}' must not be empty")]
    EmptyField(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDependency {
    target_mod_id: String,
    constraint_expression: String,
    #[serde(default)]
    optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChecksum {
    algorithm: String,
    digest: String,
}

/// The manifest document as serialized on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModManifest {
    /// Stable mod identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Version of the described payload.
    pub version: String,
    /// Author credit.
    #[serde(default)]
    pub author: String,
    /// Optional long description.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
    /// Mods declared incompatible.
    #[serde(default)]
    pub conflicts: Vec<String>,
    /// Mods that must load before this one.
    #[serde(default)]
    pub load_after: Vec<String>,
    /// Mods that must load after this one.
    #[serde(default)]
    pub load_before: Vec<String>,
    /// Local path or URL of the payload.
    pub payload_location: String,
    #[serde(default)]
    checksum: Option<RawChecksum>,
    /// Base64 ed25519 signature over the payload, when published.
    #[serde(default)]
    pub signature: Option<String>,
}

impl ModManifest {
    /// Parse a manifest from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Json`] for malformed documents.
    pub fn from_json(input: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(input)?)
    }

    /// Read and parse a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Io`] or [`ManifestError::Json`].
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Compile the manifest into an immutable [`ModDescriptor`], parsing
    /// every constraint expression and validating the checksum block.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Constraint`] for a bad dependency
    /// expression, [`ManifestError::Checksum`] for an inconsistent digest
    /// and [`ManifestError::EmptyField`] for blank identity fields.
    pub fn into_descriptor(self) -> Result<ModDescriptor, ManifestError> {
        if self.id.trim().is_empty() {
            return Err(ManifestError::EmptyField("id"));
        }
        if self.version.trim().is_empty() {
            return Err(ManifestError::EmptyField("version"));
        }
        if self.payload_location.trim().is_empty() {
            return Err(ManifestError::EmptyField("payloadLocation"));
        }

        let mut dependencies = Vec::with_capacity(self.dependencies.len());
        for raw in self.dependencies {
            let target = ModId::from(raw.target_mod_id);
            let constraint = Constraint::parse(&raw.constraint_expression).map_err(|source| {
                ManifestError::Constraint {
                    target: target.clone(),
                    source,
                }
            })?;
            dependencies.push(DependencyConstraint {
                mod_id: target,
                constraint,
                optional: raw.optional,
            });
        }

        let checksum = match self.checksum {
            Some(raw) => Some(ChecksumSpec::new(raw.algorithm.parse()?, &raw.digest)?),
            None => None,
        };

        Ok(ModDescriptor {
            id: ModId::from(self.id),
            name: self.name,
            version: ModVersion::from(self.version),
            author: self.author,
            description: self.description,
            dependencies,
            declared_conflicts: self.conflicts.into_iter().map(ModId::from).collect(),
            load_after: self.load_after.into_iter().map(ModId::from).collect(),
            load_before: self.load_before.into_iter().map(ModId::from).collect(),
            payload: PayloadLocation::parse(&self.payload_location),
            checksum,
            signature: self.signature,
        })
    }
}
