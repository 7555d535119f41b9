//! Shared types for the Modwright mod lifecycle core.
//!
//! This crate defines the data model exchanged between the resolver, conflict
//! detector, stager and orchestrator: mod identity, version constraints, the
//! manifest wire format, and checksum descriptors. It contains no IO beyond
//! reading a manifest file.

pub mod hash;
pub mod manifest;
pub mod types;
pub mod version;

// Re-exports
pub use hash::{ChecksumAlgorithm, ChecksumSpec};
pub use manifest::{ManifestError, ModManifest};
pub use types::*;
pub use version::{classify_delta, is_newer, Constraint, ConstraintError, UpdateKind};
