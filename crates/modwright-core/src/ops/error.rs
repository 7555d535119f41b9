//! Domain errors for lifecycle operations.
//!
//! Resolution-time errors abort before any filesystem mutation. Staging and
//! conflict errors abort before commit with staged files discarded.
//! Commit-time errors trigger undo and, when a restore point exists,
//! restore-point restoration. [`UpdateError::RestoreFailure`] is the only
//! fatal, non-retryable condition; it always names the retained restore
//! point so a human can recover manually.

use thiserror::Error;

use modwright_schema::{ConflictRecord, ModId};

use crate::config::MergeError;
use crate::ops::{BackupError, LookupError, RestorePointId};
use crate::resolver::ResolveError;
use crate::stage::StageError;
use crate::store::StoreError;

/// Errors surfaced by [`crate::ops::Session`] operations.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Planning failed; nothing was written.
    #[error("failed to resolve dependencies: {0}")]
    Resolve(#[from] ResolveError),

    /// Critical or error-severity conflicts block the plan.
    #[error("blocking conflicts detected ({} record(s))", .records.len())]
    ConflictBlocking {
        /// The records that block the operation.
        records: Vec<ConflictRecord>,
    },

    /// Staging or commit failed (see [`StageError`] for whether live files
    /// were touched).
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Configuration merge failed; the live config was left untouched.
    #[error("configuration merge failed: {0}")]
    Merge(#[from] MergeError),

    /// The release catalog could not answer.
    #[error("release lookup failed: {0}")]
    Lookup(#[from] LookupError),

    /// The backup collaborator failed.
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    /// The persisted state could not be read or written.
    #[error("state store failure: {0}")]
    Store(#[from] StoreError),

    /// The operation referenced a mod that is not installed.
    #[error("mod '{id}' is not installed")]
    NotInstalled {
        /// The missing mod.
        id: ModId,
    },

    /// A cancellation signal was honored; nothing was committed.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation failed after files had been committed, and the
    /// installation was successfully restored from the restore point.
    #[error("installation restored from '{restore_point}' after: {source}")]
    RolledBack {
        /// The restore point that was applied.
        restore_point: RestorePointId,
        /// What originally went wrong.
        #[source]
        source: Box<UpdateError>,
    },

    /// Fatal: restoration itself failed. The restore point is retained for
    /// manual recovery and never discarded.
    #[error(
        "restore from restore point '{restore_point}' failed: {reason}; \
         manual recovery required, the restore point is retained"
    )]
    RestoreFailure {
        /// The retained restore point.
        restore_point: RestorePointId,
        /// Why restoration failed.
        reason: String,
    },
}

impl UpdateError {
    /// Whether this error is the fatal, non-retryable kind.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RestoreFailure { .. })
    }
}
