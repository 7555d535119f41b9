//! Staged installation state machine.
//!
//! ```text
//! Pending -> Downloading -> Verifying -> Staged -> Validating -> Committing
//!                                                      |              |
//!                                                      v              v
//!                                    Failed <--- (blocking)    Committed
//!                                RolledBack <--- cancel/abort
//! ```
//!
//! Everything up to `Staged` happens inside an isolated temp directory under
//! the installation's own tmp area (same volume as the plugin root, so the
//! commit is pure renames). Cancellation is honored at state boundaries; a
//! commit always runs to completion or full undo.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ed25519_dalek::VerifyingKey;
use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use modwright_schema::{ModDescriptor, ModId, ModVersion, PayloadLocation};

use crate::io::download::{DownloadError, DownloadRequest};
use crate::io::extract::{self, ExtractError};
use crate::io::verify;
use crate::paths::InstallationLayout;
use crate::reporter::Reporter;

/// Lifecycle states of one staged installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Created, nothing fetched yet.
    Pending,
    /// Fetching the payload into the staging area.
    Downloading,
    /// Checking digest and signature.
    Verifying,
    /// Unpacked with its final relative layout, not yet live.
    Staged,
    /// Conflict detection is running against the prospective set.
    Validating,
    /// Files are being moved into the live plugin directory.
    Committing,
    /// Terminal: live directory updated.
    Committed,
    /// Terminal: aborted before commit, live directory untouched.
    RolledBack,
    /// Terminal: failed; the error records whether live files were touched.
    Failed,
}

/// Errors raised by staging and committing.
#[derive(Error, Debug)]
pub enum StageError {
    /// Filesystem failure in the staging area.
    #[error("staging io error: {0}")]
    Io(#[from] std::io::Error),

    /// Network failure while fetching the payload.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The payload could not be unpacked.
    #[error("payload unpack failed: {0}")]
    Extract(#[from] ExtractError),

    /// The payload digest does not match the manifest.
    #[error("checksum mismatch for {id} {version}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Mod being staged.
        id: ModId,
        /// Version being staged.
        version: ModVersion,
        /// Digest the manifest promised.
        expected: String,
        /// Digest actually computed.
        actual: String,
    },

    /// The payload signature does not verify against the trusted key.
    #[error("signature verification failed for {id} {version}")]
    SignatureInvalid {
        /// Mod being staged.
        id: ModId,
        /// Version being staged.
        version: ModVersion,
    },

    /// A cancellation signal was honored at a state boundary.
    #[error("cancelled before entering {next:?}")]
    Cancelled {
        /// The state that was about to begin.
        next: StageState,
    },

    /// The stager was driven out of order.
    #[error("invalid stage transition from {from:?}")]
    InvalidState {
        /// State the stager was actually in.
        from: StageState,
    },

    /// A move failed partway through commit.
    #[error("commit of {id} failed partway (live files touched: {live_touched}): {source}")]
    CommitPartial {
        /// Mod being committed.
        id: ModId,
        /// `false` when the undo restored the live directory completely.
        live_touched: bool,
        /// The underlying move failure.
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    /// Whether the failure left the live plugin directory modified.
    pub fn live_files_touched(&self) -> bool {
        matches!(self, Self::CommitPartial { live_touched: true, .. })
    }
}

/// Summary of a successful commit.
#[derive(Debug, Clone, Copy)]
pub struct CommitReceipt {
    /// Files moved into the live directory.
    pub files_moved: usize,
    /// Stale files from the previous version removed.
    pub pruned: usize,
}

/// Drives one mod's payload through download, verification, staging and
/// commit.
#[derive(Debug)]
pub struct ModStager {
    descriptor: ModDescriptor,
    state: StageState,
    staging: Option<TempDir>,
    staged_root: Option<PathBuf>,
    dest: PathBuf,
    tmp_parent: PathBuf,
}

impl ModStager {
    /// Prepare a stager for one descriptor against an installation layout.
    pub fn new(descriptor: ModDescriptor, layout: &InstallationLayout) -> Self {
        let dest = layout.mod_dir(&descriptor.id);
        Self {
            dest,
            tmp_parent: layout.tmp_dir(),
            descriptor,
            state: StageState::Pending,
            staging: None,
            staged_root: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> StageState {
        self.state
    }

    /// The descriptor being staged.
    pub fn descriptor(&self) -> &ModDescriptor {
        &self.descriptor
    }

    /// Root of the unpacked staged tree, once `Staged` was reached.
    pub fn staged_root(&self) -> Option<&Path> {
        self.staged_root.as_deref()
    }

    /// Live directory this stager commits into.
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Run `Pending -> Downloading -> Verifying -> Staged`.
    ///
    /// Nothing outside the staging temp directory is touched; any failure
    /// discards the staged files.
    ///
    /// # Errors
    ///
    /// [`StageError::Download`] / [`StageError::Io`] for fetch failures,
    /// [`StageError::ChecksumMismatch`] / [`StageError::SignatureInvalid`]
    /// for verification failures, [`StageError::Cancelled`] when the token
    /// fired at a boundary.
    pub async fn acquire(
        &mut self,
        client: &reqwest::Client,
        trusted_key: Option<&VerifyingKey>,
        reporter: &dyn Reporter,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        if self.state != StageState::Pending {
            return Err(StageError::InvalidState { from: self.state });
        }
        self.check_cancel(cancel, StageState::Downloading)?;
        match self.acquire_inner(client, trusted_key, reporter, cancel).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if !matches!(err, StageError::Cancelled { .. }) {
                    self.state = StageState::Failed;
                }
                // Drop the temp dir: staged files are discarded.
                self.staging = None;
                self.staged_root = None;
                reporter.failed(&self.descriptor.id, &self.descriptor.version, &err.to_string());
                Err(err)
            }
        }
    }

    async fn acquire_inner(
        &mut self,
        client: &reqwest::Client,
        trusted_key: Option<&VerifyingKey>,
        reporter: &dyn Reporter,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let id = self.descriptor.id.clone();
        let version = self.descriptor.version.clone();

        self.state = StageState::Downloading;
        std::fs::create_dir_all(&self.tmp_parent)?;
        let staging = tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(&self.tmp_parent)?;

        // Digest verification for URL payloads happens incrementally while
        // streaming; a mismatch surfaces here as ChecksumMismatch.
        let mut checksum_verified = false;
        let source: PathBuf = match &self.descriptor.payload {
            PayloadLocation::Url(url) => {
                let file_name = url
                    .rsplit('/')
                    .next()
                    .and_then(|n| n.split('?').next())
                    .filter(|n| !n.is_empty())
                    .unwrap_or("payload.bin");
                let dest_file = staging.path().join(file_name);
                let result = DownloadRequest {
                    client,
                    id: &id,
                    version: &version,
                    url,
                    dest: &dest_file,
                    checksum: self.descriptor.checksum.as_ref(),
                }
                .execute(reporter)
                .await;
                match result {
                    Ok(digest) => checksum_verified = digest.is_some(),
                    Err(DownloadError::HashMismatch { expected, actual }) => {
                        return Err(StageError::ChecksumMismatch {
                            id,
                            version,
                            expected,
                            actual,
                        });
                    }
                    Err(other) => return Err(other.into()),
                }
                dest_file
            }
            PayloadLocation::Path(path) => path.clone(),
        };
        self.staging = Some(staging);

        self.check_cancel(cancel, StageState::Verifying)?;
        self.state = StageState::Verifying;

        let source_is_file = source.is_file();
        if let Some(spec) = self.descriptor.checksum.clone() {
            if source_is_file && !checksum_verified {
                let algorithm = spec.algorithm;
                let artifact = source.clone();
                let actual = tokio::task::spawn_blocking(move || {
                    verify::compute_checksum(&artifact, algorithm)
                })
                .await
                .map_err(std::io::Error::other)??;
                if !spec.matches(&actual) {
                    return Err(StageError::ChecksumMismatch {
                        id,
                        version,
                        expected: spec.digest,
                        actual,
                    });
                }
            } else if !source_is_file {
                tracing::debug!(id = id.as_str(), "directory payload, manifest checksum skipped");
            }
        }

        if let (Some(signature), Some(key)) = (&self.descriptor.signature, trusted_key) {
            if source_is_file {
                let valid = verify::verify_signature(&source, signature, key)
                    .map_err(|e| StageError::Io(std::io::Error::other(e)))?;
                if !valid {
                    return Err(StageError::SignatureInvalid { id, version });
                }
            } else {
                tracing::debug!(id = id.as_str(), "directory payload, signature skipped");
            }
        }
        reporter.progress(&id, &version, "verifying", 1.0);

        self.check_cancel(cancel, StageState::Staged)?;
        let staged_root = self
            .staging
            .as_ref()
            .expect("staging dir created above")
            .path()
            .join("staged");
        {
            let source = source.clone();
            let staged_root = staged_root.clone();
            tokio::task::spawn_blocking(move || extract::unpack_payload(&source, &staged_root))
                .await
                .map_err(std::io::Error::other)??;
        }
        self.staged_root = Some(staged_root);
        self.state = StageState::Staged;
        reporter.progress(&id, &version, "staged", 1.0);
        Ok(())
    }

    /// Mark the stager as under conflict validation.
    ///
    /// # Errors
    ///
    /// [`StageError::InvalidState`] unless currently `Staged`.
    pub fn begin_validation(&mut self) -> Result<(), StageError> {
        if self.state != StageState::Staged {
            return Err(StageError::InvalidState { from: self.state });
        }
        self.state = StageState::Validating;
        Ok(())
    }

    /// Record a blocking validation verdict; staged files are discarded.
    pub fn fail_validation(&mut self) {
        self.state = StageState::Failed;
        self.staging = None;
        self.staged_root = None;
    }

    /// Abort before commit. Terminal; the live directory is untouched.
    pub fn discard(&mut self) {
        self.state = StageState::RolledBack;
        self.staging = None;
        self.staged_root = None;
    }

    /// Move staged files into the live plugin directory.
    ///
    /// Runs to completion or full undo; a cancellation requested now is
    /// deliberately not honored. Files already present are displaced to a
    /// stash first (and restored on undo); files from the previous version
    /// that the new payload no longer ships are pruned, except `*.bak`
    /// config backups.
    ///
    /// # Errors
    ///
    /// [`StageError::CommitPartial`] when a move fails; `live_touched`
    /// reports whether the undo restored the directory completely.
    pub fn commit(&mut self, reporter: &dyn Reporter) -> Result<CommitReceipt, StageError> {
        if !matches!(self.state, StageState::Staged | StageState::Validating) {
            return Err(StageError::InvalidState { from: self.state });
        }
        let staged_root = self
            .staged_root
            .clone()
            .ok_or(StageError::InvalidState { from: self.state })?;

        self.state = StageState::Committing;
        let id = self.descriptor.id.clone();
        let version = self.descriptor.version.clone();

        let stash = tempfile::Builder::new()
            .prefix("undo-")
            .tempdir_in(&self.tmp_parent)
            .map_err(StageError::Io)?;

        match commit_moves(&staged_root, &self.dest, stash.path()) {
            Ok(receipt) => {
                self.state = StageState::Committed;
                self.staging = None;
                self.staged_root = None;
                reporter.done(&id, &version, "committed");
                Ok(receipt)
            }
            Err(failure) => {
                self.state = StageState::Failed;
                let live_touched = failure.undo_failed;
                reporter.failed(&id, &version, "commit failed");
                Err(StageError::CommitPartial {
                    id,
                    live_touched,
                    source: failure.source,
                })
            }
        }
    }

    fn check_cancel(
        &mut self,
        cancel: &CancellationToken,
        next: StageState,
    ) -> Result<(), StageError> {
        if cancel.is_cancelled() {
            self.state = StageState::RolledBack;
            self.staging = None;
            self.staged_root = None;
            return Err(StageError::Cancelled { next });
        }
        Ok(())
    }
}

struct CommitFailure {
    source: std::io::Error,
    undo_failed: bool,
}

/// Per-file move journal so a partial commit can be reverted in reverse
/// order.
#[derive(Default)]
struct Journal {
    /// (live path, original staged path)
    placed: Vec<(PathBuf, PathBuf)>,
    /// (stash path, live path)
    displaced: Vec<(PathBuf, PathBuf)>,
    dest_preexisting: bool,
}

impl Journal {
    fn undo(&self, dest: &Path) -> std::io::Result<()> {
        let mut first_err = None;
        for (live, staged) in self.placed.iter().rev() {
            if let Err(e) = std::fs::rename(live, staged) {
                first_err.get_or_insert(e);
            }
        }
        for (stash, live) in self.displaced.iter().rev() {
            if let Some(parent) = live.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            if let Err(e) = std::fs::rename(stash, live) {
                first_err.get_or_insert(e);
            }
        }
        if !self.dest_preexisting {
            std::fs::remove_dir_all(dest).ok();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn commit_moves(
    staged_root: &Path,
    dest: &Path,
    stash: &Path,
) -> Result<CommitReceipt, CommitFailure> {
    let mut journal = Journal {
        dest_preexisting: dest.exists(),
        ..Journal::default()
    };

    let run = |journal: &mut Journal| -> std::io::Result<CommitReceipt> {
        let mut staged_files: Vec<PathBuf> = walkdir::WalkDir::new(staged_root)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect();
        staged_files.sort();

        let mut staged_set: BTreeSet<PathBuf> = BTreeSet::new();
        for staged in &staged_files {
            let rel = staged
                .strip_prefix(staged_root)
                .expect("walked under staged root")
                .to_path_buf();
            let target = dest.join(&rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if target.exists() {
                let stashed = stash.join(&rel);
                if let Some(parent) = stashed.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&target, &stashed)?;
                journal.displaced.push((stashed, target.clone()));
            }
            std::fs::rename(staged, &target)?;
            journal.placed.push((target, staged.clone()));
            staged_set.insert(rel);
        }

        // Prune what the previous version shipped but the new one dropped.
        // User config backups (*.bak) stay.
        let mut pruned = 0usize;
        if journal.dest_preexisting {
            let stale: Vec<PathBuf> = walkdir::WalkDir::new(dest)
                .into_iter()
                .flatten()
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| {
                    e.path()
                        .strip_prefix(dest)
                        .ok()
                        .map(std::path::Path::to_path_buf)
                })
                .filter(|rel| {
                    !staged_set.contains(rel)
                        && !rel.to_string_lossy().ends_with(".bak")
                })
                .collect();
            for rel in stale {
                let live = dest.join(&rel);
                let stashed = stash.join("pruned").join(&rel);
                if let Some(parent) = stashed.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(&live, &stashed)?;
                journal.displaced.push((stashed, live));
                pruned += 1;
            }
        }

        Ok(CommitReceipt {
            files_moved: journal.placed.len(),
            pruned,
        })
    };

    match run(&mut journal) {
        Ok(receipt) => Ok(receipt),
        Err(source) => {
            let undo_failed = journal.undo(dest).is_err();
            Err(CommitFailure {
                source,
                undo_failed,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NullReporter;
    use modwright_schema::{ChecksumAlgorithm, ChecksumSpec};

    fn descriptor_for(id: &str, version: &str, payload: PayloadLocation) -> ModDescriptor {
        ModDescriptor {
            id: ModId::from(id),
            name: id.to_string(),
            version: ModVersion::from(version),
            author: String::new(),
            description: None,
            dependencies: vec![],
            declared_conflicts: vec![],
            load_after: vec![],
            load_before: vec![],
            payload,
            checksum: None,
            signature: None,
        }
    }

    fn payload_dir(root: &Path, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join("payload-src");
        for (rel, content) in files {
            let path = dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn stages_and_commits_a_directory_payload() {
        let root = tempfile::tempdir().unwrap();
        let layout = InstallationLayout::new(root.path());
        layout.ensure_dirs().unwrap();
        let payload = payload_dir(root.path(), &[("plugin.dll", "code"), ("data/t.bin", "rows")]);

        let mut stager = ModStager::new(
            descriptor_for("m", "1.0.0", PayloadLocation::Path(payload)),
            &layout,
        );
        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        stager
            .acquire(&client, None, &NullReporter, &cancel)
            .await
            .unwrap();
        assert_eq!(stager.state(), StageState::Staged);
        assert!(!layout.mod_dir(&ModId::from("m")).exists());

        stager.begin_validation().unwrap();
        let receipt = stager.commit(&NullReporter).unwrap();
        assert_eq!(stager.state(), StageState::Committed);
        assert_eq!(receipt.files_moved, 2);
        let live = layout.mod_dir(&ModId::from("m"));
        assert_eq!(std::fs::read_to_string(live.join("plugin.dll")).unwrap(), "code");
        assert_eq!(std::fs::read_to_string(live.join("data/t.bin")).unwrap(), "rows");
    }

    #[tokio::test]
    async fn checksum_mismatch_discards_and_touches_nothing() {
        let root = tempfile::tempdir().unwrap();
        let layout = InstallationLayout::new(root.path());
        layout.ensure_dirs().unwrap();
        let artifact = root.path().join("mod.bin");
        std::fs::write(&artifact, "payload bytes").unwrap();

        let mut descriptor = descriptor_for("m", "1.0.0", PayloadLocation::Path(artifact));
        descriptor.checksum =
            Some(ChecksumSpec::new(ChecksumAlgorithm::Sha256, &"a".repeat(64)).unwrap());

        let mut stager = ModStager::new(descriptor, &layout);
        let client = reqwest::Client::new();
        let err = stager
            .acquire(&client, None, &NullReporter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::ChecksumMismatch { .. }));
        assert_eq!(stager.state(), StageState::Failed);
        assert!(!err.live_files_touched());
        assert!(!layout.mod_dir(&ModId::from("m")).exists());
    }

    #[tokio::test]
    async fn cancellation_is_honored_before_download() {
        let root = tempfile::tempdir().unwrap();
        let layout = InstallationLayout::new(root.path());
        layout.ensure_dirs().unwrap();
        let payload = payload_dir(root.path(), &[("a.txt", "a")]);

        let mut stager = ModStager::new(
            descriptor_for("m", "1.0.0", PayloadLocation::Path(payload)),
            &layout,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = stager
            .acquire(&reqwest::Client::new(), None, &NullReporter, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Cancelled { .. }));
        assert_eq!(stager.state(), StageState::RolledBack);
    }

    #[tokio::test]
    async fn upgrade_prunes_stale_files_but_keeps_bak() {
        let root = tempfile::tempdir().unwrap();
        let layout = InstallationLayout::new(root.path());
        layout.ensure_dirs().unwrap();
        let live = layout.mod_dir(&ModId::from("m"));
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("old.dll"), "old code").unwrap();
        std::fs::write(live.join("settings.ini.bak"), "backup").unwrap();

        let payload = payload_dir(root.path(), &[("new.dll", "new code")]);
        let mut stager = ModStager::new(
            descriptor_for("m", "2.0.0", PayloadLocation::Path(payload)),
            &layout,
        );
        stager
            .acquire(&reqwest::Client::new(), None, &NullReporter, &CancellationToken::new())
            .await
            .unwrap();
        stager.begin_validation().unwrap();
        let receipt = stager.commit(&NullReporter).unwrap();

        assert_eq!(receipt.pruned, 1);
        assert!(live.join("new.dll").exists());
        assert!(!live.join("old.dll").exists());
        assert_eq!(
            std::fs::read_to_string(live.join("settings.ini.bak")).unwrap(),
            "backup"
        );
    }

    #[tokio::test]
    async fn partial_commit_failure_is_undone() {
        let root = tempfile::tempdir().unwrap();
        let layout = InstallationLayout::new(root.path());
        layout.ensure_dirs().unwrap();
        let live = layout.mod_dir(&ModId::from("m"));
        std::fs::create_dir_all(&live).unwrap();
        // A *file* named "data" forces create_dir_all("data") to fail once
        // the commit reaches data/info.txt, after a.txt already moved.
        std::fs::write(live.join("keep.dll"), "keep").unwrap();
        std::fs::write(live.join("data"), "i am a file").unwrap();

        let payload = payload_dir(
            root.path(),
            &[("a.txt", "first"), ("data/info.txt", "second")],
        );
        let mut stager = ModStager::new(
            descriptor_for("m", "2.0.0", PayloadLocation::Path(payload)),
            &layout,
        );
        stager
            .acquire(&reqwest::Client::new(), None, &NullReporter, &CancellationToken::new())
            .await
            .unwrap();
        stager.begin_validation().unwrap();
        let err = stager.commit(&NullReporter).unwrap_err();

        match err {
            StageError::CommitPartial { live_touched, .. } => assert!(!live_touched),
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(stager.state(), StageState::Failed);
        // Live directory restored to its pre-commit content.
        assert!(!live.join("a.txt").exists());
        assert_eq!(std::fs::read_to_string(live.join("keep.dll")).unwrap(), "keep");
        assert_eq!(std::fs::read_to_string(live.join("data")).unwrap(), "i am a file");
    }

    #[tokio::test]
    async fn commit_from_pending_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let layout = InstallationLayout::new(root.path());
        layout.ensure_dirs().unwrap();
        let mut stager = ModStager::new(
            descriptor_for("m", "1.0.0", PayloadLocation::Path(root.path().join("x"))),
            &layout,
        );
        let err = stager.commit(&NullReporter).unwrap_err();
        assert!(matches!(err, StageError::InvalidState { .. }));
    }
}
