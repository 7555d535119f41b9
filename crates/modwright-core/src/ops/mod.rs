//! The update orchestrator.
//!
//! [`Session`] is the explicit per-installation context: it owns the
//! operation lock, the persisted installed set and the two external
//! collaborators (backup/restore and release lookup). Every mutating
//! operation runs the same sequence:
//!
//! 1. resolve a plan (abort before any write on failure);
//! 2. create a restore point when settings ask for one;
//! 3. stage every planned change into isolated temp directories;
//! 4. re-check conflicts against the prospective final set;
//! 5. merge configuration files for upgrades that preserve them;
//! 6. commit, recording state after each committed mod;
//! 7. on failure after anything committed, restore the restore point.
//!
//! Operations against one installation are serialized behind the lock;
//! listing reads a snapshot without exclusivity.

mod error;
pub mod scheduler;

pub use error::UpdateError;

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use modwright_schema::{
    classify_delta, is_newer, Channel, CompatibilityStatus, ConfigFormat, ConflictKind,
    ConflictRecord, InstalledMod, ModDescriptor, ModId, ModVersion, Release, ResolutionOption,
    ResolutionPlan, ResolutionStrategy, Severity, UpdateKind, UpdateSettings,
};

use crate::config;
use crate::conflict::{self, ModTree};
use crate::paths::InstallationLayout;
use crate::reporter::Reporter;
use crate::resolver::{self, Candidates, ResolveRequest};
use crate::stage::ModStager;
use crate::store::{InstalledStore, ModRecord, StoreError};

/// Identifier of a restore point held by the backup collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RestorePointId(String);

impl RestorePointId {
    /// Wrap a backend-issued identifier.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RestorePointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from the backup/restore collaborator.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Anything the backend could not do.
    #[error("backup backend failure: {0}")]
    Backend(String),
}

/// Errors from the release-lookup collaborator.
#[derive(Error, Debug)]
pub enum LookupError {
    /// The catalog does not know the mod at all.
    #[error("mod '{id}' not found in the release catalog")]
    NotFound {
        /// The unknown mod.
        id: ModId,
    },

    /// The mod exists but has no release on the requested channel.
    #[error("no release of '{id}' on channel {channel}")]
    NoRelease {
        /// The mod.
        id: ModId,
        /// The channel that came up empty.
        channel: Channel,
    },

    /// Transport or backend failure.
    #[error("release lookup backend failure: {0}")]
    Backend(String),
}

/// Snapshot/restore of an installation directory tree. Consumed, never
/// implemented here; storage format is the collaborator's business.
#[async_trait]
pub trait BackupProvider: Send + Sync {
    /// Create a restore point of the installation and return its id.
    async fn create_restore_point(
        &self,
        installation: &Path,
        label: &str,
    ) -> Result<RestorePointId, BackupError>;

    /// Restore the installation from a previously created restore point.
    async fn restore(
        &self,
        point: &RestorePointId,
        installation: &Path,
    ) -> Result<(), BackupError>;

    /// List restore points available for the installation.
    async fn list(&self, installation: &Path) -> Result<Vec<RestorePointId>, BackupError>;
}

/// Read-only view of the remote release catalog.
#[async_trait]
pub trait ReleaseLookup: Send + Sync {
    /// Latest release of a mod on a channel.
    async fn latest_release(&self, id: &ModId, channel: Channel)
        -> Result<Release, LookupError>;

    /// Full descriptor (manifest) for one version of a mod.
    async fn descriptor(
        &self,
        id: &ModId,
        version: &ModVersion,
    ) -> Result<ModDescriptor, LookupError>;
}

/// One install/upgrade request from the caller.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// The mod to install or upgrade.
    pub id: ModId,
    /// Pin to this version; `None` means the latest on `channel`.
    pub version: Option<ModVersion>,
    /// Release channel consulted when `version` is `None`.
    pub channel: Channel,
    /// Explicit override for blocking conflict records (declared
    /// conflicts, detector verdicts). Warnings never need it.
    pub acknowledge_conflicts: bool,
}

impl InstallRequest {
    /// Install the latest stable release of a mod.
    pub fn new(id: impl Into<ModId>) -> Self {
        Self {
            id: id.into(),
            version: None,
            channel: Channel::Stable,
            acknowledge_conflicts: false,
        }
    }

    /// Pin the request to one version.
    #[must_use]
    pub fn at_version(mut self, version: impl Into<ModVersion>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Follow a different release channel.
    #[must_use]
    pub fn on_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Accept blocking conflict records and proceed anyway.
    #[must_use]
    pub fn acknowledging_conflicts(mut self) -> Self {
        self.acknowledge_conflicts = true;
        self
    }
}

/// What one successful operation did.
#[derive(Debug)]
pub struct OperationReport {
    /// The executed plan.
    pub plan: ResolutionPlan,
    /// Non-blocking (or explicitly acknowledged) conflict records. Always
    /// surfaced, even on success.
    pub warnings: Vec<ConflictRecord>,
    /// Restore point created for this operation, if any.
    pub restore_point: Option<RestorePointId>,
    /// Config files that went through the three-way merge.
    pub merged_configs: Vec<PathBuf>,
}

/// An update the catalog offers for an installed mod.
#[derive(Debug, Clone)]
pub struct AvailableUpdate {
    /// The mod.
    pub id: ModId,
    /// Currently installed version.
    pub installed: ModVersion,
    /// The newer release.
    pub release: Release,
    /// Patch/minor/major classification of the delta.
    pub kind: UpdateKind,
}

/// Per-installation session: the only way to mutate a managed installation.
pub struct Session {
    layout: InstallationLayout,
    store: RwLock<InstalledStore>,
    op_lock: Mutex<()>,
    backup: Arc<dyn BackupProvider>,
    lookup: Arc<dyn ReleaseLookup>,
    reporter: Arc<dyn Reporter>,
    client: reqwest::Client,
    trusted_key: Option<VerifyingKey>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Outcome of the inner operation run, tracking whether a restore is due.
struct OpFailure {
    error: UpdateError,
    needs_restore: bool,
}

impl Session {
    /// Open (or initialize) a session over an installation root.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the layout cannot be created or the state file
    /// is corrupt.
    pub fn open(
        layout: InstallationLayout,
        backup: Arc<dyn BackupProvider>,
        lookup: Arc<dyn ReleaseLookup>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self, StoreError> {
        layout.ensure_dirs()?;
        let store = InstalledStore::load(layout.state_file())?;
        Ok(Self {
            layout,
            store: RwLock::new(store),
            op_lock: Mutex::new(()),
            backup,
            lookup,
            reporter,
            client: reqwest::Client::new(),
            trusted_key: None,
        })
    }

    /// Trust a publisher key; payloads carrying a signature are then
    /// verified against it during staging.
    #[must_use]
    pub fn with_trusted_key(mut self, key: VerifyingKey) -> Self {
        self.trusted_key = Some(key);
        self
    }

    /// The installation layout this session manages.
    pub fn layout(&self) -> &InstallationLayout {
        &self.layout
    }

    /// Snapshot of every installed mod and its settings. Does not take the
    /// operation lock.
    pub async fn list(&self) -> Vec<ModRecord> {
        self.store.read().await.snapshot()
    }

    /// Update settings for one mod.
    pub async fn settings(&self, id: &ModId) -> Option<UpdateSettings> {
        self.store.read().await.get(id).map(|r| r.settings.clone())
    }

    /// Replace one mod's update settings and persist.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Store`] when the mod is unknown or the state file
    /// cannot be written.
    pub async fn set_settings(
        &self,
        id: &ModId,
        settings: UpdateSettings,
    ) -> Result<(), UpdateError> {
        let _guard = self.op_lock.lock().await;
        let mut store = self.store.write().await;
        store.set_settings(id, settings)?;
        store.save()?;
        Ok(())
    }

    /// Install (or upgrade to) a mod, resolving and staging its
    /// dependencies as one plan.
    ///
    /// # Errors
    ///
    /// Any [`UpdateError`]; resolution failures mutate nothing, staging
    /// failures leave the live directory untouched, commit failures roll
    /// back (via undo or restore point).
    pub async fn install(
        &self,
        request: InstallRequest,
        cancel: &CancellationToken,
    ) -> Result<OperationReport, UpdateError> {
        let _guard = self.op_lock.lock().await;

        let settings = {
            let store = self.store.read().await;
            store
                .get(&request.id)
                .map_or_else(UpdateSettings::default, |r| r.settings.clone())
        };
        let restore_point = if settings.backup_before_update {
            Some(self.create_restore_point("install", &request.id).await?)
        } else {
            None
        };

        let mut store = self.store.write().await;
        match self.run_operation(&request, &mut store, cancel).await {
            Ok(mut report) => {
                report.restore_point = restore_point;
                Ok(report)
            }
            Err(failure) => {
                drop(store);
                self.fail_with_restore(failure.error, restore_point, failure.needs_restore)
                    .await
            }
        }
    }

    /// Check for available updates across the installed set. Read-only;
    /// takes no lock and writes nothing.
    ///
    /// # Errors
    ///
    /// [`UpdateError::Lookup`] on backend failures (an unknown mod is
    /// skipped, not an error).
    pub async fn check_updates(&self) -> Result<Vec<AvailableUpdate>, UpdateError> {
        let records = self.list().await;
        let mut available = Vec::new();
        for record in records {
            let id = record.installed.id().clone();
            match self
                .lookup
                .latest_release(&id, record.settings.channel)
                .await
            {
                Ok(release)
                    if is_newer(&record.installed.installed_version, &release.version) =>
                {
                    let kind =
                        classify_delta(&record.installed.installed_version, &release.version)
                            .unwrap_or(UpdateKind::Patch);
                    available.push(AvailableUpdate {
                        id,
                        installed: record.installed.installed_version.clone(),
                        release,
                        kind,
                    });
                }
                Ok(_) => {}
                Err(LookupError::NotFound { .. } | LookupError::NoRelease { .. }) => {
                    tracing::debug!(id = id.as_str(), "no catalog entry, skipping update check");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(available)
    }

    /// Apply updates for the given mods (or every auto-update mod when
    /// `ids` is `None`). The whole batch shares one umbrella restore
    /// point: a failure in a later mod's update also restores the earlier
    /// ones committed in the same batch.
    ///
    /// # Errors
    ///
    /// Any [`UpdateError`]. [`UpdateError::NotInstalled`] when an explicit
    /// id is unknown.
    pub async fn apply_updates(
        &self,
        ids: Option<&[ModId]>,
        cancel: &CancellationToken,
    ) -> Result<Vec<OperationReport>, UpdateError> {
        let _guard = self.op_lock.lock().await;

        let snapshot = self.store.read().await.snapshot();
        let targets: Vec<ModRecord> = match ids {
            Some(ids) => {
                let mut picked = Vec::new();
                for id in ids {
                    let record = snapshot
                        .iter()
                        .find(|r| r.installed.id() == id)
                        .cloned()
                        .ok_or_else(|| UpdateError::NotInstalled { id: id.clone() })?;
                    picked.push(record);
                }
                picked
            }
            None => snapshot
                .into_iter()
                .filter(|r| r.settings.auto_update && r.installed.enabled)
                .collect(),
        };

        let mut updates: Vec<(ModRecord, Release)> = Vec::new();
        for record in targets {
            let id = record.installed.id().clone();
            match self
                .lookup
                .latest_release(&id, record.settings.channel)
                .await
            {
                Ok(release)
                    if is_newer(&record.installed.installed_version, &release.version) =>
                {
                    updates.push((record, release));
                }
                Ok(_) => {}
                Err(LookupError::NotFound { .. } | LookupError::NoRelease { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let restore_point = if updates.iter().any(|(r, _)| r.settings.backup_before_update) {
            Some(self.create_restore_point("update", &ModId::from("batch")).await?)
        } else {
            None
        };

        let mut reports = Vec::new();
        let mut committed_any = false;
        for (record, release) in updates {
            let request = InstallRequest {
                id: record.installed.id().clone(),
                version: Some(release.version.clone()),
                channel: record.settings.channel,
                acknowledge_conflicts: false,
            };
            let mut store = self.store.write().await;
            match self.run_operation(&request, &mut store, cancel).await {
                Ok(mut report) => {
                    drop(store);
                    committed_any = true;
                    report.restore_point = restore_point.clone();
                    reports.push(report);
                }
                Err(failure) => {
                    drop(store);
                    let needs_restore = failure.needs_restore || committed_any;
                    return self
                        .fail_with_restore(failure.error, restore_point, needs_restore)
                        .await
                        .map(|_: OperationReport| Vec::new());
                }
            }
        }
        Ok(reports)
    }

    /// Remove a mod's payload and record. Refuses while another enabled
    /// mod requires it, unless `force` is set.
    ///
    /// # Errors
    ///
    /// [`UpdateError::NotInstalled`], [`UpdateError::ConflictBlocking`]
    /// (dependents), or [`UpdateError::Store`] / IO wrapped in `Store`.
    pub async fn uninstall(&self, id: &ModId, force: bool) -> Result<(), UpdateError> {
        let _guard = self.op_lock.lock().await;
        let mut store = self.store.write().await;

        let record = store
            .get(id)
            .cloned()
            .ok_or_else(|| UpdateError::NotInstalled { id: id.clone() })?;

        let dependents: Vec<ModId> = store
            .installed()
            .into_iter()
            .filter(|m| m.enabled && m.id() != id)
            .filter(|m| {
                m.descriptor
                    .required_dependencies()
                    .any(|d| &d.mod_id == id)
            })
            .map(|m| m.id().clone())
            .collect();
        if !dependents.is_empty() && !force {
            let mut involved = vec![id.clone()];
            involved.extend(dependents.iter().cloned());
            return Err(UpdateError::ConflictBlocking {
                records: vec![ConflictRecord {
                    kind: ConflictKind::DependencyConflict,
                    severity: Severity::Error,
                    involved,
                    description: format!(
                        "{} is required by {}",
                        id,
                        dependents
                            .iter()
                            .map(ModId::as_str)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                    resolutions: vec![ResolutionOption {
                        strategy: ResolutionStrategy::AcknowledgeConflict,
                        can_auto_resolve: false,
                    }],
                }],
            });
        }

        if record.installed.install_dir.exists() {
            std::fs::remove_dir_all(&record.installed.install_dir)
                .map_err(StoreError::Io)?;
        }
        let shipped = self.layout.shipped_dir(id);
        if shipped.exists() {
            std::fs::remove_dir_all(shipped).map_err(StoreError::Io)?;
        }
        store.remove(id);
        store.save()?;
        self.reporter
            .done(id, &record.installed.installed_version, "uninstalled");
        Ok(())
    }

    /// Enable or disable a mod. A disabled payload moves to the sibling
    /// disabled-staging location, so re-enabling needs no re-download.
    ///
    /// # Errors
    ///
    /// [`UpdateError::NotInstalled`] or [`UpdateError::Store`].
    pub async fn set_enabled(&self, id: &ModId, enabled: bool) -> Result<(), UpdateError> {
        let _guard = self.op_lock.lock().await;
        let mut store = self.store.write().await;

        let record = store
            .get(id)
            .ok_or_else(|| UpdateError::NotInstalled { id: id.clone() })?;
        if record.installed.enabled == enabled {
            return Ok(());
        }

        let (from, to) = if enabled {
            (self.layout.disabled_mod_dir(id), self.layout.mod_dir(id))
        } else {
            (self.layout.mod_dir(id), self.layout.disabled_mod_dir(id))
        };
        if from.exists() {
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
            }
            std::fs::rename(&from, &to).map_err(StoreError::Io)?;
        }
        store.set_enabled(id, enabled, to)?;
        store.save()?;
        Ok(())
    }

    async fn create_restore_point(
        &self,
        operation: &str,
        id: &ModId,
    ) -> Result<RestorePointId, UpdateError> {
        let label = format!(
            "pre-{operation}-{id}-{}",
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        );
        Ok(self
            .backup
            .create_restore_point(self.layout.root(), &label)
            .await?)
    }

    /// The shared resolve -> stage -> validate -> merge -> commit sequence
    /// for one request. `needs_restore` is set once any commit ran (or a
    /// partial commit touched live files).
    async fn run_operation(
        &self,
        request: &InstallRequest,
        store: &mut InstalledStore,
        cancel: &CancellationToken,
    ) -> Result<OperationReport, OpFailure> {
        let fail = |error: UpdateError| OpFailure {
            error,
            needs_restore: false,
        };

        if cancel.is_cancelled() {
            return Err(fail(UpdateError::Cancelled));
        }

        // (2) Resolve. Errors here mutate nothing.
        let installed = store.installed();
        let candidates = self
            .gather_candidates(request, store)
            .await
            .map_err(fail)?;
        let requests = [match &request.version {
            Some(version) => ResolveRequest::pinned(request.id.clone(), version.clone()),
            None => ResolveRequest::latest(request.id.clone()),
        }];
        let plan =
            resolver::resolve(&requests, &installed, &candidates).map_err(|e| fail(e.into()))?;

        if !plan.is_executable() {
            return Err(fail(UpdateError::ConflictBlocking {
                records: plan.unresolved.clone(),
            }));
        }
        if !plan.advisories.is_empty() && !request.acknowledge_conflicts {
            return Err(fail(UpdateError::ConflictBlocking {
                records: plan.advisories.clone(),
            }));
        }
        let mut warnings: Vec<ConflictRecord> = plan.advisories.clone();

        // (3) Stage every planned change; nothing touches the live tree.
        let mut stagers: Vec<ModStager> = Vec::new();
        for step in plan.changes() {
            let Some(descriptor) = candidates.find(&step.mod_id, &step.target_version).cloned()
            else {
                return Err(fail(
                    LookupError::NotFound {
                        id: step.mod_id.clone(),
                    }
                    .into(),
                ));
            };
            let mut stager = ModStager::new(descriptor, &self.layout);
            let result = stager
                .acquire(
                    &self.client,
                    self.trusted_key.as_ref(),
                    self.reporter.as_ref(),
                    cancel,
                )
                .await;
            if let Err(err) = result {
                for s in &mut stagers {
                    s.discard();
                }
                return Err(fail(err.into()));
            }
            stagers.push(stager);
        }

        // (4) Conflict re-check against the prospective final set.
        let staged_ids: HashSet<&ModId> =
            stagers.iter().map(|s| &s.descriptor().id).collect();
        let mut trees: Vec<ModTree> = store
            .installed()
            .into_iter()
            .filter(|m| !staged_ids.contains(m.id()))
            .map(|m| ModTree {
                id: m.id().clone(),
                version: m.installed_version.clone(),
                descriptor: m.descriptor.clone(),
                root: m.install_dir.clone(),
                enabled: m.enabled,
            })
            .collect();
        for stager in &stagers {
            trees.push(ModTree {
                id: stager.descriptor().id.clone(),
                version: stager.descriptor().version.clone(),
                descriptor: stager.descriptor().clone(),
                root: stager
                    .staged_root()
                    .expect("stager reached Staged")
                    .to_path_buf(),
                enabled: true,
            });
        }
        for stager in &mut stagers {
            stager.begin_validation().map_err(|e| fail(e.into()))?;
        }
        let records = conflict::detect_conflicts(&trees);
        let (blocking, advisory): (Vec<ConflictRecord>, Vec<ConflictRecord>) =
            records.into_iter().partition(|r| r.is_blocking());
        warnings.extend(advisory);
        if !blocking.is_empty() && !request.acknowledge_conflicts {
            for stager in &mut stagers {
                stager.fail_validation();
            }
            return Err(fail(UpdateError::ConflictBlocking { records: blocking }));
        }
        warnings.extend(blocking);

        // (5) Config merge for upgrades that preserve user configs.
        // Pristine shipped copies are captured first so the post-commit
        // snapshot stores defaults, not merged output.
        let mut shipped_snapshots: Vec<Vec<(PathBuf, Vec<u8>)>> = Vec::new();
        let mut merged_configs: Vec<PathBuf> = Vec::new();
        let mut merge_failure: Option<UpdateError> = None;
        'merge: for idx in 0..stagers.len() {
            let staged_root = stagers[idx]
                .staged_root()
                .expect("stager reached Staged")
                .to_path_buf();
            let id = stagers[idx].descriptor().id.clone();
            let captured = match capture_configs(&staged_root) {
                Ok(captured) => captured,
                Err(err) => {
                    merge_failure = Some(StoreError::Io(err).into());
                    break 'merge;
                }
            };

            if let Some(record) = store.get(&id) {
                if record.settings.preserve_configs {
                    let shipped_dir = self.layout.shipped_dir(&id);
                    for (rel, _) in &captured {
                        let live_file = record.installed.install_dir.join(rel);
                        if !live_file.is_file() {
                            continue;
                        }
                        let staged_file = staged_root.join(rel);
                        let old_shipped = shipped_dir.join(rel);
                        if let Err(err) = config::merge_file(
                            Some(old_shipped.as_path()),
                            &live_file,
                            &staged_file,
                        ) {
                            merge_failure = Some(err.into());
                            break 'merge;
                        }
                        merged_configs.push(rel.clone());
                    }
                }
            }
            shipped_snapshots.push(captured);
        }
        if let Some(error) = merge_failure {
            for stager in &mut stagers {
                stager.discard();
            }
            return Err(fail(error));
        }

        if cancel.is_cancelled() {
            for stager in &mut stagers {
                stager.discard();
            }
            return Err(fail(UpdateError::Cancelled));
        }

        // (6) Commit. From here on a failure needs restore-point recovery.
        let mut committed_any = false;
        for (stager, captured) in stagers.iter_mut().zip(shipped_snapshots) {
            let receipt = stager.commit(self.reporter.as_ref()).map_err(|err| {
                let needs_restore = committed_any || err.live_files_touched();
                OpFailure {
                    error: err.into(),
                    needs_restore,
                }
            })?;
            committed_any = true;
            tracing::info!(
                id = stager.descriptor().id.as_str(),
                version = stager.descriptor().version.as_str(),
                files = receipt.files_moved,
                pruned = receipt.pruned,
                "committed"
            );

            let id = stager.descriptor().id.clone();
            self.write_shipped_snapshot(&id, &captured)
                .map_err(|e| OpFailure {
                    error: UpdateError::Store(StoreError::Io(e)),
                    needs_restore: true,
                })?;

            let compatibility = if warnings.iter().any(|w| w.involved.contains(&id)) {
                CompatibilityStatus::CompatibleWithIssues
            } else {
                CompatibilityStatus::Compatible
            };
            let settings = store
                .get(&id)
                .map_or_else(UpdateSettings::default, |r| r.settings.clone());
            store.upsert(ModRecord {
                installed: InstalledMod {
                    descriptor: stager.descriptor().clone(),
                    installed_version: stager.descriptor().version.clone(),
                    enabled: true,
                    install_dir: self.layout.mod_dir(&id),
                    compatibility,
                },
                settings,
            });
            store.save().map_err(|e| OpFailure {
                error: e.into(),
                needs_restore: true,
            })?;
        }

        for warning in &warnings {
            self.reporter.warning(&warning.description);
        }

        Ok(OperationReport {
            plan,
            warnings,
            restore_point: None,
            merged_configs,
        })
    }

    /// Fetch descriptors for everything reachable from the request:
    /// installed descriptors plus the channel-latest (or pinned) release of
    /// each mod in the closure.
    async fn gather_candidates(
        &self,
        request: &InstallRequest,
        store: &InstalledStore,
    ) -> Result<Candidates, UpdateError> {
        let mut candidates = Candidates::default();
        for m in store.installed() {
            candidates.insert(m.descriptor);
        }

        let mut pending: VecDeque<(ModId, Option<ModVersion>)> =
            VecDeque::from([(request.id.clone(), request.version.clone())]);
        let mut seen: HashSet<ModId> = HashSet::new();

        while let Some((id, version)) = pending.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let channel = store
                .get(&id)
                .map_or(request.channel, |r| r.settings.channel);

            let descriptor = match version {
                Some(version) => self.lookup.descriptor(&id, &version).await?,
                None => match self.lookup.latest_release(&id, channel).await {
                    Ok(release) => self.lookup.descriptor(&id, &release.version).await?,
                    Err(LookupError::NotFound { .. } | LookupError::NoRelease { .. })
                        if store.get(&id).is_some() =>
                    {
                        // Not in the catalog (e.g. manually installed);
                        // the installed descriptor already serves.
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                },
            };
            for dep in descriptor.required_dependencies() {
                pending.push_back((dep.mod_id.clone(), None));
            }
            candidates.insert(descriptor);
        }
        Ok(candidates)
    }

    fn write_shipped_snapshot(
        &self,
        id: &ModId,
        captured: &[(PathBuf, Vec<u8>)],
    ) -> std::io::Result<()> {
        let dir = self.layout.shipped_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        if captured.is_empty() {
            return Ok(());
        }
        for (rel, bytes) in captured {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }

    /// Restore-point recovery path shared by install and batch update.
    async fn fail_with_restore(
        &self,
        error: UpdateError,
        restore_point: Option<RestorePointId>,
        needs_restore: bool,
    ) -> Result<OperationReport, UpdateError> {
        let Some(point) = restore_point else {
            return Err(error);
        };
        if !needs_restore {
            return Err(error);
        }

        tracing::warn!(restore_point = point.as_str(), "restoring after failed commit");
        match self.backup.restore(&point, self.layout.root()).await {
            Ok(()) => {
                // The restore brought back the old state file; drop the
                // stale in-memory view.
                let reloaded = InstalledStore::load(self.layout.state_file())?;
                *self.store.write().await = reloaded;
                Err(UpdateError::RolledBack {
                    restore_point: point,
                    source: Box::new(error),
                })
            }
            Err(restore_err) => Err(UpdateError::RestoreFailure {
                restore_point: point,
                reason: restore_err.to_string(),
            }),
        }
    }
}

/// Config-format files of a staged tree, as (relative path, bytes).
fn capture_configs(root: &Path) -> std::io::Result<Vec<(PathBuf, Vec<u8>)>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        if ConfigFormat::from_path(rel).is_none() {
            continue;
        }
        out.push((rel.to_path_buf(), std::fs::read(entry.path())?));
    }
    out.sort();
    Ok(out)
}
