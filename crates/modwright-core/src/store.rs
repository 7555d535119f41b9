//! Persisted installed set and per-mod update settings.
//!
//! One JSON state file per installation (`.modwright/state.json`), written
//! atomically via a temp file + rename. Listing callers get cloned
//! snapshots; mutation happens only inside the session's operation lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use modwright_schema::{InstalledMod, ModId, UpdateSettings};

/// Errors reading or writing the state file.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt state file.
    #[error("state file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    /// An operation referenced a mod that is not installed.
    #[error("mod '{id}' is not installed")]
    UnknownMod {
        /// The missing mod.
        id: ModId,
    },
}

/// One installed mod together with its update settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModRecord {
    /// Installed state.
    pub installed: InstalledMod,
    /// Update behavior for this mod.
    pub settings: UpdateSettings,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    mods: Vec<ModRecord>,
}

/// In-memory view of the state file, keyed by mod id.
#[derive(Debug)]
pub struct InstalledStore {
    path: PathBuf,
    records: BTreeMap<ModId, ModRecord>,
}

impl InstalledStore {
    /// Load the store from `path`; a missing file is an empty store.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] on read failure, [`StoreError::Malformed`] when
    /// the file exists but does not parse.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let state: StateFile = serde_json::from_str(&raw)?;
            state
                .mods
                .into_iter()
                .map(|r| (r.installed.id().clone(), r))
                .collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, records })
    }

    /// Write the store back to disk atomically.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] or [`StoreError::Malformed`] (serialization).
    pub fn save(&self) -> Result<(), StoreError> {
        let state = StateFile {
            mods: self.records.values().cloned().collect(),
        };
        let rendered = serde_json::to_string_pretty(&state)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, rendered)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Where this store persists.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up one record.
    pub fn get(&self, id: &ModId) -> Option<&ModRecord> {
        self.records.get(id)
    }

    /// Snapshot of every record, ordered by mod id.
    pub fn snapshot(&self) -> Vec<ModRecord> {
        self.records.values().cloned().collect()
    }

    /// Installed mods only (no settings), ordered by mod id.
    pub fn installed(&self) -> Vec<InstalledMod> {
        self.records.values().map(|r| r.installed.clone()).collect()
    }

    /// Number of installed mods.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or replace a record.
    pub fn upsert(&mut self, record: ModRecord) {
        self.records.insert(record.installed.id().clone(), record);
    }

    /// Remove a record, returning it if present.
    pub fn remove(&mut self, id: &ModId) -> Option<ModRecord> {
        self.records.remove(id)
    }

    /// Flip the enabled flag and record the new payload directory.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownMod`] when `id` is not installed.
    pub fn set_enabled(
        &mut self,
        id: &ModId,
        enabled: bool,
        install_dir: PathBuf,
    ) -> Result<(), StoreError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownMod { id: id.clone() })?;
        record.installed.enabled = enabled;
        record.installed.install_dir = install_dir;
        Ok(())
    }

    /// Replace a mod's update settings.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownMod`] when `id` is not installed.
    pub fn set_settings(&mut self, id: &ModId, settings: UpdateSettings) -> Result<(), StoreError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownMod { id: id.clone() })?;
        record.settings = settings;
        Ok(())
    }
}
