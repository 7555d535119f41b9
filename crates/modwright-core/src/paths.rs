//! Filesystem layout of a managed installation.
//!
//! Everything the core touches lives under the installation root:
//!
//! ```text
//! <root>/plugins/<mod-id>/          live payloads, read by the plugin loader
//! <root>/plugins.disabled/<mod-id>/ disabled payloads, kept for re-enable
//! <root>/.modwright/state.json      installed set + per-mod update settings
//! <root>/.modwright/tmp/            staging area (same volume as plugins/)
//! <root>/.modwright/shipped/<id>/   pristine shipped config copies per mod
//! ```
//!
//! There is deliberately no process-wide "current installation"; every
//! operation receives a layout (or a session built from one) explicitly.

use std::path::{Path, PathBuf};

use modwright_schema::ModId;

/// Resolved directory layout for one game installation.
#[derive(Debug, Clone)]
pub struct InstallationLayout {
    root: PathBuf,
}

impl InstallationLayout {
    /// Anchor a layout at an installation root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The installation root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Live plugin directory scanned by the loader.
    pub fn plugin_root(&self) -> PathBuf {
        self.root.join("plugins")
    }

    /// Sibling staging location for disabled payloads.
    pub fn disabled_root(&self) -> PathBuf {
        self.root.join("plugins.disabled")
    }

    /// Private data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(".modwright")
    }

    /// Persisted installed set and update settings.
    pub fn state_file(&self) -> PathBuf {
        self.data_dir().join("state.json")
    }

    /// Staging area. Kept inside the installation so commits are
    /// same-volume renames.
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir().join("tmp")
    }

    /// Pristine shipped-config snapshot for a mod, used as the merge base.
    pub fn shipped_dir(&self, id: &ModId) -> PathBuf {
        self.data_dir().join("shipped").join(id.as_str())
    }

    /// Live payload directory of an enabled mod.
    pub fn mod_dir(&self, id: &ModId) -> PathBuf {
        self.plugin_root().join(id.as_str())
    }

    /// Payload directory of a disabled mod.
    pub fn disabled_mod_dir(&self, id: &ModId) -> PathBuf {
        self.disabled_root().join(id.as_str())
    }

    /// Create every directory the core expects to exist.
    ///
    /// # Errors
    ///
    /// Propagates the first `std::io::Error` from directory creation.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.plugin_root(),
            self.disabled_root(),
            self.data_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
