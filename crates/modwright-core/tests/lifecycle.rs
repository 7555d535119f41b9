//! End-to-end lifecycle tests: install, upgrade, conflict blocking, config
//! preservation, rollback and enable/disable against a real (temporary)
//! installation tree, with directory-copy backup and in-memory catalog
//! collaborators.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use modwright_core::io::extract::copy_dir_all;
use modwright_core::ops::{
    AvailableUpdate, BackupError, BackupProvider, InstallRequest, LookupError, ReleaseLookup,
    RestorePointId, Session, UpdateError,
};
use modwright_core::resolver::ResolveError;
use modwright_core::stage::StageError;
use modwright_core::{InstallationLayout, NullReporter};
use modwright_schema::{
    Channel, ChecksumAlgorithm, ChecksumSpec, ConflictKind, Constraint, DependencyConstraint,
    ModDescriptor, ModId, ModVersion, PayloadLocation, Release, Severity, UpdateKind,
};

/// Directory-copy backup collaborator: a restore point is a full copy of
/// the installation root.
struct DirBackup {
    storage: TempDir,
    counter: AtomicUsize,
}

impl DirBackup {
    fn new() -> Self {
        Self {
            storage: TempDir::new().expect("backup storage"),
            counter: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BackupProvider for DirBackup {
    async fn create_restore_point(
        &self,
        installation: &Path,
        label: &str,
    ) -> Result<RestorePointId, BackupError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("rp-{n}-{label}");
        let dest = self.storage.path().join(&id);
        copy_dir_all(installation, &dest).map_err(|e| BackupError::Backend(e.to_string()))?;
        Ok(RestorePointId::new(id))
    }

    async fn restore(
        &self,
        point: &RestorePointId,
        installation: &Path,
    ) -> Result<(), BackupError> {
        let source = self.storage.path().join(point.as_str());
        if !source.exists() {
            return Err(BackupError::Backend(format!("unknown restore point {point}")));
        }
        for entry in
            std::fs::read_dir(installation).map_err(|e| BackupError::Backend(e.to_string()))?
        {
            let entry = entry.map_err(|e| BackupError::Backend(e.to_string()))?;
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            result.map_err(|e| BackupError::Backend(e.to_string()))?;
        }
        copy_dir_all(&source, installation).map_err(|e| BackupError::Backend(e.to_string()))
    }

    async fn list(&self, _installation: &Path) -> Result<Vec<RestorePointId>, BackupError> {
        let mut out = Vec::new();
        for entry in
            std::fs::read_dir(self.storage.path()).map_err(|e| BackupError::Backend(e.to_string()))?
        {
            let entry = entry.map_err(|e| BackupError::Backend(e.to_string()))?;
            out.push(RestorePointId::new(entry.file_name().to_string_lossy()));
        }
        Ok(out)
    }
}

/// In-memory release catalog; tests mutate it between operations to
/// publish upgrades.
#[derive(Default)]
struct StaticCatalog {
    inner: Mutex<CatalogInner>,
}

#[derive(Default)]
struct CatalogInner {
    latest: HashMap<ModId, Release>,
    descriptors: HashMap<(ModId, ModVersion), ModDescriptor>,
}

impl StaticCatalog {
    fn publish(&self, descriptor: ModDescriptor) {
        let mut inner = self.inner.lock().unwrap();
        let release = Release {
            version: descriptor.version.clone(),
            download_url: descriptor.payload.to_string(),
            checksum: descriptor.checksum.clone(),
            published_at: chrono::Utc::now(),
        };
        let replace = inner
            .latest
            .get(&descriptor.id)
            .map_or(true, |r| modwright_schema::is_newer(&r.version, &descriptor.version));
        if replace {
            inner.latest.insert(descriptor.id.clone(), release);
        }
        inner
            .descriptors
            .insert((descriptor.id.clone(), descriptor.version.clone()), descriptor);
    }
}

#[async_trait]
impl ReleaseLookup for StaticCatalog {
    async fn latest_release(
        &self,
        id: &ModId,
        _channel: Channel,
    ) -> Result<Release, LookupError> {
        self.inner
            .lock()
            .unwrap()
            .latest
            .get(id)
            .cloned()
            .ok_or_else(|| LookupError::NotFound { id: id.clone() })
    }

    async fn descriptor(
        &self,
        id: &ModId,
        version: &ModVersion,
    ) -> Result<ModDescriptor, LookupError> {
        self.inner
            .lock()
            .unwrap()
            .descriptors
            .get(&(id.clone(), version.clone()))
            .cloned()
            .ok_or_else(|| LookupError::NotFound { id: id.clone() })
    }
}

/// One temporary game installation plus its collaborators.
struct World {
    root: TempDir,
    payloads: TempDir,
    catalog: Arc<StaticCatalog>,
    backup: Arc<DirBackup>,
}

impl World {
    fn new() -> Self {
        Self {
            root: TempDir::new().expect("install root"),
            payloads: TempDir::new().expect("payload root"),
            catalog: Arc::new(StaticCatalog::default()),
            backup: Arc::new(DirBackup::new()),
        }
    }

    fn session(&self) -> Session {
        Session::open(
            InstallationLayout::new(self.root.path()),
            self.backup.clone(),
            self.catalog.clone(),
            Arc::new(NullReporter),
        )
        .expect("session opens")
    }

    fn layout(&self) -> InstallationLayout {
        InstallationLayout::new(self.root.path())
    }

    /// Create a payload directory and publish a catalog entry for it.
    fn publish_mod(
        &self,
        id: &str,
        version: &str,
        files: &[(&str, &str)],
        deps: &[(&str, &str)],
    ) -> ModDescriptor {
        let payload = self
            .payloads
            .path()
            .join(format!("{id}-{version}"));
        for (rel, content) in files {
            let path = payload.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        std::fs::create_dir_all(&payload).unwrap();

        let descriptor = ModDescriptor {
            id: ModId::from(id),
            name: id.to_string(),
            version: ModVersion::from(version),
            author: "test".to_string(),
            description: None,
            dependencies: deps
                .iter()
                .map(|(target, expr)| DependencyConstraint {
                    mod_id: ModId::from(*target),
                    constraint: Constraint::parse(expr).unwrap(),
                    optional: false,
                })
                .collect(),
            declared_conflicts: vec![],
            load_after: vec![],
            load_before: vec![],
            payload: PayloadLocation::Path(payload),
            checksum: None,
            signature: None,
        };
        self.catalog.publish(descriptor.clone());
        descriptor
    }
}

fn snapshot_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).into_iter().flatten() {
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned();
            out.insert(rel, std::fs::read(entry.path()).unwrap());
        }
    }
    out
}

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

/// Route core tracing to stderr when a test is run with RUST_LOG set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn install_resolves_and_commits_dependencies_first() {
    init_tracing();
    let world = World::new();
    world.publish_mod("core-lib", "1.5.0", &[("core.dll", "core code")], &[]);
    world.publish_mod(
        "gadget",
        "1.0.0",
        &[("gadget.dll", "gadget code")],
        &[("core-lib", ">=1.0.0,<2.0.0")],
    );

    let session = world.session();
    let report = session
        .install(InstallRequest::new("gadget"), &cancel())
        .await
        .expect("install succeeds");

    let order: Vec<&str> = report
        .plan
        .steps
        .iter()
        .map(|s| s.mod_id.as_str())
        .collect();
    assert_eq!(order, ["core-lib", "gadget"]);
    assert!(report.restore_point.is_some());
    assert!(report.warnings.is_empty());

    let layout = world.layout();
    assert_eq!(
        std::fs::read_to_string(layout.mod_dir(&ModId::from("core-lib")).join("core.dll"))
            .unwrap(),
        "core code"
    );
    assert_eq!(
        std::fs::read_to_string(layout.mod_dir(&ModId::from("gadget")).join("gadget.dll"))
            .unwrap(),
        "gadget code"
    );

    let records = session.list().await;
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.installed.enabled));
    // Settings are created with defaults on first install.
    assert!(records.iter().all(|r| r.settings.backup_before_update));
}

#[tokio::test]
async fn unsatisfiable_constraints_in_one_plan_stage_nothing() {
    let world = World::new();
    world.publish_mod("b", "2.1.0", &[("b.dll", "b")], &[]);
    world.publish_mod("a", "1.0.0", &[("a.dll", "a")], &[("b", "<1.0.0")]);
    world.publish_mod("c", "1.0.0", &[("c.dll", "c")], &[("b", ">=2.0.0")]);
    world.publish_mod(
        "bundle",
        "1.0.0",
        &[("bundle.dll", "x")],
        &[("a", ">=1.0.0"), ("c", ">=1.0.0")],
    );

    let session = world.session();
    let err = session
        .install(InstallRequest::new("bundle"), &cancel())
        .await
        .unwrap_err();

    match err {
        UpdateError::Resolve(ResolveError::Unsatisfiable { id, constraints }) => {
            assert_eq!(id.as_str(), "b");
            let all = constraints.join("; ");
            assert!(all.contains("<1.0.0"), "{all}");
            assert!(all.contains(">=2.0.0"), "{all}");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Nothing staged or committed.
    let plugin_root = world.layout().plugin_root();
    assert_eq!(std::fs::read_dir(plugin_root).unwrap().count(), 0);
    assert!(session.list().await.is_empty());
}

#[tokio::test]
async fn dependency_cycle_fails_before_any_write() {
    let world = World::new();
    world.publish_mod("a", "1.0.0", &[("a.dll", "a")], &[("b", ">=1.0.0")]);
    world.publish_mod("b", "1.0.0", &[("b.dll", "b")], &[("a", ">=1.0.0")]);

    let session = world.session();
    let err = session
        .install(InstallRequest::new("a"), &cancel())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Resolve(ResolveError::DependencyCycle { .. })
    ));
    assert!(session.list().await.is_empty());
}

#[tokio::test]
async fn file_conflict_blocks_and_leaves_live_tree_untouched() {
    let world = World::new();
    world.publish_mod("one", "1.0.0", &[("textures/rock.dds", "AAAA")], &[]);
    world.publish_mod("two", "1.0.0", &[("textures/rock.dds", "BBBB")], &[]);

    let session = world.session();
    session
        .install(InstallRequest::new("one"), &cancel())
        .await
        .unwrap();
    let before = snapshot_tree(&world.layout().plugin_root());

    let err = session
        .install(InstallRequest::new("two"), &cancel())
        .await
        .unwrap_err();
    match err {
        UpdateError::ConflictBlocking { records } => {
            assert!(records
                .iter()
                .any(|r| r.kind == ConflictKind::FileConflict && r.severity == Severity::Critical));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(snapshot_tree(&world.layout().plugin_root()), before);
    assert_eq!(session.list().await.len(), 1);
}

#[tokio::test]
async fn upgrade_preserves_user_edited_config() {
    let world = World::new();
    world.publish_mod(
        "tweaks",
        "1.0.0",
        &[("tweaks.dll", "v1"), ("config/settings.ini", "Volume = 50\n")],
        &[],
    );

    let session = world.session();
    session
        .install(InstallRequest::new("tweaks"), &cancel())
        .await
        .unwrap();

    // The user turns the volume up.
    let live_config = world
        .layout()
        .mod_dir(&ModId::from("tweaks"))
        .join("config/settings.ini");
    std::fs::write(&live_config, "Volume = 80\n").unwrap();

    // The new version ships a different default.
    world.publish_mod(
        "tweaks",
        "1.1.0",
        &[("tweaks.dll", "v2"), ("config/settings.ini", "Volume = 70\n")],
        &[],
    );

    let reports = session
        .apply_updates(Some(&[ModId::from("tweaks")]), &cancel())
        .await
        .expect("update succeeds");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].merged_configs, vec![PathBuf::from("config/settings.ini")]);

    assert_eq!(std::fs::read_to_string(&live_config).unwrap(), "Volume = 80\n");
    let backup = live_config.with_file_name("settings.ini.bak");
    assert_eq!(std::fs::read_to_string(backup).unwrap(), "Volume = 80\n");

    let records = session.list().await;
    assert_eq!(records[0].installed.installed_version, ModVersion::from("1.1.0"));
    // The shipped snapshot now holds 1.1.0's pristine defaults.
    let shipped = world
        .layout()
        .shipped_dir(&ModId::from("tweaks"))
        .join("config/settings.ini");
    assert_eq!(std::fs::read_to_string(shipped).unwrap(), "Volume = 70\n");
}

#[tokio::test]
async fn induced_commit_failure_restores_live_tree_byte_identical() {
    let world = World::new();
    world.publish_mod("solid", "1.0.0", &[("a.txt", "one"), ("blocker", "flat file")], &[]);

    let session = world.session();
    session
        .install(InstallRequest::new("solid"), &cancel())
        .await
        .unwrap();
    let before = snapshot_tree(world.root.path());

    // 2.0.0 ships a directory where 1.0.0 shipped the file "blocker", but
    // ordered after a.txt so the commit fails partway through.
    world.publish_mod(
        "solid",
        "2.0.0",
        &[("a.txt", "two"), ("blocker/inner.txt", "nested")],
        &[],
    );

    let err = session
        .apply_updates(Some(&[ModId::from("solid")]), &cancel())
        .await
        .unwrap_err();

    match &err {
        UpdateError::Stage(StageError::CommitPartial { live_touched, .. }) => {
            assert!(!*live_touched, "undo should have restored the live tree");
        }
        UpdateError::RolledBack { .. } => {}
        other => panic!("unexpected error: {other}"),
    }

    // The plugin tree is byte-identical to its pre-update state.
    let after = snapshot_tree(world.root.path());
    let plugin_files = |t: &BTreeMap<String, Vec<u8>>| -> BTreeMap<String, Vec<u8>> {
        t.iter()
            .filter(|(k, _)| k.starts_with("plugins/"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    assert_eq!(plugin_files(&after), plugin_files(&before));
    assert_eq!(
        session.list().await[0].installed.installed_version,
        ModVersion::from("1.0.0")
    );
}

#[tokio::test]
async fn batch_failure_restores_earlier_commits_in_same_batch() {
    let world = World::new();
    world.publish_mod("first", "1.0.0", &[("first.dll", "first v1")], &[]);
    world.publish_mod("second", "1.0.0", &[("second.dll", "second v1")], &[]);

    let session = world.session();
    session
        .install(InstallRequest::new("first"), &cancel())
        .await
        .unwrap();
    session
        .install(InstallRequest::new("second"), &cancel())
        .await
        .unwrap();

    // "first" gets a clean upgrade; "second"'s upgrade depends on a mod the
    // catalog cannot resolve, failing after "first" already committed.
    world.publish_mod("first", "2.0.0", &[("first.dll", "first v2")], &[]);
    world.publish_mod(
        "second",
        "2.0.0",
        &[("second.dll", "second v2")],
        &[("ghost", ">=1.0.0")],
    );

    let ids = [ModId::from("first"), ModId::from("second")];
    let err = session.apply_updates(Some(&ids), &cancel()).await.unwrap_err();
    match &err {
        UpdateError::RolledBack { restore_point, .. } => {
            assert!(restore_point.as_str().contains("update"));
        }
        other => panic!("expected rollback, got: {other}"),
    }

    // The umbrella restore point rolled "first" back too.
    let first_dll = world
        .layout()
        .mod_dir(&ModId::from("first"))
        .join("first.dll");
    assert_eq!(std::fs::read_to_string(first_dll).unwrap(), "first v1");
    let records = session.list().await;
    assert!(records
        .iter()
        .all(|r| r.installed.installed_version == ModVersion::from("1.0.0")));
}

#[tokio::test]
async fn disable_moves_payload_aside_and_enable_moves_it_back() {
    let world = World::new();
    world.publish_mod("swappable", "1.0.0", &[("s.dll", "payload bytes")], &[]);

    let session = world.session();
    session
        .install(InstallRequest::new("swappable"), &cancel())
        .await
        .unwrap();

    let id = ModId::from("swappable");
    let live = world.layout().mod_dir(&id);
    let disabled = world.layout().disabled_mod_dir(&id);

    session.set_enabled(&id, false).await.unwrap();
    assert!(!live.exists());
    assert_eq!(
        std::fs::read_to_string(disabled.join("s.dll")).unwrap(),
        "payload bytes"
    );
    assert!(!session.list().await[0].installed.enabled);

    session.set_enabled(&id, true).await.unwrap();
    assert!(!disabled.exists());
    assert_eq!(
        std::fs::read_to_string(live.join("s.dll")).unwrap(),
        "payload bytes"
    );
    assert!(session.list().await[0].installed.enabled);
}

#[tokio::test]
async fn uninstall_refuses_while_a_dependent_needs_the_mod() {
    let world = World::new();
    world.publish_mod("core-lib", "1.0.0", &[("core.dll", "c")], &[]);
    world.publish_mod(
        "gadget",
        "1.0.0",
        &[("gadget.dll", "g")],
        &[("core-lib", ">=1.0.0")],
    );

    let session = world.session();
    session
        .install(InstallRequest::new("gadget"), &cancel())
        .await
        .unwrap();

    let err = session
        .uninstall(&ModId::from("core-lib"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::ConflictBlocking { .. }));

    session.uninstall(&ModId::from("gadget"), false).await.unwrap();
    session.uninstall(&ModId::from("core-lib"), false).await.unwrap();
    assert!(session.list().await.is_empty());
    assert!(!world.layout().mod_dir(&ModId::from("gadget")).exists());
}

#[tokio::test]
async fn check_updates_classifies_patch_minor_major() {
    let world = World::new();
    world.publish_mod("p", "1.2.3", &[("p.dll", "p")], &[]);
    world.publish_mod("m", "1.2.3", &[("m.dll", "m")], &[]);
    world.publish_mod("mj", "1.2.3", &[("mj.dll", "mj")], &[]);

    let session = world.session();
    for id in ["p", "m", "mj"] {
        session
            .install(InstallRequest::new(id), &cancel())
            .await
            .unwrap();
    }

    world.publish_mod("p", "1.2.4", &[("p.dll", "p2")], &[]);
    world.publish_mod("m", "1.3.0", &[("m.dll", "m2")], &[]);
    world.publish_mod("mj", "2.0.0", &[("mj.dll", "mj2")], &[]);

    let available = session.check_updates().await.unwrap();
    let kind_of = |id: &str| -> UpdateKind {
        available
            .iter()
            .find(|u| u.id.as_str() == id)
            .map(|u: &AvailableUpdate| u.kind)
            .unwrap()
    };
    assert_eq!(kind_of("p"), UpdateKind::Patch);
    assert_eq!(kind_of("m"), UpdateKind::Minor);
    assert_eq!(kind_of("mj"), UpdateKind::Major);

    // Read-only: versions on disk unchanged.
    let records = session.list().await;
    assert!(records
        .iter()
        .all(|r| r.installed.installed_version == ModVersion::from("1.2.3")));
}

#[tokio::test]
async fn declared_conflict_needs_explicit_acknowledgment() {
    let world = World::new();
    world.publish_mod("victim", "1.0.0", &[("v.dll", "v")], &[]);
    let mut hostile = world.publish_mod("hostile", "1.0.0", &[("h.dll", "h")], &[]);
    hostile.declared_conflicts.push(ModId::from("victim"));
    world.catalog.publish(hostile);

    let session = world.session();
    session
        .install(InstallRequest::new("victim"), &cancel())
        .await
        .unwrap();

    let err = session
        .install(InstallRequest::new("hostile"), &cancel())
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::ConflictBlocking { .. }));

    let report = session
        .install(
            InstallRequest::new("hostile").acknowledging_conflicts(),
            &cancel(),
        )
        .await
        .expect("acknowledged install succeeds");
    assert!(report
        .warnings
        .iter()
        .any(|w| w.kind == ConflictKind::DependencyConflict));
}

#[tokio::test]
async fn checksum_is_verified_for_file_payloads() {
    use std::io::Write;

    let world = World::new();
    let archive = world.payloads.path().join("packed-1.0.0.zip");
    {
        let file = std::fs::File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("plugin.dll", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"packed code").unwrap();
        writer.finish().unwrap();
    }
    let digest = {
        use sha2::Digest;
        hex::encode(sha2::Sha256::digest(std::fs::read(&archive).unwrap()))
    };

    let mut descriptor = ModDescriptor {
        id: ModId::from("packed"),
        name: "Packed".to_string(),
        version: ModVersion::from("1.0.0"),
        author: "test".to_string(),
        description: None,
        dependencies: vec![],
        declared_conflicts: vec![],
        load_after: vec![],
        load_before: vec![],
        payload: PayloadLocation::Path(archive),
        checksum: Some(ChecksumSpec::new(ChecksumAlgorithm::Sha256, &digest).unwrap()),
        signature: None,
    };
    world.catalog.publish(descriptor.clone());

    let session = world.session();
    session
        .install(InstallRequest::new("packed"), &cancel())
        .await
        .expect("valid checksum installs");
    assert_eq!(
        std::fs::read_to_string(
            world.layout().mod_dir(&ModId::from("packed")).join("plugin.dll")
        )
        .unwrap(),
        "packed code"
    );

    // Republish with a corrupted digest.
    descriptor.version = ModVersion::from("1.1.0");
    descriptor.checksum =
        Some(ChecksumSpec::new(ChecksumAlgorithm::Sha256, &"0".repeat(64)).unwrap());
    world.catalog.publish(descriptor);

    let err = session
        .apply_updates(Some(&[ModId::from("packed")]), &cancel())
        .await
        .unwrap_err();
    let is_checksum_failure = |e: &UpdateError| {
        matches!(
            e,
            UpdateError::Stage(StageError::ChecksumMismatch { .. })
        )
    };
    match &err {
        UpdateError::RolledBack { source, .. } => assert!(is_checksum_failure(source)),
        other => assert!(is_checksum_failure(other), "unexpected: {other}"),
    }
}

#[tokio::test]
async fn cancellation_before_staging_leaves_installation_untouched() {
    let world = World::new();
    world.publish_mod("late", "1.0.0", &[("late.dll", "l")], &[]);

    let session = world.session();
    let token = CancellationToken::new();
    token.cancel();

    let err = session
        .install(InstallRequest::new("late"), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::Cancelled));
    assert!(session.list().await.is_empty());
    assert!(!world.layout().mod_dir(&ModId::from("late")).exists());
}

#[tokio::test]
async fn scheduler_applies_auto_updates_in_the_background() {
    use modwright_core::ops::scheduler::AutoUpdateScheduler;
    use std::time::Duration;

    let world = World::new();
    world.publish_mod("auto", "1.0.0", &[("a.dll", "v1")], &[]);

    let session = Arc::new(world.session());
    session
        .install(InstallRequest::new("auto"), &cancel())
        .await
        .unwrap();

    let id = ModId::from("auto");
    let mut settings = session.settings(&id).await.unwrap();
    settings.auto_update = true;
    session.set_settings(&id, settings).await.unwrap();

    world.publish_mod("auto", "1.0.1", &[("a.dll", "v2")], &[]);

    let scheduler = AutoUpdateScheduler::spawn(session.clone(), Duration::from_millis(100));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if session.list().await[0].installed.installed_version == ModVersion::from("1.0.1") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "scheduler never applied the update"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    scheduler.shutdown().await;

    let live = world.layout().mod_dir(&id).join("a.dll");
    assert_eq!(std::fs::read_to_string(live).unwrap(), "v2");
}

#[tokio::test]
async fn settings_round_trip_through_the_session() {
    let world = World::new();
    world.publish_mod("tunable", "1.0.0", &[("t.dll", "t")], &[]);

    let session = world.session();
    session
        .install(InstallRequest::new("tunable"), &cancel())
        .await
        .unwrap();

    let id = ModId::from("tunable");
    let mut settings = session.settings(&id).await.unwrap();
    assert!(!settings.auto_update);
    settings.auto_update = true;
    settings.channel = Channel::Beta;
    session.set_settings(&id, settings.clone()).await.unwrap();

    // A fresh session reads the persisted settings back.
    let reopened = world.session();
    assert_eq!(reopened.settings(&id).await.unwrap(), settings);
}
