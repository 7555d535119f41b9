//! Conflict detection over a prospective installed set.
//!
//! The detector never looks at the live installation directly: the
//! orchestrator hands it the *prospective* final set (current mods with
//! planned changes applied, staged trees included) so blocking conflicts
//! are found before anything is committed.
//!
//! Four analyses run over the enabled mods:
//!
//! 1. file conflicts -- one plugin path, two owners, different content;
//! 2. dependency conflicts -- re-validation of every version constraint;
//! 3. load-order conflicts -- cycles in the declared ordering relation;
//! 4. config overlaps -- two mods writing the same configuration key.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use modwright_schema::{
    ConfigFormat, ConflictKind, ConflictRecord, ModDescriptor, ModId, ModVersion,
    ResolutionOption, ResolutionStrategy, Severity,
};

use crate::config;

/// One mod of the prospective set: its descriptor and the payload tree to
/// inspect (a live directory or a staged one).
#[derive(Debug, Clone)]
pub struct ModTree {
    /// Mod identity.
    pub id: ModId,
    /// Version present in the prospective set.
    pub version: ModVersion,
    /// Descriptor of that version.
    pub descriptor: ModDescriptor,
    /// Root of the payload tree on disk.
    pub root: PathBuf,
    /// Disabled mods own no plugin paths and are skipped by every analysis.
    pub enabled: bool,
}

/// Whether any record in the set blocks a plan from proceeding.
pub fn has_blocking(records: &[ConflictRecord]) -> bool {
    records.iter().any(ConflictRecord::is_blocking)
}

/// Run all four analyses and collect the records, most severe first.
pub fn detect_conflicts(mods: &[ModTree]) -> Vec<ConflictRecord> {
    let enabled: Vec<&ModTree> = mods.iter().filter(|m| m.enabled).collect();

    let mut records = Vec::new();
    let scans: Vec<TreeScan> = enabled.iter().map(|m| TreeScan::read(m)).collect();

    records.extend(file_conflicts(&enabled, &scans));
    records.extend(dependency_conflicts(&enabled));
    records.extend(load_order_conflicts(&enabled));
    records.extend(config_overlaps(&enabled, &scans));

    records.sort_by(|a, b| b.severity.cmp(&a.severity));
    records
}

/// Relative paths and content hashes of one payload tree, config files
/// split out for the overlap analysis.
struct TreeScan {
    files: BTreeMap<String, blake3::Hash>,
    configs: BTreeMap<String, blake3::Hash>,
}

impl TreeScan {
    fn read(tree: &ModTree) -> Self {
        let mut files = BTreeMap::new();
        let mut configs = BTreeMap::new();
        for entry in walkdir::WalkDir::new(&tree.root).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&tree.root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if rel.ends_with(".bak") {
                continue;
            }
            let hash = match std::fs::read(entry.path()) {
                Ok(bytes) => blake3::hash(&bytes),
                Err(err) => {
                    tracing::warn!(
                        path = %entry.path().display(),
                        %err,
                        "skipping unreadable file during conflict scan"
                    );
                    continue;
                }
            };
            if ConfigFormat::from_path(Path::new(&rel)).is_some() {
                configs.insert(rel, hash);
            } else {
                files.insert(rel, hash);
            }
        }
        Self { files, configs }
    }
}

fn file_conflicts(enabled: &[&ModTree], scans: &[TreeScan]) -> Vec<ConflictRecord> {
    let mut owners: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, scan) in scans.iter().enumerate() {
        for path in scan.files.keys() {
            owners.entry(path).or_default().push(idx);
        }
    }

    let mut records = Vec::new();
    for (path, claimants) in owners {
        if claimants.len() < 2 {
            continue;
        }
        // Identical content under two mods is permitted and not flagged.
        let first = scans[claimants[0]].files[path];
        if claimants.iter().all(|&idx| scans[idx].files[path] == first) {
            continue;
        }

        let involved: Vec<ModId> = claimants.iter().map(|&i| enabled[i].id.clone()).collect();
        let mut resolutions = vec![ResolutionOption {
            strategy: ResolutionStrategy::ManualSelect,
            can_auto_resolve: false,
        }];
        if claimants.len() == 2
            && is_byte_prefix(
                &enabled[claimants[0]].root.join(path),
                &enabled[claimants[1]].root.join(path),
            )
        {
            resolutions.insert(
                0,
                ResolutionOption {
                    strategy: ResolutionStrategy::PreferSuperset,
                    can_auto_resolve: true,
                },
            );
        }

        records.push(ConflictRecord {
            kind: ConflictKind::FileConflict,
            severity: Severity::Critical,
            description: format!(
                "'{path}' is shipped with different content by {}",
                involved
                    .iter()
                    .map(ModId::as_str)
                    .collect::<Vec<_>>()
                    .join(" and ")
            ),
            involved,
            resolutions,
        });
    }
    records
}

/// True when one file's bytes are a strict prefix of the other's, making
/// the longer one a superset that can win automatically.
fn is_byte_prefix(a: &Path, b: &Path) -> bool {
    let (Ok(a_bytes), Ok(b_bytes)) = (std::fs::read(a), std::fs::read(b)) else {
        return false;
    };
    let (short, long) = if a_bytes.len() <= b_bytes.len() {
        (&a_bytes, &b_bytes)
    } else {
        (&b_bytes, &a_bytes)
    };
    long.starts_with(short)
}

fn dependency_conflicts(enabled: &[&ModTree]) -> Vec<ConflictRecord> {
    let present: HashMap<&ModId, &ModVersion> =
        enabled.iter().map(|m| (&m.id, &m.version)).collect();

    let mut records = Vec::new();
    for tree in enabled {
        for dep in &tree.descriptor.dependencies {
            match present.get(&dep.mod_id) {
                None if dep.optional => {}
                None => records.push(ConflictRecord {
                    kind: ConflictKind::DependencyConflict,
                    severity: Severity::Error,
                    involved: vec![tree.id.clone(), dep.mod_id.clone()],
                    description: format!(
                        "{} {} requires {} {}, which is not present",
                        tree.id, tree.version, dep.mod_id, dep.constraint
                    ),
                    resolutions: vec![ResolutionOption {
                        strategy: ResolutionStrategy::RelaxConstraint,
                        can_auto_resolve: false,
                    }],
                }),
                Some(version) if !dep.constraint.satisfies(version) => {
                    records.push(ConflictRecord {
                        kind: ConflictKind::DependencyConflict,
                        severity: Severity::Error,
                        involved: vec![tree.id.clone(), dep.mod_id.clone()],
                        description: format!(
                            "{} {} requires {} {}, but {} is present",
                            tree.id, tree.version, dep.mod_id, dep.constraint, version
                        ),
                        resolutions: vec![ResolutionOption {
                            strategy: ResolutionStrategy::RelaxConstraint,
                            can_auto_resolve: false,
                        }],
                    });
                }
                Some(_) => {}
            }
        }
    }
    records
}

fn load_order_conflicts(enabled: &[&ModTree]) -> Vec<ConflictRecord> {
    let ids: HashSet<&ModId> = enabled.iter().map(|m| &m.id).collect();

    // Edge a -> b means "a must load before b".
    let mut edges: BTreeMap<&ModId, Vec<&ModId>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&ModId, usize> =
        enabled.iter().map(|m| (&m.id, 0)).collect();

    for tree in enabled {
        for before in &tree.descriptor.load_after {
            add_order_edge(&ids, &mut edges, &mut in_degree, before, &tree.id);
        }
        for after in &tree.descriptor.load_before {
            add_order_edge(&ids, &mut edges, &mut in_degree, &tree.id, after);
        }
    }

    let mut queue: VecDeque<&ModId> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut ordered = 0usize;
    while let Some(id) = queue.pop_front() {
        ordered += 1;
        if let Some(nexts) = edges.get(id) {
            for &next in nexts {
                let d = in_degree.get_mut(next).expect("edge target tracked");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if ordered == enabled.len() {
        return Vec::new();
    }

    let involved: Vec<ModId> = in_degree
        .iter()
        .filter(|(_, &d)| d > 0)
        .map(|(&id, _)| id.clone())
        .collect();
    vec![ConflictRecord {
        kind: ConflictKind::LoadOrderConflict,
        severity: Severity::Error,
        description: format!(
            "declared load order cannot be satisfied; cycle involves {}",
            involved
                .iter()
                .map(ModId::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        involved,
        resolutions: vec![ResolutionOption {
            strategy: ResolutionStrategy::AdjustLoadOrder,
            can_auto_resolve: false,
        }],
    }]
}

/// Record "`from` loads before `to`". Edges naming mods outside the
/// prospective set are dropped.
fn add_order_edge<'a>(
    ids: &HashSet<&'a ModId>,
    edges: &mut BTreeMap<&'a ModId, Vec<&'a ModId>>,
    in_degree: &mut BTreeMap<&'a ModId, usize>,
    from: &ModId,
    to: &ModId,
) {
    let (Some(&from), Some(&to)) = (ids.get(from), ids.get(to)) else {
        return;
    };
    let entry = edges.entry(from).or_default();
    if !entry.contains(&to) {
        entry.push(to);
        *in_degree.entry(to).or_default() += 1;
    }
}

fn config_overlaps(enabled: &[&ModTree], scans: &[TreeScan]) -> Vec<ConflictRecord> {
    let mut owners: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, scan) in scans.iter().enumerate() {
        for path in scan.configs.keys() {
            owners.entry(path).or_default().push(idx);
        }
    }

    let mut records = Vec::new();
    for (path, claimants) in owners {
        if claimants.len() < 2 {
            continue;
        }
        let first = scans[claimants[0]].configs[path];
        if claimants.iter().all(|&idx| scans[idx].configs[path] == first) {
            continue;
        }

        let mut key_sets: Vec<(usize, HashSet<String>)> = Vec::new();
        let mut unparsable = false;
        for &idx in &claimants {
            match config::parse_file(&enabled[idx].root.join(path)) {
                Ok((value, _)) => {
                    let keys = config::flatten(&value).into_iter().map(|(k, _)| k).collect();
                    key_sets.push((idx, keys));
                }
                Err(err) => {
                    tracing::warn!(
                        path,
                        mod_id = enabled[idx].id.as_str(),
                        %err,
                        "config file did not parse; treating clash as a file conflict"
                    );
                    unparsable = true;
                }
            }
        }

        if unparsable {
            // Cannot prove the overlap is mergeable: same path, different
            // content, so fall back to the strict verdict.
            let involved: Vec<ModId> =
                claimants.iter().map(|&i| enabled[i].id.clone()).collect();
            records.push(ConflictRecord {
                kind: ConflictKind::FileConflict,
                severity: Severity::Critical,
                description: format!(
                    "'{path}' clashes and is not parseable as a config file"
                ),
                involved,
                resolutions: vec![ResolutionOption {
                    strategy: ResolutionStrategy::ManualSelect,
                    can_auto_resolve: false,
                }],
            });
            continue;
        }

        for i in 0..key_sets.len() {
            for j in i + 1..key_sets.len() {
                let (a_idx, a_keys) = &key_sets[i];
                let (b_idx, b_keys) = &key_sets[j];
                let mut shared: Vec<&String> = a_keys.intersection(b_keys).collect();
                if shared.is_empty() {
                    continue;
                }
                shared.sort();
                records.push(ConflictRecord {
                    kind: ConflictKind::ConfigOverlap,
                    severity: Severity::Warning,
                    involved: vec![enabled[*a_idx].id.clone(), enabled[*b_idx].id.clone()],
                    description: format!(
                        "'{path}': {} and {} both set {}",
                        enabled[*a_idx].id,
                        enabled[*b_idx].id,
                        shared
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                    resolutions: vec![
                        ResolutionOption {
                            strategy: ResolutionStrategy::NamespaceKeys,
                            can_auto_resolve: true,
                        },
                        ResolutionOption {
                            strategy: ResolutionStrategy::ManualSelect,
                            can_auto_resolve: false,
                        },
                    ],
                });
            }
        }
    }
    records
}
