//! Dependency resolution.
//!
//! Builds a directed graph over mod ids where an edge `A -> B` means "A
//! depends on B", orders it with Kahn's algorithm and selects one version
//! per mod so that every constraint pointing at it holds. The output is a
//! [`ResolutionPlan`] whose steps are ordered dependencies-first, so a plan
//! can be staged and committed front to back.
//!
//! The resolver is synchronous and pure: descriptors for not-yet-installed
//! mods are fetched by the orchestrator beforehand and handed in as
//! [`Candidates`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use thiserror::Error;

use modwright_schema::version::cmp_versions;
use modwright_schema::{
    ConflictKind, ConflictRecord, InstalledMod, ModDescriptor, ModId, ModVersion, PlanAction,
    PlanStep, ResolutionOption, ResolutionPlan, ResolutionStrategy, Severity,
};

/// Errors that abort resolution before any filesystem mutation.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving: {}", .involved.iter().map(ModId::as_str).collect::<Vec<_>>().join(", "))]
    DependencyCycle {
        /// Mods participating in (or downstream of) the cycle.
        involved: Vec<ModId>,
    },

    /// No installed or installable version of a mod satisfies every
    /// constraint pointing at it.
    #[error("no version of '{id}' satisfies: {}", .constraints.join("; "))]
    Unsatisfiable {
        /// The mod no version could be selected for.
        id: ModId,
        /// Human-readable renderings of the clashing constraints.
        constraints: Vec<String>,
    },
}

/// One requested change: install or upgrade `id`, optionally pinned to a
/// specific version.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    /// The mod to install or upgrade.
    pub id: ModId,
    /// Pin to this exact version; `None` lets the resolver pick.
    pub version: Option<ModVersion>,
}

impl ResolveRequest {
    /// Request the latest acceptable version of a mod.
    pub fn latest(id: impl Into<ModId>) -> Self {
        Self {
            id: id.into(),
            version: None,
        }
    }

    /// Request one specific version of a mod.
    pub fn pinned(id: impl Into<ModId>, version: impl Into<ModVersion>) -> Self {
        Self {
            id: id.into(),
            version: Some(version.into()),
        }
    }
}

/// Candidate descriptors known to the resolver, keyed by mod id.
///
/// Holds every version of every mod that could appear in the plan: the
/// installed descriptors plus whatever the orchestrator fetched from the
/// release catalog.
#[derive(Debug, Default)]
pub struct Candidates {
    versions: BTreeMap<ModId, Vec<ModDescriptor>>,
}

impl Candidates {
    /// Add a descriptor, ignoring exact (id, version) duplicates.
    pub fn insert(&mut self, descriptor: ModDescriptor) {
        let entry = self.versions.entry(descriptor.id.clone()).or_default();
        if !entry.iter().any(|d| d.version == descriptor.version) {
            entry.push(descriptor);
        }
    }

    /// All known versions of a mod, in insertion order.
    pub fn for_mod(&self, id: &ModId) -> &[ModDescriptor] {
        self.versions.get(id).map_or(&[], Vec::as_slice)
    }

    /// Whether any version of `id` is known.
    pub fn knows(&self, id: &ModId) -> bool {
        self.versions.contains_key(id)
    }

    /// Look up one exact (id, version) descriptor.
    pub fn find(&self, id: &ModId, version: &ModVersion) -> Option<&ModDescriptor> {
        self.for_mod(id).iter().find(|d| d.version == *version)
    }
}

/// A constraint pointing at some mod, with enough context to render a
/// useful error message.
#[derive(Debug, Clone)]
struct PointedConstraint {
    origin: String,
    origin_id: Option<ModId>,
    constraint: modwright_schema::Constraint,
    from_bystander: bool,
}

impl PointedConstraint {
    fn describe(&self, target: &ModId) -> String {
        format!("{} requires {} {}", self.origin, target, self.constraint)
    }
}

/// Compute an installation/upgrade plan.
///
/// `installed` is the current set (enabled and disabled); `candidates` must
/// contain at least one descriptor for every mod reachable from the
/// requests, including the installed ones.
///
/// # Errors
///
/// [`ResolveError::DependencyCycle`] when the dependency relation is
/// cyclic; [`ResolveError::Unsatisfiable`] when constraints inside the plan
/// closure admit no version. Constraint violations against installed
/// bystander mods do not error; they are reported through
/// [`ResolutionPlan::unresolved`], which marks the plan non-executable.
pub fn resolve(
    requests: &[ResolveRequest],
    installed: &[InstalledMod],
    candidates: &Candidates,
) -> Result<ResolutionPlan, ResolveError> {
    let installed_by_id: HashMap<&ModId, &InstalledMod> =
        installed.iter().map(|m| (m.id(), m)).collect();

    let nodes = collect_closure(requests, &installed_by_id, candidates);
    let (edges, mut in_degree) = build_edges(&nodes, &installed_by_id, candidates);

    // Kahn's algorithm, dependents first: a node is ready once every mod
    // depending on it has been processed, so all constraints pointing at it
    // are known by the time a version is selected.
    let mut queue: VecDeque<ModId> = {
        let mut roots: Vec<ModId> = nodes
            .iter()
            .filter(|id| in_degree.get(*id).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();
        roots.sort();
        roots.into()
    };

    let pins: HashMap<&ModId, &ModVersion> = requests
        .iter()
        .filter_map(|r| r.version.as_ref().map(|v| (&r.id, v)))
        .collect();

    let mut selected: HashMap<ModId, ModDescriptor> = HashMap::new();
    let mut processing_order: Vec<ModId> = Vec::with_capacity(nodes.len());
    let mut unresolved: Vec<ConflictRecord> = Vec::new();

    while let Some(id) = queue.pop_front() {
        let choice = select_version(
            &id,
            &pins,
            &selected,
            &installed_by_id,
            &nodes,
            candidates,
        )?;
        if let Some(record) = choice.bystander_violation {
            unresolved.push(record);
        }
        selected.insert(id.clone(), choice.descriptor);
        processing_order.push(id.clone());

        let mut next: Vec<ModId> = Vec::new();
        if let Some(deps) = edges.get(&id) {
            for dep in deps {
                let degree = in_degree.get_mut(dep).expect("edge target tracked");
                *degree -= 1;
                if *degree == 0 {
                    next.push(dep.clone());
                }
            }
        }
        next.sort();
        queue.extend(next);
    }

    if processing_order.len() < nodes.len() {
        let mut involved: Vec<ModId> = nodes
            .iter()
            .filter(|id| !selected.contains_key(*id))
            .cloned()
            .collect();
        involved.sort();
        return Err(ResolveError::DependencyCycle { involved });
    }

    // Dependencies before dependents.
    processing_order.reverse();

    let steps = processing_order
        .iter()
        .map(|id| {
            let descriptor = &selected[id];
            let action = match installed_by_id.get(id) {
                Some(current) if current.installed_version == descriptor.version => {
                    PlanAction::Skip
                }
                Some(_) => PlanAction::Upgrade,
                None => PlanAction::Install,
            };
            PlanStep {
                action,
                mod_id: id.clone(),
                target_version: descriptor.version.clone(),
            }
        })
        .collect();

    let advisories = declared_conflict_advisories(&selected, &installed_by_id);

    Ok(ResolutionPlan {
        steps,
        unresolved,
        advisories,
    })
}

/// Transitive closure over required dependencies, starting at the requests.
/// Optional dependencies never pull new mods into the plan.
fn collect_closure(
    requests: &[ResolveRequest],
    installed: &HashMap<&ModId, &InstalledMod>,
    candidates: &Candidates,
) -> HashSet<ModId> {
    let mut nodes: HashSet<ModId> = HashSet::new();
    let mut work: VecDeque<ModId> = requests.iter().map(|r| r.id.clone()).collect();

    while let Some(id) = work.pop_front() {
        if !nodes.insert(id.clone()) {
            continue;
        }
        for descriptor in all_descriptors(&id, installed, candidates) {
            for dep in descriptor.required_dependencies() {
                if !nodes.contains(&dep.mod_id) {
                    work.push_back(dep.mod_id.clone());
                }
            }
        }
    }
    nodes
}

/// Adjacency (`A -> [deps]`) and in-degree over the closure. Edges are the
/// union over all candidate versions so the graph shape is stable no matter
/// which version ends up selected.
fn build_edges(
    nodes: &HashSet<ModId>,
    installed: &HashMap<&ModId, &InstalledMod>,
    candidates: &Candidates,
) -> (HashMap<ModId, Vec<ModId>>, HashMap<ModId, usize>) {
    let mut edges: HashMap<ModId, Vec<ModId>> = HashMap::new();
    let mut in_degree: HashMap<ModId, usize> =
        nodes.iter().map(|id| (id.clone(), 0)).collect();

    for id in nodes {
        let mut targets: Vec<ModId> = Vec::new();
        for descriptor in all_descriptors(id, installed, candidates) {
            for dep in &descriptor.dependencies {
                if nodes.contains(&dep.mod_id)
                    && dep.mod_id != *id
                    && !targets.contains(&dep.mod_id)
                {
                    targets.push(dep.mod_id.clone());
                }
            }
        }
        for target in &targets {
            *in_degree.get_mut(target).expect("closure member") += 1;
        }
        edges.insert(id.clone(), targets);
    }
    (edges, in_degree)
}

fn all_descriptors<'a>(
    id: &ModId,
    installed: &HashMap<&ModId, &'a InstalledMod>,
    candidates: &'a Candidates,
) -> Vec<&'a ModDescriptor> {
    let mut out: Vec<&ModDescriptor> = candidates.for_mod(id).iter().collect();
    if let Some(current) = installed.get(id) {
        if !out.iter().any(|d| d.version == current.descriptor.version) {
            out.push(&current.descriptor);
        }
    }
    out
}

struct VersionChoice {
    descriptor: ModDescriptor,
    bystander_violation: Option<ConflictRecord>,
}

/// Pick the highest candidate version of `id` satisfying every constraint
/// pointing at it. Prefers the already-installed version when it ties the
/// best candidate, minimizing churn.
fn select_version(
    id: &ModId,
    pins: &HashMap<&ModId, &ModVersion>,
    selected: &HashMap<ModId, ModDescriptor>,
    installed: &HashMap<&ModId, &InstalledMod>,
    nodes: &HashSet<ModId>,
    candidates: &Candidates,
) -> Result<VersionChoice, ResolveError> {
    let mut plan_constraints: Vec<PointedConstraint> = Vec::new();
    let mut bystander_constraints: Vec<PointedConstraint> = Vec::new();

    if let Some(pin) = pins.get(id) {
        plan_constraints.push(PointedConstraint {
            origin: "the request".to_string(),
            origin_id: None,
            constraint: modwright_schema::Constraint::Exact((*pin).clone()),
            from_bystander: false,
        });
    }

    for (dependent_id, descriptor) in selected {
        for dep in &descriptor.dependencies {
            if dep.mod_id == *id {
                plan_constraints.push(PointedConstraint {
                    origin: format!("{} {}", dependent_id, descriptor.version),
                    origin_id: Some(dependent_id.clone()),
                    constraint: dep.constraint.clone(),
                    from_bystander: false,
                });
            }
        }
    }

    for (other_id, other) in installed {
        if nodes.contains(*other_id) || !other.enabled {
            continue;
        }
        for dep in &other.descriptor.dependencies {
            if dep.mod_id == *id {
                bystander_constraints.push(PointedConstraint {
                    origin: format!("installed {} {}", other_id, other.installed_version),
                    origin_id: Some((*other_id).clone()),
                    constraint: dep.constraint.clone(),
                    from_bystander: true,
                });
            }
        }
    }

    let mut pool: Vec<&ModDescriptor> = all_descriptors(id, installed, candidates);
    // Highest first; on equal versions keep the installed descriptor ahead.
    let installed_version = installed.get(id).map(|m| &m.installed_version);
    pool.sort_by(|a, b| {
        cmp_versions(b.version.as_str(), a.version.as_str()).then_with(|| {
            let a_installed = Some(&a.version) == installed_version;
            let b_installed = Some(&b.version) == installed_version;
            b_installed.cmp(&a_installed)
        })
    });

    if pool.is_empty() {
        return Err(ResolveError::Unsatisfiable {
            id: id.clone(),
            constraints: vec![format!("no known version of '{id}'")],
        });
    }

    let satisfies_all = |d: &ModDescriptor, set: &[PointedConstraint]| {
        set.iter().all(|c| c.constraint.satisfies(&d.version))
    };

    if let Some(choice) = pool
        .iter()
        .find(|d| satisfies_all(d, &plan_constraints) && satisfies_all(d, &bystander_constraints))
    {
        return Ok(VersionChoice {
            descriptor: (*choice).clone(),
            bystander_violation: None,
        });
    }

    // Constraints inside the plan can be met, but an installed bystander's
    // cannot: surface a dependency conflict instead of failing outright so
    // the caller can widen the request.
    if let Some(choice) = pool.iter().find(|d| satisfies_all(d, &plan_constraints)) {
        let violated: Vec<&PointedConstraint> = bystander_constraints
            .iter()
            .filter(|c| !c.constraint.satisfies(&choice.version))
            .collect();
        let mut involved: Vec<ModId> = vec![id.clone()];
        involved.extend(violated.iter().filter_map(|c| c.origin_id.clone()));
        let description = format!(
            "selecting {} {} violates: {}",
            id,
            choice.version,
            violated
                .iter()
                .map(|c| c.describe(id))
                .collect::<Vec<_>>()
                .join("; ")
        );
        return Ok(VersionChoice {
            descriptor: (*choice).clone(),
            bystander_violation: Some(ConflictRecord {
                kind: ConflictKind::DependencyConflict,
                severity: Severity::Error,
                involved,
                description,
                resolutions: vec![ResolutionOption {
                    strategy: ResolutionStrategy::RelaxConstraint,
                    can_auto_resolve: false,
                }],
            }),
        });
    }

    let mut descriptions: Vec<String> = plan_constraints
        .iter()
        .chain(bystander_constraints.iter().filter(|c| c.from_bystander))
        .map(|c| c.describe(id))
        .collect();
    if descriptions.is_empty() {
        descriptions.push(format!("no release of '{id}' is available"));
    }
    Err(ResolveError::Unsatisfiable {
        id: id.clone(),
        constraints: descriptions,
    })
}

/// Declared conflicts between any two mods present in the prospective set
/// are surfaced for explicit acknowledgment, never silently dropped.
fn declared_conflict_advisories(
    selected: &HashMap<ModId, ModDescriptor>,
    installed: &HashMap<&ModId, &InstalledMod>,
) -> Vec<ConflictRecord> {
    let mut present: BTreeMap<&ModId, &ModDescriptor> =
        selected.iter().map(|(k, v)| (k, v)).collect();
    for (&id, m) in installed {
        if m.enabled {
            present.entry(id).or_insert(&m.descriptor);
        }
    }

    let mut seen: HashSet<(ModId, ModId)> = HashSet::new();
    let mut records = Vec::new();
    for (id, descriptor) in &present {
        for conflicted in &descriptor.declared_conflicts {
            if !present.contains_key(conflicted) {
                continue;
            }
            let key = if *id < conflicted {
                ((*id).clone(), conflicted.clone())
            } else {
                (conflicted.clone(), (*id).clone())
            };
            if !seen.insert(key) {
                continue;
            }
            records.push(ConflictRecord {
                kind: ConflictKind::DependencyConflict,
                severity: Severity::Error,
                involved: vec![(*id).clone(), conflicted.clone()],
                description: format!("{id} declares a conflict with {conflicted}"),
                resolutions: vec![ResolutionOption {
                    strategy: ResolutionStrategy::AcknowledgeConflict,
                    can_auto_resolve: false,
                }],
            });
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use modwright_schema::{Constraint, DependencyConstraint, PayloadLocation};

    fn descriptor(id: &str, version: &str, deps: &[(&str, &str)]) -> ModDescriptor {
        ModDescriptor {
            id: ModId::from(id),
            name: id.to_uppercase(),
            version: ModVersion::from(version),
            author: String::new(),
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
            payload: PayloadLocation::Path(format!("payloads/{id}-{version}").into()),
            checksum: None,
            signature: None,
        }
    }

    fn installed_mod(id: &str, version: &str, deps: &[(&str, &str)]) -> InstalledMod {
        InstalledMod {
            descriptor: descriptor(id, version, deps),
            installed_version: ModVersion::from(version),
            enabled: true,
            install_dir: format!("plugins/{id}").into(),
            compatibility: Default::default(),
        }
    }

    fn candidates(descriptors: Vec<ModDescriptor>) -> Candidates {
        let mut c = Candidates::default();
        for d in descriptors {
            c.insert(d);
        }
        c
    }

    fn position(plan: &ResolutionPlan, id: &str) -> usize {
        plan.steps
            .iter()
            .position(|s| s.mod_id.as_str() == id)
            .unwrap_or_else(|| panic!("{id} missing from plan"))
    }

    #[test]
    fn dependencies_come_before_dependents() {
        let c = candidates(vec![
            descriptor("a", "1.0.0", &[("b", ">=1.0.0,<2.0.0"), ("c", "~1.0.0")]),
            descriptor("b", "1.5.0", &[("d", ">=1.0.0")]),
            descriptor("c", "1.0.2", &[("d", ">=1.0.0")]),
            descriptor("d", "1.1.0", &[]),
        ]);
        let plan = resolve(&[ResolveRequest::latest("a")], &[], &c).unwrap();

        assert!(plan.is_executable());
        assert!(position(&plan, "d") < position(&plan, "b"));
        assert!(position(&plan, "d") < position(&plan, "c"));
        assert!(position(&plan, "b") < position(&plan, "a"));
        assert!(position(&plan, "c") < position(&plan, "a"));
        assert!(plan.steps.iter().all(|s| s.action == PlanAction::Install));
    }

    #[test]
    fn cycle_is_detected_and_named() {
        let c = candidates(vec![
            descriptor("a", "1.0.0", &[("b", ">=1.0.0")]),
            descriptor("b", "1.0.0", &[("a", ">=1.0.0")]),
        ]);
        let err = resolve(&[ResolveRequest::latest("a")], &[], &c).unwrap_err();
        match err {
            ResolveError::DependencyCycle { involved } => {
                assert_eq!(involved, vec![ModId::from("a"), ModId::from("b")]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn clashing_constraints_in_one_plan_are_unsatisfiable() {
        let c = candidates(vec![
            descriptor("a", "1.0.0", &[("b", "<1.0.0")]),
            descriptor("c", "1.0.0", &[("b", ">=2.0.0")]),
            descriptor("b", "0.9.0", &[]),
            descriptor("b", "2.1.0", &[]),
        ]);
        let err = resolve(
            &[ResolveRequest::latest("a"), ResolveRequest::latest("c")],
            &[],
            &c,
        )
        .unwrap_err();
        match err {
            ResolveError::Unsatisfiable { id, constraints } => {
                assert_eq!(id.as_str(), "b");
                let rendered = constraints.join("; ");
                assert!(rendered.contains("<1.0.0"), "{rendered}");
                assert!(rendered.contains(">=2.0.0"), "{rendered}");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn installed_version_inside_range_resolves_clean() {
        let installed = vec![
            installed_mod("a", "1.0.0", &[("b", ">=1.0.0,<2.0.0")]),
            installed_mod("b", "1.5.0", &[]),
        ];
        let c = candidates(vec![descriptor("a", "1.0.0", &[("b", ">=1.0.0,<2.0.0")])]);
        let plan = resolve(&[ResolveRequest::latest("a")], &installed, &c).unwrap();
        assert!(plan.unresolved.is_empty());
        assert!(plan
            .steps
            .iter()
            .all(|s| s.action == PlanAction::Skip));
    }

    #[test]
    fn highest_satisfying_version_wins() {
        let c = candidates(vec![
            descriptor("a", "1.0.0", &[("b", ">=1.0.0,<2.0.0")]),
            descriptor("b", "1.0.0", &[]),
            descriptor("b", "1.9.0", &[]),
            descriptor("b", "2.0.0", &[]),
        ]);
        let plan = resolve(&[ResolveRequest::latest("a")], &[], &c).unwrap();
        let b = &plan.steps[position(&plan, "b")];
        assert_eq!(b.target_version.as_str(), "1.9.0");
    }

    #[test]
    fn upgrade_breaking_a_bystander_is_reported_not_fatal() {
        let installed = vec![
            installed_mod("viewer", "1.0.0", &[("lib", "<2.0.0")]),
            installed_mod("lib", "1.4.0", &[]),
        ];
        let c = candidates(vec![descriptor("lib", "2.0.0", &[])]);
        let plan = resolve(
            &[ResolveRequest::pinned("lib", "2.0.0")],
            &installed,
            &c,
        )
        .unwrap();
        assert!(!plan.is_executable());
        assert_eq!(plan.unresolved.len(), 1);
        let record = &plan.unresolved[0];
        assert_eq!(record.kind, ConflictKind::DependencyConflict);
        assert!(record.involved.contains(&ModId::from("viewer")));
    }

    #[test]
    fn declared_conflicts_become_advisories() {
        let mut hostile = descriptor("hostile", "1.0.0", &[]);
        hostile.declared_conflicts.push(ModId::from("victim"));
        let installed = vec![installed_mod("victim", "1.0.0", &[])];
        let c = candidates(vec![hostile]);

        let plan = resolve(&[ResolveRequest::latest("hostile")], &installed, &c).unwrap();
        assert!(plan.is_executable());
        assert_eq!(plan.advisories.len(), 1);
        assert_eq!(
            plan.advisories[0].resolutions[0].strategy,
            ResolutionStrategy::AcknowledgeConflict
        );
    }

    #[test]
    fn upgrade_steps_are_classified() {
        let installed = vec![installed_mod("a", "1.0.0", &[])];
        let c = candidates(vec![descriptor("a", "1.1.0", &[])]);
        let plan = resolve(&[ResolveRequest::pinned("a", "1.1.0")], &installed, &c).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].action, PlanAction::Upgrade);
        assert_eq!(plan.steps[0].target_version.as_str(), "1.1.0");
    }
}
