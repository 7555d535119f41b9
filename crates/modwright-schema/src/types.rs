//! Core data model: mod identity, descriptors, installed state, conflicts and
//! resolution plans.

use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::ChecksumSpec;
use crate::version::Constraint;

/// Stable identifier of a mod, unique across versions.
///
/// Compares and hashes as a plain string; used as the key of every graph and
/// map in the lifecycle core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ModId(String);

impl ModId {
    /// Create a new `ModId` from anything string-like.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ModId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ModId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for ModId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ModId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A semantic-version-like string (`major.minor.patch`, optional pre-release
/// suffix).
///
/// Ordering between versions is numeric per component, never lexical; see
/// [`crate::version::is_newer`]. Deliberately not `Ord` so callers cannot
/// accidentally sort versions lexically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ModVersion(String);

impl ModVersion {
    /// Create a new `ModVersion` from anything string-like.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The version as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ModVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ModVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ModVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Where a mod's payload can be fetched from: a local filesystem path or an
/// HTTP(S) URL. Serialized as a plain string; anything that does not look
/// like a URL is a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadLocation {
    /// Local file or directory.
    Path(PathBuf),
    /// Remote artifact, downloaded during staging.
    Url(String),
}

impl PayloadLocation {
    /// Classify a raw location string.
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            Self::Url(s.to_string())
        } else {
            Self::Path(PathBuf::from(s))
        }
    }
}

impl fmt::Display for PayloadLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Url(u) => write!(f, "{u}"),
        }
    }
}

impl Serialize for PayloadLocation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PayloadLocation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// A single dependency edge in a mod's manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConstraint {
    /// The mod this constraint points at.
    pub mod_id: ModId,
    /// Parsed constraint expression (exact, range or approximate).
    pub constraint: Constraint,
    /// Optional dependencies only constrain the target when it is present.
    pub optional: bool,
}

impl fmt::Display for DependencyConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.mod_id, self.constraint)
    }
}

/// Immutable description of one version of a mod, as read from its manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModDescriptor {
    /// Stable identity.
    pub id: ModId,
    /// Human-readable name.
    pub name: String,
    /// The version this descriptor describes.
    pub version: ModVersion,
    /// Author credit, free-form.
    pub author: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Dependencies on other mods.
    #[serde(default)]
    pub dependencies: Vec<DependencyConstraint>,
    /// Mods this one declares itself incompatible with.
    #[serde(default)]
    pub declared_conflicts: Vec<ModId>,
    /// Mods that must be loaded before this one.
    #[serde(default)]
    pub load_after: Vec<ModId>,
    /// Mods that must be loaded after this one.
    #[serde(default)]
    pub load_before: Vec<ModId>,
    /// Where the payload for this version lives.
    pub payload: PayloadLocation,
    /// Expected payload checksum, when the manifest carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumSpec>,
    /// Base64 ed25519 signature over the payload artifact, when published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ModDescriptor {
    /// Non-optional dependency edges.
    pub fn required_dependencies(&self) -> impl Iterator<Item = &DependencyConstraint> {
        self.dependencies.iter().filter(|d| !d.optional)
    }
}

/// Compatibility verdict recorded against an installed mod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityStatus {
    /// Never evaluated.
    #[default]
    Unknown,
    /// All constraints pointing at and from this mod hold.
    Compatible,
    /// Installed with surfaced warnings.
    CompatibleWithIssues,
    /// A constraint involving this mod is violated.
    Incompatible,
}

/// A mod present in the installation, enabled or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledMod {
    /// The descriptor the installed payload was built from.
    pub descriptor: ModDescriptor,
    /// The committed version.
    pub installed_version: ModVersion,
    /// Disabled mods keep their payload in the disabled staging area.
    pub enabled: bool,
    /// Live (or disabled-staging) payload directory.
    pub install_dir: PathBuf,
    /// Last recorded compatibility verdict.
    #[serde(default)]
    pub compatibility: CompatibilityStatus,
}

impl InstalledMod {
    /// Shorthand for the mod's identity.
    pub fn id(&self) -> &ModId {
        &self.descriptor.id
    }
}

/// Conflict classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two enabled mods own the same plugin file path with different content.
    FileConflict,
    /// A version constraint in the prospective set is unmet or two mods
    /// declare each other incompatible.
    DependencyConflict,
    /// The declared load-order relation contains a cycle.
    LoadOrderConflict,
    /// Two mods write the same shared configuration key.
    ConfigOverlap,
}

/// How severe a conflict is. `Error` and `Critical` block a plan; `Warning`
/// is surfaced but does not block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational; the operation may proceed.
    Warning,
    /// Blocks the plan without explicit override.
    Error,
    /// Blocks the plan; data-damaging if ignored.
    Critical,
}

/// Strategy tag on a [`ResolutionOption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the file whose content is a strict superset of the other.
    PreferSuperset,
    /// A human must pick the winning file.
    ManualSelect,
    /// Prefix the overlapping configuration keys with the owning mod id.
    NamespaceKeys,
    /// Caller explicitly accepts a declared incompatibility.
    AcknowledgeConflict,
    /// Loosen or drop one of the clashing constraints.
    RelaxConstraint,
    /// Break the ordering cycle by editing load-order declarations.
    AdjustLoadOrder,
}

/// One way a conflict could be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOption {
    /// What the resolution would do.
    pub strategy: ResolutionStrategy,
    /// Whether the system can apply it without human input.
    pub can_auto_resolve: bool,
}

/// A detected conflict between mods in a (prospective) installed set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Classification.
    pub kind: ConflictKind,
    /// Severity; drives whether a plan is blocked.
    pub severity: Severity,
    /// The mods involved.
    pub involved: Vec<ModId>,
    /// Human-readable description of the clash.
    pub description: String,
    /// Candidate resolutions, possibly empty.
    pub resolutions: Vec<ResolutionOption>,
}

impl ConflictRecord {
    /// Whether this record alone blocks a plan from proceeding.
    pub fn is_blocking(&self) -> bool {
        self.severity >= Severity::Error
    }
}

/// What a plan step does to a mod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    /// Mod is not installed; stage and commit it.
    Install,
    /// Mod is installed at a different version; replace it.
    Upgrade,
    /// Installed version already satisfies every constraint.
    Skip,
}

/// One entry of a [`ResolutionPlan`], in dependency-first order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// What to do.
    pub action: PlanAction,
    /// Which mod.
    pub mod_id: ModId,
    /// Version the step installs or keeps.
    pub target_version: ModVersion,
}

/// Output of the dependency resolver.
///
/// Steps are ordered so that every dependency appears before its dependents.
/// The plan is applied as a unit: either every step commits or none do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResolutionPlan {
    /// Ordered steps.
    pub steps: Vec<PlanStep>,
    /// Blocking dependency conflicts; non-empty means not executable.
    pub unresolved: Vec<ConflictRecord>,
    /// Declared-conflict records that require caller acknowledgment but do
    /// not make the plan non-executable.
    pub advisories: Vec<ConflictRecord>,
}

impl ResolutionPlan {
    /// A plan is executable iff it has no unresolved dependency conflicts.
    pub fn is_executable(&self) -> bool {
        self.unresolved.is_empty()
    }

    /// Steps that actually change the installation.
    pub fn changes(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.action != PlanAction::Skip)
    }
}

/// Supported configuration file formats. A closed set: format handling is
/// selected by this tag, never by sniffing content at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    /// Line-based `key = value` files with `[sections]`.
    Ini,
    /// JSON documents.
    Json,
    /// YAML documents.
    Yaml,
    /// XML documents.
    Xml,
    /// TOML documents.
    Toml,
}

impl ConfigFormat {
    /// Derive the format from a file extension, if recognized.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "ini" | "cfg" => Some(Self::Ini),
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "xml" => Some(Self::Xml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ini => "ini",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Xml => "xml",
            Self::Toml => "toml",
        };
        write!(f, "{s}")
    }
}

/// A configuration file attributed to its owning mod. Only used transiently
/// while merging or scanning for overlaps; the file on disk stays the
/// source of truth.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    /// Location of the file.
    pub path: PathBuf,
    /// Parsing strategy to use.
    pub format: ConfigFormat,
    /// The mod that ships this file.
    pub owner_mod_id: ModId,
}

/// Update track controlling which releases are eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Stable releases only (default).
    #[default]
    Stable,
    /// Pre-release beta builds.
    Beta,
    /// Bleeding-edge alpha builds.
    Alpha,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Alpha => "alpha",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "alpha" => Ok(Self::Alpha),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// Per-mod update behavior, persisted alongside the installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSettings {
    /// Whether the background scheduler may apply updates to this mod.
    pub auto_update: bool,
    /// Which release track to follow.
    pub channel: Channel,
    /// Run the configuration merger on upgrade.
    pub preserve_configs: bool,
    /// Create a restore point before mutating.
    pub backup_before_update: bool,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            auto_update: false,
            channel: Channel::Stable,
            preserve_configs: true,
            backup_before_update: true,
        }
    }
}

/// A release as reported by the release-lookup collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    /// Released version.
    pub version: ModVersion,
    /// Where the payload can be downloaded.
    pub download_url: String,
    /// Expected checksum, when the catalog publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumSpec>,
    /// Publication timestamp.
    pub published_at: chrono::DateTime<chrono::Utc>,
}
