//! Version constraint engine.
//!
//! Parses and evaluates constraint expressions against candidate versions:
//!
//! - exact: `"1.2.3"` -- component-wise numeric equality
//! - range: `">=1.0.0,<2.0.0"` -- comma-separated inequalities ANDed together
//! - approximate: `"~1.2.0"` -- same major.minor, any patch >= the given one
//!
//! Comparison is numeric per component (`1.10.0` is newer than `1.9.0`),
//! never lexical. Range expressions are evaluated through `semver` after the
//! candidate version is normalized to three components.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::types::ModVersion;

/// Error raised when a constraint expression cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    /// The expression does not match any supported constraint form.
    #[error("invalid constraint expression '{expression}': {reason}")]
    InvalidFormat {
        /// The offending expression, verbatim.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConstraintError {
    fn invalid(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// A parsed version constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Exactly this version (component-wise; `1.2` equals `1.2.0`).
    Exact(ModVersion),
    /// ANDed inequalities, e.g. `>=1.0.0, <2.0.0`.
    Range(semver::VersionReq),
    /// Same major and minor, patch at least the given one.
    Approximate {
        /// Fixed major component.
        major: u64,
        /// Fixed minor component.
        minor: u64,
        /// Minimum patch component.
        patch: u64,
    },
}

impl Constraint {
    /// Parse a constraint expression.
    ///
    /// # Errors
    ///
    /// Returns [`ConstraintError::InvalidFormat`] for expressions that are
    /// neither a bare version, a `~` approximation, nor a comma-separated
    /// inequality list.
    pub fn parse(expression: &str) -> Result<Self, ConstraintError> {
        let expr = expression.trim();
        if expr.is_empty() {
            return Err(ConstraintError::invalid(expression, "empty expression"));
        }

        if let Some(rest) = expr.strip_prefix('~') {
            return Self::parse_approximate(expression, rest.trim());
        }

        if expr.contains(['<', '>', '=']) {
            return Self::parse_range(expression, expr);
        }

        if !is_plain_version(expr) {
            return Err(ConstraintError::invalid(
                expression,
                "expected numeric dotted version, '~x.y.z' or inequality list",
            ));
        }
        Ok(Self::Exact(ModVersion::from(expr)))
    }

    fn parse_approximate(original: &str, rest: &str) -> Result<Self, ConstraintError> {
        let (numeric, _) = split_prerelease(rest);
        let parts: Vec<&str> = numeric.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(ConstraintError::invalid(
                original,
                "approximate constraint needs 1 to 3 numeric components",
            ));
        }
        let mut components = [0u64; 3];
        for (i, part) in parts.iter().enumerate() {
            components[i] = part.parse::<u64>().map_err(|_| {
                ConstraintError::invalid(original, format!("non-numeric component '{part}'"))
            })?;
        }
        Ok(Self::Approximate {
            major: components[0],
            minor: components[1],
            patch: components[2],
        })
    }

    fn parse_range(original: &str, expr: &str) -> Result<Self, ConstraintError> {
        for part in expr.split(',') {
            let part = part.trim();
            let stripped = part
                .strip_prefix(">=")
                .or_else(|| part.strip_prefix("<="))
                .or_else(|| part.strip_prefix('>'))
                .or_else(|| part.strip_prefix('<'))
                .or_else(|| part.strip_prefix('='));
            match stripped {
                Some(v) if is_plain_version(v.trim()) => {}
                _ => {
                    return Err(ConstraintError::invalid(
                        original,
                        format!("bad inequality '{part}'"),
                    ))
                }
            }
        }
        let req = semver::VersionReq::parse(expr)
            .map_err(|e| ConstraintError::invalid(original, e.to_string()))?;
        Ok(Self::Range(req))
    }

    /// Evaluate this constraint against a candidate version.
    pub fn satisfies(&self, version: &ModVersion) -> bool {
        match self {
            Self::Exact(expected) => {
                cmp_versions(version.as_str(), expected.as_str()) == Ordering::Equal
            }
            Self::Range(req) => match normalize_semver(version.as_str()) {
                Some(v) => req.matches(&v),
                None => false,
            },
            Self::Approximate {
                major,
                minor,
                patch,
            } => {
                let c = components(version.as_str());
                c.first().copied().unwrap_or(0) == *major
                    && c.get(1).copied().unwrap_or(0) == *minor
                    && c.get(2).copied().unwrap_or(0) >= *patch
            }
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "{v}"),
            Self::Range(req) => write!(f, "{req}"),
            Self::Approximate {
                major,
                minor,
                patch,
            } => write!(f, "~{major}.{minor}.{patch}"),
        }
    }
}

impl FromStr for Constraint {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Constraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Magnitude of a version delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// Only the patch component moved.
    Patch,
    /// The minor component moved.
    Minor,
    /// The major component moved.
    Major,
}

fn split_prerelease(v: &str) -> (&str, Option<&str>) {
    match v.split_once('-') {
        Some((numeric, pre)) => (numeric, Some(pre)),
        None => (v, None),
    }
}

fn is_plain_version(v: &str) -> bool {
    let (numeric, _) = split_prerelease(v);
    !numeric.is_empty()
        && numeric
            .split('.')
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn components(v: &str) -> Vec<u64> {
    let (numeric, _) = split_prerelease(v);
    numeric
        .split('.')
        .filter_map(|p| p.parse::<u64>().ok())
        .collect()
}

/// Compare two version strings component-wise, padding missing components
/// with zero. A version without a pre-release suffix orders above the same
/// version with one.
pub fn cmp_versions(a: &str, b: &str) -> Ordering {
    let ac = components(a);
    let bc = components(b);
    for i in 0..ac.len().max(bc.len()) {
        let av = ac.get(i).copied().unwrap_or(0);
        let bv = bc.get(i).copied().unwrap_or(0);
        match av.cmp(&bv) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    let (_, a_pre) = split_prerelease(a);
    let (_, b_pre) = split_prerelease(b);
    match (a_pre, b_pre) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(ap), Some(bp)) => ap.cmp(bp),
    }
}

/// Returns `true` if `latest` is newer than `current`, using numeric
/// component comparison.
pub fn is_newer(current: &ModVersion, latest: &ModVersion) -> bool {
    cmp_versions(latest.as_str(), current.as_str()) == Ordering::Greater
}

/// Classify an upgrade delta. `None` when `new` is not newer than `old`.
pub fn classify_delta(old: &ModVersion, new: &ModVersion) -> Option<UpdateKind> {
    if !is_newer(old, new) {
        return None;
    }
    let oc = components(old.as_str());
    let nc = components(new.as_str());
    let at = |c: &[u64], i: usize| c.get(i).copied().unwrap_or(0);
    if at(&nc, 0) != at(&oc, 0) {
        Some(UpdateKind::Major)
    } else if at(&nc, 1) != at(&oc, 1) {
        Some(UpdateKind::Minor)
    } else {
        Some(UpdateKind::Patch)
    }
}

fn normalize_semver(v: &str) -> Option<semver::Version> {
    let (numeric, pre) = split_prerelease(v);
    let parts: Vec<&str> = numeric.split('.').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return None;
    }
    let at = |i: usize| parts.get(i).map_or("0", |p| *p);
    let normalized = match pre {
        Some(pre) => format!("{}.{}.{}-{pre}", at(0), at(1), at(2)),
        None => format!("{}.{}.{}", at(0), at(1), at(2)),
    };
    semver::Version::parse(&normalized).ok()
}
