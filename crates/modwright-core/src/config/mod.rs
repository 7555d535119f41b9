//! Configuration parsing and three-way merge.
//!
//! When a mod upgrade changes its shipped configuration defaults, user
//! edits must survive. For every key present in the new defaults **N**,
//! compared against the old defaults **O** and the user's live file **U**:
//!
//! - key absent from O: it is new, take N's value;
//! - `U[key] != O[key]`: the user customized it, preserve U's value;
//! - otherwise: the user never touched it, adopt N's (possibly changed)
//!   default.
//!
//! Keys present in U but dropped from N are discarded and logged. The merge
//! is idempotent, and a parse failure leaves the live file byte-identical.
//!
//! All five formats project into one ordered tree (`serde_json::Value` with
//! `preserve_order`); merging happens on dotted leaf paths and the merged
//! document keeps N's structure, so format-native nesting survives.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use modwright_schema::ConfigFormat;

mod ini;
mod xml;

/// Errors raised by parsing, rendering or merging configuration files.
#[derive(Error, Debug)]
pub enum MergeError {
    /// A document could not be parsed (or re-rendered) in its format.
    #[error("cannot process {path} as {format}: {reason}")]
    Parse {
        /// The offending file.
        path: PathBuf,
        /// Format it was interpreted as.
        format: ConfigFormat,
        /// Parser/serializer diagnostic.
        reason: String,
    },

    /// The file extension maps to no supported format.
    #[error("unrecognized config format: {path}")]
    UnknownFormat {
        /// The offending file.
        path: PathBuf,
    },

    /// Filesystem failure while reading or writing.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a document in the given format into the common ordered tree.
///
/// # Errors
///
/// Returns the parser diagnostic as a plain string; callers wrap it into
/// [`MergeError::Parse`] with file context.
pub fn parse_str(input: &str, format: ConfigFormat) -> Result<Value, String> {
    match format {
        ConfigFormat::Ini => ini::parse(input),
        ConfigFormat::Json => serde_json::from_str(input).map_err(|e| e.to_string()),
        ConfigFormat::Yaml => {
            let doc: serde_yaml::Value =
                serde_yaml::from_str(input).map_err(|e| e.to_string())?;
            serde_json::to_value(doc).map_err(|e| e.to_string())
        }
        ConfigFormat::Toml => {
            let doc: toml::Value = toml::from_str(input).map_err(|e| e.to_string())?;
            serde_json::to_value(doc).map_err(|e| e.to_string())
        }
        ConfigFormat::Xml => xml::parse(input),
    }
}

/// Render the common tree back into the given format.
///
/// # Errors
///
/// Returns the serializer diagnostic as a plain string.
pub fn render(value: &Value, format: ConfigFormat) -> Result<String, String> {
    match format {
        ConfigFormat::Ini => ini::render(value),
        ConfigFormat::Json => {
            serde_json::to_string_pretty(value).map_err(|e| e.to_string())
        }
        ConfigFormat::Yaml => {
            let doc: serde_yaml::Value =
                serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
            serde_yaml::to_string(&doc).map_err(|e| e.to_string())
        }
        ConfigFormat::Toml => {
            let doc: toml::Value =
                serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
            toml::to_string_pretty(&doc).map_err(|e| e.to_string())
        }
        ConfigFormat::Xml => xml::render(value),
    }
}

/// Parse a file, deriving the format from its extension.
///
/// # Errors
///
/// [`MergeError::UnknownFormat`] for unrecognized extensions,
/// [`MergeError::Parse`] for malformed content, [`MergeError::Io`] on read
/// failure.
pub fn parse_file(path: &Path) -> Result<(Value, ConfigFormat), MergeError> {
    let format = ConfigFormat::from_path(path).ok_or_else(|| MergeError::UnknownFormat {
        path: path.to_path_buf(),
    })?;
    let raw = std::fs::read_to_string(path)?;
    let value = parse_str(&raw, format).map_err(|reason| MergeError::Parse {
        path: path.to_path_buf(),
        format,
        reason,
    })?;
    Ok((value, format))
}

/// Dotted leaf paths of a tree, in document order. Arrays are treated as
/// atomic leaves; merging inside arrays is undefined for config files.
pub fn flatten(value: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    collect_leaves("", value, &mut out);
    out
}

fn collect_leaves(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_leaves(&path, val, out);
            }
        }
        leaf => out.push((prefix.to_string(), leaf.clone())),
    }
}

fn set_path(root: &mut Value, path: &str, new_value: Value) {
    let mut current = root;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), new_value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Per-key summary of one merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// Keys where the user's customized value was kept.
    pub preserved: Vec<String>,
    /// Keys where a changed or new shipped default was taken.
    pub adopted: Vec<String>,
    /// Keys the user had that the new version no longer recognizes.
    pub dropped: Vec<String>,
}

/// Three-way merge over parsed trees. The result keeps N's structure and
/// key order with the user's customized values written back in.
pub fn merge_values(old: &Value, user: &Value, new: &Value) -> (Value, MergeOutcome) {
    let old_map: std::collections::HashMap<String, Value> =
        flatten(old).into_iter().collect();
    let user_map: std::collections::HashMap<String, Value> =
        flatten(user).into_iter().collect();

    let mut result = new.clone();
    let mut outcome = MergeOutcome::default();

    for (path, new_value) in flatten(new) {
        match old_map.get(&path) {
            None => {
                // Brand new key: N's value is already in place.
                outcome.adopted.push(path);
            }
            Some(old_value) => match user_map.get(&path) {
                Some(user_value) if user_value != old_value => {
                    set_path(&mut result, &path, user_value.clone());
                    outcome.preserved.push(path);
                }
                _ => {
                    if *old_value != new_value {
                        outcome.adopted.push(path);
                    }
                }
            },
        }
    }

    let new_map: std::collections::HashSet<String> =
        flatten(new).into_iter().map(|(p, _)| p).collect();
    for (path, _) in flatten(user) {
        if !new_map.contains(&path) {
            outcome.dropped.push(path);
        }
    }

    (result, outcome)
}

/// Result of [`merge_file`].
#[derive(Debug)]
pub struct FileMergeReport {
    /// Key-level summary.
    pub outcome: MergeOutcome,
    /// Where the user's pre-merge file was backed up.
    pub backup: PathBuf,
}

/// Merge a staged config file against the user's live copy.
///
/// `old_shipped` is the pristine file as shipped with the currently
/// installed version (`None` when no shipped snapshot exists; user values
/// that differ from the new defaults are then preserved conservatively).
/// The merged document replaces `staged_new` in the staging area, so the
/// subsequent commit carries it; the live file is only copied aside to
/// `<name>.bak`, never rewritten.
///
/// # Errors
///
/// Any [`MergeError`]; on error neither the live file nor the staged file
/// has been modified.
pub fn merge_file(
    old_shipped: Option<&Path>,
    live: &Path,
    staged_new: &Path,
) -> Result<FileMergeReport, MergeError> {
    let (new_value, format) = parse_file(staged_new)?;
    let (user_value, _) = parse_file(live)?;
    let old_value = match old_shipped {
        Some(path) if path.exists() => parse_file(path)?.0,
        // No shipped baseline: treat the new defaults as the baseline so
        // anything the user's file disagrees with is preserved.
        _ => new_value.clone(),
    };

    let (merged, outcome) = merge_values(&old_value, &user_value, &new_value);

    for path in &outcome.dropped {
        tracing::info!(
            key = path.as_str(),
            file = %live.display(),
            "dropping config key no longer shipped"
        );
    }

    let rendered = render(&merged, format).map_err(|reason| MergeError::Parse {
        path: staged_new.to_path_buf(),
        format,
        reason,
    })?;

    let backup = sibling_backup(live);
    std::fs::copy(live, &backup)?;
    std::fs::write(staged_new, rendered)?;

    Ok(FileMergeReport { outcome, backup })
}

fn sibling_backup(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "config".to_string(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!("{name}.bak"))
}
