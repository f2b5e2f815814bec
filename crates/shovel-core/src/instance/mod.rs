//! Task instances: the immutable input records and how they are loaded and
//! selected before scheduling.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or checking an instance set.
#[derive(Debug, Error)]
pub enum InstanceError {
    /// The source is not a `.json` / `.jsonl` file.
    #[error(
        "unsupported instance source {0:?}: expected a .json (array or keyed object) or .jsonl file"
    )]
    UnsupportedSource(String),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document (or one JSONL line) did not parse into an instance.
    #[error(
        "failed to parse {}{}: {source}",
        .path.display(),
        .line.map(|l| format!(" line {l}")).unwrap_or_default()
    )]
    Parse {
        path: PathBuf,
        line: Option<usize>,
        #[source]
        source: serde_json::Error,
    },

    /// The same `instance_id` appears more than once.
    #[error("duplicate instance_id {0:?} in input")]
    DuplicateId(String),
}

/// One repository bug-fix task descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    /// Source identifier, usually `owner/name` on GitHub.
    pub repo: String,
    pub base_commit: String,
    #[serde(default)]
    pub problem_statement: String,
    #[serde(default)]
    pub test_patch: String,
    #[serde(default)]
    pub patch: String,
}

/// Filters applied to the loaded sequence before scheduling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Explicit allowlist of ids.
    pub instance_ids: Option<Vec<String>>,
    /// 1-based, inclusive.
    pub start: Option<usize>,
    /// 1-based, inclusive.
    pub end: Option<usize>,
}

/// Load instances from a `.json` or `.jsonl` file, preserving source order.
///
/// A `.json` file may hold either an array of instance objects or an object
/// keyed by instance id. Duplicate ids are rejected.
pub fn load_instances(path: &Path) -> Result<Vec<Instance>, InstanceError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let instances = match extension.as_deref() {
        Some("json") => load_json(path)?,
        Some("jsonl") => load_jsonl(path)?,
        _ => return Err(InstanceError::UnsupportedSource(path.display().to_string())),
    };

    check_unique(&instances)?;
    tracing::info!(path = %path.display(), count = instances.len(), "loaded instances");
    Ok(instances)
}

fn read(path: &Path) -> Result<String, InstanceError> {
    std::fs::read_to_string(path).map_err(|source| InstanceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_json(path: &Path) -> Result<Vec<Instance>, InstanceError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum JsonSource {
        List(Vec<Instance>),
        Keyed(serde_json::Map<String, serde_json::Value>),
    }

    let parse_err = |source| InstanceError::Parse {
        path: path.to_path_buf(),
        line: None,
        source,
    };

    let contents = read(path)?;
    match serde_json::from_str::<JsonSource>(&contents).map_err(parse_err)? {
        JsonSource::List(list) => Ok(list),
        JsonSource::Keyed(map) => map
            .into_iter()
            .map(|(_, value)| serde_json::from_value::<Instance>(value).map_err(parse_err))
            .collect(),
    }
}

fn load_jsonl(path: &Path) -> Result<Vec<Instance>, InstanceError> {
    let contents = read(path)?;
    let mut instances = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let instance = serde_json::from_str::<Instance>(line).map_err(|source| {
            InstanceError::Parse {
                path: path.to_path_buf(),
                line: Some(idx + 1),
                source,
            }
        })?;
        instances.push(instance);
    }
    Ok(instances)
}

/// Reject an instance set that repeats an id.
pub fn check_unique(instances: &[Instance]) -> Result<(), InstanceError> {
    let mut seen = HashSet::with_capacity(instances.len());
    for instance in instances {
        if !seen.insert(instance.instance_id.as_str()) {
            return Err(InstanceError::DuplicateId(instance.instance_id.clone()));
        }
    }
    Ok(())
}

/// Apply the id allowlist, then the 1-based positional slice.
pub fn select(instances: Vec<Instance>, selection: &Selection) -> Vec<Instance> {
    let mut selected = instances;

    if let Some(ids) = &selection.instance_ids {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        selected.retain(|inst| wanted.contains(inst.instance_id.as_str()));

        let present: HashSet<&str> = selected.iter().map(|i| i.instance_id.as_str()).collect();
        for id in ids.iter().filter(|id| !present.contains(id.as_str())) {
            tracing::warn!(instance_id = %id, "requested instance not found in input");
        }
        tracing::info!(count = selected.len(), "filtered to requested instance ids");
    }

    if selection.start.is_some() || selection.end.is_some() {
        let total = selected.len();
        let start_idx = selection.start.unwrap_or(1).max(1) - 1;
        let end_idx = selection.end.unwrap_or(total).min(total);
        selected = if start_idx >= end_idx {
            Vec::new()
        } else {
            selected.drain(start_idx..end_idx).collect()
        };
        tracing::info!(
            start = start_idx + 1,
            end = end_idx,
            count = selected.len(),
            "sliced instances"
        );
    }

    selected
}
