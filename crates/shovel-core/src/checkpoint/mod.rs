//! Durable record of a run.
//!
//! Successes live in the output file, a pretty JSON object keyed by
//! instance id that is rewritten atomically after every success. Failures go
//! to a `<output>.failures.jsonl` sidecar, one fsynced line each. Only the
//! output file counts towards resume, so failed instances are retried.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::validate::Artifacts;
use crate::{EXIT_CODE_MARKER, SETUP_REPO_SCRIPT};

const FAILURE_LOG_SUFFIX: &str = ".failures.jsonl";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The existing output file is not a JSON object of per-instance
    /// objects whose `instance_id` matches their key.
    #[error("output file {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// A second success for an id that is already in the output.
    #[error("instance {0} already has a result")]
    Duplicate(String),

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Why an instance failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Provision,
    TurnLimitExceeded,
    ProviderFailure,
    MalformedOutput,
    Validation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provision => "provision",
            Self::TurnLimitExceeded => "turn_limit_exceeded",
            Self::ProviderFailure => "provider_failure",
            Self::MalformedOutput => "malformed_output",
            Self::Validation => "validation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { artifacts: Artifacts },
    Failed { kind: FailureKind, message: String },
}

/// Terminal record for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub instance_id: String,
    pub outcome: Outcome,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns: Option<u32>,
}

impl RunRecord {
    pub fn succeeded(artifacts: Artifacts, turns: Option<u32>) -> Self {
        Self {
            instance_id: artifacts.instance_id.clone(),
            outcome: Outcome::Succeeded { artifacts },
            finished_at: Utc::now(),
            turns,
        }
    }

    pub fn failed(
        instance_id: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
        turns: Option<u32>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            outcome: Outcome::Failed {
                kind,
                message: message.into(),
            },
            finished_at: Utc::now(),
            turns,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.outcome {
            Outcome::Failed { kind, .. } => Some(kind),
            Outcome::Succeeded { .. } => None,
        }
    }
}

/// Path of the failure sidecar for an output file.
pub fn failures_path_for(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(FAILURE_LOG_SUFFIX);
    PathBuf::from(name)
}

fn io_err(context: &'static str, path: &Path) -> impl FnOnce(io::Error) -> CheckpointError {
    let path = path.to_path_buf();
    move |source| CheckpointError::Io {
        context,
        path,
        source,
    }
}

/// Write `bytes` to a temp file beside `path`, fsync it, rename it over
/// `path`, then fsync the directory.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Read the output file. A missing file is an empty map.
pub fn load_results(path: &Path) -> Result<Map<String, Value>, CheckpointError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(io_err("failed to read", path)(e)),
    };
    let corrupt = |reason: String| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let map = match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(corrupt("top level is not a JSON object".to_string())),
        Err(e) => return Err(corrupt(e.to_string())),
    };
    for (key, value) in &map {
        match value.get("instance_id").and_then(Value::as_str) {
            Some(id) if id == key => {}
            Some(id) => {
                return Err(corrupt(format!("entry {key} has instance_id {id}")));
            }
            None => return Err(corrupt(format!("entry {key} has no instance_id"))),
        }
    }
    Ok(map)
}

/// Read a failure log back, keeping the last record per instance.
///
/// A missing log is empty. Unparsable lines (a torn final write) are
/// skipped.
pub fn load_failures(path: &Path) -> Result<Vec<RunRecord>, CheckpointError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err("failed to read", path)(e)),
    };

    let mut records: Vec<RunRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: RunRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %path.display(), line = n + 1, error = %e, "skipping unreadable failure record");
                continue;
            }
        };
        match index.get(&record.instance_id) {
            Some(&i) => records[i] = record,
            None => {
                index.insert(record.instance_id.clone(), records.len());
                records.push(record);
            }
        }
    }
    Ok(records)
}

/// Counts reported at the end of a run and by `shovel status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputSummary {
    pub total: usize,
    pub with_exit_marker: usize,
    pub with_setup_repo: usize,
}

impl OutputSummary {
    pub fn from_results(results: &Map<String, Value>) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for value in results.values() {
            if value
                .get("eval_script")
                .and_then(Value::as_str)
                .is_some_and(|s| s.contains(EXIT_CODE_MARKER))
            {
                summary.with_exit_marker += 1;
            }
            if value
                .get("setup_scripts")
                .and_then(Value::as_object)
                .is_some_and(|m| m.contains_key(SETUP_REPO_SCRIPT))
            {
                summary.with_setup_repo += 1;
            }
        }
        summary
    }
}

/// Single-writer store behind the scheduler.
#[derive(Debug)]
pub struct CheckpointStore {
    output_path: PathBuf,
    failures_path: PathBuf,
    results: Map<String, Value>,
    failures: File,
}

impl CheckpointStore {
    /// Open the store for `output_path`.
    ///
    /// With `resume`, existing successes are loaded and the failure log is
    /// appended to. Without it, both files are reset.
    pub fn open(output_path: &Path, resume: bool) -> Result<Self, CheckpointError> {
        let failures_path = failures_path_for(output_path);
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err("failed to create", parent))?;
        }

        let results = if resume {
            load_results(output_path)?
        } else {
            atomic_write(output_path, b"{}\n").map_err(io_err("failed to write", output_path))?;
            Map::new()
        };

        let failures = OpenOptions::new()
            .create(true)
            .append(resume)
            .write(true)
            .truncate(!resume)
            .open(&failures_path)
            .map_err(io_err("failed to open", &failures_path))?;

        tracing::info!(
            output = %output_path.display(),
            resume,
            existing = results.len(),
            "opened checkpoint store"
        );

        Ok(Self {
            output_path: output_path.to_path_buf(),
            failures_path,
            results,
            failures,
        })
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn failures_path(&self) -> &Path {
        &self.failures_path
    }

    pub fn results(&self) -> &Map<String, Value> {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_settled(&self, instance_id: &str) -> bool {
        self.results.contains_key(instance_id)
    }

    /// Ids with a result in the output file.
    pub fn settled_ids(&self) -> HashSet<String> {
        self.results.keys().cloned().collect()
    }

    /// Durably record one terminal instance.
    pub fn append(&mut self, record: &RunRecord) -> Result<(), CheckpointError> {
        match &record.outcome {
            Outcome::Succeeded { artifacts } => self.append_success(&record.instance_id, artifacts),
            Outcome::Failed { .. } => self.append_failure(record),
        }
    }

    fn append_success(&mut self, instance_id: &str, artifacts: &Artifacts) -> Result<(), CheckpointError> {
        if self.results.contains_key(instance_id) {
            return Err(CheckpointError::Duplicate(instance_id.to_string()));
        }
        let value = serde_json::to_value(artifacts)?;
        self.results.insert(instance_id.to_string(), value);

        let written = serde_json::to_vec_pretty(&self.results)
            .map_err(CheckpointError::from)
            .and_then(|mut bytes| {
                bytes.push(b'\n');
                atomic_write(&self.output_path, &bytes)
                    .map_err(io_err("failed to write", &self.output_path))
            });
        if written.is_err() {
            self.results.remove(instance_id);
        }
        written?;
        tracing::debug!(instance_id, total = self.results.len(), "saved result");
        Ok(())
    }

    fn append_failure(&mut self, record: &RunRecord) -> Result<(), CheckpointError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.failures
            .write_all(&line)
            .and_then(|()| self.failures.sync_data())
            .map_err(io_err("failed to append to", &self.failures_path))?;
        tracing::debug!(instance_id = %record.instance_id, "logged failure");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn artifacts(id: &str) -> Artifacts {
        Artifacts {
            instance_id: id.to_string(),
            dockerfile: "FROM --platform=linux/x86_64 python:3.11".to_string(),
            eval_script: format!("pytest\nrc=$?\necho \"{EXIT_CODE_MARKER}=$rc\"\n"),
            setup_scripts: BTreeMap::from([(SETUP_REPO_SCRIPT.to_string(), "pip install .".to_string())]),
            extra: Map::new(),
        }
    }

    #[test]
    fn fresh_open_writes_empty_object_and_truncates_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("docker_res.json");
        std::fs::write(&out, r#"{"old": {}}"#).unwrap();
        std::fs::write(failures_path_for(&out), "stale\n").unwrap();

        let store = CheckpointStore::open(&out, false).unwrap();
        assert!(store.is_empty());
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "{}");
        assert_eq!(std::fs::read_to_string(store.failures_path()).unwrap(), "");
    }

    #[test]
    fn successes_are_persisted_as_pretty_json() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("nested/dir/out.json");
        let mut store = CheckpointStore::open(&out, false).unwrap();
        store.append(&RunRecord::succeeded(artifacts("b"), Some(3))).unwrap();
        store.append(&RunRecord::succeeded(artifacts("a"), None)).unwrap();

        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("\n  \"b\": {"), "pretty-printed: {text}");
        let reloaded = load_results(&out).unwrap();
        assert_eq!(reloaded.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(reloaded["a"]["setup_scripts"][SETUP_REPO_SCRIPT], "pip install .");
        assert_eq!(reloaded["a"]["instance_id"], "a");
        assert_eq!(reloaded["b"]["instance_id"], "b");
    }

    #[test]
    fn entries_must_carry_their_own_instance_id() {
        let tmp = tempfile::tempdir().unwrap();

        let missing = tmp.path().join("missing_id.json");
        std::fs::write(&missing, r#"{"a": {"dockerfile": "FROM x"}}"#).unwrap();
        assert!(matches!(
            CheckpointStore::open(&missing, true).unwrap_err(),
            CheckpointError::Corrupt { .. }
        ));

        let mismatched = tmp.path().join("mismatch.json");
        std::fs::write(&mismatched, r#"{"a": {"instance_id": "b"}}"#).unwrap();
        let err = load_results(&mismatched).unwrap_err();
        assert!(err.to_string().contains("entry a has instance_id b"), "{err}");
    }

    #[test]
    fn duplicate_success_is_rejected_without_touching_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.json");
        let mut store = CheckpointStore::open(&out, false).unwrap();
        store.append(&RunRecord::succeeded(artifacts("a"), None)).unwrap();
        let before = std::fs::read(&out).unwrap();

        let err = store.append(&RunRecord::succeeded(artifacts("a"), None)).unwrap_err();
        assert!(matches!(err, CheckpointError::Duplicate(ref id) if id == "a"));
        assert_eq!(std::fs::read(&out).unwrap(), before);
    }

    #[test]
    fn failures_are_not_settled() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.json");
        let mut store = CheckpointStore::open(&out, false).unwrap();
        store
            .append(&RunRecord::failed("x", FailureKind::Validation, "bad", Some(4)))
            .unwrap();
        store.append(&RunRecord::succeeded(artifacts("y"), None)).unwrap();
        drop(store);

        let store = CheckpointStore::open(&out, true).unwrap();
        assert_eq!(store.settled_ids(), HashSet::from(["y".to_string()]));
        assert!(!store.is_settled("x"));

        let failures = load_failures(store.failures_path()).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].failure_kind(), Some(FailureKind::Validation));
        assert_eq!(failures[0].turns, Some(4));
    }

    #[test]
    fn resume_appends_to_failure_log_and_keeps_last_per_id() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.json");
        {
            let mut store = CheckpointStore::open(&out, false).unwrap();
            store
                .append(&RunRecord::failed("x", FailureKind::TurnLimitExceeded, "slow", None))
                .unwrap();
            store
                .append(&RunRecord::failed("z", FailureKind::Provision, "clone", None))
                .unwrap();
        }
        {
            let mut store = CheckpointStore::open(&out, true).unwrap();
            store
                .append(&RunRecord::failed("x", FailureKind::ProviderFailure, "429", None))
                .unwrap();
        }
        let failures = load_failures(&failures_path_for(&out)).unwrap();
        let kinds: Vec<_> = failures
            .iter()
            .map(|r| (r.instance_id.as_str(), r.failure_kind().unwrap()))
            .collect();
        assert_eq!(
            kinds,
            vec![("x", FailureKind::ProviderFailure), ("z", FailureKind::Provision)]
        );
    }

    #[test]
    fn resume_on_missing_file_is_empty_and_corrupt_file_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("missing.json");
        assert!(CheckpointStore::open(&out, true).unwrap().is_empty());

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, "{\"a\": ").unwrap();
        assert!(matches!(
            CheckpointStore::open(&bad, true).unwrap_err(),
            CheckpointError::Corrupt { .. }
        ));

        let list = tmp.path().join("list.json");
        std::fs::write(&list, "[]").unwrap();
        assert!(matches!(
            CheckpointStore::open(&list, true).unwrap_err(),
            CheckpointError::Corrupt { .. }
        ));
    }

    #[test]
    fn torn_failure_line_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("out.json.failures.jsonl");
        let good = serde_json::to_string(&RunRecord::failed("a", FailureKind::MalformedOutput, "t", None)).unwrap();
        std::fs::write(&log, format!("{good}\n{{\"instance_id\":\"b\",\"outc")).unwrap();
        let failures = load_failures(&log).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].instance_id, "a");
    }

    #[test]
    fn summary_counts_marker_and_setup_script() {
        let mut results = Map::new();
        results.insert("a".into(), serde_json::to_value(artifacts("a")).unwrap());
        results.insert(
            "b".into(),
            serde_json::json!({"eval_script": "pytest", "setup_scripts": {}}),
        );
        assert_eq!(
            OutputSummary::from_results(&results),
            OutputSummary {
                total: 2,
                with_exit_marker: 1,
                with_setup_repo: 1
            }
        );
    }

    #[test]
    fn failure_kind_display_matches_serde() {
        for kind in [
            FailureKind::Provision,
            FailureKind::TurnLimitExceeded,
            FailureKind::ProviderFailure,
            FailureKind::MalformedOutput,
            FailureKind::Validation,
        ] {
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                Value::String(kind.to_string())
            );
        }
    }
}
