//! Shared fixtures for shovel integration tests.
//!
//! Deterministic stand-ins for the two external collaborators (workspace
//! provisioning and the coding agent) plus helpers for building instance
//! sets and throwaway git repositories.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use shovel_core::agent::{AgentDriver, AgentError, AgentOutput};
use shovel_core::instance::Instance;
use shovel_core::workspace::{ProvisionError, Provisioner, WorkspaceInfo, sanitize_instance_id};

/// Instance with placeholder repo fields.
pub fn instance(id: &str) -> Instance {
    Instance {
        instance_id: id.to_string(),
        repo: "example/project".to_string(),
        base_commit: "0000000".to_string(),
        problem_statement: format!("problem for {id}"),
        test_patch: "--- a/tests/test_core.py\n+++ b/tests/test_core.py\n".to_string(),
        patch: String::new(),
    }
}

/// `n` instances named `inst-001`, `inst-002`, ...
pub fn instances(n: usize) -> Vec<Instance> {
    (1..=n).map(|i| instance(&format!("inst-{i:03}"))).collect()
}

/// Write `instances` as JSONL.
pub fn write_jsonl(path: &Path, instances: &[Instance]) {
    let body: String = instances
        .iter()
        .map(|i| serde_json::to_string(i).expect("serialize instance") + "\n")
        .collect();
    std::fs::write(path, body).expect("write jsonl");
}

/// A well-formed agent output object whose content depends only on `id`.
pub fn valid_output(id: &str) -> Value {
    json!({
        "dockerfile": format!("FROM --platform=linux/x86_64 python:3.11\n# {id}\n"),
        "eval_script": "#!/bin/bash\npytest tests/test_core.py\nrc=$?\necho \"OMNIGRIL_EXIT_CODE=$rc\"\n",
        "setup_scripts": {"setup_repo.sh": format!("git clone repo /testbed # {id}")},
    })
}

/// Tracks how many workspaces are live at once.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Provisioner that hands out empty temp directories.
#[derive(Debug)]
pub struct StubProvisioner {
    root: TempDir,
    fail_ids: HashSet<String>,
    panic_on_release: HashSet<String>,
    pub probe: ConcurrencyProbe,
}

impl StubProvisioner {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("create provisioner root"),
            fail_ids: HashSet::new(),
            panic_on_release: HashSet::new(),
            probe: ConcurrencyProbe::default(),
        }
    }

    /// Make provisioning fail for `id` with a missing-revision error.
    pub fn failing_for(mut self, id: &str) -> Self {
        self.fail_ids.insert(id.to_string());
        self
    }

    /// Panic while releasing the workspace of `id`.
    pub fn panicking_on_release_for(mut self, id: &str) -> Self {
        self.panic_on_release.insert(id.to_string());
        self
    }
}

impl Default for StubProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for StubProvisioner {
    fn name(&self) -> &str {
        "stub"
    }

    async fn provision(&self, instance: &Instance) -> Result<WorkspaceInfo, ProvisionError> {
        if self.fail_ids.contains(&instance.instance_id) {
            return Err(ProvisionError::MissingRevision {
                repo: instance.repo.clone(),
                revision: instance.base_commit.clone(),
            });
        }
        let path = self.root.path().join(sanitize_instance_id(&instance.instance_id));
        std::fs::create_dir_all(&path).map_err(|source| ProvisionError::Io {
            context: format!("creating {}", path.display()),
            source,
        })?;
        self.probe.enter();
        Ok(WorkspaceInfo {
            instance_id: instance.instance_id.clone(),
            path,
        })
    }

    async fn release(&self, info: &WorkspaceInfo) -> Result<(), ProvisionError> {
        self.probe.exit();
        if self.panic_on_release.contains(&info.instance_id) {
            panic!("release of {} exploded", info.instance_id);
        }
        Ok(())
    }
}

/// What [`ScriptedDriver`] does for one instance.
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Return [`valid_output`].
    Succeed,
    /// Return [`valid_output`] with the exit-code echo stripped.
    SucceedWithoutMarker,
    /// Return an object missing `setup_scripts`.
    Incomplete,
    Fail(AgentError),
    /// Never return; only cancellation or a timeout ends it.
    Hang,
    Panic,
}

/// Deterministic [`AgentDriver`] keyed by instance id.
#[derive(Debug)]
pub struct ScriptedDriver {
    behaviors: HashMap<String, StubBehavior>,
    delay: Duration,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedDriver {
    /// Succeeds for every instance.
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with(mut self, id: &str, behavior: StubBehavior) -> Self {
        self.behaviors.insert(id.to_string(), behavior);
        self
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// How many times `id` was run.
    pub fn calls(&self, id: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("calls lock").values().sum()
    }
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentDriver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(
        &self,
        instance: &Instance,
        _workspace: &WorkspaceInfo,
        _max_turns: u32,
    ) -> Result<AgentOutput, AgentError> {
        let id = instance.instance_id.as_str();
        *self
            .calls
            .lock()
            .expect("calls lock")
            .entry(id.to_string())
            .or_default() += 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let behavior = self.behaviors.get(id).cloned().unwrap_or(StubBehavior::Succeed);
        let raw = match behavior {
            StubBehavior::Succeed => valid_output(id),
            StubBehavior::SucceedWithoutMarker => {
                let mut v = valid_output(id);
                v["eval_script"] = json!("#!/bin/bash\npytest tests/test_core.py\n");
                v
            }
            StubBehavior::Incomplete => json!({"dockerfile": "FROM scratch", "eval_script": "true"}),
            StubBehavior::Fail(err) => return Err(err),
            StubBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!("pending never resolves")
            }
            StubBehavior::Panic => panic!("scripted panic for {id}"),
        };
        Ok(AgentOutput {
            raw,
            turns: 3,
            cost_usd: None,
        })
    }
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A throwaway git repository with two commits.
///
/// Returns the temp dir guard, the repo path, and the commit hashes
/// oldest first.
pub fn create_temp_git_repo() -> (TempDir, PathBuf, Vec<String>) {
    let tmp = TempDir::new().expect("create temp dir");
    let repo = tmp.path().join("source");
    std::fs::create_dir_all(&repo).expect("create repo dir");

    git(&repo, &["init", "-q"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test"]);

    let mut commits = Vec::new();
    for (n, contents) in ["first\n", "second\n"].iter().enumerate() {
        std::fs::write(repo.join("file.txt"), contents).expect("write file");
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", &format!("commit {n}")]);
        commits.push(git(&repo, &["rev-parse", "HEAD"]));
    }
    (tmp, repo, commits)
}
