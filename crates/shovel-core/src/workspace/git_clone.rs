//! Git clone provisioning backend.
//!
//! Each instance gets a full clone under `<root>/<sanitized instance id>`.
//! Clones never share an object store, so concurrent instances on the same
//! repository cannot contend on git lock files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{ProvisionError, Provisioner, WorkspaceInfo, sanitize_instance_id};
use crate::instance::Instance;

/// Stderr fragments that indicate a network problem rather than a bad
/// repository or revision.
const TRANSIENT_MARKERS: &[&str] = &[
    "Could not resolve host",
    "unable to access",
    "Connection",
    "timed out",
    "early EOF",
    "The remote end hung up",
    "RPC failed",
];

/// Stderr fragments emitted when the requested revision is absent.
const MISSING_REVISION_MARKERS: &[&str] = &[
    "unknown revision",
    "Could not parse object",
    "bad revision",
    "not a valid object name",
    "not a tree",
];

/// Configuration for [`GitCloneProvisioner`].
#[derive(Debug, Clone)]
pub struct GitCloneConfig {
    /// Directory under which per-instance clones live.
    pub root: PathBuf,
    /// Clone URL template; `{repo}` is replaced by [`Instance::repo`].
    pub remote_template: String,
    /// Wall-clock limit for each individual git step.
    pub step_timeout: Duration,
    /// Leave the checkout on disk after the instance settles.
    pub keep_workspaces: bool,
}

impl GitCloneConfig {
    pub const DEFAULT_REMOTE_TEMPLATE: &'static str = "https://github.com/{repo}";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            remote_template: Self::DEFAULT_REMOTE_TEMPLATE.to_string(),
            step_timeout: Duration::from_secs(300),
            keep_workspaces: true,
        }
    }
}

/// Provisioner that clones `repo` and hard-resets to `base_commit`.
///
/// A directory left over from an earlier run is reused after a reset and
/// clean; if that fails it is deleted and cloned again.
#[derive(Debug, Clone)]
pub struct GitCloneProvisioner {
    config: GitCloneConfig,
    /// Directories currently owned by an in-flight instance.
    in_use: Arc<Mutex<HashSet<PathBuf>>>,
}

impl GitCloneProvisioner {
    pub fn new(config: GitCloneConfig) -> Self {
        Self {
            config,
            in_use: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &GitCloneConfig {
        &self.config
    }

    /// Directory used for `instance_id`.
    pub fn workspace_path(&self, instance_id: &str) -> PathBuf {
        self.config.root.join(sanitize_instance_id(instance_id))
    }

    /// Build the clone URL for `repo`.
    pub fn remote_url(&self, repo: &str) -> String {
        self.config.remote_template.replace("{repo}", repo)
    }

    fn claim(&self, path: &Path) -> Result<(), ProvisionError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        if !in_use.insert(path.to_path_buf()) {
            return Err(ProvisionError::InUse(path.to_path_buf()));
        }
        Ok(())
    }

    fn unclaim(&self, path: &Path) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        in_use.remove(path);
    }

    /// Run one git step with the configured timeout, returning its output
    /// only when it exits successfully.
    async fn git(&self, step: &str, args: &[&str], cwd: &Path) -> Result<Output, ProvisionError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.config.step_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProvisionError::Transient {
                    step: step.to_string(),
                    message: format!("failed to run git: {e}"),
                });
            }
            Err(_elapsed) => {
                return Err(ProvisionError::Timeout {
                    step: step.to_string(),
                    timeout: self.config.step_timeout,
                });
            }
        };

        if output.status.success() {
            return Ok(output);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
            return Err(ProvisionError::Transient {
                step: step.to_string(),
                message: stderr,
            });
        }
        Err(ProvisionError::Git {
            step: step.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }

    /// `git reset --hard <base_commit>`, mapping an unknown revision onto
    /// [`ProvisionError::MissingRevision`].
    async fn reset_to_base(&self, instance: &Instance, dir: &Path) -> Result<(), ProvisionError> {
        match self
            .git("reset", &["reset", "--hard", &instance.base_commit], dir)
            .await
        {
            Ok(_) => Ok(()),
            Err(ProvisionError::Git { stderr, .. })
                if MISSING_REVISION_MARKERS.iter().any(|m| stderr.contains(m)) =>
            {
                Err(ProvisionError::MissingRevision {
                    repo: instance.repo.clone(),
                    revision: instance.base_commit.clone(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn reuse_existing(&self, instance: &Instance, dir: &Path) -> Result<(), ProvisionError> {
        self.reset_to_base(instance, dir).await?;
        self.git("clean", &["clean", "-fdx"], dir).await?;
        Ok(())
    }

    async fn fresh_clone(&self, instance: &Instance, dir: &Path) -> Result<(), ProvisionError> {
        let remote = self.remote_url(&instance.repo);
        let dir_str = dir.to_string_lossy();
        tracing::info!(
            instance_id = %instance.instance_id,
            repo = %instance.repo,
            base_commit = %short_sha(&instance.base_commit),
            "cloning repository"
        );

        if let Err(e) = self
            .git(
                "clone",
                &["clone", "-o", "origin", &remote, &dir_str],
                &self.config.root,
            )
            .await
        {
            remove_dir_best_effort(dir);
            return Err(e);
        }

        self.reset_to_base(instance, dir).await
    }

    async fn checkout(&self, instance: &Instance, dir: &Path) -> Result<(), ProvisionError> {
        // Only reuse a directory that is itself a checkout; git would
        // otherwise walk up and reset whatever repository encloses the root.
        if dir.join(".git").exists() {
            tracing::info!(
                instance_id = %instance.instance_id,
                base_commit = %short_sha(&instance.base_commit),
                "workspace exists, resetting"
            );
            match self.reuse_existing(instance, dir).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        instance_id = %instance.instance_id,
                        error = %e,
                        "reset of existing workspace failed, recloning"
                    );
                    tokio::fs::remove_dir_all(dir)
                        .await
                        .map_err(|source| ProvisionError::Io {
                            context: format!("failed to remove stale workspace {}", dir.display()),
                            source,
                        })?;
                }
            }
        } else if dir.exists() {
            tracing::warn!(
                instance_id = %instance.instance_id,
                path = %dir.display(),
                "workspace directory is not a git checkout, removing"
            );
            tokio::fs::remove_dir_all(dir)
                .await
                .map_err(|source| ProvisionError::Io {
                    context: format!("failed to remove stale workspace {}", dir.display()),
                    source,
                })?;
        }

        self.fresh_clone(instance, dir).await
    }
}

#[async_trait]
impl Provisioner for GitCloneProvisioner {
    fn name(&self) -> &str {
        "git-clone"
    }

    async fn provision(&self, instance: &Instance) -> Result<WorkspaceInfo, ProvisionError> {
        tokio::fs::create_dir_all(&self.config.root)
            .await
            .map_err(|source| ProvisionError::Io {
                context: format!(
                    "failed to create workspace root {}",
                    self.config.root.display()
                ),
                source,
            })?;

        let dir = self.workspace_path(&instance.instance_id);
        self.claim(&dir)?;

        if let Err(e) = self.checkout(instance, &dir).await {
            self.unclaim(&dir);
            return Err(e);
        }

        Ok(WorkspaceInfo {
            instance_id: instance.instance_id.clone(),
            path: dir,
        })
    }

    async fn release(&self, info: &WorkspaceInfo) -> Result<(), ProvisionError> {
        self.unclaim(&info.path);
        if self.config.keep_workspaces || !info.path.exists() {
            return Ok(());
        }
        tokio::fs::remove_dir_all(&info.path)
            .await
            .map_err(|source| ProvisionError::Io {
                context: format!("failed to remove workspace {}", info.path.display()),
                source,
            })
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

fn remove_dir_best_effort(dir: &Path) {
    if dir.exists() {
        let _ = std::fs::remove_dir_all(dir);
    }
}
