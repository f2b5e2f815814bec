//! Workspace provisioning.
//!
//! Decouples "give this instance its own checkout" from how the checkout is
//! produced, so the scheduler can run against real git clones or test
//! doubles interchangeably.

pub mod git_clone;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::instance::Instance;

pub use git_clone::{GitCloneConfig, GitCloneProvisioner};

/// Errors raised while creating or releasing a workspace.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Network-level or spawn failure that may succeed on a later attempt.
    #[error("transient failure during git {step}: {message}")]
    Transient { step: String, message: String },

    /// The base commit does not exist in the cloned repository.
    #[error("revision {revision} not found in {repo}")]
    MissingRevision { repo: String, revision: String },

    /// A git step exceeded its wall-clock budget.
    #[error("git {step} timed out after {}s", .timeout.as_secs())]
    Timeout { step: String, timeout: Duration },

    /// A git command exited non-zero for any other reason.
    #[error("git {step} failed (exit {code}): {stderr}")]
    Git {
        step: String,
        code: i32,
        stderr: String,
    },

    /// Another in-flight instance already owns the target directory.
    #[error("workspace {} is already in use", .0.display())]
    InUse(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    /// Whether a retry by the caller could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

/// A provisioned, exclusively owned working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceInfo {
    /// The instance that owns this workspace.
    pub instance_id: String,
    /// Root of the checked-out tree.
    pub path: PathBuf,
}

/// Backend that produces an isolated checkout for one instance.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Human-readable backend name (e.g. "git-clone").
    fn name(&self) -> &str;

    /// Produce a working tree matching `instance.repo` at
    /// `instance.base_commit`. Failures are not retried here.
    async fn provision(&self, instance: &Instance) -> Result<WorkspaceInfo, ProvisionError>;

    /// Give the workspace back once the instance is terminal.
    async fn release(&self, info: &WorkspaceInfo) -> Result<(), ProvisionError>;
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Map an instance id onto a single safe path component, distinct for
/// distinct ids.
///
/// Ids made only of `[A-Za-z0-9._-]` are used as-is. Any other id has `/`
/// replaced by `__` and other characters by `_`, followed by `~` and the
/// first 16 hex digits of the SHA-256 of the raw id. `~` never appears in
/// an id that is used as-is, so the two forms cannot collide.
pub fn sanitize_instance_id(instance_id: &str) -> String {
    let verbatim = !instance_id.is_empty()
        && instance_id != "."
        && instance_id != ".."
        && instance_id.chars().all(is_safe_char);
    if verbatim {
        return instance_id.to_string();
    }

    let readable: String = instance_id
        .replace('/', "__")
        .chars()
        .map(|c| if is_safe_char(c) { c } else { '_' })
        .collect();
    let digest = Sha256::digest(instance_id.as_bytes());
    format!("{readable}~{}", &hex::encode(digest)[..16])
}
