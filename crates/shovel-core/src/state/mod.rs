//! Per-instance state machine.
//!
//! Validates the transitions an instance goes through inside a worker and
//! records them so the pipeline cannot skip or repeat a stage.

use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Processing state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Provisioning,
    Running,
    Validating,
    Succeeded,
    Failed,
}

impl InstanceState {
    /// `true` for `Succeeded` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// `true` while the instance occupies a worker slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Provisioning | Self::Running | Self::Validating)
    }

    /// Check whether `from -> to` is an edge of the transition graph:
    ///
    /// ```text
    /// pending      -> provisioning
    /// provisioning -> running
    /// running      -> validating
    /// validating   -> succeeded
    /// provisioning -> failed
    /// running      -> failed
    /// validating   -> failed
    /// ```
    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Pending, Self::Provisioning)
                | (Self::Provisioning, Self::Running)
                | (Self::Running, Self::Validating)
                | (Self::Validating, Self::Succeeded)
                | (Self::Provisioning, Self::Failed)
                | (Self::Running, Self::Failed)
                | (Self::Validating, Self::Failed)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks the current state of a single instance and the path it took.
#[derive(Debug, Clone)]
pub struct InstanceProgress {
    instance_id: String,
    state: InstanceState,
    history: Vec<InstanceState>,
}

impl InstanceProgress {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            state: InstanceState::Pending,
            history: vec![InstanceState::Pending],
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn history(&self) -> &[InstanceState] {
        &self.history
    }

    /// Move to `to`, failing if the edge is not in the graph.
    pub fn advance(&mut self, to: InstanceState) -> Result<()> {
        if !InstanceState::is_valid_transition(self.state, to) {
            bail!(
                "invalid state transition: {} -> {} for instance {}",
                self.state,
                to,
                self.instance_id
            );
        }
        tracing::debug!(
            instance_id = %self.instance_id,
            from = %self.state,
            to = %to,
            "instance state transition"
        );
        self.state = to;
        self.history.push(to);
        Ok(())
    }
}
