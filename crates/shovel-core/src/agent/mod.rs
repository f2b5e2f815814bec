//! Agent driver: runs one bounded-turn coding-agent session per instance.
//!
//! The [`AgentDriver`] trait is the seam the pipeline talks to. The only
//! production implementation, [`ClaudeCodeDriver`], shells out to the
//! Claude Code CLI and parses its stream-json output.

pub mod claude_code;
pub mod output;
pub mod prompt;
pub mod trajectory;
pub mod types;

use async_trait::async_trait;

use crate::instance::Instance;
use crate::workspace::WorkspaceInfo;

pub use claude_code::{ClaudeCodeConfig, ClaudeCodeDriver};
pub use types::{
    AgentError, AgentEvent, AgentOutput, AgentSession, ProviderFailureKind, TerminationReason,
};

/// Runs an agent session inside a provisioned workspace.
///
/// Implementations own their retry policy for transient provider errors;
/// whatever they return is final for the instance.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Human-readable name (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Drive a session of at most `max_turns` turns and return the raw
    /// output object from its final message.
    async fn run(
        &self,
        instance: &Instance,
        workspace: &WorkspaceInfo,
        max_turns: u32,
    ) -> Result<AgentOutput, AgentError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn AgentDriver) {}
};
