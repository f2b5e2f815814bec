//! Orchestration engine for shovel.
//!
//! Turns a batch of repository bug-fix instances into Docker evaluation
//! environments by running a coding agent against an isolated checkout of
//! each repository and persisting the validated artifacts.
//!
//! ```text
//! instance::load_instances + instance::select
//!     |
//!     v
//! scheduler::run_scheduler ---- CheckpointStore (single writer)
//!     |
//!     +--> pipeline::run_instance_pipeline  (one per worker)
//!             Provisioner -> AgentDriver -> validate
//! ```

pub mod agent;
pub mod checkpoint;
pub mod instance;
pub mod pipeline;
pub mod scheduler;
pub mod state;
pub mod validate;
pub mod workspace;

/// Marker token the eval script must print so the downstream evaluation
/// framework can read the test exit status.
pub const EXIT_CODE_MARKER: &str = "OMNIGRIL_EXIT_CODE";

/// Name of the setup script every result must carry.
pub const SETUP_REPO_SCRIPT: &str = "setup_repo.sh";
