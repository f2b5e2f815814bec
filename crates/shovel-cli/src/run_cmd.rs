//! `shovel run` command: process an instance file through the scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use shovel_core::agent::{ClaudeCodeConfig, ClaudeCodeDriver};
use shovel_core::checkpoint::{CheckpointStore, OutputSummary};
use shovel_core::instance::{Selection, load_instances, select};
use shovel_core::pipeline::PipelineConfig;
use shovel_core::scheduler::{SchedulerConfig, SchedulerResult, run_scheduler};
use shovel_core::validate::ValidatorConfig;
use shovel_core::workspace::{GitCloneConfig, GitCloneProvisioner};

use crate::config::{CliOverrides, RunSettings};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Instance file (.json or .jsonl)
    #[arg(long)]
    pub input: PathBuf,
    /// Output file for accepted environment specs
    #[arg(long, default_value = "docker_res.json")]
    pub output: PathBuf,
    /// Directory holding per-instance checkouts [default: ./repo]
    #[arg(long)]
    pub repo_dir: Option<PathBuf>,
    /// Clone URL template; `{repo}` is replaced by the instance's repo
    #[arg(long, default_value = GitCloneConfig::DEFAULT_REMOTE_TEMPLATE)]
    pub remote_template: String,
    /// Model passed to the agent [default: claude-sonnet-4-5-20250929]
    #[arg(long)]
    pub model: Option<String>,
    /// Maximum instances in flight [default: 4]
    #[arg(long)]
    pub max_workers: Option<usize>,
    /// Agent turn budget per instance [default: 100]
    #[arg(long)]
    pub max_turns: Option<u32>,
    /// Only process these instance ids
    #[arg(long, num_args = 1..)]
    pub instance_ids: Option<Vec<String>>,
    /// First instance to process (1-based, inclusive)
    #[arg(long)]
    pub start: Option<usize>,
    /// Last instance to process (1-based, inclusive)
    #[arg(long)]
    pub end: Option<usize>,
    /// Trajectory log directory [default: ./logs]
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    /// Do not write trajectory logs
    #[arg(long)]
    pub no_trajectory: bool,
    /// Keep existing results and skip instances already in the output
    #[arg(long)]
    pub resume: bool,
    /// Seconds of agent silence before the session is killed
    #[arg(long, default_value_t = 600)]
    pub turn_timeout: u64,
    /// Seconds allowed for each git step while provisioning
    #[arg(long, default_value_t = 300)]
    pub provision_timeout: u64,
    /// Extra agent attempts after a transient provider failure
    #[arg(long, default_value_t = 2)]
    pub provider_retries: u32,
    /// Path to the claude binary
    #[arg(long)]
    pub claude_bin: Option<String>,
    /// Leave checkouts on disk after each instance (default)
    #[arg(long, overrides_with = "remove_workspaces")]
    keep_workspaces: bool,
    /// Delete checkouts once each instance settles
    #[arg(long, overrides_with = "keep_workspaces")]
    remove_workspaces: bool,
    /// Reject eval scripts without the exit-code echo instead of repairing them
    #[arg(long)]
    pub strict_marker: bool,
}

impl RunArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            model: self.model.clone(),
            max_workers: self.max_workers,
            max_turns: self.max_turns,
            repo_dir: self.repo_dir.clone(),
            log_dir: self.log_dir.clone(),
            claude_bin: self.claude_bin.clone(),
        }
    }

    /// The later of `--keep-workspaces` / `--remove-workspaces` wins.
    pub fn keep_workspaces(&self) -> bool {
        self.keep_workspaces || !self.remove_workspaces
    }

    fn selection(&self) -> Selection {
        Selection {
            instance_ids: self.instance_ids.clone(),
            start: self.start,
            end: self.end,
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("cannot resolve {}", path.display()))
}

/// Run the command, returning the process exit code.
pub async fn run(args: RunArgs) -> Result<i32> {
    let settings = RunSettings::resolve(&args.overrides())?;

    let instances = load_instances(&args.input)
        .with_context(|| format!("failed to load instances from {}", args.input.display()))?;
    let loaded = instances.len();
    let instances = select(instances, &args.selection());

    let project_dir = std::env::current_dir().context("cannot determine working directory")?;
    let repo_dir = absolute(&settings.repo_dir)?;

    let mut git_config = GitCloneConfig::new(&repo_dir);
    git_config.remote_template = args.remote_template.clone();
    git_config.step_timeout = Duration::from_secs(args.provision_timeout);
    git_config.keep_workspaces = args.keep_workspaces();
    let provisioner = Arc::new(GitCloneProvisioner::new(git_config));

    let mut claude_config = ClaudeCodeConfig::new(&project_dir);
    claude_config.binary = settings.claude_bin.clone();
    claude_config.model = settings.model.clone();
    claude_config.turn_timeout = Duration::from_secs(args.turn_timeout);
    claude_config.provider_retries = args.provider_retries;
    claude_config.log_dir = if args.no_trajectory {
        None
    } else {
        Some(absolute(&settings.log_dir)?)
    };
    let driver = Arc::new(ClaudeCodeDriver::new(claude_config));

    let config = SchedulerConfig {
        max_workers: settings.max_workers,
        pipeline: PipelineConfig {
            max_turns: settings.max_turns,
            validator: ValidatorConfig {
                repair_missing_marker: !args.strict_marker,
            },
            ..Default::default()
        },
        ..Default::default()
    };

    let mut store = CheckpointStore::open(&args.output, args.resume)
        .with_context(|| format!("failed to open output {}", args.output.display()))?;

    println!("Processing {} of {} instances", instances.len(), loaded);
    println!("  Model: {}", settings.model);
    println!("  Max workers: {}", settings.max_workers);
    println!("  Max turns: {}", settings.max_turns);
    println!("  Workspaces: {}", repo_dir.display());
    println!("  Output: {}", args.output.display());
    if args.resume {
        println!("  Resuming with {} existing results", store.len());
    }

    // Set up graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let result = run_scheduler(instances, provisioner, driver, &mut store, &config, cancel).await?;

    let summary = result.summary();
    let totals = OutputSummary::from_results(store.results());
    println!();
    println!(
        "Processed {}: {} succeeded, {} failed ({} skipped as already done)",
        summary.recorded(),
        summary.succeeded,
        summary.failed,
        summary.skipped
    );
    println!("Results in {}: {}", args.output.display(), totals.total);
    println!("  with OMNIGRIL_EXIT_CODE: {}", totals.with_exit_marker);
    println!("  with setup_repo.sh: {}", totals.with_setup_repo);
    if summary.failed > 0 {
        println!("Failures logged to {}", store.failures_path().display());
    }

    Ok(match result {
        SchedulerResult::Interrupted(_) => {
            println!("\nRun interrupted. Re-run with --resume to continue.");
            130
        }
        SchedulerResult::Completed(s) if s.failed > 0 => 1,
        SchedulerResult::Completed(_) => 0,
    })
}
