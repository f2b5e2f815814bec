//! Bounded-concurrency scheduler: fans instances out to pipeline workers and
//! funnels their records into the checkpoint store.
//!
//! Workers never touch the store. Each one sends an [`InstanceDone`] back
//! over an mpsc channel and the scheduler loop appends it before reading the
//! next message, which makes the loop the store's only writer.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentDriver;
use crate::checkpoint::{CheckpointStore, FailureKind, RunRecord};
use crate::instance::{Instance, check_unique};
use crate::pipeline::{PipelineConfig, panic_message, run_instance_pipeline};
use crate::workspace::Provisioner;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on instances past `pending` and not yet terminal.
    pub max_workers: usize,
    /// How long to wait for in-flight workers after a cancel.
    pub drain_timeout: Duration,
    pub pipeline: PipelineConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            drain_timeout: Duration::from_secs(10),
            pipeline: PipelineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Already settled in the store before this run.
    pub skipped: usize,
}

impl RunSummary {
    pub fn recorded(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerResult {
    Completed(RunSummary),
    Interrupted(RunSummary),
}

impl SchedulerResult {
    pub fn summary(&self) -> &RunSummary {
        match self {
            Self::Completed(s) | Self::Interrupted(s) => s,
        }
    }
}

/// Message sent from a worker back to the scheduler loop.
struct InstanceDone {
    instance_id: String,
    /// `None` when the worker abandoned the instance on cancel.
    record: Option<RunRecord>,
}

fn handle_done(
    store: &mut CheckpointStore,
    summary: &mut RunSummary,
    total: usize,
    done: InstanceDone,
) -> Result<()> {
    let Some(record) = done.record else {
        tracing::debug!(instance_id = %done.instance_id, "instance abandoned after cancel");
        return Ok(());
    };
    store
        .append(&record)
        .with_context(|| format!("failed to record result for {}", record.instance_id))?;

    if record.is_success() {
        summary.succeeded += 1;
    } else {
        summary.failed += 1;
    }
    tracing::info!(
        instance_id = %record.instance_id,
        success = record.is_success(),
        done = summary.recorded(),
        total,
        "[{}/{}] {} {}",
        summary.recorded(),
        total,
        record.instance_id,
        match record.failure_kind() {
            None => "succeeded".to_string(),
            Some(kind) => format!("failed ({kind})"),
        }
    );
    Ok(())
}

/// Process `instances` with at most `config.max_workers` in flight.
///
/// Instances already settled in `store` are skipped. Per-instance failures
/// become records; only store errors and duplicate input ids are fatal.
pub async fn run_scheduler(
    instances: Vec<Instance>,
    provisioner: Arc<dyn Provisioner>,
    driver: Arc<dyn AgentDriver>,
    store: &mut CheckpointStore,
    config: &SchedulerConfig,
    cancel: CancellationToken,
) -> Result<SchedulerResult> {
    check_unique(&instances).context("refusing to schedule instance set")?;
    if config.max_workers == 0 {
        bail!("max_workers must be at least 1");
    }

    let mut summary = RunSummary::default();
    let pending: Vec<Instance> = instances
        .into_iter()
        .filter(|inst| {
            let settled = store.is_settled(&inst.instance_id);
            if settled {
                summary.skipped += 1;
                tracing::debug!(instance_id = %inst.instance_id, "already settled, skipping");
            }
            !settled
        })
        .collect();
    let total = pending.len();

    tracing::info!(
        to_process = total,
        skipped = summary.skipped,
        max_workers = config.max_workers,
        driver = driver.name(),
        provisioner = provisioner.name(),
        "starting scheduler"
    );

    let semaphore = Arc::new(Semaphore::new(config.max_workers));
    let (tx, mut rx) = mpsc::channel::<InstanceDone>(config.max_workers * 2);
    let mut in_flight: usize = 0;
    let mut queue = pending.into_iter();
    let mut next = queue.next();

    loop {
        if cancel.is_cancelled() {
            tracing::info!(in_flight, "scheduler cancelled, draining in-flight instances");
            let drain_deadline = tokio::time::Instant::now() + config.drain_timeout;
            while in_flight > 0 {
                match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                    Ok(Some(done)) => {
                        in_flight -= 1;
                        handle_done(store, &mut summary, total, done)?;
                    }
                    _ => break,
                }
            }
            if in_flight > 0 {
                tracing::warn!(
                    remaining = in_flight,
                    "drain timeout expired, {} instances still in flight",
                    in_flight
                );
            }
            return Ok(SchedulerResult::Interrupted(summary));
        }

        // Record whatever has already finished before dispatching more.
        while let Ok(done) = rx.try_recv() {
            in_flight -= 1;
            handle_done(store, &mut summary, total, done)?;
        }

        let Some(instance) = next.take() else {
            if in_flight == 0 {
                break;
            }
            tokio::select! {
                done = rx.recv() => {
                    let done = done.context("worker channel closed unexpectedly")?;
                    in_flight -= 1;
                    handle_done(store, &mut summary, total, done)?;
                }
                _ = cancel.cancelled() => {}
            }
            continue;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                next = Some(instance);
            }
            done = rx.recv(), if in_flight > 0 => {
                next = Some(instance);
                let done = done.context("worker channel closed unexpectedly")?;
                in_flight -= 1;
                handle_done(store, &mut summary, total, done)?;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => {
                let permit = permit.context("worker semaphore closed")?;
                in_flight += 1;
                summary.dispatched += 1;

                let provisioner = Arc::clone(&provisioner);
                let driver = Arc::clone(&driver);
                let pipeline_config = config.pipeline.clone();
                let cancel = cancel.clone();
                let tx = tx.clone();

                tracing::debug!(instance_id = %instance.instance_id, in_flight, "dispatching instance");
                tokio::spawn(async move {
                    let record = AssertUnwindSafe(run_instance_pipeline(
                        &instance,
                        provisioner.as_ref(),
                        driver.as_ref(),
                        &pipeline_config,
                        &cancel,
                    ))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        // Every dispatched instance must report back or the loop never ends.
                        let message = panic_message(payload.as_ref());
                        tracing::error!(instance_id = %instance.instance_id, %message, "worker panicked");
                        Some(RunRecord::failed(
                            instance.instance_id.as_str(),
                            FailureKind::ProviderFailure,
                            format!("worker panicked: {message}"),
                            None,
                        ))
                    });

                    drop(permit);

                    let _ = tx
                        .send(InstanceDone {
                            instance_id: instance.instance_id,
                            record,
                        })
                        .await;
                });

                next = queue.next();
            }
        }
    }

    tracing::info!(
        dispatched = summary.dispatched,
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        "scheduler finished"
    );
    Ok(SchedulerResult::Completed(summary))
}
