//! Scheduler behaviour against stub collaborators: record accounting,
//! resume, concurrency bounds, durability, failure isolation, cancellation.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use shovel_core::agent::{AgentDriver, AgentError, AgentOutput};
use shovel_core::checkpoint::{CheckpointStore, FailureKind, failures_path_for, load_failures, load_results};
use shovel_core::instance::{Instance, Selection, select};
use shovel_core::workspace::WorkspaceInfo;
use shovel_core::scheduler::{RunSummary, SchedulerConfig, SchedulerResult, run_scheduler};
use shovel_core::validate::has_exit_marker;
use shovel_test_utils::{ScriptedDriver, StubBehavior, StubProvisioner, instance, instances};

// ===========================================================================
// Helpers
// ===========================================================================

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_workers: workers,
        drain_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn run(
    output: &Path,
    resume: bool,
    set: Vec<Instance>,
    provisioner: Arc<StubProvisioner>,
    driver: Arc<ScriptedDriver>,
    workers: usize,
) -> SchedulerResult {
    let mut store = CheckpointStore::open(output, resume).unwrap();
    run_scheduler(
        set,
        provisioner,
        driver,
        &mut store,
        &config(workers),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

fn completed(result: SchedulerResult) -> RunSummary {
    match result {
        SchedulerResult::Completed(s) => s,
        other => panic!("expected completed run, got {other:?}"),
    }
}

// ===========================================================================
// Accounting
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_dispatched_instance_gets_one_record() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("docker_res.json");
    let driver = ScriptedDriver::new()
        .with("inst-002", StubBehavior::Fail(AgentError::fatal("bad key")))
        .with("inst-005", StubBehavior::Incomplete)
        .with(
            "inst-007",
            StubBehavior::Fail(AgentError::TurnLimitExceeded {
                max_turns: 3,
                turns: 4,
            }),
        );

    let summary = completed(
        run(
            &out,
            false,
            instances(10),
            Arc::new(StubProvisioner::new().failing_for("inst-009")),
            Arc::new(driver),
            3,
        )
        .await,
    );

    assert_eq!(summary.dispatched, 10);
    assert_eq!(summary.recorded(), summary.dispatched);
    assert_eq!(summary.succeeded, 6);
    assert_eq!(summary.failed, 4);

    let results = load_results(&out).unwrap();
    let failures = load_failures(&failures_path_for(&out)).unwrap();
    assert_eq!(results.len() + failures.len(), 10);

    let kind_of = |id: &str| {
        failures
            .iter()
            .find(|r| r.instance_id == id)
            .and_then(|r| r.failure_kind())
    };
    assert_eq!(kind_of("inst-002"), Some(FailureKind::ProviderFailure));
    assert_eq!(kind_of("inst-005"), Some(FailureKind::Validation));
    assert_eq!(kind_of("inst-007"), Some(FailureKind::TurnLimitExceeded));
    assert_eq!(kind_of("inst-009"), Some(FailureKind::Provision));

    for (id, value) in &results {
        assert_eq!(value["instance_id"].as_str(), Some(id.as_str()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_workers_are_recorded_and_the_run_finishes() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.json");
    let driver = ScriptedDriver::new().with("inst-001", StubBehavior::Panic);
    let provisioner = StubProvisioner::new().panicking_on_release_for("inst-003");

    let finished = tokio::time::timeout(
        Duration::from_secs(10),
        run(&out, false, instances(4), Arc::new(provisioner), Arc::new(driver), 2),
    )
    .await
    .expect("scheduler must not hang on a panicking worker");
    let summary = completed(finished);

    assert_eq!(summary.dispatched, 4);
    assert_eq!(summary.recorded(), 4);
    assert_eq!(summary.failed, 2);

    let failures = load_failures(&failures_path_for(&out)).unwrap();
    let mut failed: Vec<_> = failures
        .iter()
        .map(|r| (r.instance_id.as_str(), r.failure_kind()))
        .collect();
    failed.sort_by(|a, b| a.0.cmp(b.0));
    assert_eq!(
        failed,
        vec![
            ("inst-001", Some(FailureKind::ProviderFailure)),
            ("inst-003", Some(FailureKind::ProviderFailure)),
        ]
    );
    let results = load_results(&out).unwrap();
    assert!(results.contains_key("inst-002"));
    assert!(results.contains_key("inst-004"));
}

#[tokio::test]
async fn failures_do_not_affect_siblings() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.json");
    let driver = ScriptedDriver::new().with("inst-001", StubBehavior::Fail(AgentError::transient("503")));

    let summary = completed(
        run(
            &out,
            false,
            instances(4),
            Arc::new(StubProvisioner::new()),
            Arc::new(driver),
            1,
        )
        .await,
    );
    assert_eq!(summary.succeeded, 3);
    let results = load_results(&out).unwrap();
    assert!(!results.contains_key("inst-001"));
    for id in ["inst-002", "inst-003", "inst-004"] {
        assert!(results.contains_key(id), "{id} missing");
    }
}

#[tokio::test]
async fn empty_input_completes_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let summary = completed(
        run(
            &tmp.path().join("out.json"),
            false,
            Vec::new(),
            Arc::new(StubProvisioner::new()),
            Arc::new(ScriptedDriver::new()),
            4,
        )
        .await,
    );
    assert_eq!(summary, RunSummary::default());
}

#[tokio::test]
async fn duplicate_ids_are_fatal_before_dispatch() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = CheckpointStore::open(&tmp.path().join("out.json"), false).unwrap();
    let driver = Arc::new(ScriptedDriver::new());
    let err = run_scheduler(
        vec![instance("a"), instance("b"), instance("a")],
        Arc::new(StubProvisioner::new()),
        driver.clone(),
        &mut store,
        &config(2),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("duplicate instance_id"));
    assert_eq!(driver.total_calls(), 0);
    assert!(store.is_empty());
}

// ===========================================================================
// Resume
// ===========================================================================

#[tokio::test]
async fn resume_skips_settled_and_retries_failures() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.json");

    let first = Arc::new(
        ScriptedDriver::new().with("inst-003", StubBehavior::Fail(AgentError::transient("429"))),
    );
    completed(
        run(&out, false, instances(5), Arc::new(StubProvisioner::new()), first, 2).await,
    );
    let after_first = load_results(&out).unwrap();
    assert_eq!(after_first.len(), 4);

    let second = Arc::new(ScriptedDriver::new());
    let summary = completed(
        run(
            &out,
            true,
            instances(5),
            Arc::new(StubProvisioner::new()),
            second.clone(),
            2,
        )
        .await,
    );
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(second.calls("inst-003"), 1);
    assert_eq!(second.total_calls(), 1);

    let after_second = load_results(&out).unwrap();
    assert_eq!(after_second.len(), 5);
    for (id, value) in &after_first {
        assert_eq!(&after_second[id], value, "{id} changed on resume");
    }
}

#[tokio::test]
async fn resume_of_finished_run_is_a_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.json");
    completed(
        run(
            &out,
            false,
            instances(3),
            Arc::new(StubProvisioner::new()),
            Arc::new(ScriptedDriver::new()),
            2,
        )
        .await,
    );
    let before = std::fs::read(&out).unwrap();

    let driver = Arc::new(ScriptedDriver::new());
    let summary = completed(
        run(
            &out,
            true,
            instances(3),
            Arc::new(StubProvisioner::new()),
            driver.clone(),
            2,
        )
        .await,
    );
    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(driver.total_calls(), 0);
    assert_eq!(std::fs::read(&out).unwrap(), before);
}

// ===========================================================================
// Concurrency
// ===========================================================================

fn sorted(map: Map<String, Value>) -> Vec<(String, Value)> {
    let mut v: Vec<_> = map.into_iter().collect();
    v.sort_by(|a, b| a.0.cmp(&b.0));
    v
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_worker_and_eight_workers_agree() {
    let tmp = tempfile::tempdir().unwrap();
    let make_driver = || {
        ScriptedDriver::new()
            .with("inst-004", StubBehavior::Incomplete)
            .with("inst-011", StubBehavior::SucceedWithoutMarker)
            .with_delay(Duration::from_millis(5))
    };

    let serial = tmp.path().join("w1.json");
    let parallel = tmp.path().join("w8.json");
    completed(
        run(&serial, false, instances(16), Arc::new(StubProvisioner::new()), Arc::new(make_driver()), 1)
            .await,
    );
    completed(
        run(&parallel, false, instances(16), Arc::new(StubProvisioner::new()), Arc::new(make_driver()), 8)
            .await,
    );

    assert_eq!(
        sorted(load_results(&serial).unwrap()),
        sorted(load_results(&parallel).unwrap())
    );

    let failed_ids = |p: &Path| {
        let mut ids: Vec<_> = load_failures(&failures_path_for(p))
            .unwrap()
            .into_iter()
            .map(|r| (r.instance_id.clone(), r.failure_kind()))
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        ids
    };
    assert_eq!(failed_ids(&serial), failed_ids(&parallel));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_never_exceeds_max_workers() {
    let tmp = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(StubProvisioner::new());
    let driver = Arc::new(ScriptedDriver::new().with_delay(Duration::from_millis(20)));

    completed(
        run(
            &tmp.path().join("out.json"),
            false,
            instances(24),
            provisioner.clone(),
            driver,
            3,
        )
        .await,
    );
    assert!(provisioner.probe.peak() <= 3, "peak {}", provisioner.probe.peak());
    assert!(provisioner.probe.peak() >= 2, "workers never overlapped");
    assert_eq!(provisioner.probe.current(), 0, "every workspace released");
}

// ===========================================================================
// Output invariants
// ===========================================================================

#[tokio::test]
async fn every_accepted_result_carries_the_exit_marker() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.json");
    let driver = ScriptedDriver::new()
        .with("inst-001", StubBehavior::SucceedWithoutMarker)
        .with("inst-002", StubBehavior::SucceedWithoutMarker);

    completed(
        run(&out, false, instances(4), Arc::new(StubProvisioner::new()), Arc::new(driver), 2).await,
    );
    let results = load_results(&out).unwrap();
    assert_eq!(results.len(), 4);
    for (id, value) in &results {
        let script = value["eval_script"].as_str().unwrap();
        assert!(has_exit_marker(script), "{id}: {script}");
        assert!(value["setup_scripts"]["setup_repo.sh"].is_string(), "{id}");
    }
}

#[tokio::test]
async fn selection_limits_what_is_processed() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.json");
    let selection = Selection {
        instance_ids: Some(vec!["inst-002".into(), "inst-004".into(), "inst-006".into()]),
        start: Some(2),
        end: Some(3),
    };
    let chosen = select(instances(8), &selection);

    let driver = Arc::new(ScriptedDriver::new());
    completed(
        run(&out, false, chosen, Arc::new(StubProvisioner::new()), driver.clone(), 2).await,
    );
    let mut keys: Vec<_> = load_results(&out).unwrap().keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, vec!["inst-004", "inst-006"]);
    assert_eq!(driver.calls("inst-002"), 0);
}

// ===========================================================================
// Durability
// ===========================================================================

#[tokio::test]
async fn store_reopened_mid_run_holds_exactly_the_appended_results() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.json");

    const K: usize = 5;
    completed(
        run(
            &out,
            false,
            instances(K),
            Arc::new(StubProvisioner::new()),
            Arc::new(ScriptedDriver::new()),
            3,
        )
        .await,
    );

    let reopened = CheckpointStore::open(&out, true).unwrap();
    assert_eq!(reopened.len(), K);

    // No temp files left behind next to the output.
    let stray: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n != "out.json" && n != "out.json.failures.jsonl")
        .collect();
    assert!(stray.is_empty(), "unexpected files: {stray:?}");
}

/// Succeeds for the first `stop_after` calls, then cancels the run and
/// hangs, like a process killed right after its last checkpoint.
struct StopAfter {
    inner: ScriptedDriver,
    stop_after: usize,
    seen: AtomicUsize,
    cancel: CancellationToken,
}

#[async_trait]
impl AgentDriver for StopAfter {
    fn name(&self) -> &str {
        "stop-after"
    }

    async fn run(
        &self,
        instance: &Instance,
        workspace: &WorkspaceInfo,
        max_turns: u32,
    ) -> Result<AgentOutput, AgentError> {
        if self.seen.fetch_add(1, Ordering::SeqCst) >= self.stop_after {
            self.cancel.cancel();
            std::future::pending::<()>().await;
        }
        self.inner.run(instance, workspace, max_turns).await
    }
}

#[tokio::test]
async fn interrupted_run_keeps_prefix_and_resume_finishes_the_rest() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.json");
    const N: usize = 8;
    const K: usize = 3;

    let cancel = CancellationToken::new();
    let stopper = Arc::new(StopAfter {
        inner: ScriptedDriver::new(),
        stop_after: K,
        seen: AtomicUsize::new(0),
        cancel: cancel.clone(),
    });
    let mut store = CheckpointStore::open(&out, false).unwrap();
    let result = run_scheduler(
        instances(N),
        Arc::new(StubProvisioner::new()),
        stopper,
        &mut store,
        &config(1),
        cancel,
    )
    .await
    .unwrap();
    drop(store);
    let SchedulerResult::Interrupted(first) = result else {
        panic!("expected interrupted run, got {result:?}");
    };
    assert_eq!(first.succeeded, K);

    // Read back from disk as a fresh process would.
    let prefix = load_results(&out).unwrap();
    let mut keys: Vec<_> = prefix.keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, vec!["inst-001", "inst-002", "inst-003"]);
    assert!(load_failures(&failures_path_for(&out)).unwrap().is_empty());

    let driver = Arc::new(ScriptedDriver::new());
    let second = completed(
        run(&out, true, instances(N), Arc::new(StubProvisioner::new()), driver.clone(), 3).await,
    );
    assert_eq!(second.skipped, K);
    assert_eq!(second.dispatched, N - K);
    assert_eq!(second.succeeded, N - K);
    for i in 1..=N {
        let id = format!("inst-{i:03}");
        let expected = if i <= K { 0 } else { 1 };
        assert_eq!(driver.calls(&id), expected, "{id}");
    }

    let all = load_results(&out).unwrap();
    assert_eq!(all.len(), N);
    for (id, value) in &prefix {
        assert_eq!(&all[id], value, "{id} changed on resume");
    }
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_interrupts_without_recording_abandoned_work() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.json");
    let mut set = instances(2);
    set.extend((1..=4).map(|i| instance(&format!("slow-{i}"))));

    let mut driver = ScriptedDriver::new();
    for i in 1..=4 {
        driver = driver.with(&format!("slow-{i}"), StubBehavior::Hang);
    }
    let driver = Arc::new(driver);
    let provisioner = Arc::new(StubProvisioner::new());

    let mut store = CheckpointStore::open(&out, false).unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let result = run_scheduler(
        set,
        provisioner.clone(),
        driver.clone(),
        &mut store,
        &config(2),
        cancel,
    )
    .await
    .unwrap();

    let SchedulerResult::Interrupted(summary) = result else {
        panic!("expected interrupted run, got {result:?}");
    };
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    // Two hung instances held both slots; the rest were never dispatched.
    assert_eq!(summary.dispatched, 4);
    assert_eq!(driver.calls("slow-3"), 0);

    let results = load_results(&out).unwrap();
    assert_eq!(results.len(), 2);
    assert!(load_failures(&failures_path_for(&out)).unwrap().is_empty());
    assert_eq!(provisioner.probe.current(), 0);
}

#[tokio::test]
async fn strict_marker_mode_rejects_unmarked_scripts() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out.json");
    let mut cfg = config(2);
    cfg.pipeline.validator.repair_missing_marker = false;

    let mut store = CheckpointStore::open(&out, false).unwrap();
    let result = run_scheduler(
        instances(3),
        Arc::new(StubProvisioner::new()),
        Arc::new(ScriptedDriver::new().with("inst-002", StubBehavior::SucceedWithoutMarker)),
        &mut store,
        &cfg,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let summary = completed(result);
    assert_eq!((summary.succeeded, summary.failed), (2, 1));
    let failures = load_failures(&failures_path_for(&out)).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].instance_id, "inst-002");
    assert_eq!(failures[0].failure_kind(), Some(FailureKind::Validation));
}
