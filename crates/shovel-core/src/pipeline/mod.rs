//! Per-instance pipeline: provision, run the agent, validate.
//!
//! Runs inside one scheduler worker and always ends in exactly one of: a
//! [`RunRecord`] (success or classified failure) or `None` when the run was
//! cancelled mid-flight. The workspace is released on every path.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentDriver, AgentError, AgentOutput};
use crate::checkpoint::{FailureKind, RunRecord};
use crate::instance::Instance;
use crate::state::{InstanceProgress, InstanceState};
use crate::validate::{ValidationError, ValidatorConfig, validate};
use crate::workspace::{ProvisionError, Provisioner, WorkspaceInfo};

/// Settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_turns: u32,
    /// Wall-clock cap on the whole provisioning stage.
    pub provision_timeout: Option<Duration>,
    /// Wall-clock cap on the whole agent stage, retries included.
    pub session_timeout: Option<Duration>,
    pub validator: ValidatorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_turns: 100,
            provision_timeout: None,
            session_timeout: None,
            validator: ValidatorConfig::default(),
        }
    }
}

/// The pluggable stages a pipeline awaits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Provision,
    Agent,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Provision => "provisioning",
            Self::Agent => "agent session",
        })
    }
}

/// Any error that ends an instance.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("agent failed: {0}")]
    Agent(#[from] AgentError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{stage} timed out after {}s", .timeout.as_secs())]
    TimedOut { stage: Stage, timeout: Duration },

    #[error("{stage} panicked: {message}")]
    Panicked { stage: Stage, message: String },
}

impl From<&PipelineError> for FailureKind {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::Provision(_) => Self::Provision,
            PipelineError::Agent(AgentError::TurnLimitExceeded { .. }) => Self::TurnLimitExceeded,
            PipelineError::Agent(AgentError::ProviderFailure { .. }) => Self::ProviderFailure,
            PipelineError::Agent(AgentError::MalformedOutput(_)) => Self::MalformedOutput,
            PipelineError::Validation(_) => Self::Validation,
            PipelineError::TimedOut { stage, .. } | PipelineError::Panicked { stage, .. } => {
                match stage {
                    Stage::Provision => Self::Provision,
                    Stage::Agent => Self::ProviderFailure,
                }
            }
        }
    }
}

enum Guarded<T> {
    Done(T),
    Cancelled,
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Await `fut` under an optional deadline, giving up early on cancel.
///
/// A panic inside `fut` becomes [`PipelineError::Panicked`] for `stage`.
async fn guarded<T, E>(
    fut: impl Future<Output = Result<T, E>>,
    stage: Stage,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Guarded<T>, PipelineError>
where
    PipelineError: From<E>,
{
    let caught = AssertUnwindSafe(fut).catch_unwind();
    let bounded = async {
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, caught).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(PipelineError::TimedOut {
                        stage,
                        timeout: limit,
                    });
                }
            },
            None => caught.await,
        };
        match outcome {
            Ok(r) => r.map_err(PipelineError::from),
            Err(payload) => Err(PipelineError::Panicked {
                stage,
                message: panic_message(payload.as_ref()),
            }),
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(Guarded::Cancelled),
        r = bounded => r.map(Guarded::Done),
    }
}

fn advance(progress: &mut InstanceProgress, to: InstanceState) {
    if let Err(e) = progress.advance(to) {
        tracing::error!(error = %e, "instance state machine rejected transition");
    }
}

async fn release(provisioner: &dyn Provisioner, workspace: &WorkspaceInfo) {
    if let Err(e) = provisioner.release(workspace).await {
        tracing::warn!(
            instance_id = %workspace.instance_id,
            error = %e,
            "failed to release workspace"
        );
    }
}

/// Run one instance end to end.
///
/// Returns `None` if `cancel` fired before the instance reached a terminal
/// state; nothing about that instance should be recorded.
pub async fn run_instance_pipeline(
    instance: &Instance,
    provisioner: &dyn Provisioner,
    driver: &dyn AgentDriver,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Option<RunRecord> {
    let instance_id = instance.instance_id.as_str();
    let started = Instant::now();
    let mut progress = InstanceProgress::new(instance_id);

    if cancel.is_cancelled() {
        return None;
    }

    advance(&mut progress, InstanceState::Provisioning);
    let workspace = match guarded(
        provisioner.provision(instance),
        Stage::Provision,
        config.provision_timeout,
        cancel,
    )
    .await
    {
        Ok(Guarded::Done(ws)) => ws,
        Ok(Guarded::Cancelled) => return None,
        Err(e) => return Some(fail(&mut progress, instance_id, &e, None, started)),
    };
    tracing::info!(
        instance_id,
        backend = provisioner.name(),
        path = %workspace.path.display(),
        "workspace ready"
    );

    advance(&mut progress, InstanceState::Running);
    let agent = guarded(
        driver.run(instance, &workspace, config.max_turns),
        Stage::Agent,
        config.session_timeout,
        cancel,
    )
    .await;

    let record = match agent {
        Ok(Guarded::Cancelled) => None,
        Err(e) => {
            let turns = match &e {
                PipelineError::Agent(AgentError::TurnLimitExceeded { turns, .. }) => Some(*turns),
                _ => None,
            };
            Some(fail(&mut progress, instance_id, &e, turns, started))
        }
        Ok(Guarded::Done(AgentOutput { raw, turns, .. })) => {
            advance(&mut progress, InstanceState::Validating);
            match validate(instance_id, &raw, &config.validator) {
                Ok(artifacts) => {
                    advance(&mut progress, InstanceState::Succeeded);
                    tracing::info!(
                        instance_id,
                        turns,
                        elapsed_secs = started.elapsed().as_secs(),
                        "instance succeeded"
                    );
                    Some(RunRecord::succeeded(artifacts, Some(turns)))
                }
                Err(e) => Some(fail(
                    &mut progress,
                    instance_id,
                    &PipelineError::from(e),
                    Some(turns),
                    started,
                )),
            }
        }
    };

    release(provisioner, &workspace).await;
    record
}

fn fail(
    progress: &mut InstanceProgress,
    instance_id: &str,
    err: &PipelineError,
    turns: Option<u32>,
    started: Instant,
) -> RunRecord {
    advance(progress, InstanceState::Failed);
    let kind = FailureKind::from(err);
    tracing::warn!(
        instance_id,
        kind = %kind,
        error = %err,
        elapsed_secs = started.elapsed().as_secs(),
        "instance failed"
    );
    RunRecord::failed(instance_id, kind, err.to_string(), turns)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::checkpoint::Outcome;

    #[derive(Default)]
    struct FakeProvisioner {
        fail: Option<fn() -> ProvisionError>,
        released: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        fn name(&self) -> &str {
            "fake"
        }

        async fn provision(&self, instance: &Instance) -> Result<WorkspaceInfo, ProvisionError> {
            if let Some(make) = self.fail {
                return Err(make());
            }
            Ok(WorkspaceInfo {
                instance_id: instance.instance_id.clone(),
                path: PathBuf::from("/nonexistent"),
            })
        }

        async fn release(&self, info: &WorkspaceInfo) -> Result<(), ProvisionError> {
            self.released.lock().unwrap().push(info.instance_id.clone());
            Ok(())
        }
    }

    enum Script {
        Output(serde_json::Value),
        Error(AgentError),
        Hang,
        Panic,
    }

    struct FakeDriver(Script);

    #[async_trait]
    impl AgentDriver for FakeDriver {
        fn name(&self) -> &str {
            "fake"
        }

        async fn run(
            &self,
            _instance: &Instance,
            _workspace: &WorkspaceInfo,
            _max_turns: u32,
        ) -> Result<AgentOutput, AgentError> {
            match &self.0 {
                Script::Output(raw) => Ok(AgentOutput {
                    raw: raw.clone(),
                    turns: 4,
                    cost_usd: None,
                }),
                Script::Error(e) => Err(e.clone()),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
                Script::Panic => panic!("driver blew up"),
            }
        }
    }

    fn instance() -> Instance {
        Instance {
            instance_id: "i-1".into(),
            repo: "o/r".into(),
            base_commit: "abc".into(),
            problem_statement: String::new(),
            test_patch: String::new(),
            patch: String::new(),
        }
    }

    fn good_output() -> serde_json::Value {
        json!({
            "dockerfile": "FROM x",
            "eval_script": "pytest",
            "setup_scripts": {"setup_repo.sh": "clone"},
        })
    }

    async fn run(p: &FakeProvisioner, d: &FakeDriver, config: &PipelineConfig) -> Option<RunRecord> {
        run_instance_pipeline(&instance(), p, d, config, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn success_yields_repaired_artifacts_and_releases() {
        let p = FakeProvisioner::default();
        let d = FakeDriver(Script::Output(good_output()));
        let record = run(&p, &d, &PipelineConfig::default()).await.unwrap();

        assert_eq!(record.turns, Some(4));
        let Outcome::Succeeded { artifacts } = &record.outcome else {
            panic!("expected success, got {record:?}");
        };
        assert!(artifacts.eval_script.contains("OMNIGRIL_EXIT_CODE"));
        assert_eq!(*p.released.lock().unwrap(), vec!["i-1".to_string()]);
    }

    #[tokio::test]
    async fn failures_are_classified() {
        let cases: Vec<(FakeProvisioner, Script, FailureKind)> = vec![
            (
                FakeProvisioner {
                    fail: Some(|| ProvisionError::MissingRevision {
                        repo: "o/r".into(),
                        revision: "abc".into(),
                    }),
                    ..Default::default()
                },
                Script::Output(good_output()),
                FailureKind::Provision,
            ),
            (
                FakeProvisioner {
                    fail: Some(|| ProvisionError::Timeout {
                        step: "clone".into(),
                        timeout: Duration::from_secs(1),
                    }),
                    ..Default::default()
                },
                Script::Output(good_output()),
                FailureKind::Provision,
            ),
            (
                FakeProvisioner::default(),
                Script::Error(AgentError::TurnLimitExceeded {
                    max_turns: 3,
                    turns: 3,
                }),
                FailureKind::TurnLimitExceeded,
            ),
            (
                FakeProvisioner::default(),
                Script::Error(AgentError::transient("overloaded")),
                FailureKind::ProviderFailure,
            ),
            (
                FakeProvisioner::default(),
                Script::Error(AgentError::MalformedOutput("no json".into())),
                FailureKind::MalformedOutput,
            ),
            (
                FakeProvisioner::default(),
                Script::Output(json!({"dockerfile": "FROM x"})),
                FailureKind::Validation,
            ),
        ];

        for (p, script, want) in cases {
            let record = run(&p, &FakeDriver(script), &PipelineConfig::default())
                .await
                .unwrap();
            assert_eq!(record.failure_kind(), Some(want), "{record:?}");
        }
    }

    #[tokio::test]
    async fn turn_limit_records_turns() {
        let p = FakeProvisioner::default();
        let d = FakeDriver(Script::Error(AgentError::TurnLimitExceeded {
            max_turns: 3,
            turns: 3,
        }));
        let record = run(&p, &d, &PipelineConfig::default()).await.unwrap();
        assert_eq!(record.turns, Some(3));
        assert_eq!(p.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_timeout_is_a_provider_failure() {
        let p = FakeProvisioner::default();
        let d = FakeDriver(Script::Hang);
        let config = PipelineConfig {
            session_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let record = run(&p, &d, &config).await.unwrap();
        assert_eq!(record.failure_kind(), Some(FailureKind::ProviderFailure));
        let Outcome::Failed { message, .. } = &record.outcome else {
            panic!("expected failure");
        };
        assert!(message.contains("timed out"), "{message}");
        assert_eq!(p.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn provision_stage_timeout_is_a_provision_failure() {
        struct SlowProvisioner;

        #[async_trait]
        impl Provisioner for SlowProvisioner {
            fn name(&self) -> &str {
                "slow"
            }

            async fn provision(&self, _instance: &Instance) -> Result<WorkspaceInfo, ProvisionError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }

            async fn release(&self, _info: &WorkspaceInfo) -> Result<(), ProvisionError> {
                Ok(())
            }
        }

        let config = PipelineConfig {
            provision_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let d = FakeDriver(Script::Output(good_output()));
        let record =
            run_instance_pipeline(&instance(), &SlowProvisioner, &d, &config, &CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(record.failure_kind(), Some(FailureKind::Provision));
    }

    #[tokio::test]
    async fn driver_panic_is_a_provider_failure_and_releases() {
        let p = FakeProvisioner::default();
        let d = FakeDriver(Script::Panic);
        let record = run(&p, &d, &PipelineConfig::default()).await.unwrap();
        assert_eq!(record.failure_kind(), Some(FailureKind::ProviderFailure));
        let Outcome::Failed { message, .. } = &record.outcome else {
            panic!("expected failure");
        };
        assert!(message.contains("driver blew up"), "{message}");
        assert_eq!(*p.released.lock().unwrap(), vec!["i-1".to_string()]);
    }

    #[tokio::test]
    async fn cancellation_abandons_and_still_releases() {
        let p = FakeProvisioner::default();
        let d = FakeDriver(Script::Hang);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let record =
            run_instance_pipeline(&instance(), &p, &d, &PipelineConfig::default(), &cancel).await;
        assert!(record.is_none());
        assert_eq!(p.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn already_cancelled_does_nothing() {
        let p = FakeProvisioner::default();
        let d = FakeDriver(Script::Output(good_output()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(
            run_instance_pipeline(&instance(), &p, &d, &PipelineConfig::default(), &cancel)
                .await
                .is_none()
        );
        assert!(p.released.lock().unwrap().is_empty());
    }
}
