use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use nodeward_core::automation::{AutomationRun, RunId};
use nodeward_core::clock::{Clock, Deadline};
use nodeward_core::naming::StorePaths;
use nodeward_core::poll::{Attempt, PollError, Poller};
use nodeward_store::{CoordinationStore, PutOptions};

use crate::error::BootError;
use crate::signal::{BootSignalReporter, BootVerdict};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AutomationError {
    #[error("automation definition {0:?} not found")]
    DefinitionNotFound(String),
    #[error("automation service unreachable: {0}")]
    Unreachable(String),
    #[error("automation error: {0}")]
    Backend(String),
}

/// Remote multi-step runner. Owns run status; callers only observe it.
#[async_trait]
pub trait AutomationRunner: Send + Sync {
    async fn start(
        &self,
        name: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<RunId, AutomationError>;

    async fn get_status(&self, run_id: &RunId) -> Result<AutomationRun, AutomationError>;
}

/// Self-contained bootstrap used when the remote runner is unavailable.
#[async_trait]
pub trait LocalBootstrap: Send + Sync {
    async fn run_local(&self) -> Result<(), BootError>;
}

/// Executor phases. Each transition happens in [`AutomationExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Start,
    Started(RunId),
    Polling(RunId),
    Terminal(AutomationRun),
    Fallback(String),
}

/// Drives one remote automation run from start to a boot verdict.
///
/// There is no executor-side timeout besides the boot deadline: the runner
/// decides when a run has taken too long and reports `TimedOut`.
pub struct AutomationExecutor<'a> {
    runner: &'a dyn AutomationRunner,
    store: &'a dyn CoordinationStore,
    paths: &'a StorePaths,
    clock: &'a dyn Clock,
    interval: Duration,
    deadline: Deadline,
}

impl<'a> AutomationExecutor<'a> {
    pub fn new(
        runner: &'a dyn AutomationRunner,
        store: &'a dyn CoordinationStore,
        paths: &'a StorePaths,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            runner,
            store,
            paths,
            clock,
            interval: DEFAULT_POLL_INTERVAL,
            deadline: Deadline::none(),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run `document` (or the local fallback) to a verdict.
    pub async fn execute(
        &self,
        document: &str,
        parameters: &BTreeMap<String, String>,
        fallback: &dyn LocalBootstrap,
    ) -> BootVerdict {
        let mut phase = Phase::Start;
        loop {
            phase = match phase {
                Phase::Start => match self.runner.start(document, parameters).await {
                    Ok(run_id) => Phase::Started(run_id),
                    Err(
                        e @ (AutomationError::DefinitionNotFound(_)
                        | AutomationError::Unreachable(_)),
                    ) => Phase::Fallback(e.to_string()),
                    Err(e) => return BootVerdict::failure(e.to_string()),
                },
                Phase::Started(run_id) => {
                    info!(run_id = %run_id, document, "Automation run started");
                    self.persist_run_id(&run_id).await;
                    Phase::Polling(run_id)
                }
                Phase::Polling(run_id) => match self.poll(&run_id).await {
                    Ok(run) => Phase::Terminal(run),
                    Err(e) => return BootVerdict::failure(e.to_string()),
                },
                Phase::Terminal(run) => {
                    return if run.status.is_success() {
                        info!(run_id = %run.run_id, "Automation run succeeded");
                        BootVerdict::success()
                    } else {
                        for failure in &run.step_failures {
                            warn!(
                                run_id = %run.run_id,
                                step = %failure.step_name,
                                message = %failure.message,
                                "Automation step failed"
                            );
                        }
                        BootVerdict::failure(run.failure_reason())
                    };
                }
                Phase::Fallback(why) => {
                    warn!(reason = %why, "Automation unavailable, running local bootstrap");
                    return match fallback.run_local().await {
                        Ok(()) => BootVerdict::success(),
                        Err(e) => BootVerdict::failure(e.to_string()),
                    };
                }
            };
        }
    }

    /// [`execute`](Self::execute), then send the verdict exactly once.
    pub async fn execute_and_report(
        &self,
        document: &str,
        parameters: &BTreeMap<String, String>,
        fallback: &dyn LocalBootstrap,
        reporter: BootSignalReporter,
    ) -> BootVerdict {
        let verdict = self.execute(document, parameters, fallback).await;
        reporter.report(&verdict).await;
        verdict
    }

    async fn persist_run_id(&self, run_id: &RunId) {
        let key = self.paths.execution_id();
        if let Err(e) = self
            .store
            .put(&key, run_id.as_str(), PutOptions::plain())
            .await
        {
            warn!(key = %key, run_id = %run_id, error = %e, "Failed to record automation run id");
        }
    }

    async fn poll(&self, run_id: &RunId) -> Result<AutomationRun, BootError> {
        let result = Poller::new(self.clock, "automation run", self.interval)
            .deadline(self.deadline)
            .run(|attempt| async move {
                match self.runner.get_status(run_id).await {
                    Ok(run) if run.status.is_terminal() => Attempt::Ready(run),
                    Ok(run) => {
                        info!(run_id = %run_id, status = %run.status, attempt, "Automation run in flight");
                        Attempt::Retry(run.status.to_string())
                    }
                    Err(e) => {
                        warn!(run_id = %run_id, attempt, error = %e, "Automation status unavailable");
                        Attempt::<AutomationRun, BootError>::Retry(e.to_string())
                    }
                }
            })
            .await;

        match result {
            Ok(polled) => Ok(polled.value),
            Err(PollError::Deadline(e)) => Err(BootError::Deadline(e)),
            Err(PollError::Fatal(e)) => Err(e),
            Err(PollError::Exhausted { attempts, last }) => Err(BootError::AutomationFailed(format!(
                "automation run {} still {} after {} polls",
                run_id, last, attempts
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use nodeward_core::automation::{RunStatus, StepFailure};
    use nodeward_core::clock::ManualClock;
    use nodeward_store::memory::MemoryStore;

    use crate::signal::RecordingSink;

    /// Runner that replays a fixed status sequence.
    struct ScriptedRunner {
        start: Result<RunId, AutomationError>,
        statuses: Mutex<VecDeque<AutomationRun>>,
        polls: Mutex<u32>,
    }

    impl ScriptedRunner {
        fn new(statuses: Vec<AutomationRun>) -> Self {
            Self {
                start: Ok(RunId::new("exec-1")),
                statuses: Mutex::new(statuses.into()),
                polls: Mutex::new(0),
            }
        }

        fn failing_start(err: AutomationError) -> Self {
            Self {
                start: Err(err),
                ..Self::new(Vec::new())
            }
        }

        fn polls(&self) -> u32 {
            *self.polls.lock().unwrap()
        }
    }

    #[async_trait]
    impl AutomationRunner for ScriptedRunner {
        async fn start(
            &self,
            _name: &str,
            _parameters: &BTreeMap<String, String>,
        ) -> Result<RunId, AutomationError> {
            self.start.clone()
        }

        async fn get_status(&self, run_id: &RunId) -> Result<AutomationRun, AutomationError> {
            *self.polls.lock().unwrap() += 1;
            let mut statuses = self.statuses.lock().unwrap();
            let next = if statuses.len() > 1 {
                statuses.pop_front()
            } else {
                statuses.front().cloned()
            };
            next.map(|mut run| {
                run.run_id = run_id.clone();
                run
            })
            .ok_or_else(|| AutomationError::Backend("no scripted status".into()))
        }
    }

    struct CountingFallback {
        runs: Mutex<u32>,
        result: fn() -> Result<(), BootError>,
    }

    impl CountingFallback {
        fn ok() -> Self {
            Self {
                runs: Mutex::new(0),
                result: || Ok(()),
            }
        }

        fn runs(&self) -> u32 {
            *self.runs.lock().unwrap()
        }
    }

    #[async_trait]
    impl LocalBootstrap for CountingFallback {
        async fn run_local(&self) -> Result<(), BootError> {
            *self.runs.lock().unwrap() += 1;
            (self.result)()
        }
    }

    fn run(status: RunStatus) -> AutomationRun {
        AutomationRun {
            run_id: RunId::new(""),
            status,
            step_failures: Vec::new(),
        }
    }

    fn paths() -> StorePaths {
        StorePaths::new("k8s", "development").unwrap()
    }

    #[tokio::test]
    async fn test_success_emits_exactly_one_signal() {
        let runner = ScriptedRunner::new(vec![
            run(RunStatus::Pending),
            run(RunStatus::InProgress),
            run(RunStatus::Success),
        ]);
        let store = MemoryStore::new();
        let paths = paths();
        let clock = ManualClock::new();
        let sink = Arc::new(RecordingSink::new());
        let fallback = CountingFallback::ok();

        let verdict = AutomationExecutor::new(&runner, &store, &paths, &clock)
            .execute_and_report(
                "k8s-dev-bootstrap",
                &BTreeMap::new(),
                &fallback,
                BootSignalReporter::new(sink.clone()),
            )
            .await;

        assert_eq!(verdict, BootVerdict::success());
        assert_eq!(sink.signals(), vec![BootVerdict::success()]);
        assert_eq!(runner.polls(), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(15), Duration::from_secs(15)]
        );
        assert_eq!(fallback.runs(), 0);
        assert_eq!(store.get(&paths.execution_id()).await.unwrap(), "exec-1");
    }

    #[tokio::test]
    async fn test_failure_reason_lists_every_failed_step() {
        let mut failed = run(RunStatus::Failed);
        failed.step_failures = vec![
            StepFailure::new("installCalico", "timeout waiting for pods"),
            StepFailure::new("bootstrapArgoCD", "exit code 1"),
        ];
        let runner = ScriptedRunner::new(vec![run(RunStatus::InProgress), failed]);
        let store = MemoryStore::new();
        let paths = paths();
        let clock = ManualClock::new();
        let sink = Arc::new(RecordingSink::new());

        let verdict = AutomationExecutor::new(&runner, &store, &paths, &clock)
            .execute_and_report(
                "k8s-dev-bootstrap",
                &BTreeMap::new(),
                &CountingFallback::ok(),
                BootSignalReporter::new(sink.clone()),
            )
            .await;

        assert!(!verdict.success);
        let reason = verdict.reason.clone().unwrap();
        assert!(reason.contains("installCalico: timeout waiting for pods"), "{}", reason);
        assert!(reason.contains("bootstrapArgoCD: exit code 1"), "{}", reason);
        assert_eq!(sink.signals(), vec![verdict]);
    }

    #[tokio::test]
    async fn test_timed_out_and_cancelled_are_failures() {
        for status in [RunStatus::TimedOut, RunStatus::Cancelled] {
            let runner = ScriptedRunner::new(vec![run(status)]);
            let store = MemoryStore::new();
            let paths = paths();
            let clock = ManualClock::new();
            let verdict = AutomationExecutor::new(&runner, &store, &paths, &clock)
                .execute("doc", &BTreeMap::new(), &CountingFallback::ok())
                .await;
            assert!(!verdict.success, "{} should fail boot", status);
        }
    }

    #[tokio::test]
    async fn test_missing_definition_falls_back_to_local() {
        let runner =
            ScriptedRunner::failing_start(AutomationError::DefinitionNotFound("doc".into()));
        let store = MemoryStore::new();
        let paths = paths();
        let clock = ManualClock::new();
        let fallback = CountingFallback::ok();

        let verdict = AutomationExecutor::new(&runner, &store, &paths, &clock)
            .execute("doc", &BTreeMap::new(), &fallback)
            .await;

        assert_eq!(verdict, BootVerdict::success());
        assert_eq!(fallback.runs(), 1);
        assert_eq!(runner.polls(), 0);
        assert!(store.try_get(&paths.execution_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fallback_failure_is_reported() {
        let runner = ScriptedRunner::failing_start(AutomationError::Unreachable("dns".into()));
        let store = MemoryStore::new();
        let paths = paths();
        let clock = ManualClock::new();
        let fallback = CountingFallback {
            runs: Mutex::new(0),
            result: || Err(BootError::JoinFailed("kubeadm exit 1".into())),
        };

        let verdict = AutomationExecutor::new(&runner, &store, &paths, &clock)
            .execute("doc", &BTreeMap::new(), &fallback)
            .await;
        assert_eq!(verdict, BootVerdict::failure("join failed: kubeadm exit 1"));
    }

    #[tokio::test]
    async fn test_backend_start_error_does_not_fall_back() {
        let runner = ScriptedRunner::failing_start(AutomationError::Backend("throttled".into()));
        let store = MemoryStore::new();
        let paths = paths();
        let clock = ManualClock::new();
        let fallback = CountingFallback::ok();

        let verdict = AutomationExecutor::new(&runner, &store, &paths, &clock)
            .execute("doc", &BTreeMap::new(), &fallback)
            .await;
        assert!(!verdict.success);
        assert_eq!(fallback.runs(), 0);
    }

    #[tokio::test]
    async fn test_deadline_bounds_polling() {
        let runner = ScriptedRunner::new(vec![run(RunStatus::InProgress)]);
        let store = MemoryStore::new();
        let paths = paths();
        let clock = ManualClock::new();
        let deadline = Deadline::after(&clock, Duration::from_secs(60));

        let verdict = AutomationExecutor::new(&runner, &store, &paths, &clock)
            .deadline(deadline)
            .execute("doc", &BTreeMap::new(), &CountingFallback::ok())
            .await;
        assert!(!verdict.success);
        assert!(verdict.reason.unwrap().contains("deadline exceeded"));
        assert_eq!(runner.polls(), 4);
    }
}
