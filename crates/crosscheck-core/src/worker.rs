//! Worker lifecycle: start, health check, crash check, stop.
//!
//! A worker is expected to run until the harness kills it. It is healthy if
//! it is still running after the grace period, and it has crashed if it is
//! found exited at any later check.

use std::panic::AssertUnwindSafe;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::BrokerKind;
use crate::error::{HarnessError, Result};
use crate::implementation::{Implementation, ImplementationTag, LaunchContext, Role};
use crate::supervisor::{ProcessSupervisor, SupervisedProcess};

/// Identity of one worker in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSpec {
    pub implementation: ImplementationTag,
    pub broker: BrokerKind,
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Healthy,
    /// Exited while the harness still needed it.
    Crashed(ExitStatus),
    Stopped,
}

/// Liveness checks on a running worker, shared with whoever drives clients
/// against it.
#[derive(Debug, Clone)]
pub struct WorkerMonitor {
    spec: WorkerSpec,
    process: Arc<Mutex<SupervisedProcess>>,
}

impl WorkerMonitor {
    pub(crate) fn new(spec: WorkerSpec, process: SupervisedProcess) -> Self {
        Self {
            spec,
            process: Arc::new(Mutex::new(process)),
        }
    }

    /// Which worker this is.
    pub fn spec(&self) -> WorkerSpec {
        self.spec
    }

    /// The worker's exit status, or `None` while it is still running.
    pub async fn exited(&self) -> Option<ExitStatus> {
        self.process.lock().await.poll()
    }

    /// Fails with [`HarnessError::WorkerCrashed`] if the worker has exited.
    pub async fn ensure_alive(&self) -> Result<()> {
        match self.exited().await {
            None => Ok(()),
            Some(status) => {
                warn!(worker = %self.spec.implementation, %status, "worker found exited");
                Err(HarnessError::WorkerCrashed {
                    implementation: self.spec.implementation,
                    status,
                })
            }
        }
    }
}

/// A running worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    monitor: WorkerMonitor,
    state: WorkerState,
}

impl WorkerHandle {
    /// Spawn `implementation`'s worker and wait out the grace period.
    ///
    /// Fails with [`HarnessError::WorkerStartupFailed`] if the worker has
    /// already exited by then, and with [`HarnessError::Interrupted`] if
    /// `cancel` fires during the wait. The process is stopped on both paths.
    pub async fn acquire(
        supervisor: &ProcessSupervisor,
        implementation: &dyn Implementation,
        launch: &LaunchContext,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let spec = WorkerSpec {
            implementation: implementation.tag(),
            broker: launch.broker,
            verbose: launch.verbose,
        };
        info!(worker = %spec.implementation, broker = %spec.broker, "starting worker");

        let process = implementation.spawn(supervisor, Role::Worker, launch)?;
        let pid = process.pid();
        let mut worker = Self {
            monitor: WorkerMonitor::new(spec, process),
            state: WorkerState::Starting,
        };

        let interrupted = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(grace) => false,
        };
        if interrupted {
            worker.stop().await;
            return Err(HarnessError::Interrupted);
        }

        if let Some(status) = worker.monitor.exited().await {
            worker.state = WorkerState::Crashed(status);
            // Flushes whatever the worker printed before dying.
            worker.stop().await;
            return Err(HarnessError::WorkerStartupFailed {
                implementation: spec.implementation,
                status,
            });
        }

        worker.state = WorkerState::Healthy;
        info!(worker = %spec.implementation, pid = ?pid, "worker healthy");
        Ok(worker)
    }

    pub fn spec(&self) -> WorkerSpec {
        self.monitor.spec
    }

    /// State as of the last check.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// A shareable liveness handle on this worker.
    pub fn monitor(&self) -> WorkerMonitor {
        self.monitor.clone()
    }

    /// Poll the process and update the state. A healthy worker found
    /// exited becomes [`WorkerState::Crashed`].
    pub async fn check(&mut self) -> WorkerState {
        if self.state == WorkerState::Healthy {
            if let Some(status) = self.monitor.exited().await {
                self.state = WorkerState::Crashed(status);
            }
        }
        self.state
    }

    /// Crash check, then stop the process.
    ///
    /// The process is stopped whatever the check finds; a worker that had
    /// exited on its own yields [`HarnessError::WorkerCrashed`].
    pub async fn release(mut self) -> Result<()> {
        let state = self.check().await;
        self.stop().await;

        let implementation = self.monitor.spec.implementation;
        match state {
            WorkerState::Crashed(status) => {
                warn!(worker = %implementation, %status, "worker crashed");
                Err(HarnessError::WorkerCrashed {
                    implementation,
                    status,
                })
            }
            _ => {
                info!(worker = %implementation, "worker stopped");
                Ok(())
            }
        }
    }

    async fn stop(&mut self) {
        if let Err(e) = self.monitor.process.lock().await.kill().await {
            warn!(worker = %self.monitor.spec.implementation, error = %e, "failed to stop worker");
        }
        if !matches!(self.state, WorkerState::Crashed(_)) {
            self.state = WorkerState::Stopped;
        }
    }
}

/// Run `body` with a healthy worker, releasing it on every exit path.
///
/// `body` gets a [`WorkerMonitor`] to check the worker between steps. A
/// worker crash outranks whatever error `body` returned, unless the run was
/// cancelled, in which case the result is [`HarnessError::Interrupted`]. A
/// panic in `body` is resumed after the worker has been stopped.
pub async fn with_worker<F, Fut, T>(
    supervisor: &ProcessSupervisor,
    implementation: &dyn Implementation,
    launch: &LaunchContext,
    grace: Duration,
    cancel: &CancellationToken,
    body: F,
) -> Result<T>
where
    F: FnOnce(WorkerMonitor) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let worker = WorkerHandle::acquire(supervisor, implementation, launch, grace, cancel).await?;
    let spec = worker.spec();

    let outcome = AssertUnwindSafe(body(worker.monitor()))
        .catch_unwind()
        .await;
    let released = worker.release().await;

    let result = match outcome {
        Err(panic) => std::panic::resume_unwind(panic),
        Ok(result) => result,
    };
    match (result, released) {
        (_, Err(_)) if cancel.is_cancelled() => Err(HarnessError::Interrupted),
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(crash)) => Err(crash),
        (Err(e), Err(crash)) => {
            warn!(worker = %spec.implementation, error = %e, "failure attributed to worker crash");
            Err(crash)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;

    use crate::supervisor::{MemorySink, ProcessSpec};

    /// Runs an inline shell script as the worker.
    struct ScriptWorker(&'static str);

    impl Implementation for ScriptWorker {
        fn tag(&self) -> ImplementationTag {
            ImplementationTag::Python
        }

        fn label(&self, _role: Role) -> String {
            "pyworker".to_string()
        }

        fn command(&self, _role: Role, launch: &LaunchContext) -> ProcessSpec {
            ProcessSpec::new("sh")
                .arg("-c")
                .arg(self.0)
                .envs(&launch.env)
        }
    }

    fn launch() -> LaunchContext {
        LaunchContext {
            broker: BrokerKind::Redis,
            verbose: false,
            env: BTreeMap::new(),
        }
    }

    fn supervisor(sink: &MemorySink) -> ProcessSupervisor {
        ProcessSupervisor::new(Arc::new(sink.clone())).with_kill_grace(Duration::from_secs(2))
    }

    const GRACE: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn long_running_worker_is_healthy_and_released_cleanly() {
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();
        let mut worker = WorkerHandle::acquire(
            &supervisor(&sink),
            &ScriptWorker("echo ready; exec sleep 30"),
            &launch(),
            GRACE,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(worker.state(), WorkerState::Healthy);
        assert_eq!(worker.check().await, WorkerState::Healthy);
        assert!(worker.monitor().ensure_alive().await.is_ok());
        assert_eq!(worker.spec().implementation, ImplementationTag::Python);
        worker.release().await.unwrap();
        assert_eq!(sink.lines_for("pyworker"), vec!["ready"]);
    }

    #[tokio::test]
    async fn worker_exiting_during_grace_fails_startup() {
        let sink = MemorySink::new();
        let err = WorkerHandle::acquire(
            &supervisor(&sink),
            &ScriptWorker("echo 'cannot connect to broker' >&2; exit 1"),
            &launch(),
            GRACE,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            HarnessError::WorkerStartupFailed {
                implementation,
                status,
            } => {
                assert_eq!(implementation, ImplementationTag::Python);
                assert_eq!(status.code(), Some(1));
            }
            other => panic!("expected WorkerStartupFailed, got {other:?}"),
        }
        assert_eq!(sink.lines_for("pyworker"), vec!["cannot connect to broker"]);
    }

    #[tokio::test]
    async fn worker_exiting_after_grace_is_a_crash_on_release() {
        let sink = MemorySink::new();
        let mut worker = WorkerHandle::acquire(
            &supervisor(&sink),
            &ScriptWorker("sleep 0.5; exit 3"),
            &launch(),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(worker.check().await, WorkerState::Crashed(_)));
        assert!(matches!(
            worker.monitor().ensure_alive().await,
            Err(HarnessError::WorkerCrashed { .. })
        ));

        let err = worker.release().await.unwrap_err();
        match err {
            HarnessError::WorkerCrashed { status, .. } => assert_eq!(status.code(), Some(3)),
            other => panic!("expected WorkerCrashed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_during_grace_interrupts_and_stops() {
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = WorkerHandle::acquire(
            &supervisor(&sink),
            &ScriptWorker("exec sleep 30"),
            &launch(),
            Duration::from_secs(30),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::Interrupted));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_before_grace() {
        struct MissingDir;
        impl Implementation for MissingDir {
            fn tag(&self) -> ImplementationTag {
                ImplementationTag::Rust
            }
            fn label(&self, _role: Role) -> String {
                "worker".to_string()
            }
            fn command(&self, _role: Role, _launch: &LaunchContext) -> ProcessSpec {
                ProcessSpec::new("sleep")
                    .arg("30")
                    .current_dir(PathBuf::from("/nonexistent/crosscheck/rust"))
            }
        }

        let sink = MemorySink::new();
        let err = WorkerHandle::acquire(
            &supervisor(&sink),
            &MissingDir,
            &launch(),
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::MissingWorkingDir { .. }));
    }

    #[tokio::test]
    async fn with_worker_returns_body_value() {
        let sink = MemorySink::new();
        let value = with_worker(
            &supervisor(&sink),
            &ScriptWorker("exec sleep 30"),
            &launch(),
            GRACE,
            &CancellationToken::new(),
            |worker| async move { Ok::<_, HarnessError>(worker.spec().broker) },
        )
        .await
        .unwrap();
        assert_eq!(value, BrokerKind::Redis);
    }

    #[tokio::test]
    async fn with_worker_keeps_body_error_when_worker_is_healthy() {
        let sink = MemorySink::new();
        let err = with_worker(
            &supervisor(&sink),
            &ScriptWorker("exec sleep 30"),
            &launch(),
            GRACE,
            &CancellationToken::new(),
            |_worker| async move {
                Err::<(), _>(HarnessError::ClientTimedOut {
                    implementation: ImplementationTag::Rust,
                    task: crate::catalog::TaskId::Add,
                    timeout: Duration::from_secs(1),
                })
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::ClientTimedOut { .. }));
    }

    #[tokio::test]
    async fn with_worker_reports_crash_over_body_error() {
        let sink = MemorySink::new();
        let err = with_worker(
            &supervisor(&sink),
            &ScriptWorker("sleep 0.3; exit 2"),
            &launch(),
            Duration::from_millis(100),
            &CancellationToken::new(),
            |_worker| async move {
                tokio::time::sleep(Duration::from_millis(600)).await;
                Err::<(), _>(HarnessError::ClientTaskFailed {
                    implementation: ImplementationTag::Rust,
                    task: crate::catalog::TaskId::ExpectedFailure,
                    status: ExitStatus::from_raw(256),
                })
            },
        )
        .await
        .unwrap_err();
        match err {
            HarnessError::WorkerCrashed { status, .. } => assert_eq!(status.code(), Some(2)),
            other => panic!("expected WorkerCrashed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn with_worker_reports_interrupt_when_cancelled_worker_exits() {
        let sink = MemorySink::new();
        let cancel = CancellationToken::new();
        let err = with_worker(
            &supervisor(&sink),
            &ScriptWorker("sleep 0.3; exit 130"),
            &launch(),
            Duration::from_millis(100),
            &cancel,
            |_worker| async {
                tokio::time::sleep(Duration::from_millis(600)).await;
                cancel.cancel();
                Err::<(), _>(HarnessError::Interrupted)
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::Interrupted));
    }

    #[tokio::test]
    async fn with_worker_reports_crash_after_successful_body() {
        let sink = MemorySink::new();
        let err = with_worker(
            &supervisor(&sink),
            &ScriptWorker("sleep 0.3; exit 2"),
            &launch(),
            Duration::from_millis(100),
            &CancellationToken::new(),
            |_worker| async move {
                tokio::time::sleep(Duration::from_millis(600)).await;
                Ok::<_, HarnessError>(())
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::WorkerCrashed { .. }));
    }

    #[tokio::test]
    async fn with_worker_stops_worker_when_body_panics() {
        let sink = MemorySink::new();
        let supervisor = supervisor(&sink);
        let launch = launch();
        let cancel = CancellationToken::new();
        let worker =
            ScriptWorker("trap 'echo terminated; exit 0' TERM; while true; do sleep 0.1; done");
        let body = with_worker(
            &supervisor,
            &worker,
            &launch,
            GRACE,
            &cancel,
            |_worker| async move {
                if true {
                    panic!("body exploded");
                }
                Ok::<_, HarnessError>(())
            },
        );

        let caught = AssertUnwindSafe(body).catch_unwind().await;
        assert!(caught.is_err());
        assert_eq!(sink.lines_for("pyworker"), vec!["terminated"]);
    }
}
