//! One-shot client invocations over the task catalog.

use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::BrokerKind;
use crate::catalog::{TaskCatalog, TaskId};
use crate::error::{HarnessError, Result};
use crate::implementation::{Implementation, ImplementationTag, LaunchContext, Role};
use crate::supervisor::{ProcessSupervisor, SupervisedProcess};
use crate::worker::WorkerMonitor;

/// One client process submitting one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInvocation {
    pub task: TaskId,
    pub broker: BrokerKind,
    pub implementation: ImplementationTag,
}

/// A finished, successful client invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRun {
    pub invocation: ClientInvocation,
    pub started: Instant,
    pub finished: Instant,
    pub status: ExitStatus,
}

impl TaskRun {
    /// The task this run submitted.
    pub fn task(&self) -> TaskId {
        self.invocation.task
    }

    pub fn elapsed(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }
}

/// Runs clients one at a time and requires each to exit successfully.
#[derive(Debug, Clone)]
pub struct ClientRunner {
    supervisor: ProcessSupervisor,
    launch: LaunchContext,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ClientRunner {
    /// Clients get `launch`'s environment and at most `timeout` each.
    pub fn new(
        supervisor: ProcessSupervisor,
        launch: LaunchContext,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            supervisor,
            launch,
            timeout,
            cancel,
        }
    }

    /// Drive every task in `tasks`, in catalog order, through `client`.
    ///
    /// Stops at the first failure. Each client has exited before the next
    /// is spawned, so runs never overlap. The worker is checked before every
    /// task; one found exited fails the pass with
    /// [`HarnessError::WorkerCrashed`].
    pub async fn run(
        &self,
        tasks: &TaskCatalog,
        worker: &WorkerMonitor,
        client: &dyn Implementation,
    ) -> Result<Vec<TaskRun>> {
        info!(
            worker = %worker.spec().implementation,
            client = %client.tag(),
            broker = %self.launch.broker,
            tasks = tasks.len(),
            "running client pass"
        );

        let mut runs = Vec::with_capacity(tasks.len());
        for descriptor in tasks.tasks() {
            let invocation = ClientInvocation {
                task: descriptor.id,
                broker: self.launch.broker,
                implementation: client.tag(),
            };
            worker.ensure_alive().await?;
            runs.push(self.run_one(invocation, client).await?);
        }
        Ok(runs)
    }

    /// Spawn one client and wait (bounded) for a zero exit.
    pub async fn run_one(
        &self,
        invocation: ClientInvocation,
        client: &dyn Implementation,
    ) -> Result<TaskRun> {
        let task = invocation.task;
        let started = Instant::now();
        let mut process = client.spawn(&self.supervisor, Role::Client(task), &self.launch)?;

        let waited = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            waited = process.wait(Some(self.timeout)) => Some(waited),
        };

        let status = match waited {
            None => {
                stop(&mut process).await;
                return Err(HarnessError::Interrupted);
            }
            Some(Err(HarnessError::TimedOut { timeout, .. })) => {
                warn!(client = %invocation.implementation, task = %task, ?timeout, "client timed out");
                stop(&mut process).await;
                return Err(HarnessError::ClientTimedOut {
                    implementation: invocation.implementation,
                    task,
                    timeout,
                });
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(status)) => status,
        };
        let finished = Instant::now();

        if !status.success() {
            // Ctrl-C reaches the client's process group too.
            if self.cancel.is_cancelled() {
                return Err(HarnessError::Interrupted);
            }
            return Err(HarnessError::ClientTaskFailed {
                implementation: invocation.implementation,
                task,
                status,
            });
        }

        let run = TaskRun {
            invocation,
            started,
            finished,
            status,
        };
        info!(
            client = %invocation.implementation,
            task = %task,
            elapsed_ms = run.elapsed().as_millis() as u64,
            "task passed"
        );
        Ok(run)
    }
}

async fn stop(process: &mut SupervisedProcess) {
    if let Err(e) = process.kill().await {
        warn!(label = %process.label(), error = %e, "failed to stop client");
    }
}
