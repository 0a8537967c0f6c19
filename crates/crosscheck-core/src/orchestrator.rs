//! Conformance run orchestration.
//!
//! One run is a strictly nested sequence of scopes:
//!
//! ```text
//! broker (acquire .. release)
//!   for each worker implementation:
//!     worker (spawn, grace, health .. crash check, kill)
//!       for each client implementation:
//!         client pass over the catalog, one task at a time
//! ```
//!
//! Every scope releases what it acquired on every exit path, so a failing
//! client still leaves no worker running and no owned container behind.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{BrokerEnvironment, BrokerHandle, BrokerKind, ContainerRuntime};
use crate::client::{ClientRunner, TaskRun};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::implementation::{ImplementationRegistry, ImplementationTag, LaunchContext};
use crate::supervisor::{OutputSink, ProcessSupervisor};
use crate::worker;

/// Results of one client implementation against one worker.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub worker: ImplementationTag,
    pub client: ImplementationTag,
    pub runs: Vec<TaskRun>,
}

impl PassReport {
    /// Summed client wall time for this pass.
    pub fn elapsed(&self) -> Duration {
        self.runs.iter().map(TaskRun::elapsed).sum()
    }
}

/// Everything a successful run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub broker: BrokerKind,
    pub passes: Vec<PassReport>,
}

impl RunReport {
    /// Total client invocations that passed.
    pub fn task_count(&self) -> usize {
        self.passes.iter().map(|p| p.runs.len()).sum()
    }
}

/// Drives the worker x client matrix against one broker.
pub struct Orchestrator {
    config: HarnessConfig,
    brokers: BrokerEnvironment,
    supervisor: ProcessSupervisor,
    registry: ImplementationRegistry,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("broker", &self.config.broker)
            .field("workers", &self.config.workers)
            .field("clients", &self.config.clients)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Orchestrator {
    /// Build an orchestrator with the standard Rust and Python
    /// implementations, configured from `config`.
    pub fn new(
        config: HarnessConfig,
        runtime: Arc<dyn ContainerRuntime>,
        sink: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Self {
        let registry = ImplementationRegistry::standard(config.rust.clone(), config.python.clone());
        let supervisor = ProcessSupervisor::new(sink).with_kill_grace(config.timing.kill_grace);
        Self {
            config,
            brokers: BrokerEnvironment::new(runtime),
            supervisor,
            registry,
            cancel,
        }
    }

    /// Replace the implementation registry.
    pub fn with_registry(mut self, registry: ImplementationRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The configuration this orchestrator runs.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn brokers(&self) -> &BrokerEnvironment {
        &self.brokers
    }

    /// Execute the whole run.
    ///
    /// The first failure aborts the run after all scopes have been
    /// released, and is returned as-is.
    pub async fn run(&self) -> Result<RunReport> {
        let cfg = &self.config;

        // Unknown implementations fail before anything is started.
        for &tag in cfg.workers.iter().chain(&cfg.clients) {
            self.registry.get(tag)?;
        }
        if cfg.workers.is_empty() || cfg.clients.is_empty() {
            warn!(
                workers = cfg.workers.len(),
                clients = cfg.clients.len(),
                "no worker/client combination selected; only the broker will be checked"
            );
        }

        let launch = cfg.launch_context();
        info!(
            broker = %cfg.broker,
            address = %cfg.broker_spec().address,
            tasks = cfg.tasks.len(),
            "starting conformance run"
        );

        let report = self
            .brokers
            .with_broker(cfg.broker_spec(), |broker| self.run_matrix(broker, &launch))
            .await?;

        info!(
            passes = report.passes.len(),
            tasks = report.task_count(),
            "conformance run passed"
        );
        Ok(report)
    }

    async fn run_matrix(&self, broker: BrokerHandle, launch: &LaunchContext) -> Result<RunReport> {
        let cfg = &self.config;
        let runner = ClientRunner::new(
            self.supervisor.clone(),
            launch.clone(),
            cfg.timing.client_timeout,
            self.cancel.clone(),
        );
        let runner = &runner;

        let mut report = RunReport {
            broker: broker.kind,
            passes: Vec::new(),
        };

        for &worker_tag in &cfg.workers {
            let worker_impl = self.registry.get(worker_tag)?;
            let passes = worker::with_worker(
                &self.supervisor,
                worker_impl,
                launch,
                cfg.timing.grace_period,
                &self.cancel,
                |worker| async move {
                    let mut passes = Vec::with_capacity(cfg.clients.len());
                    for &client_tag in &cfg.clients {
                        let client = self.registry.get(client_tag)?;
                        let runs = runner.run(&cfg.tasks, &worker, client).await?;
                        info!(worker = %worker_tag, client = %client_tag, "client pass complete");
                        passes.push(PassReport {
                            worker: worker_tag,
                            client: client_tag,
                            runs,
                        });
                    }
                    Ok::<_, HarnessError>(passes)
                },
            )
            .await?;
            report.passes.extend(passes);
        }

        Ok(report)
    }
}
