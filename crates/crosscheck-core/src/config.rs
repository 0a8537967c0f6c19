//! Run configuration.
//!
//! A [`HarnessConfig`] is assembled once by the caller (the CLI resolves
//! flags, environment, and config file into it) and then only read. The
//! environment handed to every child is derived from it here, so nothing in
//! the harness touches its own process environment.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::broker::{BrokerKind, BrokerSpec};
use crate::catalog::TaskCatalog;
use crate::implementation::{ImplementationTag, LaunchContext, PythonCommand, RustCommand};
use crate::supervisor::DEFAULT_KILL_GRACE;

/// How long a worker must stay up before it counts as healthy.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Upper bound on a single client invocation.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

/// `RUST_LOG` handed to children when verbose.
pub const VERBOSE_RUST_LOG: &str = "debug,celery=trace";

/// `RUST_LOG` handed to children otherwise.
pub const QUIET_RUST_LOG: &str = "info";

/// Every delay the harness applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub grace_period: Duration,
    pub client_timeout: Duration,
    /// Delay between SIGTERM and SIGKILL when stopping a process.
    pub kill_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// Immutable settings for one conformance run.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Backend the run is executed against.
    pub broker: BrokerKind,
    pub redis: BrokerSpec,
    pub amqp: BrokerSpec,
    pub verbose: bool,
    /// Worker implementations, in run order.
    pub workers: Vec<ImplementationTag>,
    /// Client implementations driven against each worker, in run order.
    pub clients: Vec<ImplementationTag>,
    pub tasks: TaskCatalog,
    pub timing: Timing,
    pub rust: RustCommand,
    pub python: PythonCommand,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::default(),
            redis: BrokerSpec::redis(),
            amqp: BrokerSpec::amqp(),
            verbose: false,
            workers: Vec::new(),
            clients: Vec::new(),
            tasks: TaskCatalog::default(),
            timing: Timing::default(),
            rust: RustCommand::default(),
            python: PythonCommand::default(),
        }
    }
}

impl HarnessConfig {
    /// The container spec for the selected backend.
    pub fn broker_spec(&self) -> &BrokerSpec {
        self.spec_for(self.broker)
    }

    pub fn spec_for(&self, kind: BrokerKind) -> &BrokerSpec {
        match kind {
            BrokerKind::Redis => &self.redis,
            BrokerKind::Amqp => &self.amqp,
        }
    }

    /// Environment added to every worker and client.
    ///
    /// `CELERY_BROKER` carries the selected backend's address; both backend
    /// addresses are always present because some implementations keep
    /// results in redis regardless of the broker.
    pub fn child_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "CELERY_BROKER".to_string(),
            self.broker_spec().address.clone(),
        );
        env.insert(
            BrokerKind::Redis.address_var().to_string(),
            self.redis.address.clone(),
        );
        env.insert(
            BrokerKind::Amqp.address_var().to_string(),
            self.amqp.address.clone(),
        );
        if self.verbose {
            env.insert("RUST_LOG".to_string(), VERBOSE_RUST_LOG.to_string());
            env.insert("RUST_BACKTRACE".to_string(), "1".to_string());
        } else {
            env.insert("RUST_LOG".to_string(), QUIET_RUST_LOG.to_string());
        }
        env
    }

    pub fn launch_context(&self) -> LaunchContext {
        LaunchContext {
            broker: self.broker,
            verbose: self.verbose,
            env: self.child_env(),
        }
    }
}
