//! Error type shared by every stage of a conformance run.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerKind;
use crate::catalog::TaskId;
use crate::implementation::ImplementationTag;

/// Everything that can abort a conformance run.
///
/// Each variant names the stage it came from (process, broker, worker, or
/// task) so the final message is enough to locate the failure.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The OS refused to create the process (missing binary, bad cwd, ...).
    #[error("failed to spawn [{label}] ({program}): {source}")]
    Spawn {
        label: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The working directory configured for a process does not exist.
    #[error("working directory for [{label}] does not exist: {}", path.display())]
    MissingWorkingDir { label: String, path: PathBuf },

    /// A bounded wait elapsed before the process exited.
    #[error("[{label}] did not exit within {timeout:?}")]
    TimedOut { label: String, timeout: Duration },

    /// Waiting on or signalling a child failed at the OS level.
    #[error("process [{label}] i/o error: {source}")]
    Process {
        label: String,
        #[source]
        source: std::io::Error,
    },

    /// The broker container could not be started.
    #[error("failed to start {kind} broker container {container}: {reason}")]
    BrokerStart {
        kind: BrokerKind,
        container: String,
        reason: String,
    },

    /// The container control plane could not be queried.
    #[error("failed to query broker container {container}: {reason}")]
    BrokerQuery { container: String, reason: String },

    /// The worker exited before its post-grace-period health check.
    #[error("{implementation} worker exited during startup ({status})")]
    WorkerStartupFailed {
        implementation: ImplementationTag,
        status: ExitStatus,
    },

    /// The worker exited on its own while the harness still needed it.
    #[error("{implementation} worker crashed ({status})")]
    WorkerCrashed {
        implementation: ImplementationTag,
        status: ExitStatus,
    },

    /// A client reported a mismatch (or died) for a task.
    #[error("{implementation} client failed for task {task} ({status})")]
    ClientTaskFailed {
        implementation: ImplementationTag,
        task: TaskId,
        status: ExitStatus,
    },

    /// A client did not finish its task within the configured bound.
    #[error("{implementation} client timed out on task {task} after {timeout:?}")]
    ClientTimedOut {
        implementation: ImplementationTag,
        task: TaskId,
        timeout: Duration,
    },

    /// No implementation is registered under the requested tag.
    #[error("no {0} implementation registered")]
    UnknownImplementation(ImplementationTag),

    /// The run was cancelled (Ctrl-C).
    #[error("run interrupted")]
    Interrupted,
}

impl HarnessError {
    /// True for failures reported by the system under test rather than by
    /// the harness's own plumbing.
    pub fn is_conformance_failure(&self) -> bool {
        matches!(
            self,
            Self::WorkerStartupFailed { .. }
                | Self::WorkerCrashed { .. }
                | Self::ClientTaskFailed { .. }
                | Self::ClientTimedOut { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
