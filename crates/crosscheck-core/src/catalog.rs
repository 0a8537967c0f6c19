//! The task catalog and the outcome each task must resolve to.
//!
//! Every (worker, client, broker) combination is driven through the same
//! catalog. Clients decide pass/fail by comparing what they observe with
//! [`ExpectedOutcome`]; the harness only looks at their exit status.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inputs submitted for the `add` task.
pub const ADD_ARGS: (i64, i64) = (2, 3);

/// Failure message carried by `expected_failure`.
pub const EXPECTED_FAILURE_MESSAGE: &str = "failure expected";

/// Failure message carried by `unexpected_failure`.
pub const UNEXPECTED_FAILURE_MESSAGE: &str = "failure unexpected";

/// Hard time limit enforced on every catalog task.
pub const TASK_TIME_LIMIT: Duration = Duration::from_secs(1);

/// How long `task_with_timeout` sleeps; always longer than [`TASK_TIME_LIMIT`].
pub const TIMEOUT_TASK_SLEEP: Duration = Duration::from_secs(2);

/// Canonical task identifiers, as registered by worker implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskId {
    Add,
    ExpectedFailure,
    UnexpectedFailure,
    TaskWithTimeout,
    RetryWithBackoff,
}

impl TaskId {
    /// Every known id, in catalog order.
    pub const ALL: [TaskId; 5] = [
        TaskId::Add,
        TaskId::ExpectedFailure,
        TaskId::TaskWithTimeout,
        TaskId::UnexpectedFailure,
        TaskId::RetryWithBackoff,
    ];

    /// The wire name used on worker/client command lines.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskId::Add => "add",
            TaskId::ExpectedFailure => "expected_failure",
            TaskId::UnexpectedFailure => "unexpected_failure",
            TaskId::TaskWithTimeout => "task_with_timeout",
            TaskId::RetryWithBackoff => "retry_with_backoff",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing a task id that is not in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown task {0:?} (expected one of: add, expected_failure, unexpected_failure, task_with_timeout, retry_with_backoff)")]
pub struct UnknownTask(pub String);

impl FromStr for TaskId {
    type Err = UnknownTask;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| UnknownTask(s.to_string()))
    }
}

/// Terminal state a task's asynchronous result must reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedOutcome {
    /// Completes normally with exactly this value.
    Success { value: serde_json::Value },
    /// A business failure raised deliberately by the task.
    ExpectedFailure { message: String },
    /// An arbitrary exception that must propagate unaltered.
    UnexpectedFailure { message: String },
    /// The worker enforces the time limit and kills the task.
    Timeout,
}

/// What a client actually observed for a submitted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservedOutcome {
    Success { value: serde_json::Value },
    Failure { message: String },
    TimedOut,
}

/// A disagreement between an observed result and the catalog.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("expected {expected}, observed {observed}")]
pub struct OutcomeMismatch {
    pub expected: String,
    pub observed: String,
}

impl ExpectedOutcome {
    /// Compare an observation against this expectation.
    ///
    /// Failure messages must match exactly. A timeout never matches a normal
    /// completion, whatever its value.
    pub fn check(&self, observed: &ObservedOutcome) -> Result<(), OutcomeMismatch> {
        let matches = match (self, observed) {
            (ExpectedOutcome::Success { value }, ObservedOutcome::Success { value: got }) => {
                value == got
            }
            (
                ExpectedOutcome::ExpectedFailure { message }
                | ExpectedOutcome::UnexpectedFailure { message },
                ObservedOutcome::Failure { message: got },
            ) => message == got,
            (ExpectedOutcome::Timeout, ObservedOutcome::TimedOut) => true,
            _ => false,
        };

        if matches {
            Ok(())
        } else {
            Err(OutcomeMismatch {
                expected: self.to_string(),
                observed: observed.to_string(),
            })
        }
    }
}

impl fmt::Display for ExpectedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedOutcome::Success { value } => write!(f, "success({value})"),
            ExpectedOutcome::ExpectedFailure { message } => {
                write!(f, "expected failure({message:?})")
            }
            ExpectedOutcome::UnexpectedFailure { message } => {
                write!(f, "unexpected failure({message:?})")
            }
            ExpectedOutcome::Timeout => f.write_str("timeout"),
        }
    }
}

impl fmt::Display for ObservedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservedOutcome::Success { value } => write!(f, "success({value})"),
            ObservedOutcome::Failure { message } => write!(f, "failure({message:?})"),
            ObservedOutcome::TimedOut => f.write_str("timeout"),
        }
    }
}

/// Bounded self-retry performed by the worker, not by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; the task succeeds on the last one.
    pub max_retries: u32,
    /// Fixed delay before each redelivery.
    #[serde(with = "duration_secs")]
    pub countdown: Duration,
}

impl RetryPolicy {
    /// Total attempts the worker makes, including the first.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// One entry of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub expected: ExpectedOutcome,
    #[serde(with = "duration_secs")]
    pub time_limit: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl TaskDescriptor {
    /// The catalog entry for `id`.
    pub fn for_id(id: TaskId) -> Self {
        match id {
            TaskId::Add => Self {
                id,
                expected: ExpectedOutcome::Success {
                    value: serde_json::json!(ADD_ARGS.0 + ADD_ARGS.1),
                },
                time_limit: TASK_TIME_LIMIT,
                retry: None,
            },
            TaskId::ExpectedFailure => Self {
                id,
                expected: ExpectedOutcome::ExpectedFailure {
                    message: EXPECTED_FAILURE_MESSAGE.to_string(),
                },
                time_limit: TASK_TIME_LIMIT,
                retry: None,
            },
            TaskId::UnexpectedFailure => Self {
                id,
                expected: ExpectedOutcome::UnexpectedFailure {
                    message: UNEXPECTED_FAILURE_MESSAGE.to_string(),
                },
                time_limit: TASK_TIME_LIMIT,
                retry: None,
            },
            TaskId::TaskWithTimeout => Self {
                id,
                expected: ExpectedOutcome::Timeout,
                time_limit: TASK_TIME_LIMIT,
                retry: None,
            },
            TaskId::RetryWithBackoff => Self {
                id,
                expected: ExpectedOutcome::Success {
                    value: serde_json::Value::Null,
                },
                // Each attempt is short; the limit covers one attempt.
                time_limit: Duration::from_secs(60),
                retry: Some(RetryPolicy {
                    max_retries: 3,
                    countdown: Duration::from_secs(1),
                }),
            },
        }
    }
}

/// An ordered selection of catalog entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCatalog {
    tasks: Vec<TaskDescriptor>,
}

impl TaskCatalog {
    /// Ids run when no explicit selection is given.
    pub const DEFAULT_IDS: [TaskId; 4] = [
        TaskId::Add,
        TaskId::ExpectedFailure,
        TaskId::TaskWithTimeout,
        TaskId::UnexpectedFailure,
    ];

    /// Every known task, including the optional retry scenario.
    pub fn full() -> Self {
        Self::select(&TaskId::ALL)
    }

    /// Keep only `ids`, in catalog order, each at most once.
    pub fn select(ids: &[TaskId]) -> Self {
        let tasks = TaskId::ALL
            .into_iter()
            .filter(|id| ids.contains(id))
            .map(TaskDescriptor::for_id)
            .collect();
        Self { tasks }
    }

    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskCatalog {
    fn default() -> Self {
        Self::select(&Self::DEFAULT_IDS)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
