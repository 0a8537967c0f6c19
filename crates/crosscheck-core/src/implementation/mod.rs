//! Worker/client implementations under test.
//!
//! Each language variant implements [`Implementation`], which knows how to
//! turn a [`Role`] into a command line. Liveness, waiting, and termination
//! are the same for every variant and live on
//! [`SupervisedProcess`](crate::supervisor::SupervisedProcess).
//!
//! ```text
//! Orchestrator
//!     |
//!     v
//! ImplementationRegistry --get(Rust)--> &dyn Implementation
//!     |                                      |
//!     |   spawn(Role::Worker) ---------------+--> SupervisedProcess (runs until killed)
//!     |   spawn(Role::Client(task)) ---------+--> SupervisedProcess (exits 0 on match)
//! ```

pub mod python;
pub mod registry;
pub mod rust;
pub mod trait_def;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::broker::BrokerKind;
use crate::catalog::TaskId;

pub use python::{PythonCommand, PythonImplementation};
pub use registry::ImplementationRegistry;
pub use rust::{RustCommand, RustImplementation};
pub use trait_def::Implementation;

/// Which language implementation a worker or client comes from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ImplementationTag {
    Rust,
    Python,
}

impl ImplementationTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ImplementationTag::Rust => "rust",
            ImplementationTag::Python => "python",
        }
    }
}

impl fmt::Display for ImplementationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImplementationTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rust" => Ok(ImplementationTag::Rust),
            "python" => Ok(ImplementationTag::Python),
            other => Err(format!(
                "unknown implementation {other:?} (expected \"rust\" or \"python\")"
            )),
        }
    }
}

/// What a spawned process is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Consume tasks until killed.
    Worker,
    /// Submit one task, check its outcome, exit 0 on match.
    Client(TaskId),
}

/// Run-wide inputs every command line is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    pub broker: BrokerKind,
    pub verbose: bool,
    /// Extra environment for every child (broker addresses, log settings).
    pub env: BTreeMap<String, String>,
}
