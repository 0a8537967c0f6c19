//! Cross-implementation conformance harness for Celery-style task queues.
//!
//! Starts a broker container, then drives every selected worker
//! implementation against every selected client implementation over a
//! fixed task catalog, requiring each client to report the expected
//! outcome.

pub mod broker;
pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod implementation;
pub mod orchestrator;
pub mod supervisor;
pub mod worker;

pub use broker::{BrokerEnvironment, BrokerKind, BrokerSpec, ContainerRuntime, DockerCli};
pub use catalog::{TaskCatalog, TaskId};
pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use implementation::{Implementation, ImplementationRegistry, ImplementationTag};
pub use orchestrator::{Orchestrator, RunReport};
pub use supervisor::{OutputSink, ProcessSupervisor, StdoutSink};
