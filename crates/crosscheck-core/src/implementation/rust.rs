//! The Rust worker/client, driven through `cargo run`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{Implementation, ImplementationTag, LaunchContext, Role};
use crate::supervisor::ProcessSpec;

/// How to invoke the Rust binary.
///
/// The role arguments (`worker --broker <kind>` or
/// `client --broker <kind> <task>`) are appended to `args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RustCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for RustCommand {
    fn default() -> Self {
        Self {
            program: "cargo".to_string(),
            args: vec!["run".to_string(), "--".to_string()],
            working_dir: Some(PathBuf::from("rust")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RustImplementation {
    command: RustCommand,
}

impl RustImplementation {
    pub fn new(command: RustCommand) -> Self {
        Self { command }
    }
}

impl Implementation for RustImplementation {
    fn tag(&self) -> ImplementationTag {
        ImplementationTag::Rust
    }

    fn label(&self, role: Role) -> String {
        match role {
            Role::Worker => "worker".to_string(),
            Role::Client(task) => format!("client-{task}"),
        }
    }

    fn command(&self, role: Role, launch: &LaunchContext) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.command.program)
            .args(self.command.args.iter().cloned())
            .envs(&launch.env);
        if let Some(dir) = &self.command.working_dir {
            spec = spec.current_dir(dir);
        }

        match role {
            Role::Worker => spec.args(["worker", "--broker", launch.broker.as_str()]),
            Role::Client(task) => {
                spec.args(["client", "--broker", launch.broker.as_str(), task.as_str()])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::broker::BrokerKind;
    use crate::catalog::TaskId;

    fn launch(broker: BrokerKind) -> LaunchContext {
        LaunchContext {
            broker,
            verbose: false,
            env: BTreeMap::from([("RUST_LOG".to_string(), "info".to_string())]),
        }
    }

    #[test]
    fn worker_command_runs_cargo_in_rust_dir() {
        let spec = RustImplementation::default().command(Role::Worker, &launch(BrokerKind::Amqp));
        assert_eq!(spec.program, "cargo");
        assert_eq!(spec.args, vec!["run", "--", "worker", "--broker", "amqp"]);
        assert_eq!(spec.working_dir, Some(PathBuf::from("rust")));
        assert_eq!(spec.env.get("RUST_LOG").map(String::as_str), Some("info"));
    }

    #[test]
    fn client_command_passes_task_last() {
        let imp = RustImplementation::default();
        let spec = imp.command(
            Role::Client(TaskId::TaskWithTimeout),
            &launch(BrokerKind::Redis),
        );
        assert_eq!(
            spec.args,
            vec!["run", "--", "client", "--broker", "redis", "task_with_timeout"]
        );
        assert_eq!(imp.label(Role::Client(TaskId::TaskWithTimeout)), "client-task_with_timeout");
        assert_eq!(imp.label(Role::Worker), "worker");
    }

    #[test]
    fn prebuilt_binary_without_working_dir() {
        let imp = RustImplementation::new(RustCommand {
            program: "target/release/celery-rs".to_string(),
            args: vec![],
            working_dir: None,
        });
        let spec = imp.command(Role::Worker, &launch(BrokerKind::Redis));
        assert_eq!(spec.display(), "target/release/celery-rs worker --broker redis");
        assert!(spec.working_dir.is_none());
    }
}
