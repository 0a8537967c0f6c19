//! The Python (Celery) worker and client.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{Implementation, ImplementationTag, LaunchContext, Role};
use crate::supervisor::ProcessSpec;

/// How to invoke the Python side.
///
/// The worker runs `<program> -m celery -A <app_module> worker ...`; the
/// client runs `<program> -m <app_module> --task <task>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonCommand {
    pub program: String,
    pub app_module: String,
    pub working_dir: Option<PathBuf>,
}

impl Default for PythonCommand {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            app_module: "py.tasks".to_string(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PythonImplementation {
    command: PythonCommand,
}

impl PythonImplementation {
    pub fn new(command: PythonCommand) -> Self {
        Self { command }
    }
}

impl Implementation for PythonImplementation {
    fn tag(&self) -> ImplementationTag {
        ImplementationTag::Python
    }

    fn label(&self, role: Role) -> String {
        match role {
            Role::Worker => "pyworker".to_string(),
            Role::Client(task) => format!("pyclient-{task}"),
        }
    }

    fn command(&self, role: Role, launch: &LaunchContext) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.command.program).envs(&launch.env);
        if let Some(dir) = &self.command.working_dir {
            spec = spec.current_dir(dir);
        }
        let app = self.command.app_module.as_str();

        match role {
            Role::Worker => {
                spec = spec.args(["-m", "celery", "-A", app]);
                if !launch.verbose {
                    spec = spec.arg("-q");
                }
                // A single process so stateful tasks see one interpreter.
                spec.args([
                    "worker",
                    "-l",
                    if launch.verbose { "DEBUG" } else { "CRITICAL" },
                    "-c",
                    "1",
                ])
            }
            Role::Client(task) => spec.args(["-m", app, "--task", task.as_str()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::broker::BrokerKind;
    use crate::catalog::TaskId;

    fn launch(verbose: bool) -> LaunchContext {
        LaunchContext {
            broker: BrokerKind::Redis,
            verbose,
            env: BTreeMap::from([(
                "CELERY_BROKER".to_string(),
                "redis://127.0.0.1:6380/".to_string(),
            )]),
        }
    }

    #[test]
    fn quiet_worker_by_default() {
        let spec = PythonImplementation::default().command(Role::Worker, &launch(false));
        assert_eq!(
            spec.display(),
            "python -m celery -A py.tasks -q worker -l CRITICAL -c 1"
        );
        assert_eq!(
            spec.env.get("CELERY_BROKER").map(String::as_str),
            Some("redis://127.0.0.1:6380/")
        );
    }

    #[test]
    fn verbose_worker_logs_debug() {
        let spec = PythonImplementation::default().command(Role::Worker, &launch(true));
        assert_eq!(spec.display(), "python -m celery -A py.tasks worker -l DEBUG -c 1");
    }

    #[test]
    fn client_runs_app_module_with_task() {
        let imp = PythonImplementation::new(PythonCommand {
            program: "./venv/bin/python".to_string(),
            app_module: "celery_test_py.tasks".to_string(),
            working_dir: Some(PathBuf::from("/srv/celery")),
        });
        let spec = imp.command(Role::Client(TaskId::UnexpectedFailure), &launch(false));
        assert_eq!(
            spec.display(),
            "./venv/bin/python -m celery_test_py.tasks --task unexpected_failure"
        );
        assert_eq!(spec.working_dir, Some(PathBuf::from("/srv/celery")));
        assert_eq!(
            imp.label(Role::Client(TaskId::UnexpectedFailure)),
            "pyclient-unexpected_failure"
        );
    }
}
