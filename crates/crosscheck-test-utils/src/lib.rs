//! Shared test utilities for crosscheck integration tests.
//!
//! Provides stand-ins for every external program the harness drives:
//!
//! - [`write_script`]: an executable shell script, used as a fake worker or
//!   client binary.
//! - [`FakeDocker`]: a `docker` CLI replacement that keeps container state in
//!   a temp directory and logs every invocation.
//! - [`start_named_redis`]: a real redis container via testcontainers, for
//!   tests that need an actual docker daemon.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Write `body` to `dir/name` as an executable `sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))
        .unwrap_or_else(|e| panic!("failed to write script {}: {e}", path.display()));
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .unwrap_or_else(|e| panic!("failed to chmod script {}: {e}", path.display()));
    path
}

const FAKE_DOCKER: &str = r#"
state="__STATE__"
echo "$*" >> "$state/calls.log"
case "$1" in
  ps)
    # ps --filter name=<n> --format {{.Names}}; substring match like docker.
    name="${3#name=}"
    ls "$state/running" | grep -F -- "$name"
    exit 0
    ;;
  run)
    if [ -e "$state/fail-run" ]; then
      echo "Error response from daemon: port is already allocated" >&2
      exit 125
    fi
    name=""
    prev=""
    for arg in "$@"; do
      if [ "$prev" = "--name" ]; then name="$arg"; fi
      prev="$arg"
    done
    touch "$state/running/$name"
    echo "4f1c9e2b7a3d"
    ;;
  stop)
    if [ -e "$state/fail-stop" ]; then
      echo "Error response from daemon: cannot stop container: $2" >&2
      exit 1
    fi
    rm -f "$state/running/$2"
    echo "$2"
    ;;
  *)
    echo "fake docker: unsupported command $1" >&2
    exit 2
    ;;
esac
"#;

/// A scripted `docker` binary backed by a temp directory.
///
/// Understands `ps --filter name=<n> --format {{.Names}}`, `run ... --name
/// <n> <image>` and `stop <n>`. Running containers are files under
/// `running/`; every invocation is appended to `calls.log`.
pub struct FakeDocker {
    dir: TempDir,
    binary: PathBuf,
}

impl FakeDocker {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create fake docker dir");
        fs::create_dir(dir.path().join("running")).expect("failed to create state dir");
        let script = FAKE_DOCKER.replace("__STATE__", &dir.path().display().to_string());
        let binary = write_script(dir.path(), "docker", &script);
        Self { dir, binary }
    }

    /// Path to pass to `DockerCli::with_binary`.
    pub fn binary(&self) -> String {
        self.binary.display().to_string()
    }

    /// Every invocation so far, as space-joined arguments.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("calls.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Only the invocations whose first argument is `command`.
    pub fn calls_to(&self, command: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split_whitespace().next() == Some(command))
            .collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.dir.path().join("running").join(name).exists()
    }

    /// Pretend a container was started outside the harness.
    pub fn mark_running(&self, name: &str) {
        fs::write(self.dir.path().join("running").join(name), "")
            .expect("failed to mark container running");
    }

    /// Pretend a container was stopped outside the harness.
    pub fn mark_stopped(&self, name: &str) {
        let _ = fs::remove_file(self.dir.path().join("running").join(name));
    }

    /// Make every subsequent `docker run` fail.
    pub fn fail_run(&self) {
        fs::write(self.dir.path().join("fail-run"), "").expect("failed to set fail-run");
    }

    /// Make every subsequent `docker stop` fail.
    pub fn fail_stop(&self) {
        fs::write(self.dir.path().join("fail-stop"), "").expect("failed to set fail-stop");
    }
}

impl Default for FakeDocker {
    fn default() -> Self {
        Self::new()
    }
}

/// Start a redis container named `name` through testcontainers.
///
/// The container is removed when the returned handle is dropped.
pub async fn start_named_redis(name: &str) -> ContainerAsync<Redis> {
    Redis::default()
        .with_container_name(name)
        .start()
        .await
        .expect("failed to start redis container")
}
