//! Supervised child processes with concurrent output draining.
//!
//! Every spawned process gets two reader tasks, one per pipe, that copy
//! lines into a shared [`OutputSink`] until the pipe closes. Reading both
//! pipes concurrently with the process keeps a chatty child from blocking
//! on a full stderr buffer while we only read stdout (or vice versa).

pub mod sink;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};

pub use sink::{CapturedLine, MemorySink, OutputSink, StdoutSink, Stream};

/// How long to wait for the readers after the process itself has exited.
///
/// A descendant that inherited the pipes can keep them open after the
/// direct child is gone; we stop waiting for it after this long.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default delay between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to launch one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the harness's inherited environment.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    /// Run `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set every variable in `vars` for the child.
    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Run the child in `dir`, which must exist at spawn time.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// `program arg1 arg2 ...`, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Spawns labeled processes whose output is forwarded to one sink.
#[derive(Clone)]
pub struct ProcessSupervisor {
    sink: Arc<dyn OutputSink>,
    kill_grace: Duration,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("kill_grace", &self.kill_grace)
            .finish()
    }
}

impl ProcessSupervisor {
    /// Forward all child output to `sink`.
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Override the delay between SIGTERM and SIGKILL in [`SupervisedProcess::kill`].
    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    /// Start `spec` and begin draining its stdout and stderr.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, label: &str, spec: &ProcessSpec) -> Result<SupervisedProcess> {
        if let Some(dir) = &spec.working_dir {
            if !dir.is_dir() {
                return Err(HarnessError::MissingWorkingDir {
                    label: label.to_string(),
                    path: dir.clone(),
                });
            }
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            label: label.to_string(),
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(
                label.to_string(),
                Stream::Stdout,
                stdout,
                Arc::clone(&self.sink),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(
                label.to_string(),
                Stream::Stderr,
                stderr,
                Arc::clone(&self.sink),
            )));
        }

        debug!(label, pid = ?pid, command = %spec.display(), "spawned process");

        Ok(SupervisedProcess {
            label: label.to_string(),
            pid,
            child,
            status: None,
            readers,
            kill_grace: self.kill_grace,
        })
    }
}

/// Copy one pipe into the sink line by line until EOF.
async fn pump<R>(label: String, stream: Stream, pipe: R, sink: Arc<dyn OutputSink>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => sink.write_line(&label, stream, &String::from_utf8_lossy(&buf)),
            Err(e) => {
                warn!(label = %label, ?stream, error = %e, "error reading process output");
                break;
            }
        }
    }
}

/// A running (or finished) child owned by the harness.
///
/// The exit status goes from `None` to `Some` exactly once and is cached.
/// Dropping the handle kills the child.
#[derive(Debug)]
pub struct SupervisedProcess {
    label: String,
    pid: Option<u32>,
    child: Child,
    status: Option<ExitStatus>,
    readers: Vec<JoinHandle<()>>,
    kill_grace: Duration,
}

impl SupervisedProcess {
    /// Prefix attached to every output line of this process.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// OS process id, if the child was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The cached exit status, without touching the OS.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Non-blocking liveness check. `None` means still running.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.record(status),
                Ok(None) => {}
                Err(e) => warn!(label = %self.label, error = %e, "error checking process status"),
            }
        }
        self.status
    }

    /// Wait for the process to exit, for at most `timeout` if given.
    ///
    /// An elapsed timeout is reported as [`HarnessError::TimedOut`]; the
    /// process is left running.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus> {
        if let Some(status) = self.poll() {
            self.drain_output().await;
            return Ok(status);
        }

        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                Ok(waited) => waited,
                Err(_elapsed) => {
                    return Err(HarnessError::TimedOut {
                        label: self.label.clone(),
                        timeout: limit,
                    });
                }
            },
            None => self.child.wait().await,
        };

        let status = waited.map_err(|source| HarnessError::Process {
            label: self.label.clone(),
            source,
        })?;
        self.record(status);
        self.drain_output().await;
        Ok(status)
    }

    /// Terminate the process: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Safe to call on a process that has already exited; the recorded
    /// status is returned.
    pub async fn kill(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.poll() {
            self.drain_output().await;
            return Ok(status);
        }

        let mut exited = None;
        if self.send_sigterm() {
            if let Ok(Ok(status)) =
                tokio::time::timeout(self.kill_grace, self.child.wait()).await
            {
                debug!(label = %self.label, "process exited after SIGTERM");
                exited = Some(status);
            }
        }

        let status = match exited {
            Some(status) => status,
            None => {
                debug!(label = %self.label, "sending SIGKILL");
                self.child
                    .kill()
                    .await
                    .map_err(|source| HarnessError::Process {
                        label: self.label.clone(),
                        source,
                    })?;
                self.child
                    .wait()
                    .await
                    .map_err(|source| HarnessError::Process {
                        label: self.label.clone(),
                        source,
                    })?
            }
        };

        self.record(status);
        self.drain_output().await;
        Ok(status)
    }

    #[cfg(unix)]
    fn send_sigterm(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        // SAFETY: pid is our own child, which has not been reaped yet
        // (poll() just returned None), so it cannot have been reused.
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if ret != 0 {
            warn!(label = %self.label, pid, "SIGTERM failed, proceeding to SIGKILL");
        }
        ret == 0
    }

    #[cfg(not(unix))]
    fn send_sigterm(&self) -> bool {
        false
    }

    fn record(&mut self, status: ExitStatus) {
        if self.status.is_none() {
            debug!(label = %self.label, %status, "process exited");
            self.status = Some(status);
        }
    }

    async fn drain_output(&mut self) {
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader)
                .await
                .is_err()
            {
                debug!(label = %self.label, "output pipe still held open after exit");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn supervisor() -> (ProcessSupervisor, MemorySink) {
        let sink = MemorySink::new();
        let supervisor = ProcessSupervisor::new(Arc::new(sink.clone()))
            .with_kill_grace(Duration::from_millis(300));
        (supervisor, sink)
    }

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let (supervisor, _) = supervisor();
        let err = supervisor
            .spawn("worker", &ProcessSpec::new("crosscheck_no_such_binary"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Spawn { .. }), "got {err:?}");
        assert!(err.to_string().contains("[worker]"));
    }

    #[tokio::test]
    async fn missing_working_dir_is_rejected() {
        let (supervisor, _) = supervisor();
        let spec = sh("true").current_dir("/definitely/not/a/dir");
        let err = supervisor.spawn("worker", &spec).unwrap_err();
        assert!(matches!(err, HarnessError::MissingWorkingDir { .. }));
    }

    #[tokio::test]
    async fn both_streams_are_forwarded_with_label() {
        let (supervisor, sink) = supervisor();
        let mut proc = supervisor
            .spawn("client-add", &sh("echo to-stdout; echo to-stderr >&2"))
            .unwrap();
        let status = proc.wait(Some(Duration::from_secs(10))).await.unwrap();
        assert!(status.success());

        let lines = sink.lines();
        assert!(lines.iter().any(|l| l.label == "client-add"
            && l.stream == Stream::Stdout
            && l.line == "to-stdout"));
        assert!(lines.iter().any(|l| l.label == "client-add"
            && l.stream == Stream::Stderr
            && l.line == "to-stderr"));
    }

    #[tokio::test]
    async fn heavy_output_on_both_pipes_does_not_deadlock() {
        let (supervisor, sink) = supervisor();
        let script = "i=0; while [ $i -lt 3000 ]; do \
                      echo \"out $i xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\"; \
                      echo \"err $i xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\" >&2; \
                      i=$((i+1)); done";
        let mut proc = supervisor.spawn("chatty", &sh(script)).unwrap();
        let status = proc.wait(Some(Duration::from_secs(30))).await.unwrap();
        assert!(status.success());

        let lines = sink.lines();
        let stdout = lines.iter().filter(|l| l.stream == Stream::Stdout).count();
        let stderr = lines.iter().filter(|l| l.stream == Stream::Stderr).count();
        assert_eq!(stdout, 3000);
        assert_eq!(stderr, 3000);
    }

    #[tokio::test]
    async fn env_and_working_dir_are_applied() {
        let (supervisor, sink) = supervisor();
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("echo \"broker=$CELERY_BROKER\"; pwd")
            .env("CELERY_BROKER", "redis://127.0.0.1:6380/")
            .current_dir(dir.path());
        let mut proc = supervisor.spawn("env", &spec).unwrap();
        proc.wait(Some(Duration::from_secs(10))).await.unwrap();

        let lines = sink.lines_for("env");
        assert_eq!(lines[0], "broker=redis://127.0.0.1:6380/");
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(
            PathBuf::from(&lines[1]).canonicalize().unwrap(),
            canonical
        );
    }

    #[tokio::test]
    async fn poll_reports_running_then_caches_exit() {
        let (supervisor, _) = supervisor();
        let mut proc = supervisor.spawn("sleeper", &sh("exec sleep 30")).unwrap();
        assert!(proc.poll().is_none());
        assert!(proc.exit_status().is_none());

        let status = proc.kill().await.unwrap();
        assert!(!status.success());
        assert_eq!(proc.poll(), Some(status));
        assert_eq!(proc.exit_status(), Some(status));
    }

    #[tokio::test]
    async fn elapsed_wait_is_distinct_from_exit() {
        let (supervisor, _) = supervisor();
        let mut proc = supervisor.spawn("hang", &sh("exec sleep 30")).unwrap();
        let err = proc
            .wait(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(
            matches!(err, HarnessError::TimedOut { ref label, .. } if label == "hang"),
            "got {err:?}"
        );
        assert!(proc.poll().is_none(), "timeout must not reap the process");
        proc.kill().await.unwrap();
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let (supervisor, _) = supervisor();
        let mut proc = supervisor.spawn("quick", &sh("exit 3")).unwrap();
        let status = proc.wait(Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(status.code(), Some(3));

        assert_eq!(proc.kill().await.unwrap().code(), Some(3));
        assert_eq!(proc.kill().await.unwrap().code(), Some(3));
    }

    #[tokio::test]
    async fn kill_terminates_with_sigterm() {
        let (supervisor, _) = supervisor();
        let mut proc = supervisor.spawn("polite", &sh("exec sleep 30")).unwrap();
        let status = proc.kill().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn kill_escalates_when_sigterm_is_ignored() {
        let (supervisor, _) = supervisor();
        let mut proc = supervisor
            .spawn("stubborn", &sh("trap '' TERM; exec sleep 30"))
            .unwrap();
        // Give the shell time to install the trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = proc.kill().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn spec_display_joins_program_and_args() {
        let spec = ProcessSpec::new("cargo").args(["run", "--", "worker"]);
        assert_eq!(spec.display(), "cargo run -- worker");
    }
}
