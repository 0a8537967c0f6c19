//! Docker CLI backend for [`ContainerRuntime`].
//!
//! Shells out to `docker` rather than talking to the daemon API so the
//! harness works with whatever context/socket the user's CLI is configured
//! for (Docker Desktop, colima, a remote host, ...).

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{BrokerSpec, ContainerRuntime};

/// Container runtime that drives the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    /// Path to the `docker` binary. Defaults to `"docker"` (found via `$PATH`).
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use a custom binary (a `podman` shim, or a fake in tests).
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }

    /// Arguments for `docker run` that start `spec` detached.
    fn run_args(spec: &BrokerSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string(), "--rm".to_string()];
        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push("--name".to_string());
        args.push(spec.container_name.clone());
        args.push(spec.image.clone());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output> {
        debug!(binary = %self.binary, args = %args.join(" "), "running docker");
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run {} {}", self.binary, args.join(" ")))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `docker ps --format {{.Names}}` output lists exactly `container`.
///
/// The `name=` filter matches substrings, so `redis` would also match
/// `redis-celery-test`; the exact comparison happens here.
fn lists_container(ps_output: &str, container: &str) -> bool {
    ps_output.lines().any(|line| line.trim() == container)
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        "docker"
    }

    async fn is_running(&self, container: &str) -> Result<bool> {
        let args = [
            "ps".to_string(),
            "--filter".to_string(),
            format!("name={container}"),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let output = self.docker(&args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker ps failed: {}", stderr.trim());
        }

        Ok(lists_container(
            &String::from_utf8_lossy(&output.stdout),
            container,
        ))
    }

    async fn start(&self, spec: &BrokerSpec) -> Result<()> {
        let output = self.docker(&Self::run_args(spec)).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker run failed: {}", stderr.trim());
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(container = %spec.container_name, %container_id, "docker run succeeded");
        Ok(())
    }

    async fn stop(&self, container: &str) -> Result<()> {
        let output = self
            .docker(&["stop".to_string(), container.to_string()])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker stop {container} failed: {}", stderr.trim());
        }

        Ok(())
    }
}
