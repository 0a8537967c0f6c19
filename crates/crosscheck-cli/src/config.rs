//! Configuration file handling for crosscheck.
//!
//! An optional TOML file (`./crosscheck.toml` unless `--config` names one)
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crosscheck_core::broker::{BrokerKind, BrokerSpec, PortMapping};
use crosscheck_core::catalog::{TaskCatalog, TaskId};
use crosscheck_core::config::HarnessConfig;
use crosscheck_core::implementation::{ImplementationTag, PythonCommand, RustCommand};

use crate::Cli;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "crosscheck.toml";

/// Env var selecting the broker backend.
pub const BROKER_ENV: &str = "CROSSCHECK_BROKER";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

/// Every section and key is optional; missing values fall through to the
/// built-in defaults.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub broker: Option<BrokerKind>,
    pub tasks: Option<Vec<TaskId>>,
    pub timing: TimingSection,
    pub redis: BrokerSection,
    pub amqp: BrokerSection,
    pub rust: Option<RustCommand>,
    pub python: Option<PythonCommand>,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingSection {
    pub grace_period_ms: Option<u64>,
    pub client_timeout_secs: Option<u64>,
    pub kill_grace_secs: Option<u64>,
}

/// Overrides for one broker container.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSection {
    pub container_name: Option<String>,
    pub image: Option<String>,
    pub ports: Option<Vec<PortMapping>>,
    pub address: Option<String>,
}

impl BrokerSection {
    fn apply(&self, spec: &mut BrokerSpec) {
        if let Some(name) = &self.container_name {
            spec.container_name = name.clone();
        }
        if let Some(image) = &self.image {
            spec.image = image.clone();
        }
        if let Some(ports) = &self.ports {
            spec.ports = ports.clone();
        }
        if let Some(address) = &self.address {
            spec.address = address.clone();
        }
    }
}

// -----------------------------------------------------------------------
// Read
// -----------------------------------------------------------------------

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// The config file for this run, if any.
///
/// An explicit path must exist. The default file is optional.
pub fn find_config(explicit: Option<&Path>) -> Result<Option<ConfigFile>> {
    match explicit {
        Some(path) => load_config(path).map(Some),
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if path.is_file() {
                load_config(&path).map(Some)
            } else {
                Ok(None)
            }
        }
    }
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Resolve the run configuration.
///
/// - broker: `--broker` > `CROSSCHECK_BROKER` > file `broker` > redis
/// - addresses: `REDIS_ADDR` / `AMQP_ADDR` > file `[redis]`/`[amqp]` `address` > built-in
/// - tasks: `--tasks` > file `tasks` > default catalog
/// - timing: `--grace-period-ms` / `--client-timeout` > file `[timing]` > built-in
/// - workers, clients, verbosity: CLI only
///
/// `env` stands in for `std::env::var` so tests never touch the process
/// environment.
pub fn resolve(
    cli: &Cli,
    file: Option<ConfigFile>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<HarnessConfig> {
    let file = file.unwrap_or_default();
    let mut cfg = HarnessConfig::default();

    cfg.broker = if let Some(kind) = cli.broker {
        kind
    } else if let Some(raw) = env(BROKER_ENV) {
        match raw.parse::<BrokerKind>() {
            Ok(kind) => kind,
            Err(e) => bail!("invalid {BROKER_ENV}: {e}"),
        }
    } else {
        file.broker.unwrap_or_default()
    };

    file.redis.apply(&mut cfg.redis);
    file.amqp.apply(&mut cfg.amqp);
    if let Some(addr) = env(BrokerKind::Redis.address_var()) {
        cfg.redis.address = addr;
    }
    if let Some(addr) = env(BrokerKind::Amqp.address_var()) {
        cfg.amqp.address = addr;
    }

    cfg.tasks = match cli.tasks.as_deref().or(file.tasks.as_deref()) {
        Some(ids) => TaskCatalog::select(ids),
        None => TaskCatalog::default(),
    };
    if cfg.tasks.is_empty() {
        bail!("no tasks selected");
    }

    if let Some(ms) = cli.grace_period_ms.or(file.timing.grace_period_ms) {
        cfg.timing.grace_period = Duration::from_millis(ms);
    }
    if let Some(secs) = cli.client_timeout.or(file.timing.client_timeout_secs) {
        if secs == 0 {
            bail!("client timeout must be at least one second");
        }
        cfg.timing.client_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = file.timing.kill_grace_secs {
        cfg.timing.kill_grace = Duration::from_secs(secs);
    }

    if let Some(rust) = file.rust {
        cfg.rust = rust;
    }
    if let Some(python) = file.python {
        cfg.python = python;
    }

    cfg.verbose = cli.verbose;
    cfg.workers = selected(cli.rust_worker, cli.python_worker);
    cfg.clients = selected(cli.rust_client, cli.python_client);

    Ok(cfg)
}

fn selected(rust: bool, python: bool) -> Vec<ImplementationTag> {
    let mut tags = Vec::new();
    if rust {
        tags.push(ImplementationTag::Rust);
    }
    if python {
        tags.push(ImplementationTag::Python);
    }
    tags
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
