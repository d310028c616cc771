use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// What the acceptor does when `accept` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AcceptErrorPolicy {
    /// Log transient failures and keep accepting; stop only on listener faults.
    #[default]
    Resilient,
    /// Stop the server on the first accept failure of any kind.
    FailFast,
}

/// Server settings, read from an optional JSON file and overridden by flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Seconds a session may wait for a complete line before it is closed.
    pub idle_timeout_secs: u64,
    pub accept_errors: AcceptErrorPolicy,
    /// Seconds between session statistics reports; 0 disables them.
    pub stats_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            idle_timeout_secs: 5,
            accept_errors: AcceptErrorPolicy::Resilient,
            stats_interval_secs: 5,
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_secs == 0 {
            bail!("idle_timeout_secs must be at least 1");
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Line-oriented in-memory key-value server", long_about = None)]
pub struct Cli {
    /// JSON configuration file; flags below take precedence over it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    #[arg(long, value_enum)]
    pub accept_errors: Option<AcceptErrorPolicy>,

    #[arg(long)]
    pub stats_interval_secs: Option<u64>,
}

impl Cli {
    pub fn resolve(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => load(path)?,
            None => Config::default(),
        };

        if let Some(host) = self.host {
            cfg.host = host;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(secs) = self.idle_timeout_secs {
            cfg.idle_timeout_secs = secs;
        }
        if let Some(policy) = self.accept_errors {
            cfg.accept_errors = policy;
        }
        if let Some(secs) = self.stats_interval_secs {
            cfg.stats_interval_secs = secs;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Reads and deserializes a JSON config file. Missing fields keep their defaults.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let cfg: Config = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse config file {:?}", path))?;
    cfg.validate()
        .with_context(|| format!("Invalid config file {:?}", path))?;
    Ok(cfg)
}
