//! Configuration file support for the ingestion engine.
//!
//! Loads settings from `~/.config/dxcluster/config.toml` on Linux
//! (or platform-appropriate location on other OSes).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::ClusterConfig;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Callsign to use for cluster logins.
    pub callsign: String,

    /// Contact email, used by some dialects' filter commands.
    pub email: Option<String>,

    /// Candidate cluster servers as `host:port`.
    pub servers: Vec<String>,

    /// Path to the DXCC prefix reference table (cty.csv format).
    pub cty_file: PathBuf,

    /// Path to the SQLite spot database.
    pub db_path: PathBuf,

    /// SQLite statement-lock timeout in seconds.
    pub db_busy_timeout: u64,

    /// Write queue capacity in records.
    pub queue_capacity: usize,

    /// Connection timeout in seconds.
    pub connect_timeout: u64,

    /// Login/handshake timeout in seconds.
    pub login_timeout: u64,

    /// Per-filter-command reply timeout in seconds.
    pub command_timeout: u64,

    /// Read timeout for individual lines in seconds.
    pub read_timeout: u64,

    /// Consecutive read timeouts tolerated before reconnecting.
    pub read_retry_budget: u32,

    /// Sleep between read-timeout retries in seconds.
    pub idle_sleep: u64,

    /// Pause between connection attempts in seconds.
    pub retry_pause: u64,

    /// Print statistics every N seconds (0 = never).
    pub stats_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            callsign: "N0CALL".to_string(),
            email: None,
            servers: vec![
                "dxc.w3lpl.net:7373".to_string(),
                "dxc.ve7cc.net:23".to_string(),
                "dxfun.com:8000".to_string(),
            ],
            cty_file: PathBuf::from("cty.csv"),
            db_path: PathBuf::from("dxcluster.db"),
            db_busy_timeout: 5,
            queue_capacity: 1000,
            connect_timeout: 30,
            login_timeout: 30,
            command_timeout: 5,
            read_timeout: 10,
            read_retry_budget: 5,
            idle_sleep: 15,
            retry_pause: 30,
            stats_interval: 300,
        }
    }
}

impl Config {
    /// Load configuration, preferring an explicit path over the default
    /// location.
    ///
    /// An explicit path must exist and parse. Without one, a missing default
    /// file yields the built-in defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read_file(path),
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::read_file(&path),
                _ => Ok(Config::default()),
            },
        }
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in config file: {}", path.display()))
    }

    /// Returns the path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dxcluster/config.toml"))
    }

    /// Validate all configuration settings.
    ///
    /// An empty callsign or server list is startup-fatal: the engine has
    /// nothing to do without them.
    pub fn validate(&self) -> Result<()> {
        if self.callsign.trim().is_empty() {
            anyhow::bail!("callsign must not be empty");
        }
        if self.servers.is_empty() {
            anyhow::bail!("server list must not be empty");
        }
        for server in &self.servers {
            if !server.contains(':') {
                anyhow::bail!("server \"{server}\" is not host:port");
            }
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue capacity must be at least 1");
        }
        Ok(())
    }

    /// Build the cluster client configuration from these settings.
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            servers: self.servers.clone(),
            callsign: self.callsign.clone(),
            email: self.email.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            login_timeout: Duration::from_secs(self.login_timeout),
            command_timeout: Duration::from_secs(self.command_timeout),
            read_timeout: Duration::from_secs(self.read_timeout),
            read_retry_budget: self.read_retry_budget,
            idle_sleep: Duration::from_secs(self.idle_sleep),
            retry_pause: Duration::from_secs(self.retry_pause),
        }
    }
}
