//! The configuration document.
//!
//! A single YAML (or JSON) file with three top-level keys: `MANAGER` for the
//! supervisor and polling knobs, `CLIENTS` for the queues to watch, and
//! `LOGGING`, accepted for compatibility but opaque to the core (the
//! `tracing` subscriber owns log output).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::grader::GraderOptions;
use crate::jail::{JailConfig, JailLimits};

/// Errors raised while loading or validating the configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("unknown handler '{0}' (not present in the handler registry)")]
    UnknownHandler(String),

    #[error("handler '{handler}' references unregistered jail '{jail}'")]
    UnknownJail { handler: String, jail: String },

    #[error("handler '{0}' requires a CODEJAIL block")]
    MissingJail(String),

    #[error("handler '{handler}' could not be constructed: {reason}")]
    HandlerInit { handler: String, reason: String },
}

/// Supervisor and polling knobs (the `MANAGER` block).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct ManagerConfig {
    /// Optional HTTP Basic pair sent on every request, independent of the
    /// form login.
    pub http_basic_auth: Option<(String, String)>,
    /// Supervisor monitor tick, seconds.
    pub poll_time: u64,
    /// Per-request timeout, seconds.
    pub requests_timeout: f64,
    /// Sleep between polls when a fetch comes back empty, seconds.
    pub poll_interval: u64,
    /// Sleep after three consecutive empty polls, seconds; 0 disables.
    pub idle_poll_interval: u64,
    /// Retry interval while the login endpoint refuses us, seconds.
    pub login_poll_interval: u64,
    /// Follow HTTP redirects instead of treating them as session expiry.
    pub follow_client_redirects: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            http_basic_auth: None,
            poll_time: 10,
            requests_timeout: 1.0,
            poll_interval: 1,
            idle_poll_interval: 0,
            login_poll_interval: 5,
            follow_client_redirects: false,
        }
    }
}

impl ManagerConfig {
    pub fn requests_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.requests_timeout)
    }

    pub fn poll_time(&self) -> Duration {
        Duration::from_secs(self.poll_time)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn idle_poll_interval(&self) -> Option<Duration> {
        (self.idle_poll_interval > 0).then(|| Duration::from_secs(self.idle_poll_interval))
    }

    pub fn login_poll_interval(&self) -> Duration {
        Duration::from_secs(self.login_poll_interval)
    }
}

/// One watched queue (an entry of the `CLIENTS` list).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ClientConfig {
    pub queue_name: String,
    #[serde(default = "default_server")]
    pub server: String,
    /// Form-login credential pair; omitted means login is skipped.
    #[serde(default)]
    pub auth: Option<(String, String)>,
    /// Number of concurrent workers polling this queue.
    #[serde(default = "default_connections")]
    pub connections: u32,
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

fn default_server() -> String {
    "http://localhost:18040".to_string()
}

fn default_connections() -> u32 {
    1
}

/// One handler installed into a queue's workers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct HandlerConfig {
    /// Registry name of the handler, e.g. `"jailed"`.
    pub handler: String,
    #[serde(default)]
    pub kwargs: GraderOptions,
    /// Jail to register and grade under; required by the jailed handler.
    #[serde(default)]
    pub codejail: Option<JailSpec>,
}

/// The `CODEJAIL` block of a handler.
#[derive(Debug, Clone, Deserialize)]
pub struct JailSpec {
    pub name: String,
    /// Interpreter executed inside the jail.
    pub bin_path: PathBuf,
    /// Sandbox account; defaults to the current user (limits only).
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub limits: JailLimits,
}

impl JailSpec {
    pub fn to_jail_config(&self) -> JailConfig {
        JailConfig {
            name: self.name.clone(),
            interpreter: self.bin_path.clone(),
            user: self.user.clone(),
            limits: self.limits.clone(),
        }
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WatcherConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
    /// Opaque; accepted so existing deployments keep their documents.
    #[serde(default)]
    pub logging: Option<serde_yaml::Value>,
}

impl WatcherConfig {
    /// Loads the document from a YAML or JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Total worker count the document asks for (Σ CONNECTIONS).
    pub fn total_connections(&self) -> usize {
        self.clients
            .iter()
            .map(|c| c.connections.max(1) as usize)
            .sum()
    }
}
