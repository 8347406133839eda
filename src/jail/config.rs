//! Jail configuration and the process-wide jail registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Resource limits applied to a jailed child.
///
/// CPU, VMEM and FSIZE map to rlimits in the child; REALTIME is the
/// wall-clock bound enforced by the parent with a kill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct JailLimits {
    /// CPU seconds.
    pub cpu: u64,
    /// Address-space bytes.
    pub vmem: u64,
    /// Largest file the child may create, in bytes.
    pub fsize: u64,
    /// Wall-clock seconds before the parent kills the child.
    pub realtime: u64,
}

impl Default for JailLimits {
    fn default() -> Self {
        Self {
            cpu: 1,
            vmem: 512 * 1024 * 1024,
            fsize: 1024 * 1024,
            realtime: 3,
        }
    }
}

/// One named jail: an interpreter plus the identity and limits to run it
/// under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JailConfig {
    /// Registry name referenced by handler configs.
    pub name: String,
    /// Interpreter executed inside the jail by the driver.
    pub interpreter: PathBuf,
    /// Sandbox account for the uid drop; `None` runs as the current user
    /// with limits only.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub limits: JailLimits,
}

/// Insert-only map of jail name to configuration.
///
/// Built once at supervisor startup and shared with every handler. A reload
/// may add new names; re-registering an existing name is ignored so a
/// running worker never sees its interpreter swapped out from under it.
#[derive(Debug, Default)]
pub struct JailRegistry {
    inner: Mutex<HashMap<String, JailConfig>>,
}

impl JailRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a jail. Returns false (and keeps the first registration)
    /// when the name is already taken.
    pub fn register(&self, config: JailConfig) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.contains_key(&config.name) {
            warn!(jail = %config.name, "Jail already registered, keeping existing configuration");
            return false;
        }
        info!(
            jail = %config.name,
            interpreter = %config.interpreter.display(),
            user = config.user.as_deref().unwrap_or("<current>"),
            "Registered jail"
        );
        inner.insert(config.name.clone(), config);
        true
    }

    pub fn get(&self, name: &str) -> Option<JailConfig> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = inner.keys().cloned().collect();
        names.sort();
        names
    }
}
