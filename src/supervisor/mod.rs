//! The supervisor: builds workers from the configuration document, watches
//! their liveness, hot-reloads on config change, and drives shutdown.
//!
//! Failure policy is fail-fast: a dead worker silently loses throughput, so
//! any worker death surfaces as a process exit and the orchestrator above
//! restarts us.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ConfigError, ManagerConfig, WatcherConfig};
use crate::grader::HandlerRegistry;
use crate::jail::JailRegistry;
use crate::protocol::{ProtocolError, XQueueClient};
use crate::worker::QueueWorker;

/// Errors that end the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("worker for queue '{0}' died")]
    WorkerDied(String),

    #[error("configuration file {0} disappeared")]
    ConfigVanished(PathBuf),

    #[error("failed to join worker tasks: {0}")]
    JoinFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A spawned worker as the supervisor tracks it.
struct WorkerHandle {
    id: String,
    queue_name: String,
    handle: JoinHandle<()>,
    processing: Arc<AtomicBool>,
}

/// Owns the worker fleet for one configuration file.
pub struct Supervisor {
    config_path: PathBuf,
    manager: ManagerConfig,
    registry: HandlerRegistry,
    jails: Arc<JailRegistry>,
    pending: Vec<QueueWorker>,
    running: Vec<WorkerHandle>,
    shutdown_tx: broadcast::Sender<()>,
    last_configured: Option<SystemTime>,
}

impl Supervisor {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config_path: config_path.into(),
            manager: ManagerConfig::default(),
            registry: HandlerRegistry::builtin(),
            jails: Arc::new(JailRegistry::new()),
            pending: Vec::new(),
            running: Vec::new(),
            shutdown_tx,
            last_configured: None,
        }
    }

    /// Loads the config file if its modification time advanced and rebuilds
    /// the (unstarted) worker set. Returns whether anything was loaded.
    pub fn configure_from_file(&mut self) -> Result<bool, SupervisorError> {
        if !self.did_config_change()? {
            return Ok(false);
        }
        if self.last_configured.is_some() {
            info!(config = %self.config_path.display(), "Config file changed");
        }
        let mtime = std::fs::metadata(&self.config_path)?.modified()?;
        let config = WatcherConfig::load(&self.config_path)?;
        self.manager = config.manager.clone();
        self.configure(&config)?;
        self.last_configured = Some(mtime);
        Ok(true)
    }

    /// Builds `CONNECTIONS` workers per configured queue.
    fn configure(&mut self, config: &WatcherConfig) -> Result<(), SupervisorError> {
        self.pending.clear();
        for client_config in &config.clients {
            let mut handlers = Vec::new();
            for handler_config in &client_config.handlers {
                handlers.push(self.registry.build(handler_config, &self.jails)?);
            }
            for i in 0..client_config.connections.max(1) {
                let client = XQueueClient::new(
                    &client_config.server,
                    &client_config.queue_name,
                    client_config.auth.clone(),
                    self.manager.http_basic_auth.clone(),
                    self.manager.requests_timeout(),
                    self.manager.follow_client_redirects,
                )?;
                let worker = QueueWorker::new(
                    format!("{}-{}", client_config.queue_name, i),
                    client,
                    handlers.clone(),
                    &self.manager,
                    self.shutdown_tx.subscribe(),
                );
                self.pending.push(worker);
            }
        }
        Ok(())
    }

    /// Spawns every built worker on its own task. Never blocks on them.
    pub fn start(&mut self) {
        for worker in self.pending.drain(..) {
            let id = worker.id().to_string();
            let queue_name = worker.id().rsplit_once('-').map_or_else(
                || worker.id().to_string(),
                |(queue, _)| queue.to_string(),
            );
            info!(worker_id = %id, "Starting worker");
            let processing = worker.processing_flag();
            let handle = tokio::spawn(worker.run());
            self.running.push(WorkerHandle {
                id,
                queue_name,
                handle,
                processing,
            });
        }
    }

    /// Number of workers currently spawned.
    pub fn worker_count(&self) -> usize {
        self.running.len()
    }

    /// Monitor loop.
    ///
    /// Each tick checks worker liveness and the config file's modification
    /// time. Returns `Ok` after a clean shutdown (SIGTERM, or `quit_if_empty`
    /// with nothing configured); any worker death is an error. A vanished
    /// config file is tolerated for exactly one tick, guarding against
    /// editor-rename races.
    pub async fn wait(&mut self, quit_if_empty: bool) -> Result<(), SupervisorError> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut config_disappeared = false;

        loop {
            if self.running.is_empty() {
                warn!(config = %self.config_path.display(), "No clients configured");
                if quit_if_empty {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.manager.poll_time()) => {}
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    return self.shutdown().await;
                }
            }

            match self.did_config_change() {
                Ok(true) => {
                    self.reload().await?;
                    config_disappeared = false;
                }
                Ok(false) => {
                    config_disappeared = false;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    if config_disappeared {
                        error!(config = %self.config_path.display(), "Config file disappeared, exiting");
                        self.shutdown().await?;
                        return Err(SupervisorError::ConfigVanished(self.config_path.clone()));
                    }
                    // The file may be mid-rename; give it one more tick.
                    config_disappeared = true;
                    error!(config = %self.config_path.display(), "Config file disappeared, retrying");
                }
                Err(err) => return Err(err.into()),
            }

            if let Some(dead) = self.running.iter().find(|w| w.handle.is_finished()) {
                let queue_name = dead.queue_name.clone();
                let id = dead.id.clone();
                error!(worker_id = %id, queue = %queue_name, "Worker died");
                self.shutdown().await?;
                return Err(SupervisorError::WorkerDied(queue_name));
            }
        }
    }

    /// Atomic stop-then-reconfigure-then-start.
    pub async fn reload(&mut self) -> Result<(), SupervisorError> {
        self.stop_workers().await?;
        info!(config = %self.config_path.display(), "Reloading config");
        self.configure_from_file()?;
        self.start();
        Ok(())
    }

    /// Requests every worker to stop and joins them. Idempotent.
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        info!("Shutting down");
        self.stop_workers().await?;
        info!("Shutdown complete");
        Ok(())
    }

    async fn stop_workers(&mut self) -> Result<(), SupervisorError> {
        // Ignore send errors: all workers may already be gone.
        let _ = self.shutdown_tx.send(());

        let mut join_failure = None;
        while let Some(worker) = self.running.pop() {
            if worker.processing.load(Ordering::SeqCst) {
                info!(worker_id = %worker.id, "Waiting for in-flight submission");
            }
            if let Err(err) = worker.handle.await {
                error!(worker_id = %worker.id, error = %err, "Joining worker failed");
                join_failure = Some(err.to_string());
            } else {
                info!(worker_id = %worker.id, "Worker done");
            }
        }

        match join_failure {
            Some(reason) => Err(SupervisorError::JoinFailure(reason)),
            None => Ok(()),
        }
    }

    /// Whether the config file's mtime advanced past the last load.
    fn did_config_change(&self) -> io::Result<bool> {
        let mtime = std::fs::metadata(&self.config_path)?.modified()?;
        Ok(match self.last_configured {
            None => true,
            Some(last) => mtime > last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &std::path::Path, contents: &str) -> PathBuf {
        let path = dir.join("config.yml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    const ECHO_CONFIG: &str = r#"
MANAGER:
  POLL_TIME: 1
  REQUESTS_TIMEOUT: 0.2
CLIENTS:
  - QUEUE_NAME: test-queue
    SERVER: http://127.0.0.1:1
    CONNECTIONS: 2
    HANDLERS:
      - HANDLER: echo
"#;

    #[tokio::test]
    async fn test_configure_builds_connection_count() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), ECHO_CONFIG);

        let mut supervisor = Supervisor::new(&path);
        assert!(supervisor.configure_from_file().unwrap());
        assert_eq!(supervisor.pending.len(), 2);

        // Unchanged file: no reconfigure.
        assert!(!supervisor.configure_from_file().unwrap());
    }

    #[tokio::test]
    async fn test_unknown_handler_fails_configuration() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(
            dir.path(),
            "CLIENTS:\n  - QUEUE_NAME: q\n    HANDLERS:\n      - HANDLER: bogus\n",
        );

        let mut supervisor = Supervisor::new(&path);
        let err = supervisor.configure_from_file().unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Config(ConfigError::UnknownHandler(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_quits_when_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), "MANAGER:\n  POLL_TIME: 1\n");

        let mut supervisor = Supervisor::new(&path);
        supervisor.configure_from_file().unwrap();
        supervisor.start();
        assert_eq!(supervisor.worker_count(), 0);

        supervisor.wait(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_death_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), ECHO_CONFIG);

        let mut supervisor = Supervisor::new(&path);
        supervisor.configure_from_file().unwrap();

        // A worker that exits immediately stands in for a crash.
        supervisor.running.push(WorkerHandle {
            id: "dead-0".to_string(),
            queue_name: "dead".to_string(),
            handle: tokio::spawn(async {}),
            processing: Arc::new(AtomicBool::new(false)),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let err = supervisor.wait(false).await.unwrap_err();
        assert!(matches!(err, SupervisorError::WorkerDied(queue) if queue == "dead"));
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), ECHO_CONFIG);

        let mut supervisor = Supervisor::new(&path);
        supervisor.configure_from_file().unwrap();
        supervisor.start();
        assert_eq!(supervisor.worker_count(), 2);

        supervisor.shutdown().await.unwrap();
        assert_eq!(supervisor.worker_count(), 0);
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(dir.path(), ECHO_CONFIG);

        let mut supervisor = Supervisor::new(&path);
        supervisor.configure_from_file().unwrap();
        supervisor.start();
        assert_eq!(supervisor.worker_count(), 2);

        // Rewrite with one connection and a bumped mtime.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        write_config(
            dir.path(),
            "MANAGER:\n  POLL_TIME: 1\nCLIENTS:\n  - QUEUE_NAME: q\n    SERVER: http://127.0.0.1:1\n    HANDLERS:\n      - HANDLER: echo\n",
        );

        supervisor.reload().await.unwrap();
        assert_eq!(supervisor.worker_count(), 1);
    }
}
