//! Per-queue polling worker.
//!
//! One worker owns one HTTP session against one queue and loops strictly
//! sequentially: fetch, process, reply. Shutdown is observed between
//! iterations only; an in-flight grade is allowed to finish and reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::grader::Handler;
use crate::metrics;
use crate::protocol::{Fetched, ProtocolError, Submission, XQueueClient};

/// Consecutive empty polls before the idle interval kicks in.
const IDLE_THRESHOLD: u32 = 3;

/// Lifecycle states of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    LoggedOut,
    LoggingIn,
    Idle,
    Fetching,
    Processing,
    Replying,
    Stopped,
}

/// A single long-lived polling worker.
pub struct QueueWorker {
    id: String,
    client: XQueueClient,
    handlers: Vec<Arc<dyn Handler>>,
    poll_interval: Duration,
    idle_poll_interval: Option<Duration>,
    login_poll_interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
    processing: Arc<AtomicBool>,
    state: WorkerState,
    empty_polls: u32,
}

impl QueueWorker {
    pub fn new(
        id: impl Into<String>,
        client: XQueueClient,
        handlers: Vec<Arc<dyn Handler>>,
        manager: &ManagerConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            handlers,
            poll_interval: manager.poll_interval(),
            idle_poll_interval: manager.idle_poll_interval(),
            login_poll_interval: manager.login_poll_interval(),
            shutdown_rx,
            processing: Arc::new(AtomicBool::new(false)),
            state: WorkerState::LoggedOut,
            empty_polls: 0,
        }
    }

    /// Flag exposed to the supervisor: true while a submission is in flight.
    pub fn processing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.processing)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main loop. Runs until shutdown; never panics over protocol trouble.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, queue = %self.client.queue_name(), "Worker started");

        if !self.login_until_ready().await {
            self.set_state(WorkerState::Stopped);
            info!(worker_id = %self.id, "Worker stopped before login completed");
            return;
        }

        loop {
            if self.should_stop() {
                break;
            }
            self.process_one().await;
        }

        self.set_state(WorkerState::Stopped);
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Retries the login until it succeeds or shutdown arrives. Never gives
    /// up silently.
    async fn login_until_ready(&mut self) -> bool {
        self.set_state(WorkerState::LoggingIn);
        loop {
            match self.client.login().await {
                Ok(()) => {
                    self.set_state(WorkerState::Idle);
                    return true;
                }
                Err(err) => {
                    error!(
                        worker_id = %self.id,
                        error = %err,
                        retry_in = ?self.login_poll_interval,
                        "Login failed, will retry"
                    );
                }
            }
            if self.sleep_or_shutdown(self.login_poll_interval).await {
                return false;
            }
        }
    }

    /// One fetch-process-reply iteration.
    async fn process_one(&mut self) {
        self.set_state(WorkerState::Fetching);
        match self.client.get_submission().await {
            // A request timeout is not a failure: no work this tick, and the
            // timeout itself already paced the loop.
            Err(ProtocolError::Timeout { url }) => {
                debug!(worker_id = %self.id, url = %url, "Fetch timed out, treating as no work");
                self.set_state(WorkerState::Idle);
            }
            Err(err) => {
                error!(worker_id = %self.id, error = %err, "Fetch failed");
                self.set_state(WorkerState::Idle);
                self.sleep_or_shutdown(self.poll_interval).await;
            }
            Ok(Fetched::Nothing(reason)) => {
                debug!(worker_id = %self.id, reason = %reason, "Queue empty");
                self.empty_polls += 1;
                let delay = self.next_delay();
                self.set_state(WorkerState::Idle);
                self.sleep_or_shutdown(delay).await;
            }
            Ok(Fetched::Submission(submission)) => {
                self.empty_polls = 0;
                self.processing.store(true, Ordering::SeqCst);
                self.set_state(WorkerState::Processing);
                self.handle_submission(submission).await;
                self.processing.store(false, Ordering::SeqCst);
                self.set_state(WorkerState::Idle);
            }
        }
    }

    /// Runs the handler chain; the first handler producing a reply posts it.
    /// At most one reply goes out per fetched submission.
    async fn handle_submission(&mut self, submission: Submission) {
        let header = submission.header_token();
        for handler in &self.handlers {
            let handler_name = handler.name().to_string();
            match handler.handle(&submission).await {
                Ok(None) => continue,
                Ok(Some(reply)) => {
                    self.set_state(WorkerState::Replying);
                    match self.client.put_result(&header, &reply).await {
                        Ok(()) => {
                            metrics::inc_replies();
                            debug!(
                                worker_id = %self.id,
                                handler = handler_name,
                                correct = reply.correct,
                                score = reply.score,
                                "Reply posted"
                            );
                        }
                        Err(err) => {
                            // Logged and dropped; the submission is never
                            // re-fetched over a failed post.
                            error!(worker_id = %self.id, error = %err, "Failed to post reply");
                        }
                    }
                    return;
                }
                Err(err) => {
                    error!(
                        worker_id = %self.id,
                        handler = handler_name,
                        error = %err,
                        "Handler failed, trying next"
                    );
                }
            }
        }
        warn!(worker_id = %self.id, "No handler produced a reply");
    }

    /// Poll delay, switching to the idle interval after enough consecutive
    /// empty fetches.
    fn next_delay(&self) -> Duration {
        if self.empty_polls >= IDLE_THRESHOLD {
            self.idle_poll_interval.unwrap_or(self.poll_interval)
        } else {
            self.poll_interval
        }
    }

    /// Sleeps, returning true when shutdown arrived instead.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown_rx.recv() => true,
        }
    }

    fn should_stop(&mut self) -> bool {
        match self.shutdown_rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => true,
            Err(broadcast::error::TryRecvError::Lagged(_)) => true,
            Err(broadcast::error::TryRecvError::Empty) => false,
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            debug!(worker_id = %self.id, from = ?self.state, to = ?state, "State change");
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_with(manager: ManagerConfig) -> (QueueWorker, broadcast::Sender<()>) {
        let (tx, rx) = broadcast::channel(1);
        let client = XQueueClient::new(
            "http://localhost:1",
            "q",
            None,
            None,
            Duration::from_millis(100),
            false,
        )
        .unwrap();
        (QueueWorker::new("q-0", client, Vec::new(), &manager, rx), tx)
    }

    #[test]
    fn test_idle_backoff_kicks_in_after_three_empty_polls() {
        let manager: ManagerConfig =
            serde_yaml::from_str("POLL_INTERVAL: 1\nIDLE_POLL_INTERVAL: 30").unwrap();
        let (mut worker, _tx) = worker_with(manager);

        assert_eq!(worker.next_delay(), Duration::from_secs(1));
        worker.empty_polls = 2;
        assert_eq!(worker.next_delay(), Duration::from_secs(1));
        worker.empty_polls = 3;
        assert_eq!(worker.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_idle_backoff_disabled_without_interval() {
        let (mut worker, _tx) = worker_with(ManagerConfig::default());
        worker.empty_polls = 10;
        assert_eq!(worker.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_flag_observed() {
        let (mut worker, tx) = worker_with(ManagerConfig::default());
        assert!(!worker.should_stop());
        tx.send(()).unwrap();
        assert!(worker.should_stop());
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_shutdown() {
        let (mut worker, tx) = worker_with(ManagerConfig::default());
        tx.send(()).unwrap();
        let interrupted = worker.sleep_or_shutdown(Duration::from_secs(60)).await;
        assert!(interrupted);
    }
}
