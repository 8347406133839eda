//! Grading handlers: dispatch, verdict computation, and reply rendering.

pub mod dispatcher;
pub mod ipc;
pub mod registry;
pub mod render;
pub mod verdict;

use async_trait::async_trait;
use thiserror::Error;

use crate::jail::JailError;
use crate::protocol::envelope::{Reply, Submission};

pub use dispatcher::{GraderOptions, JailedGrader};
pub use registry::HandlerRegistry;
pub use verdict::{TestOutcome, Verdict};

/// Errors raised while grading one submission.
///
/// Most submission-scoped failures never surface here: they become an
/// error-verdict reply so the server can move on. What remains is
/// infrastructure trouble the worker logs before continuing.
#[derive(Debug, Error)]
pub enum GraderError {
    #[error("submission envelope invalid: {0}")]
    Envelope(String),

    #[error("jail error: {0}")]
    Jail(#[from] JailError),

    #[error("report rendering failed: {0}")]
    Render(#[from] tera::Error),

    #[error("per-item subprocess failed: {0}")]
    Subprocess(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A configured component that takes a claimed submission and may produce a
/// reply. Handlers hold no per-submission state; anything mutable lives in
/// the jailed child.
#[async_trait]
pub trait Handler: Send + Sync + std::fmt::Debug {
    /// A short name for logs.
    fn name(&self) -> &str;

    /// Grades one submission. `Ok(None)` means this handler has nothing to
    /// post (the worker then tries the next handler in the chain).
    async fn handle(&self, submission: &Submission) -> Result<Option<Reply>, GraderError>;
}
