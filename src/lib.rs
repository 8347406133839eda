//! gradewatch: a pull-based grading worker pool.
//!
//! Polls named queues on a submission server, claims student submissions,
//! runs them (plus a reference answer) inside a resource-limited jail,
//! compares outputs through a problem-specific checker, and posts a
//! structured verdict back.

// Core modules
pub mod checker;
pub mod cli;
pub mod config;
pub mod grader;
pub mod jail;
pub mod metrics;
pub mod protocol;
pub mod supervisor;
pub mod worker;

// Re-export commonly used error types
pub use config::ConfigError;
pub use grader::GraderError;
pub use jail::JailError;
pub use protocol::ProtocolError;
pub use supervisor::SupervisorError;
