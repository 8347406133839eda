//! Queue protocol: the wire types and HTTP client for the submission server.

pub mod client;
pub mod envelope;

pub use client::{Fetched, ProtocolError, XQueueClient};
pub use envelope::{GraderPayload, Reply, Submission, SubmissionBody};
