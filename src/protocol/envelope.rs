//! Submission and reply envelopes.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// A claimed submission, as decoded from the `content` payload of
/// `get_submission`.
///
/// The header is kept as raw JSON text so the reply can echo it
/// byte-for-byte; it is never decoded into a typed structure.
#[derive(Debug, Serialize, Deserialize)]
pub struct Submission {
    pub xqueue_header: Box<RawValue>,
    pub xqueue_body: String,
    #[serde(default)]
    pub xqueue_files: Option<serde_json::Value>,
}

impl Clone for Submission {
    fn clone(&self) -> Self {
        Self {
            xqueue_header: self.xqueue_header.to_owned(),
            xqueue_body: self.xqueue_body.clone(),
            xqueue_files: self.xqueue_files.clone(),
        }
    }
}

impl Submission {
    /// The header as the token posted back with the reply.
    ///
    /// A JSON string header unwraps to its contents; anything else is echoed
    /// as its exact JSON text.
    pub fn header_token(&self) -> String {
        match serde_json::from_str::<serde_json::Value>(self.xqueue_header.get()) {
            Ok(serde_json::Value::String(s)) => s,
            _ => self.xqueue_header.get().to_string(),
        }
    }

    /// Decodes the body into its student response and grader payload.
    pub fn body(&self) -> Result<SubmissionBody, serde_json::Error> {
        serde_json::from_str(&self.xqueue_body)
    }
}

/// The decoded `xqueue_body`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionBody {
    pub student_response: String,
    /// Usually a JSON string that itself decodes to [`GraderPayload`]; some
    /// servers inline the object instead, so both are accepted.
    pub grader_payload: serde_json::Value,
}

impl SubmissionBody {
    /// The grader payload as JSON text, whichever shape it arrived in.
    pub fn payload_text(&self) -> String {
        match &self.grader_payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn payload(&self) -> Result<GraderPayload, serde_json::Error> {
        serde_json::from_str(&self.payload_text())
    }
}

/// Options carried in the grader payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraderPayload {
    /// Problem bundle directory, relative to the handler's grader root.
    pub grader: String,
    /// Language tag for localized messages.
    #[serde(default = "default_lang")]
    pub lang: String,
    /// Wall-clock override in seconds for this submission's runs.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Suppress per-test expected/actual output in the reply.
    #[serde(default)]
    pub hide_output: bool,
    /// Short-circuit to full credit without running anything.
    #[serde(default)]
    pub skip_grader: bool,
}

fn default_lang() -> String {
    crate::checker::locale::DEFAULT_LANG.to_string()
}

/// The wire reply posted to `put_result` as `xqueue_body`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// 0 or 1 on the wire.
    pub correct: u8,
    pub score: f64,
    pub msg: String,
}

impl Reply {
    pub fn new(correct: bool, score: f64, msg: impl Into<String>) -> Self {
        Self {
            correct: u8::from(correct),
            score,
            msg: msg.into(),
        }
    }
}
