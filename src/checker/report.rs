//! The structured result of one in-sandbox execution.

use serde::{Deserialize, Serialize};

/// Outcome of loading and interrogating the checker program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckerStatus {
    /// Checker loaded and enumerated its tests.
    Ok,
    /// Checker failed to load or crashed while driving tests.
    Error,
    /// Checker was never reached.
    Notrun,
}

/// Outcome of loading and exercising the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Submission loaded cleanly.
    Ok,
    /// Submission failed to load.
    Error,
    /// Submission swallowed the end-test sentinel with a blanket handler.
    Caught,
    /// Submission was never reached.
    Notrun,
}

impl std::fmt::Display for CheckerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckerStatus::Ok => write!(f, "ok"),
            CheckerStatus::Error => write!(f, "error"),
            CheckerStatus::Notrun => write!(f, "notrun"),
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionStatus::Ok => write!(f, "ok"),
            SubmissionStatus::Error => write!(f, "error"),
            SubmissionStatus::Caught => write!(f, "caught"),
            SubmissionStatus::Notrun => write!(f, "notrun"),
        }
    }
}

/// Checker-side report: status plus captured load output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerSide {
    pub status: CheckerStatus,
    /// Load-time stdout of the checker.
    #[serde(default)]
    pub stdout: String,
    /// Formatted failure detail; full context, this is staff code.
    #[serde(default)]
    pub exception: Option<String>,
}

/// Submission-side report: status plus captured load output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionSide {
    pub status: SubmissionStatus,
    /// Load-time stdout of the submission.
    #[serde(default)]
    pub stdout: String,
    /// Scrubbed traceback, safe to show to the learner.
    #[serde(default)]
    pub exception: Option<String>,
}

/// One test as declared by the checker's `tests` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDescriptor {
    /// Stable name used to address the test in `run` and `compare`.
    pub name: String,
    pub short_description: String,
    #[serde(default)]
    pub detailed_description: String,
}

/// One executed test: descriptions plus everything it printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub short_description: String,
    #[serde(default)]
    pub detailed_description: String,
    /// Captured stdout, trailing-newline terminated, with any scrubbed
    /// exception appended.
    pub output: String,
}

/// The full report emitted by the in-sandbox driver as one JSON object.
///
/// The `results` sequence has exactly one entry per test the checker
/// declared, in declaration order; for a fixed seed the report is
/// byte-identical across runs (modulo submission nondeterminism).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub checker: CheckerSide,
    pub submission: SubmissionSide,
    pub results: Vec<TestRecord>,
    /// Number of exceptions observed across loading and test runs.
    pub exceptions: u32,
}

impl RunReport {
    /// A report for an execution that never got anywhere.
    pub fn notrun() -> Self {
        Self {
            checker: CheckerSide {
                status: CheckerStatus::Notrun,
                stdout: String::new(),
                exception: None,
            },
            submission: SubmissionSide {
                status: SubmissionStatus::Notrun,
                stdout: String::new(),
                exception: None,
            },
            results: Vec::new(),
            exceptions: 0,
        }
    }

    /// True when both sides ran cleanly and nothing threw.
    pub fn is_clean(&self) -> bool {
        self.checker.status == CheckerStatus::Ok
            && self.submission.status == SubmissionStatus::Ok
            && self.exceptions == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notrun_report() {
        let report = RunReport::notrun();
        assert_eq!(report.checker.status, CheckerStatus::Notrun);
        assert_eq!(report.submission.status, SubmissionStatus::Notrun);
        assert!(report.results.is_empty());
        assert!(!report.is_clean());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SubmissionStatus::Caught).unwrap(),
            "\"caught\""
        );
        assert_eq!(
            serde_json::to_string(&CheckerStatus::Notrun).unwrap(),
            "\"notrun\""
        );
    }

    #[test]
    fn test_report_round_trip() {
        let report = RunReport {
            checker: CheckerSide {
                status: CheckerStatus::Ok,
                stdout: "loaded\n".to_string(),
                exception: None,
            },
            submission: SubmissionSide {
                status: SubmissionStatus::Ok,
                stdout: String::new(),
                exception: None,
            },
            results: vec![TestRecord {
                short_description: "adds".to_string(),
                detailed_description: "adds two numbers".to_string(),
                output: "3\n".to_string(),
            }],
            exceptions: 0,
        };

        let json = serde_json::to_string(&report).unwrap();
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_clean());
        assert_eq!(parsed.results, report.results);
    }
}
