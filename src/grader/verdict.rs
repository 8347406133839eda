//! The verdict engine: aligns reference and student run reports, compares
//! per-test outputs through the checker, and computes the score.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::checker::locale::Catalog;
use crate::checker::report::RunReport;
use crate::checker::END_TEST_EXIT;

/// Per-test output cap, bytes. Applied before comparison and before display
/// so a learner never sees a mismatch caused by display truncation.
pub const OUTPUT_LIMIT: usize = 5000;

/// Marker appended to capped output.
pub const TRUNCATION_SENTINEL: &str = "...OUTPUT TRUNCATED";

/// How long one `compare` invocation may take; comparisons are pure
/// functions over two strings and should be instant.
const COMPARE_TIMEOUT: Duration = Duration::from_secs(10);

pub const MSG_STAFF_SOLUTION: &str =
    "There was a problem running the staff solution (Staff debug: E1).";
pub const MSG_RUN_SOLUTION: &str =
    "There was a problem running your solution (Staff debug: E2).";
pub const MSG_CANT_RUN: &str = "We couldn't run your solution (Staff debug: E3).";
pub const MSG_ERROR_THROWN: &str = "There was an error thrown while running your solution.";
pub const MSG_MISMATCHED_COUNTS: &str =
    "Something went wrong: different numbers of tests ran for your code and for our reference code.";
pub const MSG_MISMATCHED_TESTS: &str = "Something went wrong: tests don't match up.";
pub const MSG_DEFAULT_ERROR: &str = "There was a problem while running your code (Staff debug: E4). \
Please contact the course staff for assistance.";
pub const MSG_TIME_LIMIT: &str = "Your code did not finish within the time limit.";
pub const MSG_MEMORY_LIMIT: &str = "Your code exceeded the memory limit.";

/// One aligned, compared test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub short_description: String,
    pub detailed_description: String,
    pub correct: bool,
    pub expected_output: String,
    pub actual_output: String,
}

/// The final grading outcome for one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub correct: bool,
    pub score: f64,
    pub tests: Vec<TestOutcome>,
    pub errors: Vec<String>,
}

impl Verdict {
    /// A verdict that never got to run any tests.
    pub fn errored(errors: Vec<String>) -> Self {
        Self {
            correct: false,
            score: 0.0,
            tests: Vec::new(),
            errors,
        }
    }

    /// Full credit without running anything (the skip short-circuit).
    pub fn skipped() -> Self {
        Self {
            correct: true,
            score: 1.0,
            tests: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Everything `evaluate` needs to ask the checker for comparisons.
pub struct CompareContext<'a> {
    pub interpreter: &'a Path,
    pub bundle: &'a Path,
    pub checker_name: &'a str,
    pub catalog: &'a Catalog,
    pub hide_output: bool,
}

/// Caps one test output at [`OUTPUT_LIMIT`] bytes.
///
/// Idempotent: an already-capped string passes through unchanged, so the
/// sentinel appears at most once.
pub fn truncate_output(out: &str) -> String {
    if out.len() <= OUTPUT_LIMIT {
        return out.to_string();
    }
    if out.ends_with(TRUNCATION_SENTINEL) && out.len() <= OUTPUT_LIMIT + TRUNCATION_SENTINEL.len()
    {
        return out.to_string();
    }
    let mut cut = OUTPUT_LIMIT;
    while !out.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &out[..cut], TRUNCATION_SENTINEL)
}

/// Aligns the two reports and produces the verdict.
///
/// Preconditions checked here: equal-length result vectors with matching
/// short descriptions at every index. A violation yields an errored verdict
/// with an opaque message; the detail goes to the server-side log only.
pub async fn evaluate(
    expected: &RunReport,
    actual: &RunReport,
    ctx: &CompareContext<'_>,
) -> Verdict {
    if expected.results.len() != actual.results.len() {
        error!(
            expected = expected.results.len(),
            actual = actual.results.len(),
            "Reference and student runs produced different test counts"
        );
        return Verdict::errored(vec![ctx
            .catalog
            .gettext(MSG_MISMATCHED_COUNTS)
            .to_string()]);
    }

    let mut tests = Vec::new();
    let mut corrects: Vec<bool> = Vec::new();

    for (exp, act) in expected.results.iter().zip(actual.results.iter()) {
        if exp.short_description != act.short_description {
            error!(
                expected = %exp.short_description,
                actual = %act.short_description,
                "Test descriptions do not line up"
            );
            return Verdict::errored(vec![ctx
                .catalog
                .gettext(MSG_MISMATCHED_TESTS)
                .to_string()]);
        }

        // Cap before comparing so comparison and display see the same bytes.
        let mut actual_output = truncate_output(&act.output);
        let correct = match compare_outputs(ctx, &exp.short_description, &exp.output, &actual_output)
            .await
        {
            Comparison::Correct => true,
            Comparison::Incorrect => false,
            Comparison::EndTest(message) => {
                actual_output.push('\n');
                actual_output.push_str(&format!(
                    "*** {}: {} ***",
                    ctx.catalog.gettext("ERROR"),
                    message
                ));
                false
            }
            Comparison::CheckerFailed(detail) => {
                error!(test = %exp.short_description, detail = %detail, "Checker comparison failed");
                return Verdict::errored(vec![ctx
                    .catalog
                    .gettext(MSG_MISMATCHED_TESTS)
                    .to_string()]);
            }
        };
        corrects.push(correct);

        if !ctx.hide_output {
            tests.push(TestOutcome {
                short_description: exp.short_description.clone(),
                detailed_description: exp.detailed_description.clone(),
                correct,
                expected_output: exp.output.clone(),
                actual_output,
            });
        }
    }

    let n = corrects.len();
    let k = corrects.iter().filter(|c| **c).count();
    let mut errors = Vec::new();
    if n == 0 {
        // Nothing ran and nothing complained: synthesize the staff-contact
        // message rather than reporting a silent zero.
        errors.push(ctx.catalog.gettext(MSG_DEFAULT_ERROR).to_string());
    }

    Verdict {
        correct: n > 0 && k == n,
        score: if n > 0 { k as f64 / n as f64 } else { 0.0 },
        tests,
        errors,
    }
}

enum Comparison {
    Correct,
    Incorrect,
    /// The checker ended the comparison with the sentinel; the payload is
    /// its message for the learner.
    EndTest(String),
    CheckerFailed(String),
}

/// Asks the checker to compare one expected/actual pair.
async fn compare_outputs(
    ctx: &CompareContext<'_>,
    test_name: &str,
    expected: &str,
    actual: &str,
) -> Comparison {
    let payload = json!({ "expected": expected, "actual": actual }).to_string();

    let spawned = tokio::process::Command::new(ctx.interpreter)
        .arg(ctx.checker_name)
        .arg("compare")
        .arg(test_name)
        .current_dir(ctx.bundle)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => return Comparison::CheckerFailed(format!("could not spawn checker: {err}")),
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(payload.as_bytes()).await {
            warn!(error = %err, "Could not feed comparison input");
        }
        drop(stdin);
    }

    let output = match tokio::time::timeout(COMPARE_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Comparison::CheckerFailed(err.to_string()),
        Err(_) => return Comparison::CheckerFailed("comparison timed out".to_string()),
    };

    match output.status.code() {
        Some(0) => Comparison::Correct,
        Some(1) => Comparison::Incorrect,
        Some(code) if code == END_TEST_EXIT => {
            let message = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
            Comparison::EndTest(message)
        }
        other => Comparison::CheckerFailed(format!(
            "comparison exited with {:?}: {}",
            other,
            String::from_utf8_lossy(&output.stderr)
        )),
    }
}
