//! The jailed grader: decodes the submission envelope, runs the reference
//! answer and the student code inside the jail, and renders the verdict.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::checker::locale::Catalog;
use crate::checker::report::{CheckerStatus, RunReport, SubmissionStatus};
use crate::checker::UNSUPPORTED_EXIT;
use crate::jail::{JailConfig, JailStatus, JailedRun};
use crate::metrics;
use crate::protocol::envelope::{GraderPayload, Reply, Submission};

use super::render;
use super::verdict::{
    CompareContext, Verdict, MSG_CANT_RUN, MSG_DEFAULT_ERROR, MSG_ERROR_THROWN,
    MSG_MEMORY_LIMIT, MSG_RUN_SOLUTION, MSG_STAFF_SOLUTION, MSG_TIME_LIMIT,
};
use super::{GraderError, Handler};

/// Upper bound for one parent-side `precheck` invocation.
const PRECHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Seeds land in [0, 20000]; the same seed feeds both runs so random draws
/// line up between reference and student.
const SEED_RANGE: std::ops::RangeInclusive<u32> = 0..=20_000;

/// Handler options (the `KWARGS` block of a handler config).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraderOptions {
    /// Root directory all bundle paths resolve under.
    #[serde(default = "default_grader_root")]
    pub grader_root: PathBuf,
    /// Grade each submission in a short-lived child process.
    #[serde(default = "default_true")]
    pub fork_per_item: bool,
    /// Run the reference answer without the uid drop and rlimits.
    #[serde(default)]
    pub trust_reference: bool,
    /// Explicit path to the in-sandbox driver binary; discovered next to
    /// the current executable when unset.
    #[serde(default)]
    pub driver_path: Option<PathBuf>,
}

fn default_grader_root() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_true() -> bool {
    true
}

impl Default for GraderOptions {
    fn default() -> Self {
        Self {
            grader_root: default_grader_root(),
            fork_per_item: true,
            trust_reference: false,
            driver_path: None,
        }
    }
}

/// Why a jailed run produced no usable report.
enum RunFailure {
    TimedOut,
    Signaled(i32),
    Failed(String),
}

/// Grades submissions against problem bundles under a jail.
#[derive(Debug)]
pub struct JailedGrader {
    options: GraderOptions,
    jail: JailConfig,
    driver: PathBuf,
}

impl JailedGrader {
    pub fn new(options: GraderOptions, jail: JailConfig) -> Result<Self, GraderError> {
        let driver = match &options.driver_path {
            Some(path) => path.clone(),
            None => JailedRun::default_driver_path()?,
        };
        Ok(Self {
            options,
            jail,
            driver,
        })
    }

    pub fn options(&self) -> &GraderOptions {
        &self.options
    }

    pub fn jail(&self) -> &JailConfig {
        &self.jail
    }

    /// Grades one submission in-process.
    ///
    /// Anything wrong with the submission itself comes back as an
    /// error-verdict reply; `Err` is reserved for infrastructure trouble.
    pub async fn grade(&self, submission: &Submission) -> Result<Reply, GraderError> {
        let body = match submission.body() {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "Malformed xqueue_body in submission");
                return error_reply(vec![MSG_DEFAULT_ERROR.to_string()]);
            }
        };

        let payload = match body.payload() {
            Ok(payload) => payload,
            Err(err) => {
                metrics::inc_payload_errors();
                // The raw payload goes to the server-side log only.
                debug!(payload = %body.payload_text(), error = %err, "Error parsing grader payload");
                return error_reply(vec![MSG_DEFAULT_ERROR.to_string()]);
            }
        };

        if payload.skip_grader {
            debug!(grader = %payload.grader, "skip_grader set, granting full credit");
            return Ok(render::render_reply(&Verdict::skipped())?);
        }

        let bundle = match self.resolve_bundle(&payload.grader) {
            Ok(bundle) => bundle,
            Err(reason) => {
                error!(grader = %payload.grader, reason = %reason, "Rejecting bundle path");
                return error_reply(vec![MSG_DEFAULT_ERROR.to_string()]);
            }
        };
        let Some(checker_name) = find_by_stem(&bundle, "check") else {
            error!(bundle = %bundle.display(), "Bundle has no checker program");
            return error_reply(vec![MSG_DEFAULT_ERROR.to_string()]);
        };

        let catalog = Catalog::for_bundle(&bundle, &payload.lang);

        let input_errors = self
            .precheck(&bundle, &checker_name, &body.student_response)
            .await;
        if !input_errors.is_empty() {
            return Ok(render::render_reply(&Verdict::errored(input_errors))?);
        }

        let answer = match find_by_stem(&bundle, "answer")
            .map(|name| std::fs::read_to_string(bundle.join(name)))
        {
            Some(Ok(answer)) => answer,
            other => {
                error!(bundle = %bundle.display(), ?other, "Could not read reference answer");
                return error_reply(vec![catalog.gettext(MSG_STAFF_SOLUTION).to_string()]);
            }
        };

        let seed = rand::rng().random_range(SEED_RANGE);
        let wall_clock = self.wall_clock(payload.timeout);
        let runner = JailedRun::new(self.jail.clone(), self.driver.clone());

        // Reference first: its output set validates the student's report.
        let expected = match self
            .run_and_parse(
                &runner,
                &bundle,
                &checker_name,
                &answer,
                seed,
                &payload.lang,
                self.options.trust_reference,
                wall_clock,
            )
            .await
        {
            Ok(report) if report.is_clean() => report,
            Ok(report) => {
                error!(
                    bundle = %bundle.display(),
                    checker_status = %report.checker.status,
                    submission_status = %report.submission.status,
                    exceptions = report.exceptions,
                    "Reference answer did not run cleanly"
                );
                return error_reply(vec![catalog.gettext(MSG_STAFF_SOLUTION).to_string()]);
            }
            Err(failure) => {
                log_run_failure(&bundle, "reference", &failure);
                return error_reply(vec![catalog.gettext(MSG_STAFF_SOLUTION).to_string()]);
            }
        };

        // Student second, always jailed.
        let actual = match self
            .run_and_parse(
                &runner,
                &bundle,
                &checker_name,
                &body.student_response,
                seed,
                &payload.lang,
                false,
                wall_clock,
            )
            .await
        {
            Ok(report) => report,
            Err(RunFailure::TimedOut) => {
                return error_reply(vec![catalog.gettext(MSG_TIME_LIMIT).to_string()]);
            }
            Err(RunFailure::Signaled(signal)) => {
                let message = if signal == libc::SIGXCPU {
                    MSG_TIME_LIMIT
                } else if signal == libc::SIGKILL {
                    MSG_MEMORY_LIMIT
                } else {
                    MSG_CANT_RUN
                };
                return error_reply(vec![catalog.gettext(message).to_string()]);
            }
            Err(failure) => {
                log_run_failure(&bundle, "student", &failure);
                return error_reply(vec![
                    catalog.gettext(MSG_RUN_SOLUTION).to_string(),
                    catalog.gettext(MSG_CANT_RUN).to_string(),
                ]);
            }
        };

        if actual.checker.status != CheckerStatus::Ok {
            error!(
                bundle = %bundle.display(),
                status = %actual.checker.status,
                exception = ?actual.checker.exception,
                "Checker failed during the student run"
            );
            return error_reply(vec![catalog.gettext(MSG_CANT_RUN).to_string()]);
        }

        if actual.submission.status != SubmissionStatus::Ok {
            if actual.submission.status == SubmissionStatus::Caught {
                // Suspicious: the submission swallowed the sentinel.
                warn!(
                    bundle = %bundle.display(),
                    source = %body.student_response,
                    "Suspicious submission caught the end-test sentinel"
                );
            }
            let shown = actual
                .submission
                .exception
                .clone()
                .unwrap_or_else(|| catalog.gettext(MSG_ERROR_THROWN).to_string());
            return error_reply(vec![shown]);
        }

        let ctx = CompareContext {
            interpreter: &self.jail.interpreter,
            bundle: &bundle,
            checker_name: &checker_name,
            catalog: &catalog,
            hide_output: payload.hide_output,
        };
        let verdict = super::verdict::evaluate(&expected, &actual, &ctx).await;
        Ok(render::render_reply(&verdict)?)
    }

    /// Resolves the payload's bundle path under the grader root, rejecting
    /// anything that escapes it.
    fn resolve_bundle(&self, relative: &str) -> Result<PathBuf, String> {
        let root = self
            .options
            .grader_root
            .canonicalize()
            .map_err(|e| format!("grader root unavailable: {e}"))?;
        let bundle = root
            .join(relative)
            .canonicalize()
            .map_err(|e| format!("bundle unavailable: {e}"))?;
        if !bundle.starts_with(&root) {
            return Err("bundle path escapes the grader root".to_string());
        }
        if !bundle.is_dir() {
            return Err("bundle path is not a directory".to_string());
        }
        Ok(bundle)
    }

    /// Asks the checker for input errors before anything runs. Checkers that
    /// exit [`UNSUPPORTED_EXIT`] simply do not implement prechecks.
    async fn precheck(&self, bundle: &Path, checker_name: &str, source: &str) -> Vec<String> {
        let spawned = tokio::process::Command::new(&self.jail.interpreter)
            .arg(checker_name)
            .arg("precheck")
            .current_dir(bundle)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                warn!(error = %err, "Could not spawn precheck, skipping");
                return Vec::new();
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(source.as_bytes()).await;
        }

        let output = match tokio::time::timeout(PRECHECK_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(error = %err, "Precheck failed, skipping");
                return Vec::new();
            }
            Err(_) => {
                warn!("Precheck timed out, skipping");
                return Vec::new();
            }
        };

        match output.status.code() {
            Some(code) if code == UNSUPPORTED_EXIT => Vec::new(),
            Some(0) | Some(1) => String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect(),
            other => {
                warn!(exit = ?other, "Precheck crashed, skipping");
                Vec::new()
            }
        }
    }

    /// Wall-clock bound for one jailed run; the payload may override the
    /// jail's REALTIME limit.
    fn wall_clock(&self, payload_timeout: Option<u64>) -> Duration {
        Duration::from_secs(payload_timeout.unwrap_or(self.jail.limits.realtime).max(1))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_and_parse(
        &self,
        runner: &JailedRun,
        bundle: &Path,
        checker_name: &str,
        source: &str,
        seed: u32,
        lang: &str,
        trusted: bool,
        wall_clock: Duration,
    ) -> Result<RunReport, RunFailure> {
        let outcome = runner
            .run(bundle, checker_name, source, seed, lang, trusted, wall_clock)
            .await
            .map_err(|err| RunFailure::Failed(err.to_string()))?;

        match outcome.status {
            JailStatus::TimedOut => Err(RunFailure::TimedOut),
            JailStatus::Signaled(signal) => Err(RunFailure::Signaled(signal)),
            JailStatus::Exited(0) => serde_json::from_str(outcome.stdout.trim()).map_err(|err| {
                RunFailure::Failed(format!(
                    "unparseable run report ({err}); stdout: {:?}, stderr: {:?}",
                    outcome.stdout, outcome.stderr
                ))
            }),
            JailStatus::Exited(code) => Err(RunFailure::Failed(format!(
                "driver exited with {code}; stderr: {:?}",
                outcome.stderr
            ))),
        }
    }
}

#[async_trait]
impl Handler for JailedGrader {
    fn name(&self) -> &str {
        "jailed"
    }

    async fn handle(&self, submission: &Submission) -> Result<Option<Reply>, GraderError> {
        metrics::inc_submissions();
        let start = Instant::now();

        let result = if self.options.fork_per_item {
            super::ipc::grade_in_subprocess(
                &self.options,
                &self.jail,
                submission,
                self.subprocess_bound(submission),
            )
            .await
        } else {
            self.grade(submission).await
        };

        metrics::observe_grading(start.elapsed());

        match result {
            Ok(reply) => Ok(Some(reply)),
            Err(err) => {
                // The reply must still go out so the server moves on;
                // submissions are never dropped over grader trouble.
                error!(error = %err, "Grading failed, sending error verdict");
                Ok(Some(error_reply(vec![MSG_DEFAULT_ERROR.to_string()])?))
            }
        }
    }
}

impl JailedGrader {
    /// Bound on the per-item child: both runs plus comparison headroom.
    fn subprocess_bound(&self, submission: &Submission) -> Duration {
        let payload_timeout = submission
            .body()
            .ok()
            .and_then(|body| body.payload().ok())
            .and_then(|payload: GraderPayload| payload.timeout);
        let wall = self.wall_clock(payload_timeout);
        wall * 2 + Duration::from_secs(60)
    }
}

fn error_reply(errors: Vec<String>) -> Result<Reply, GraderError> {
    Ok(render::render_reply(&Verdict::errored(errors))?)
}

fn log_run_failure(bundle: &Path, which: &str, failure: &RunFailure) {
    match failure {
        RunFailure::TimedOut => {
            error!(bundle = %bundle.display(), which, "Run hit the wall clock")
        }
        RunFailure::Signaled(signal) => {
            error!(bundle = %bundle.display(), which, signal, "Run killed by signal")
        }
        RunFailure::Failed(detail) => {
            error!(bundle = %bundle.display(), which, detail = %detail, "Run failed")
        }
    }
}

/// Finds the file in `dir` whose stem matches, e.g. `check.py` for "check".
fn find_by_stem(dir: &Path, stem: &str) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            Path::new(name)
                .file_stem()
                .is_some_and(|s| s.to_string_lossy() == stem)
        })
        .collect();
    names.sort();
    names.into_iter().next()
}
