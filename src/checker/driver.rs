//! The in-sandbox driver.
//!
//! Runs as the `checkrun` binary inside the jail work directory. It drives
//! the checker through its `tests`, `load` and `run` subcommands, captures
//! per-test stdout, scrubs submission tracebacks, accounts for the end-test
//! sentinel, and prints one [`RunReport`] JSON object on stdout. All failure
//! modes are reported in-band; the driver itself exits 0.

use std::io;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use clap::Parser;

use super::locale::{Catalog, DEFAULT_LANG};
use super::report::{
    CheckerStatus, RunReport, SubmissionStatus, TestDescriptor, TestRecord,
};
use super::scrub::scrub_traceback;
use super::{END_TESTS_TRAILER, END_TEST_EXIT, MSG_BARE_EXCEPT};

/// Seed handed to the checker's private RNG.
pub const SEED_ENV: &str = "GRADE_SEED";
/// Seed handed to the problem's global RNG (always seed + 1).
pub const SEED_GLOBAL_ENV: &str = "GRADE_SEED_GLOBAL";
/// Language tag forwarded to the checker.
pub const LANG_ENV: &str = "GRADE_LANG";

/// Arguments of the `checkrun` binary.
#[derive(Debug, Parser)]
#[command(name = "checkrun")]
#[command(about = "Run a checker against a submission and print a JSON report")]
pub struct DriverArgs {
    /// Interpreter used to execute the checker.
    #[arg(long)]
    pub interpreter: PathBuf,

    /// Language tag for localized messages.
    #[arg(long, default_value = DEFAULT_LANG)]
    pub lang: String,

    /// Checker file name, relative to the work directory.
    pub checker: String,

    /// Submission file name, relative to the work directory.
    pub submission: String,

    /// Seed synchronizing randomness across the reference and student runs.
    pub seed: u32,
}

/// Drives the checker and produces the report.
pub fn drive(args: &DriverArgs) -> RunReport {
    let work_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let catalog = Catalog::load(&work_dir.join("conf").join("locale"), &args.lang);
    let mut report = RunReport::notrun();

    // Enumerating tests doubles as the checker load: anything the checker
    // prints before the final JSON line is its load-time output.
    let descriptors = match run_checker(args, &["tests"]) {
        Err(err) => {
            report.checker.status = CheckerStatus::Error;
            report.checker.exception = Some(format!("could not invoke checker: {err}"));
            report.exceptions += 1;
            return report;
        }
        Ok(output) => {
            if !output.status.success() {
                report.checker.status = CheckerStatus::Error;
                report.checker.stdout = lossy(&output.stdout);
                // Staff code: keep the full trace.
                report.checker.exception = Some(lossy(&output.stderr));
                report.exceptions += 1;
                return report;
            }
            match parse_test_listing(&lossy(&output.stdout)) {
                Ok((banner, descriptors)) => {
                    report.checker.status = CheckerStatus::Ok;
                    report.checker.stdout = banner;
                    descriptors
                }
                Err(msg) => {
                    report.checker.status = CheckerStatus::Error;
                    report.checker.exception = Some(msg);
                    report.exceptions += 1;
                    return report;
                }
            }
        }
    };

    match run_checker(args, &["load", &args.submission]) {
        Err(err) => {
            report.checker.status = CheckerStatus::Error;
            report.checker.exception = Some(format!("could not invoke checker: {err}"));
            report.exceptions += 1;
            return report;
        }
        Ok(output) => {
            report.submission.stdout = lossy(&output.stdout);
            if !output.status.success() {
                report.submission.status = SubmissionStatus::Error;
                report.submission.exception = Some(scrub_traceback(
                    &lossy(&output.stderr),
                    &args.submission,
                    &work_dir,
                ));
                report.exceptions += 1;
                return report;
            }
            report.submission.status = SubmissionStatus::Ok;
        }
    }

    let mut raised_total: u32 = 0;
    let mut escaped: u32 = 0;
    for descriptor in &descriptors {
        match run_checker(args, &["run", &descriptor.name, &args.submission]) {
            Err(err) => {
                report.checker.status = CheckerStatus::Error;
                report.checker.exception = Some(format!("could not invoke checker: {err}"));
                report.exceptions += 1;
                return report;
            }
            Ok(output) => {
                let (stderr_body, raised) = split_trailer(&lossy(&output.stderr));
                raised_total += raised;

                let mut test_output = with_trailing_newline(lossy(&output.stdout));
                match output.status.code() {
                    Some(0) => {}
                    Some(code) if code == END_TEST_EXIT => escaped += 1,
                    Some(_) => {
                        test_output.push_str(&scrub_traceback(
                            &stderr_body,
                            &args.submission,
                            &work_dir,
                        ));
                        report.exceptions += 1;
                    }
                    None => {
                        test_output.push_str(catalog.gettext(
                            "The test run was terminated by the execution environment.",
                        ));
                        test_output.push('\n');
                        report.exceptions += 1;
                    }
                }
                report.results.push(TestRecord {
                    short_description: descriptor.short_description.clone(),
                    detailed_description: descriptor.detailed_description.clone(),
                    output: test_output,
                });
            }
        }
    }

    // The checker raised the sentinel more often than it escaped back to us:
    // the submission must be swallowing it with a blanket handler.
    if raised_total > escaped {
        report.submission.status = SubmissionStatus::Caught;
        report.submission.exception = Some(catalog.gettext(MSG_BARE_EXCEPT).to_string());
    }

    report
}

/// Entry point for the `checkrun` binary: drive, print, exit 0.
pub fn main() {
    let args = DriverArgs::parse();
    let report = drive(&args);
    // A report that cannot be serialized would be a bug in the types, not in
    // the graded code; emit a checker-error report instead of panicking.
    match serde_json::to_string(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            let mut fallback = RunReport::notrun();
            fallback.checker.status = CheckerStatus::Error;
            fallback.checker.exception = Some(err.to_string());
            fallback.exceptions = 1;
            if let Ok(json) = serde_json::to_string(&fallback) {
                println!("{json}");
            }
        }
    }
}

/// Invokes one checker subcommand with the seed environment installed.
fn run_checker(args: &DriverArgs, phase: &[&str]) -> io::Result<Output> {
    Command::new(&args.interpreter)
        .arg(&args.checker)
        .args(phase)
        .env(SEED_ENV, args.seed.to_string())
        .env(SEED_GLOBAL_ENV, (u64::from(args.seed) + 1).to_string())
        .env(LANG_ENV, &args.lang)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
}

/// Splits the `tests` output into the load banner and the descriptor list.
///
/// The JSON array is the last non-empty stdout line; everything above it is
/// checker load output.
fn parse_test_listing(stdout: &str) -> Result<(String, Vec<TestDescriptor>), String> {
    let trimmed = stdout.trim_end_matches('\n');
    let (banner, json_line) = match trimmed.rfind('\n') {
        Some(idx) => (&trimmed[..=idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };
    if json_line.trim().is_empty() {
        return Err("checker printed no test listing".to_string());
    }
    let descriptors: Vec<TestDescriptor> = serde_json::from_str(json_line.trim())
        .map_err(|err| format!("unparseable test listing: {err}"))?;
    Ok((banner.to_string(), descriptors))
}

/// Extracts the `end-tests-raised: N` trailer from a run's stderr.
fn split_trailer(stderr: &str) -> (String, u32) {
    let trimmed = stderr.trim_end_matches('\n');
    if let Some(idx) = trimmed.rfind('\n') {
        let (body, last) = (&trimmed[..idx], &trimmed[idx + 1..]);
        if let Some(count) = parse_trailer(last) {
            return (format!("{body}\n"), count);
        }
    } else if let Some(count) = parse_trailer(trimmed) {
        return (String::new(), count);
    }
    (stderr.to_string(), 0)
}

fn parse_trailer(line: &str) -> Option<u32> {
    line.trim()
        .strip_prefix(END_TESTS_TRAILER)
        .and_then(|rest| rest.trim().parse().ok())
}

fn with_trailing_newline(mut s: String) -> String {
    if !s.is_empty() && !s.ends_with('\n') {
        s.push('\n');
    }
    s
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}
