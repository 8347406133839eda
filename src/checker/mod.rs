//! Checker protocol: the in-sandbox driver and its wire types.
//!
//! A problem bundle contains a checker program written for the interpreter
//! named in the jail configuration. The driver (the `checkrun` binary) is
//! staged into the jail work directory next to the checker and the
//! submission, and talks to the checker through subcommands:
//!
//! - `<interp> <checker> tests` prints a JSON array of test descriptors as
//!   its final stdout line (anything before it is load-time output).
//! - `<interp> <checker> load <submission>` loads the submission, printing
//!   its load-time output; a non-zero exit reports a submission error with
//!   the traceback on stderr.
//! - `<interp> <checker> run <name> <submission>` runs one test. Exit 0 is a
//!   completed test, exit 93 means the end-test sentinel escaped the test
//!   cleanly, any other exit is an exception. The final stderr line
//!   `end-tests-raised: N` reports how many times the sentinel was raised
//!   during the run.
//!
//! The driver emits a single [`RunReport`] JSON object on stdout and always
//! exits 0; failures are reported in-band.

pub mod driver;
pub mod locale;
pub mod report;
pub mod scrub;

pub use driver::{drive, DriverArgs};
pub use locale::Catalog;
pub use report::{CheckerStatus, RunReport, SubmissionStatus, TestDescriptor, TestRecord};

/// Exit code a checker uses to signal that the end-test sentinel escaped a
/// test (or a comparison) cleanly.
pub const END_TEST_EXIT: i32 = 93;

/// Exit code a checker uses to signal that an optional subcommand (such as
/// `precheck`) is not implemented.
pub const UNSUPPORTED_EXIT: i32 = 64;

/// Stderr trailer emitted by a checker after each `run` invocation.
pub const END_TESTS_TRAILER: &str = "end-tests-raised:";

/// Message shown when the submission swallowed the end-test sentinel.
pub const MSG_BARE_EXCEPT: &str =
    "Your code interfered with our grader. Don't use bare 'except' clauses.";
