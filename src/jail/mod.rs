//! Process jail: uid-dropped, resource-limited execution of untrusted code.
//!
//! Each run gets a fresh temporary work directory staged with the driver
//! binary, the problem bundle, and the submission source. The child runs
//! under the configured sandbox user with rlimits applied, bounded by a
//! wall-clock kill from the parent.

pub mod config;
pub mod runner;

pub use config::{JailConfig, JailLimits, JailRegistry};
pub use runner::{JailError, JailOutcome, JailStatus, JailedRun};
