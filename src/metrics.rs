//! Prometheus metrics for the grading pipeline.
//!
//! Counters and histograms live behind `OnceLock` statics and are registered
//! once by [`init_metrics`]; recording helpers are no-ops until then, so
//! library consumers and tests never pay for metrics they did not ask for.

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{Counter, Histogram, HistogramOpts, Opts, Registry};

/// Global registry holding all gradewatch metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Submissions pulled off a queue and handed to a handler.
static SUBMISSIONS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Grader payloads that failed to parse.
static PAYLOAD_ERRORS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Replies posted back to the server.
static REPLIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// End-to-end grading duration, seconds.
static GRADING_SECONDS: OnceLock<Histogram> = OnceLock::new();

/// Creates and registers every metric. Call once at startup; calling again
/// is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let submissions = Counter::with_opts(Opts::new(
        "gradewatch_submissions_total",
        "Submissions handed to a grader",
    ))?;
    let payload_errors = Counter::with_opts(Opts::new(
        "gradewatch_payload_errors_total",
        "Grader payloads that failed to parse",
    ))?;
    let replies = Counter::with_opts(Opts::new(
        "gradewatch_replies_total",
        "Replies posted to the queue server",
    ))?;
    let grading_seconds = Histogram::with_opts(
        HistogramOpts::new("gradewatch_grading_seconds", "End-to-end grading duration")
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )?;

    registry.register(Box::new(submissions.clone()))?;
    registry.register(Box::new(payload_errors.clone()))?;
    registry.register(Box::new(replies.clone()))?;
    registry.register(Box::new(grading_seconds.clone()))?;

    let _ = SUBMISSIONS_TOTAL.set(submissions);
    let _ = PAYLOAD_ERRORS_TOTAL.set(payload_errors);
    let _ = REPLIES_TOTAL.set(replies);
    let _ = GRADING_SECONDS.set(grading_seconds);
    let _ = REGISTRY.set(registry);

    Ok(())
}

pub fn inc_submissions() {
    if let Some(counter) = SUBMISSIONS_TOTAL.get() {
        counter.inc();
    }
}

pub fn inc_payload_errors() {
    if let Some(counter) = PAYLOAD_ERRORS_TOTAL.get() {
        counter.inc();
    }
}

pub fn inc_replies() {
    if let Some(counter) = REPLIES_TOTAL.get() {
        counter.inc();
    }
}

pub fn observe_grading(duration: Duration) {
    if let Some(histogram) = GRADING_SECONDS.get() {
        histogram.observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_init_is_a_noop() {
        // Must not panic even when init_metrics was never called.
        inc_submissions();
        observe_grading(Duration::from_millis(100));
    }

    #[test]
    fn test_init_and_record() {
        init_metrics().unwrap();
        init_metrics().unwrap(); // idempotent

        inc_submissions();
        inc_replies();
        observe_grading(Duration::from_secs(1));

        let families = REGISTRY.get().unwrap().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "gradewatch_submissions_total"));
    }
}
