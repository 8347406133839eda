//! Traceback scrubbing for learner-visible error output.
//!
//! Exceptions raised while loading or running a submission are formatted by
//! the interpreter with frames from the checker and the driver above the
//! learner's own code, and with absolute paths into the jail work directory.
//! Neither belongs in the reply: the learner sees only their own code, with
//! paths relative to the work directory.

use std::path::Path;

/// Scrubs one formatted traceback.
///
/// Every occurrence of `work_dir` as a path prefix is removed, and frames
/// above the first mention of `submission_file` (matched by file stem) are
/// dropped. When the trace never mentions the submission at all, only the
/// final message line survives.
pub fn scrub_traceback(raw: &str, submission_file: &str, work_dir: &Path) -> String {
    let prefix = format!("{}/", work_dir.display());
    let relativized = raw.replace(&prefix, "");

    let stem = Path::new(submission_file)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| submission_file.to_string());

    let lines: Vec<&str> = relativized.lines().collect();
    let scrubbed = match lines.iter().position(|line| line.contains(&stem)) {
        Some(idx) => lines[idx..].join("\n"),
        None => lines
            .iter()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.to_string())
            .unwrap_or_default(),
    };

    if scrubbed.is_empty() || scrubbed.ends_with('\n') {
        scrubbed
    } else {
        format!("{scrubbed}\n")
    }
}
