//! End-to-end grading scenarios.
//!
//! These tests drive the whole pipeline (dispatcher, jail staging, the real
//! `checkrun` driver, verdict engine, report rendering) against problem
//! bundles whose checkers are /bin/sh scripts. Runs stay unjailed (no
//! sandbox account, trusted reference) so the suite needs no root.

use std::path::{Path, PathBuf};

use gradewatch::grader::{GraderOptions, JailedGrader};
use gradewatch::jail::{JailConfig, JailLimits};
use gradewatch::protocol::Submission;
use serde_json::json;

/// The sh checker used by most scenarios: one test that calls `foo` from the
/// submission and compares its output against the reference byte-for-byte.
const CHECKER: &str = r#"#!/bin/sh
mode="$1"
case "$mode" in
tests)
    echo '[{"name": "t1", "short_description": "calls foo", "detailed_description": "foo prints a greeting"}]'
    exit 0
    ;;
load)
    . "./$2" || exit 1
    exit 0
    ;;
run)
    sub="$3"
    . "./$sub" || exit 1
    foo
    echo "end-tests-raised: 0" >&2
    exit 0
    ;;
compare)
    input=$(cat)
    expected=$(printf '%s' "$input" | sed 's/.*"expected":"\([^"]*\)".*/\1/')
    actual=$(printf '%s' "$input" | sed 's/.*"actual":"\([^"]*\)".*/\1/')
    [ "$expected" = "$actual" ] && exit 0 || exit 1
    ;;
precheck)
    exit 64
    ;;
esac
exit 2
"#;

const ANSWER: &str = "foo() { echo hi; }\n";

fn write_bundle(root: &Path, name: &str, checker: &str, answer: &str) -> PathBuf {
    let bundle = root.join(name);
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(bundle.join("check.sh"), checker).unwrap();
    std::fs::write(bundle.join("answer.sh"), answer).unwrap();
    bundle
}

fn grader(root: &Path) -> JailedGrader {
    let options = GraderOptions {
        grader_root: root.to_path_buf(),
        fork_per_item: false,
        trust_reference: true,
        driver_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_checkrun"))),
    };
    let jail = JailConfig {
        name: "sh".to_string(),
        interpreter: PathBuf::from("/bin/sh"),
        user: None,
        limits: JailLimits::default(),
    };
    JailedGrader::new(options, jail).unwrap()
}

fn submission(source: &str, payload: serde_json::Value) -> Submission {
    let body = json!({
        "student_response": source,
        "grader_payload": payload.to_string(),
    });
    serde_json::from_value(json!({
        "xqueue_header": "header-123",
        "xqueue_body": body.to_string(),
        "xqueue_files": "",
    }))
    .unwrap()
}

#[tokio::test]
async fn test_correct_submission() {
    let root = tempfile::TempDir::new().unwrap();
    write_bundle(root.path(), "greeting", CHECKER, ANSWER);
    let grader = grader(root.path());

    let reply = grader
        .grade(&submission("foo() { echo hi; }\n", json!({"grader": "greeting"})))
        .await
        .unwrap();

    assert_eq!(reply.correct, 1, "msg: {}", reply.msg);
    assert_eq!(reply.score, 1.0);
    assert!(reply.msg.contains("result-correct"));
    assert!(!reply.msg.contains("result-incorrect"));
}

#[tokio::test]
async fn test_incorrect_submission() {
    let root = tempfile::TempDir::new().unwrap();
    write_bundle(root.path(), "greeting", CHECKER, ANSWER);
    let grader = grader(root.path());

    let reply = grader
        .grade(&submission("foo() { echo bye; }\n", json!({"grader": "greeting"})))
        .await
        .unwrap();

    assert_eq!(reply.correct, 0);
    assert_eq!(reply.score, 0.0);
    assert!(reply.msg.contains("result-incorrect"), "msg: {}", reply.msg);
}

#[tokio::test]
async fn test_empty_submission_reports_errors() {
    let root = tempfile::TempDir::new().unwrap();
    // This checker's load phase also requires foo to be defined.
    let strict = CHECKER.replace(
        r#"    . "./$2" || exit 1"#,
        r#"    . "./$2" || exit 1
    command -v foo >/dev/null || { echo "foo is not defined" >&2; exit 1; }"#,
    );
    write_bundle(root.path(), "greeting", &strict, ANSWER);
    let grader = grader(root.path());

    let reply = grader
        .grade(&submission("", json!({"grader": "greeting"})))
        .await
        .unwrap();

    assert_eq!(reply.correct, 0);
    assert_eq!(reply.score, 0.0);
    assert!(reply.msg.contains("result-errors"), "msg: {}", reply.msg);
}

#[tokio::test]
async fn test_broken_submission_gets_scrubbed_traceback() {
    let root = tempfile::TempDir::new().unwrap();
    write_bundle(root.path(), "greeting", CHECKER, ANSWER);
    let grader = grader(root.path());

    let reply = grader
        .grade(&submission("asdofhpsdfuh\n", json!({"grader": "greeting"})))
        .await
        .unwrap();

    assert_eq!(reply.correct, 0);
    assert_eq!(reply.score, 0.0);
    assert!(reply.msg.contains("result-errors"), "msg: {}", reply.msg);
    // No jail work-directory paths may leak into the learner's view.
    assert!(!reply.msg.contains("grade-"), "msg leaks paths: {}", reply.msg);
    assert!(!reply.msg.contains("/tmp/"), "msg leaks paths: {}", reply.msg);
}

#[tokio::test]
async fn test_infinite_loop_hits_time_limit() {
    let root = tempfile::TempDir::new().unwrap();
    write_bundle(root.path(), "greeting", CHECKER, ANSWER);
    let grader = grader(root.path());

    let reply = grader
        .grade(&submission(
            "foo() { sleep 100; }\n",
            json!({"grader": "greeting", "timeout": 1}),
        ))
        .await
        .unwrap();

    assert_eq!(reply.correct, 0);
    assert!(
        reply.msg.contains("time limit"),
        "expected a time-limit message, got: {}",
        reply.msg
    );
}

#[tokio::test]
async fn test_sentinel_evasion_is_flagged() {
    let root = tempfile::TempDir::new().unwrap();
    // The checker raises the end-test sentinel on every run. Submissions
    // marked "evade" swallow it (the sentinel never escapes); honest ones
    // let it propagate as exit 93.
    let checker = r#"#!/bin/sh
mode="$1"
case "$mode" in
tests)
    echo '[{"name": "t1", "short_description": "sentinel test"}]'
    exit 0
    ;;
load)
    exit 0
    ;;
run)
    sub="$3"
    echo "end-tests-raised: 1" >&2
    if grep -q evade "./$sub"; then
        exit 0
    fi
    exit 93
    ;;
compare)
    cat >/dev/null
    exit 0
    ;;
precheck)
    exit 64
    ;;
esac
exit 2
"#;
    write_bundle(root.path(), "sentinel", checker, "honest\n");
    let grader = grader(root.path());

    let reply = grader
        .grade(&submission("evade\n", json!({"grader": "sentinel"})))
        .await
        .unwrap();

    assert_eq!(reply.correct, 0);
    assert!(
        reply.msg.contains("except"),
        "expected the bare-except message, got: {}",
        reply.msg
    );
}

#[tokio::test]
async fn test_skip_grader_short_circuits() {
    let root = tempfile::TempDir::new().unwrap();
    // No bundle on disk at all: skip must never touch it.
    let grader = grader(root.path());

    let reply = grader
        .grade(&submission(
            "anything",
            json!({"grader": "missing", "skip_grader": true}),
        ))
        .await
        .unwrap();

    assert_eq!(reply.correct, 1);
    assert_eq!(reply.score, 1.0);
}

#[tokio::test]
async fn test_hide_output_suppresses_test_blocks() {
    let root = tempfile::TempDir::new().unwrap();
    write_bundle(root.path(), "greeting", CHECKER, ANSWER);
    let grader = grader(root.path());

    let reply = grader
        .grade(&submission(
            "foo() { echo hi; }\n",
            json!({"grader": "greeting", "hide_output": true}),
        ))
        .await
        .unwrap();

    assert_eq!(reply.correct, 1);
    assert_eq!(reply.score, 1.0);
    assert!(!reply.msg.contains("result-correct"));
    assert!(!reply.msg.contains("result-actual-output"));
}

#[tokio::test]
async fn test_unparseable_payload_still_replies() {
    let root = tempfile::TempDir::new().unwrap();
    let grader = grader(root.path());

    let body = json!({
        "student_response": "x",
        "grader_payload": "not json at all",
    });
    let submission: Submission = serde_json::from_value(json!({
        "xqueue_header": "h",
        "xqueue_body": body.to_string(),
    }))
    .unwrap();

    let reply = grader.grade(&submission).await.unwrap();
    assert_eq!(reply.correct, 0);
    assert!(reply.msg.contains("result-errors"));
}

#[tokio::test]
async fn test_bundle_escape_is_refused() {
    let root = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("inner")).unwrap();
    let grader_root = root.path().join("inner");
    write_bundle(root.path(), "outside", CHECKER, ANSWER);
    let grader = grader(&grader_root);

    let reply = grader
        .grade(&submission("x", json!({"grader": "../outside"})))
        .await
        .unwrap();

    assert_eq!(reply.correct, 0, "escaping bundle paths must not grade");
}

#[tokio::test]
async fn test_precheck_errors_short_circuit() {
    let root = tempfile::TempDir::new().unwrap();
    // A checker whose precheck rejects tab characters.
    let checker = CHECKER.replace(
        "precheck)\n    exit 64",
        r#"precheck)
    if grep -q "$(printf '\t')" /dev/stdin; then
        echo "Tabs are not allowed in submissions."
    fi
    exit 0"#,
    );
    write_bundle(root.path(), "greeting", &checker, ANSWER);
    let grader = grader(root.path());

    let reply = grader
        .grade(&submission("\tfoo() { echo hi; }\n", json!({"grader": "greeting"})))
        .await
        .unwrap();

    assert_eq!(reply.correct, 0);
    assert!(
        reply.msg.contains("Tabs are not allowed"),
        "msg: {}",
        reply.msg
    );

    // Clean submissions pass the precheck and grade normally.
    let reply = grader
        .grade(&submission("foo() { echo hi; }\n", json!({"grader": "greeting"})))
        .await
        .unwrap();
    assert_eq!(reply.correct, 1);
}

/// Two driver runs with the same seed must emit byte-identical reports.
#[tokio::test]
async fn test_seed_determinism() {
    let root = tempfile::TempDir::new().unwrap();
    let checker = r#"#!/bin/sh
mode="$1"
case "$mode" in
tests)
    echo '[{"name": "t1", "short_description": "echoes the seed"}]'
    exit 0
    ;;
load)
    exit 0
    ;;
run)
    echo "seed: $GRADE_SEED global: $GRADE_SEED_GLOBAL"
    echo "end-tests-raised: 0" >&2
    exit 0
    ;;
esac
exit 2
"#;
    std::fs::write(root.path().join("check.sh"), checker).unwrap();
    std::fs::write(root.path().join("submission.sh"), "").unwrap();

    let run = |seed: u32| {
        let output = std::process::Command::new(env!("CARGO_BIN_EXE_checkrun"))
            .args(["--interpreter", "/bin/sh", "check.sh", "submission.sh"])
            .arg(seed.to_string())
            .current_dir(root.path())
            .output()
            .unwrap();
        assert!(output.status.success());
        output.stdout
    };

    let first = run(777);
    let second = run(777);
    assert_eq!(first, second, "same seed must give identical reports");

    let other = run(778);
    assert_ne!(first, other, "the seed must reach the checker");
}
