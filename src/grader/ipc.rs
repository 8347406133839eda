//! Per-item subprocess isolation.
//!
//! With `fork_per_item` enabled, each submission is graded by a short-lived
//! child running this same binary with the hidden `grade-one` subcommand.
//! The parent streams a JSON [`GradeRequest`] to the child's stdin and reads
//! back exactly one length-prefixed (u32 big-endian) JSON frame carrying
//! either the reply or a tagged error. Defense in depth against per-process
//! state leaking between submissions, orthogonal to the jail itself.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error};

use crate::jail::JailConfig;
use crate::protocol::envelope::{Reply, Submission};

use super::dispatcher::{GraderOptions, JailedGrader};
use super::GraderError;

/// Hidden subcommand name the child is spawned with.
pub const GRADE_ONE_COMMAND: &str = "grade-one";

/// Everything the child needs to grade one submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct GradeRequest {
    pub options: GraderOptions,
    pub jail: JailConfig,
    pub submission: Submission,
}

/// The child's single response frame.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GradeResponse {
    Reply { reply: Reply },
    Error { message: String },
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Parent side: spawn the child, stream the request, await the frame.
pub async fn grade_in_subprocess(
    options: &GraderOptions,
    jail: &JailConfig,
    submission: &Submission,
    bound: Duration,
) -> Result<Reply, GraderError> {
    let exe = std::env::current_exe()?;
    let request = GradeRequest {
        options: options.clone(),
        jail: jail.clone(),
        submission: submission.clone(),
    };
    let encoded = serde_json::to_vec(&request)?;

    let mut child = tokio::process::Command::new(exe)
        .arg(GRADE_ONE_COMMAND)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&encoded).await?;
        // Closing stdin tells the child the request is complete.
        drop(stdin);
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| GraderError::Subprocess("child stdout unavailable".to_string()))?;

    let frame = match tokio::time::timeout(bound, read_frame(&mut stdout)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(err)) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(GraderError::Subprocess(format!("truncated frame: {err}")));
        }
        Err(_) => {
            error!(?bound, "Per-item child exceeded its wall-clock bound, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(GraderError::Subprocess("child timed out".to_string()));
        }
    };

    let _ = child.wait().await;

    match serde_json::from_slice::<GradeResponse>(&frame)? {
        GradeResponse::Reply { reply } => Ok(reply),
        GradeResponse::Error { message } => Err(GraderError::Subprocess(message)),
    }
}

/// Child side: read the request from stdin, grade, write the frame, exit.
///
/// Grading happens with `fork_per_item` forced off so the child never
/// recurses into another child.
pub async fn serve_grade_one() -> i32 {
    let mut stdin = tokio::io::stdin();
    let mut raw = Vec::new();
    if let Err(err) = stdin.read_to_end(&mut raw).await {
        error!(error = %err, "Could not read grade request");
        return 1;
    }

    let response = match serde_json::from_slice::<GradeRequest>(&raw) {
        Err(err) => GradeResponse::Error {
            message: format!("unparseable grade request: {err}"),
        },
        Ok(request) => {
            debug!("Grading one submission in child process");
            let mut options = request.options;
            options.fork_per_item = false;
            match JailedGrader::new(options, request.jail) {
                Err(err) => GradeResponse::Error {
                    message: err.to_string(),
                },
                Ok(grader) => match grader.grade(&request.submission).await {
                    Ok(reply) => GradeResponse::Reply { reply },
                    Err(err) => GradeResponse::Error {
                        message: err.to_string(),
                    },
                },
            }
        }
    };

    let encoded = match serde_json::to_vec(&response) {
        Ok(encoded) => encoded,
        Err(err) => {
            error!(error = %err, "Could not encode grade response");
            return 1;
        }
    };
    let mut stdout = tokio::io::stdout();
    if let Err(err) = write_frame(&mut stdout, &encoded).await {
        error!(error = %err, "Could not write grade response frame");
        return 1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut writer = std::io::Cursor::new(Vec::new());
        write_frame(&mut writer, b"hello frame").await.unwrap();
        let buffer = writer.into_inner();
        assert_eq!(&buffer[..4], &11u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buffer);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame, b"hello frame");
    }

    #[tokio::test]
    async fn test_truncated_frame_errors() {
        let mut writer = std::io::Cursor::new(Vec::new());
        write_frame(&mut writer, b"full payload").await.unwrap();
        let mut buffer = writer.into_inner();
        buffer.truncate(buffer.len() - 3);

        let mut cursor = std::io::Cursor::new(buffer);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn test_response_tagging() {
        let reply = GradeResponse::Reply {
            reply: Reply::new(true, 1.0, "ok"),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["kind"], "reply");

        let err = GradeResponse::Error {
            message: "boom".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "error");
    }

    #[test]
    fn test_request_round_trip() {
        let submission: Submission = serde_json::from_str(
            r#"{"xqueue_header": "h", "xqueue_body": "{}"}"#,
        )
        .unwrap();
        let request = GradeRequest {
            options: GraderOptions::default(),
            jail: crate::jail::JailConfig {
                name: "sh".to_string(),
                interpreter: "/bin/sh".into(),
                user: None,
                limits: Default::default(),
            },
            submission,
        };
        let encoded = serde_json::to_vec(&request).unwrap();
        let decoded: GradeRequest = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.jail.name, "sh");
        assert_eq!(decoded.submission.header_token(), "h");
    }
}
