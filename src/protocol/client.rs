//! HTTP client for the submission queue server.
//!
//! Wraps a cookie-holding `reqwest::Client` with redirects disabled so a
//! `301`/`302` surfaces here instead of being followed: it is the server's
//! session-expired signal, answered by re-authenticating and retrying the
//! original request once.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use super::envelope::{Reply, Submission};

const LOGIN_URI: &str = "/xqueue/login/";
const GET_SUBMISSION_URI: &str = "/xqueue/get_submission/";
const PUT_RESULT_URI: &str = "/xqueue/put_result/";

/// Errors surfaced by the queue client.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The request hit `REQUESTS_TIMEOUT`. Callers fetching work treat this
    /// as "no work this tick", not as a failure.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("could not connect to {url}: {source}")]
    Connection { url: String, source: reqwest::Error },

    /// The server answered but refused the login form.
    #[error("login refused: {0}")]
    LoginRefused(String),

    /// The server answered with something other than a success envelope.
    #[error("server error: {0}")]
    Server(String),

    #[error("HTTP client construction failed: {0}")]
    Build(#[source] reqwest::Error),
}

/// Result of one `get_submission` poll.
#[derive(Debug)]
pub enum Fetched {
    Submission(Submission),
    /// Queue empty or otherwise no work; the message is the server's reason.
    Nothing(String),
}

/// Internal result of envelope parsing.
#[derive(Debug, PartialEq)]
enum ParsedReply {
    Success(Value),
    Failure(String),
}

/// One queue's HTTP session.
pub struct XQueueClient {
    http: reqwest::Client,
    server: String,
    queue_name: String,
    credentials: Option<(String, String)>,
    basic_auth: Option<(String, String)>,
    timeout: Duration,
}

impl XQueueClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server: impl Into<String>,
        queue_name: impl Into<String>,
        credentials: Option<(String, String)>,
        basic_auth: Option<(String, String)>,
        timeout: Duration,
        follow_redirects: bool,
    ) -> Result<Self, ProtocolError> {
        let redirect = if follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .redirect(redirect)
            .build()
            .map_err(ProtocolError::Build)?;

        let mut server = server.into();
        while server.ends_with('/') {
            server.pop();
        }

        Ok(Self {
            http,
            server,
            queue_name: queue_name.into(),
            credentials,
            basic_auth,
            timeout,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Posts the login form. A `None` credential pair makes this a no-op.
    pub async fn login(&self) -> Result<(), ProtocolError> {
        let Some((username, password)) = &self.credentials else {
            return Ok(());
        };
        let url = format!("{}{}", self.server, LOGIN_URI);
        debug!(url = %url, username = %username, "Logging in to queue server");

        let mut request = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .form(&[("username", username.as_str()), ("password", password.as_str())]);
        if let Some((user, pass)) = &self.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.map_err(|e| classify(e, &url))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| classify(e, &url))?;
        if status != StatusCode::OK {
            return Err(ProtocolError::LoginRefused(format!(
                "login returned status {status}"
            )));
        }
        match parse_xreply(status, &body) {
            ParsedReply::Success(_) => Ok(()),
            ParsedReply::Failure(msg) => Err(ProtocolError::LoginRefused(msg)),
        }
    }

    /// Polls the queue for one submission.
    pub async fn get_submission(&self) -> Result<Fetched, ProtocolError> {
        let query = [("queue_name", self.queue_name.clone())];
        let parsed = self
            .request(Method::GET, GET_SUBMISSION_URI, Some(&query), None)
            .await?;
        match parsed {
            ParsedReply::Failure(msg) => Ok(Fetched::Nothing(msg)),
            ParsedReply::Success(content) => {
                // The payload is a JSON string that itself decodes to the
                // submission envelope.
                let text = match content {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                match serde_json::from_str::<Submission>(&text) {
                    Ok(submission) => Ok(Fetched::Submission(submission)),
                    Err(err) => {
                        error!(error = %err, "Unparseable submission envelope");
                        Ok(Fetched::Nothing(format!("unparseable submission: {err}")))
                    }
                }
            }
        }
    }

    /// Posts one reply, echoing the fetched header token verbatim.
    pub async fn put_result(&self, header_token: &str, reply: &Reply) -> Result<(), ProtocolError> {
        let body = serde_json::to_string(reply)
            .map_err(|e| ProtocolError::Server(format!("unserializable reply: {e}")))?;
        let form = [
            ("xqueue_header", header_token.to_string()),
            ("xqueue_body", body),
        ];
        let parsed = self
            .request(Method::POST, PUT_RESULT_URI, None, Some(&form))
            .await?;
        match parsed {
            ParsedReply::Success(_) => Ok(()),
            ParsedReply::Failure(msg) => Err(ProtocolError::Server(msg)),
        }
    }

    /// Sends one request, re-authenticating and retrying once on a redirect.
    async fn request(
        &self,
        method: Method,
        uri: &str,
        query: Option<&[(&str, String)]>,
        form: Option<&[(&str, String)]>,
    ) -> Result<ParsedReply, ProtocolError> {
        let url = format!("{}{}", self.server, uri);
        let mut reauthenticated = false;
        loop {
            let mut request = self.http.request(method.clone(), &url).timeout(self.timeout);
            if let Some(query) = query {
                request = request.query(query);
            }
            if let Some(form) = form {
                request = request.form(form);
            }
            if let Some((user, pass)) = &self.basic_auth {
                request = request.basic_auth(user, Some(pass));
            }

            let response = request.send().await.map_err(|e| classify(e, &url))?;
            let status = response.status();

            if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {
                if reauthenticated {
                    return Err(ProtocolError::Server(
                        "still redirected after re-login".to_string(),
                    ));
                }
                debug!(url = %url, "Session expired, re-authenticating");
                self.login().await?;
                reauthenticated = true;
                continue;
            }

            let body = response.text().await.map_err(|e| classify(e, &url))?;
            return Ok(parse_xreply(status, &body));
        }
    }
}

fn classify(err: reqwest::Error, url: &str) -> ProtocolError {
    if err.is_timeout() {
        ProtocolError::Timeout {
            url: url.to_string(),
        }
    } else {
        ProtocolError::Connection {
            url: url.to_string(),
            source: err,
        }
    }
}

/// Parses a server response into success-plus-payload or a failure message.
///
/// Success is a 200 whose JSON body carries either `return_code == 0` (the
/// payload is `content`) or a truthy `success` (the payload is the envelope
/// itself). Everything else is a failure with a diagnostic message.
fn parse_xreply(status: StatusCode, body: &str) -> ParsedReply {
    if status != StatusCode::OK {
        return ParsedReply::Failure(format!("server returned status_code={status}"));
    }

    let envelope: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return ParsedReply::Failure("could not parse xreply".to_string()),
    };

    if let Some(return_code) = envelope.get("return_code") {
        return if return_code == 0 {
            ParsedReply::Success(envelope.get("content").cloned().unwrap_or(Value::Null))
        } else {
            let msg = envelope
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or("nonzero return code");
            ParsedReply::Failure(msg.to_string())
        };
    }

    if let Some(success) = envelope.get("success") {
        let truthy = match success {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            _ => None,
        };
        return match truthy {
            Some(true) => ParsedReply::Success(envelope.clone()),
            Some(false) => ParsedReply::Failure("request unsuccessful".to_string()),
            None => ParsedReply::Failure("invalid success code".to_string()),
        };
    }

    ParsedReply::Failure("cannot find a valid success or return code".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_return_code_success() {
        let parsed = parse_xreply(StatusCode::OK, r#"{"return_code": 0, "content": "payload"}"#);
        assert_eq!(parsed, ParsedReply::Success(Value::String("payload".into())));
    }

    #[test]
    fn test_parse_return_code_failure() {
        let parsed = parse_xreply(StatusCode::OK, r#"{"return_code": 1, "content": "empty"}"#);
        assert_eq!(parsed, ParsedReply::Failure("empty".to_string()));
    }

    #[test]
    fn test_parse_success_flag() {
        let parsed = parse_xreply(StatusCode::OK, r#"{"success": true, "msg": "ok"}"#);
        assert!(matches!(parsed, ParsedReply::Success(Value::Object(_))));

        let parsed = parse_xreply(StatusCode::OK, r#"{"success": 1}"#);
        assert!(matches!(parsed, ParsedReply::Success(_)));

        let parsed = parse_xreply(StatusCode::OK, r#"{"success": "bad"}"#);
        assert_eq!(parsed, ParsedReply::Failure("invalid success code".to_string()));
    }

    #[test]
    fn test_parse_missing_codes() {
        let parsed = parse_xreply(StatusCode::OK, r#"{"hello": 1}"#);
        assert!(matches!(parsed, ParsedReply::Failure(_)));
    }

    #[test]
    fn test_parse_non_200() {
        let parsed = parse_xreply(StatusCode::INTERNAL_SERVER_ERROR, "{}");
        assert!(matches!(parsed, ParsedReply::Failure(_)));
    }

    #[test]
    fn test_parse_bad_json() {
        let parsed = parse_xreply(StatusCode::OK, "<html>");
        assert_eq!(
            parsed,
            ParsedReply::Failure("could not parse xreply".to_string())
        );
    }

    #[test]
    fn test_server_url_trailing_slash_trimmed() {
        let client = XQueueClient::new(
            "http://example.test/",
            "q",
            None,
            None,
            Duration::from_secs(1),
            false,
        )
        .unwrap();
        assert_eq!(client.server, "http://example.test");
    }
}
