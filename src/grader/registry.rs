//! Handler registry.
//!
//! Config documents select handlers by stable names resolved at load time
//! through this registry of constructor functions. An unknown name is a
//! configuration error before any worker starts, never a grading-time
//! surprise.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ConfigError, HandlerConfig};
use crate::jail::JailRegistry;
use crate::protocol::envelope::{Reply, Submission};

use super::dispatcher::JailedGrader;
use super::{GraderError, Handler};

/// Builds one handler from its config block.
pub type HandlerCtor =
    fn(&HandlerConfig, &Arc<JailRegistry>) -> Result<Arc<dyn Handler>, ConfigError>;

/// Name-to-constructor map for every handler the config may reference.
pub struct HandlerRegistry {
    ctors: HashMap<String, HandlerCtor>,
}

impl HandlerRegistry {
    /// The built-in handlers: `jailed` (the grader) and `echo` (a
    /// diagnostic handler that reflects the submission back).
    pub fn builtin() -> Self {
        let mut registry = Self {
            ctors: HashMap::new(),
        };
        registry.register("jailed", build_jailed);
        registry.register("echo", build_echo);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, ctor: HandlerCtor) {
        self.ctors.insert(name.into(), ctor);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Constructs the handler a config block names.
    pub fn build(
        &self,
        config: &HandlerConfig,
        jails: &Arc<JailRegistry>,
    ) -> Result<Arc<dyn Handler>, ConfigError> {
        let ctor = self
            .ctors
            .get(&config.handler)
            .ok_or_else(|| ConfigError::UnknownHandler(config.handler.clone()))?;
        ctor(config, jails)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn build_jailed(
    config: &HandlerConfig,
    jails: &Arc<JailRegistry>,
) -> Result<Arc<dyn Handler>, ConfigError> {
    let spec = config
        .codejail
        .as_ref()
        .ok_or_else(|| ConfigError::MissingJail(config.handler.clone()))?;

    // First registration wins; a handler re-using the name grades under the
    // configuration already installed.
    jails.register(spec.to_jail_config());
    let jail = jails
        .get(&spec.name)
        .ok_or_else(|| ConfigError::UnknownJail {
            handler: config.handler.clone(),
            jail: spec.name.clone(),
        })?;

    let grader =
        JailedGrader::new(config.kwargs.clone(), jail).map_err(|err| ConfigError::HandlerInit {
            handler: config.handler.clone(),
            reason: err.to_string(),
        })?;
    Ok(Arc::new(grader))
}

fn build_echo(
    _config: &HandlerConfig,
    _jails: &Arc<JailRegistry>,
) -> Result<Arc<dyn Handler>, ConfigError> {
    Ok(Arc::new(EchoHandler))
}

/// Reflects the student response back with full credit. Useful for wiring
/// checks and load tests; grades nothing.
#[derive(Debug)]
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(&self, submission: &Submission) -> Result<Option<Reply>, GraderError> {
        let source = submission
            .body()
            .map(|body| body.student_response)
            .unwrap_or_default();
        let msg = format!("<pre>{}</pre>", tera::escape_html(&source));
        Ok(Some(Reply::new(true, 1.0, msg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grader::GraderOptions;
    use crate::jail::JailLimits;

    fn handler_config(handler: &str, codejail: Option<crate::config::JailSpec>) -> HandlerConfig {
        HandlerConfig {
            handler: handler.to_string(),
            kwargs: GraderOptions {
                driver_path: Some("/bin/true".into()),
                ..GraderOptions::default()
            },
            codejail,
        }
    }

    fn sh_spec(name: &str) -> crate::config::JailSpec {
        serde_yaml::from_str(&format!("name: {name}\nbin_path: /bin/sh")).unwrap()
    }

    #[test]
    fn test_builtin_names() {
        let registry = HandlerRegistry::builtin();
        assert_eq!(registry.names(), vec!["echo", "jailed"]);
    }

    #[test]
    fn test_unknown_handler_is_config_error() {
        let registry = HandlerRegistry::builtin();
        let jails = Arc::new(JailRegistry::new());
        let err = registry
            .build(&handler_config("nope", None), &jails)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHandler(name) if name == "nope"));
    }

    #[test]
    fn test_jailed_requires_codejail_block() {
        let registry = HandlerRegistry::builtin();
        let jails = Arc::new(JailRegistry::new());
        let err = registry
            .build(&handler_config("jailed", None), &jails)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingJail(_)));
    }

    #[test]
    fn test_jailed_registers_its_jail() {
        let registry = HandlerRegistry::builtin();
        let jails = Arc::new(JailRegistry::new());
        let handler = registry
            .build(&handler_config("jailed", Some(sh_spec("sh"))), &jails)
            .unwrap();
        assert_eq!(handler.name(), "jailed");
        assert!(jails.get("sh").is_some());
        assert_eq!(jails.get("sh").unwrap().limits.cpu, JailLimits::default().cpu);
    }

    #[tokio::test]
    async fn test_echo_handler_reflects_source() {
        let registry = HandlerRegistry::builtin();
        let jails = Arc::new(JailRegistry::new());
        let handler = registry
            .build(&handler_config("echo", None), &jails)
            .unwrap();

        let submission: Submission = serde_json::from_str(
            r#"{"xqueue_header": "h",
                "xqueue_body": "{\"student_response\": \"print <1>\", \"grader_payload\": \"{}\"}"}"#,
        )
        .unwrap();
        let reply = handler.handle(&submission).await.unwrap().unwrap();
        assert_eq!(reply.correct, 1);
        assert!(reply.msg.contains("print &lt;1&gt;"));
    }
}
