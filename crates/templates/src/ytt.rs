//! External `ytt` preprocessor for templates declared with `spec.ytt`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::StampError;

pub const DEFAULT_YTT_TIMEOUT: Duration = Duration::from_secs(4);

/// Text-in, document-out template preprocessor.
#[async_trait::async_trait]
pub trait Preprocessor: Send + Sync {
    async fn render(&self, template: &str, context: &Value) -> Result<Value, StampError>;
}

/// Runs the `ytt` binary with every context key passed as `--data-value-yaml key=<json>`.
#[derive(Debug, Clone)]
pub struct YttPreprocessor {
    program: PathBuf,
    timeout: Duration,
}

impl Default for YttPreprocessor {
    fn default() -> Self {
        Self { program: PathBuf::from("ytt"), timeout: DEFAULT_YTT_TIMEOUT }
    }
}

impl YttPreprocessor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { program: program.into(), timeout }
    }

    /// `LOOM_YTT_PATH` (default `ytt` on `PATH`) and `LOOM_YTT_TIMEOUT_SECS` (default 4).
    pub fn from_env() -> Self {
        let program = std::env::var("LOOM_YTT_PATH").ok().filter(|s| !s.is_empty()).unwrap_or_else(|| "ytt".into());
        let secs = std::env::var("LOOM_YTT_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(4);
        Self::new(program, Duration::from_secs(secs))
    }

    fn args(context: &Value) -> Vec<String> {
        let mut args = vec!["-f".to_string(), "-".to_string()];
        if let Some(m) = context.as_object() {
            for (k, v) in m {
                args.push("--data-value-yaml".into());
                args.push(format!("{}={}", k, v));
            }
        }
        args
    }
}

#[async_trait::async_trait]
impl Preprocessor for YttPreprocessor {
    async fn render(&self, template: &str, context: &Value) -> Result<Value, StampError> {
        let args = Self::args(context);
        debug!(program = %self.program.display(), args = args.len(), "ytt call");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StampError::Preprocess(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(template.as_bytes()).await.map_err(|e| StampError::Preprocess(e.to_string()))?;
        }
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| StampError::Preprocess(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| StampError::Preprocess(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StampError::Preprocess(if stderr.trim().is_empty() {
                output.status.to_string()
            } else {
                stderr.trim().to_string()
            }));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        debug!(bytes = text.len(), "ytt result");
        serde_yaml::from_str(&text).map_err(|e| StampError::Preprocess(format!("invalid output: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_context_key_becomes_a_data_value() {
        let args = YttPreprocessor::args(&json!({"params": {"a": 1}, "workload": {"metadata": {"name": "app"}}}));
        assert_eq!(&args[..2], &["-f", "-"]);
        assert!(args.contains(&r#"params={"a":1}"#.to_string()));
        assert!(args.contains(&r#"workload={"metadata":{"name":"app"}}"#.to_string()));
        assert_eq!(args.iter().filter(|a| *a == "--data-value-yaml").count(), 2);
    }

    #[tokio::test]
    async fn missing_binary_is_a_preprocess_error() {
        let ytt = YttPreprocessor::new("/nonexistent/loom-ytt", Duration::from_secs(1));
        let e = ytt.render("a: 1", &json!({})).await.unwrap_err();
        assert!(matches!(e, StampError::Preprocess(_)));
        assert!(e.to_string().starts_with("unable to apply ytt template"));
    }
}
