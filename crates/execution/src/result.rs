use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured outcome of one workflow or custom-code invocation.
///
/// `success` holds exactly when the child exited 0 and nothing was rejected
/// by the safety policy. `result_json` carries the payload extracted from
/// the stdout result marker, or `None` when no usable payload was produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub result_json: Option<Value>,
    #[serde(default)]
    pub timing_ms: u64,
    #[serde(default)]
    pub safety_rejections: Vec<String>,
}

impl ExecutionResult {
    /// Pre-spawn failure: no output captured, just a message and exit code.
    pub(crate) fn error(message: impl Into<String>, exit_code: i32, timing_ms: u64) -> Self {
        Self {
            success: false,
            exit_code,
            stdout: String::new(),
            stderr: message.into(),
            result_json: None,
            timing_ms,
            safety_rejections: Vec::new(),
        }
    }
}
