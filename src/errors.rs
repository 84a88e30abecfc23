//! Structured error types for ntm
//!
//! Uses thiserror for ergonomic error definitions with automatic Display
//! and Error trait implementations. User-facing errors carry a short
//! machine-readable code alongside the human message.

use serde_json::json;
use thiserror::Error;

/// All possible errors in ntm
#[derive(Error, Debug)]
pub enum NtmError {
    /// Workflow or policy document failed validation
    #[error("Validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    /// A required external binary is missing from PATH
    #[error("Tool unavailable: {0}")]
    ToolUnavailable(String),

    /// Child process or fetch exceeded its deadline
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Rotation attempted while the pane is still in cooldown
    #[error("Cooldown active: {remaining_secs}s remaining before next rotation on {pane}")]
    CooldownActive { pane: String, remaining_secs: i64 },

    /// No run checkpoint found for the given run ID
    #[error("No checkpoint found for run '{0}'")]
    CheckpointNotFound(String),

    /// Configuration file missing or malformed
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No tmux sessions available to operate on
    #[error("No active sessions found")]
    NoSessions,

    /// Command-line flag combination is invalid
    #[error("Invalid flag: {0}")]
    InvalidFlag(String),

    /// Filesystem I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing/serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience Result type using NtmError
pub type Result<T> = std::result::Result<T, NtmError>;

impl NtmError {
    /// Short machine-readable code for user-facing errors
    pub fn code(&self) -> Option<&'static str> {
        match self {
            NtmError::Validation { .. } => Some("VALIDATION_ERROR"),
            NtmError::ToolUnavailable(_) => Some("TOOL_UNAVAILABLE"),
            NtmError::Timeout { .. } => Some("TIMEOUT"),
            NtmError::CooldownActive { .. } => Some("COOLDOWN_ACTIVE"),
            NtmError::CheckpointNotFound(_) => Some("CHECKPOINT_NOT_FOUND"),
            NtmError::ConfigError(_) => Some("CONFIG_ERROR"),
            NtmError::NoSessions => Some("NO_SESSIONS"),
            NtmError::InvalidFlag(_) => Some("INVALID_FLAG"),
            NtmError::Io(_) | NtmError::Json(_) => None,
        }
    }

    /// Optional hint shown under the error message
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            NtmError::NoSessions => Some("start a tmux session with agents first"),
            NtmError::ToolUnavailable(_) => Some("install the binary or adjust PATH"),
            NtmError::CheckpointNotFound(_) => Some("list runs under .ntm/runs/ for valid IDs"),
            _ => None,
        }
    }

    /// Render as the wire JSON error shape: `{"error", "code"?, "details"?}`
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = json!({ "error": self.to_string() });
        if let Some(code) = self.code() {
            obj["code"] = json!(code);
        }
        if let Some(hint) = self.hint() {
            obj["details"] = json!(hint);
        }
        obj
    }
}
