use std::path::PathBuf;

use thiserror::Error;

use crate::capability::Tool;
use crate::model::{FailureKind, Source};

/// Errors that abort a stage. Only `Configuration` and `Artifact` are fatal
/// to a module; the rest are downgraded to warnings by their callers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {path}: {reason}")]
    Configuration { path: PathBuf, reason: String },

    #[error("{source_kind} collection failed: {reason}")]
    Collection { source_kind: Source, reason: String },

    #[error("malformed pattern `{pattern}`: {reason}")]
    Match { pattern: String, reason: String },

    #[error("artifact error: {path}: {reason}")]
    Artifact { path: PathBuf, reason: String },
}

impl PipelineError {
    pub fn configuration(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Configuration {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn collection(source_kind: Source, reason: impl ToString) -> Self {
        Self::Collection {
            source_kind,
            reason: reason.to_string(),
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Artifact {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why a single diff item did not reach its desired state.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ItemFailure {
    #[error("timed out after {seconds}s; process killed")]
    Timeout { seconds: u64 },

    #[error("exited with code {code}{}", detail_suffix(.detail))]
    ExitCode { code: i32, detail: Option<String> },

    #[error("failed to start `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("{0} is not available on this host")]
    ToolUnavailable(Tool),

    #[error("unsupported remediation: {0}")]
    Unsupported(String),
}

impl ItemFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ItemFailure::Timeout { .. } => FailureKind::Timeout,
            ItemFailure::ExitCode { .. } => FailureKind::ExitCode,
            ItemFailure::Spawn { .. } => FailureKind::Spawn,
            ItemFailure::Verification(_) => FailureKind::Verification,
            ItemFailure::ToolUnavailable(_) => FailureKind::ToolUnavailable,
            ItemFailure::Unsupported(_) => FailureKind::Unsupported,
        }
    }
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(text) if !text.trim().is_empty() => format!(": {}", text.trim()),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::ItemFailure;
    use crate::model::FailureKind;

    #[test]
    fn exit_code_message_includes_trimmed_detail() {
        let failure = ItemFailure::ExitCode {
            code: 1603,
            detail: Some("  fatal error during installation\r\n".to_string()),
        };
        assert_eq!(
            failure.to_string(),
            "exited with code 1603: fatal error during installation"
        );
        assert_eq!(failure.kind(), FailureKind::ExitCode);
    }

    #[test]
    fn timeout_message_names_the_limit() {
        let failure = ItemFailure::Timeout { seconds: 300 };
        assert!(failure.to_string().contains("300s"));
    }
}
