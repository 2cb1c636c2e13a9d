use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error across the orchestrator stack.
///
/// Every failure carries exactly one of these kinds; `kind()` returns the
/// stable kebab-case tag used on the wire and in persisted records.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("unknown method '{method}'")]
    UnknownMethod { method: String },

    #[error("script parse error: {reason}")]
    ScriptParse { reason: String },

    #[error("unbound variable '{name}'")]
    UnboundVariable { name: String },

    #[error("path '{path}' escapes the permitted roots")]
    PathEscape { path: String },

    #[error("clone failed: {reason}")]
    CloneFailed { reason: String },

    #[error("download failed: {reason}")]
    DownloadFailed { reason: String },

    #[error("archive invalid: {reason}")]
    ArchiveInvalid { reason: String },

    #[error("virtual environment failed: {reason}")]
    VenvFailed { reason: String },

    #[error("command exited with code {code}")]
    ShellNonzero { code: i32, tail: String },

    #[error("operation timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("no readiness signal within {secs}s")]
    ReadinessTimeout { secs: u64 },

    #[error("port {port} is busy")]
    PortBusy { port: u16 },

    #[error("tunnel open via '{provider}' failed: {reason}")]
    TunnelOpenFailed { provider: String, reason: String },

    #[error("tunnel dead: {reason}")]
    TunnelDead { reason: String },

    #[error("input request cancelled")]
    InputCancelled,

    #[error("illegal state: {reason}")]
    IllegalState { reason: String },

    #[error("disk full: {reason}")]
    DiskFull { reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

pub type HostResult<T> = Result<T, HostError>;

impl HostError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownMethod { .. } => "unknown-method",
            Self::ScriptParse { .. } => "script-parse",
            Self::UnboundVariable { .. } => "unbound-variable",
            Self::PathEscape { .. } => "path-escape",
            Self::CloneFailed { .. } => "clone-failed",
            Self::DownloadFailed { .. } => "download-failed",
            Self::ArchiveInvalid { .. } => "archive-invalid",
            Self::VenvFailed { .. } => "venv-failed",
            Self::ShellNonzero { .. } => "shell-nonzero",
            Self::Timeout { .. } => "timeout",
            Self::ReadinessTimeout { .. } => "readiness-timeout",
            Self::PortBusy { .. } => "port-busy",
            Self::TunnelOpenFailed { .. } => "tunnel-open-failed",
            Self::TunnelDead { .. } => "tunnel-dead",
            Self::InputCancelled => "input-cancelled",
            Self::IllegalState { .. } => "illegal-state",
            Self::DiskFull { .. } => "disk-full",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn internal(reason: impl std::fmt::Display) -> Self {
        Self::Internal {
            reason: reason.to_string(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ScriptParse {
            reason: reason.into(),
        }
    }

    pub fn illegal(reason: impl Into<String>) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }

    /// Map an I/O error, promoting `ENOSPC` to the dedicated kind.
    pub fn io(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(28) {
            return Self::DiskFull {
                reason: err.to_string(),
            };
        }
        Self::Internal {
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err)
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            reason: err.to_string(),
        }
    }
}

/// Serializable error snapshot carried in records and on the event stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<&HostError> for ErrorInfo {
    fn from(err: &HostError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        let err = HostError::TunnelOpenFailed {
            provider: "ngrok".into(),
            reason: "no credentials".into(),
        };
        assert_eq!(err.kind(), "tunnel-open-failed");
        let info = ErrorInfo::from(&err);
        assert_eq!(info.kind, "tunnel-open-failed");
        assert!(info.message.contains("ngrok"));
    }

    #[test]
    fn enospc_maps_to_disk_full() {
        let io = std::io::Error::from_raw_os_error(28);
        assert_eq!(HostError::io(io).kind(), "disk-full");
    }
}
