use std::fmt;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure categories recorded against report entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    ToolUnavailable,
    PermissionDenied,
    MalformedOutput,
    /// The device rejected a feature it does not implement. Expected on
    /// plenty of hardware and not a test failure.
    Unsupported,
    PathError,
    Timeout,
    ToolFailed,
    Panicked,
    /// A unit assumed to exist because discovery returned none.
    Unverified,
    /// The run was stopped before this entity was tested.
    Interrupted,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::ToolUnavailable => "tool-unavailable",
            FaultKind::PermissionDenied => "permission-denied",
            FaultKind::MalformedOutput => "malformed-output",
            FaultKind::Unsupported => "unsupported",
            FaultKind::PathError => "path-error",
            FaultKind::Timeout => "timeout",
            FaultKind::ToolFailed => "tool-failed",
            FaultKind::Panicked => "panicked",
            FaultKind::Unverified => "unverified",
            FaultKind::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{tool}: not installed or not on PATH")]
    Unavailable { tool: String },
    #[error("{tool}: permission denied: {detail}")]
    PermissionDenied { tool: String, detail: String },
    #[error("{tool}: not supported by the device: {detail}")]
    Unsupported { tool: String, detail: String },
    #[error("{tool}: no answer after {secs:.1}s, killed")]
    Timeout { tool: String, secs: f64 },
    #[error("{tool}: exited with status {status:?}: {detail}")]
    Failed {
        tool: String,
        status: Option<i32>,
        detail: String,
    },
    #[error("{tool}: malformed output: {reason}")]
    Malformed {
        tool: String,
        reason: String,
        raw: String,
    },
    #[error("path error: {0}")]
    Path(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ToolError {
    pub fn malformed(tool: &str, reason: impl Into<String>, raw: &str) -> Self {
        ToolError::Malformed {
            tool: tool.to_string(),
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            ToolError::Unavailable { .. } => FaultKind::ToolUnavailable,
            ToolError::PermissionDenied { .. } => FaultKind::PermissionDenied,
            ToolError::Unsupported { .. } => FaultKind::Unsupported,
            ToolError::Timeout { .. } => FaultKind::Timeout,
            ToolError::Failed { .. } => FaultKind::ToolFailed,
            ToolError::Malformed { .. } => FaultKind::MalformedOutput,
            ToolError::Path(_) => FaultKind::PathError,
            ToolError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                FaultKind::PermissionDenied
            }
            ToolError::Io(e) if e.kind() == io::ErrorKind::NotFound => FaultKind::PathError,
            ToolError::Io(_) => FaultKind::ToolFailed,
        }
    }

    /// Raw text the tool produced, when the failure kept it.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            ToolError::Malformed { raw, .. } => Some(raw),
            ToolError::Failed { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

/// A labelled failure attached to the entity it happened to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub scope: String,
    pub kind: FaultKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(scope: impl Into<String>, kind: FaultKind, message: impl Into<String>) -> Self {
        Diagnostic {
            scope: scope.into(),
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn from_tool(scope: impl Into<String>, err: &ToolError) -> Self {
        Diagnostic::new(scope, err.kind(), err.to_string())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.scope, self.message)
    }
}

/// Best-effort text of a panic payload caught at a join point.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "panic payload of unknown type".to_string()
    }
}
