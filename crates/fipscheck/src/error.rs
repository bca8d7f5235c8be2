use std::path::PathBuf;

use serde::Serialize;

use crate::report::ScanResult;

/// Failures that end a scan. Per-binary problems never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scan root {}: {reason}", .path.display())]
    FatalRoot { path: PathBuf, reason: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The run was cancelled; `partial` holds every report finalized so far.
    #[error("scan cancelled after {} report(s)", .partial.reports.len())]
    Cancelled { partial: Box<ScanResult> },
}

impl ScanError {
    pub fn partial(&self) -> Option<&ScanResult> {
        match self {
            ScanError::Cancelled { partial } => Some(partial),
            _ => None,
        }
    }
}

/// Failure attached to a single report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemError {
    #[error("unreadable: {message}")]
    Unreadable { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl ItemError {
    pub fn unreadable(err: impl std::fmt::Display) -> Self {
        ItemError::Unreadable {
            message: format!("{err:#}"),
        }
    }
}
