use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;

/// Failures a unit of work can run into.
///
/// None of these ever reach the scheduler's caller: units absorb them and
/// publish the outcome as branch facts instead.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("network failure while {operation}: {reason}")]
    TransientNetwork {
        operation: &'static str,
        reason: String,
    },

    #[error("{tool} failed: {reason}")]
    ToolFailure { tool: String, reason: String },

    #[error("unusable content from {source_url}: {reason}")]
    PermanentContent { source_url: String, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error("no fact for `{key}` within {}", humantime::format_duration(*.after))]
    RendezvousTimeout { key: String, after: Duration },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl TaskError {
    pub fn network(operation: &'static str, reason: impl ToString) -> Self {
        Self::TransientNetwork {
            operation,
            reason: reason.to_string(),
        }
    }

    pub fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolFailure {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn content(source_url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PermanentContent {
            source_url: source_url.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Map a non-success HTTP status onto the taxonomy: client errors are
    /// permanent, everything else is worth another attempt.
    pub fn from_status(status: StatusCode, url: &str) -> Self {
        if status.is_client_error() {
            Self::content(url, format!("HTTP {status}"))
        } else {
            Self::network("fetching range", format!("HTTP {status} from {url}"))
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientNetwork { .. } | Self::ToolFailure { .. } | Self::Io { .. } => true,
            Self::PermanentContent { .. }
            | Self::Cancelled
            | Self::RendezvousTimeout { .. }
            | Self::Image(_) => false,
        }
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() || e.is_redirect() {
            let url = e.url().map(|u| u.to_string()).unwrap_or_default();
            return Self::content(url, e.to_string());
        }
        Self::network("talking to the source", e)
    }
}
