//! Engine error types.

use thiserror::Error;

/// Errors from container-engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine daemon is unreachable.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// The engine does not know the referenced container.
    #[error("container {0} not found in engine")]
    NotFound(String),

    /// The engine rejected or failed the request.
    #[error("engine API error during {op}: {message}")]
    Api {
        /// The operation that failed.
        op: &'static str,
        /// Engine-reported message.
        message: String,
    },

    /// The operation exceeded its deadline.
    #[error("engine {op} timed out after {secs}s")]
    Timeout {
        /// The operation that timed out.
        op: &'static str,
        /// The deadline that was exceeded.
        secs: u64,
    },

    /// The operation was cancelled by the caller.
    #[error("engine {op} cancelled")]
    Cancelled {
        /// The operation that was cancelled.
        op: &'static str,
    },

    /// The seccomp profile could not be read.
    #[error("seccomp profile {path}: {source}")]
    SeccompProfile {
        /// Configured profile path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Whether the caller may reasonably retry the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_) | Self::Api { .. })
    }

    /// The `CAT-NNN` code this error maps to.
    #[must_use]
    pub fn code(&self) -> &'static str {
        use palisade_core::codes;
        match self {
            Self::NotFound(_) => codes::CTX_NOT_FOUND,
            _ => codes::CTX_START_FAILED,
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
