//! Audit error types.

use thiserror::Error;

/// Errors from audit log operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Opening or appending to the log file failed.
    #[error("audit log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// An entry did not serialize.
    #[error("audit entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;
