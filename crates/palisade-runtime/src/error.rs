//! Runtime error types.

use palisade_budget::AllocationDecision;
use palisade_core::{ContainerId, CredentialId};
use thiserror::Error;

/// Errors from the container plane.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Keystore failure (missing credential, decrypt failure).
    #[error(transparent)]
    Keystore(#[from] palisade_keystore::KeystoreError),

    /// Engine failure.
    #[error(transparent)]
    Engine(#[from] palisade_engine::EngineError),

    /// The budget tracker denied the allocation.
    #[error("budget denied: {decision}")]
    Budget {
        /// The denying decision.
        decision: AllocationDecision,
    },

    /// The concurrency cap is reached.
    #[error("container limit reached ({limit} live containers)")]
    LimitReached {
        /// The configured cap.
        limit: usize,
    },

    /// Another start on the same credential is in flight. Retryable.
    #[error("a start for credential {credential_id} is already in flight")]
    StartContended {
        /// The contended credential.
        credential_id: CredentialId,
    },

    /// The credential is past its expiry.
    #[error("credential {credential_id} is expired")]
    CredentialExpired {
        /// The expired credential.
        credential_id: CredentialId,
    },

    /// No managed container with this id.
    #[error("container {container_id} not found")]
    NotFound {
        /// The unknown id.
        container_id: ContainerId,
    },

    /// The container did not reach running within the start grace.
    #[error("container {container_id} did not reach running within {grace_ms}ms")]
    StartGraceExceeded {
        /// The container.
        container_id: ContainerId,
        /// The grace that elapsed.
        grace_ms: u64,
    },

    /// Secret bundle build or write failure.
    #[error("secret injection failed: {0}")]
    Injection(String),

    /// The runtime directory is not on a tmpfs mount.
    #[error("runtime directory {path} is not on a tmpfs mount")]
    NotTmpfs {
        /// The offending path.
        path: String,
    },

    /// Filesystem failure in the runtime directory.
    #[error("runtime directory I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// The `CAT-NNN` code this error maps to.
    #[must_use]
    pub fn code(&self) -> &'static str {
        use palisade_core::codes;
        match self {
            Self::Keystore(e) => e.code(),
            Self::Engine(e) => e.code(),
            Self::Budget { .. } => codes::BGT_EXCEEDED,
            Self::LimitReached { .. } => codes::CTX_LIMIT_REACHED,
            Self::StartContended { .. } => codes::CTX_START_CONTENDED,
            Self::CredentialExpired { .. } => codes::RPC_INVALID,
            Self::NotFound { .. } => codes::CTX_NOT_FOUND,
            Self::StartGraceExceeded { .. } => codes::CTX_START_FAILED,
            Self::Injection(_) | Self::NotTmpfs { .. } | Self::Io(_) => codes::SYS_INJECTION,
        }
    }

    /// Whether the caller may retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StartContended { .. } => true,
            Self::Engine(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
