//! Audit entry types and actions.
//!
//! Every security-relevant operation is recorded as an audit entry. Actions
//! never carry secret material — credential accesses record the id, secret
//! injections record the file path, chat commands record the command name.

use palisade_core::{ContainerId, CredentialId, Timestamp, TraceId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry identifier.
    pub id: Uuid,
    /// When this entry was created.
    pub timestamp: Timestamp,
    /// Snake-case action discriminant, duplicated out of `action` so log
    /// consumers can filter without knowing the full schema.
    pub event_type: String,
    /// The action being audited.
    pub action: AuditAction,
    /// Outcome of the action.
    pub outcome: AuditOutcome,
    /// Trace id correlating the entry with an error report, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
}

impl AuditEntry {
    /// Create an entry for `action` with the given outcome.
    #[must_use]
    pub fn new(action: AuditAction, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Timestamp::now(),
            event_type: action.event_type().to_owned(),
            action,
            outcome,
            trace_id: None,
        }
    }

    /// Attach a trace id.
    #[must_use]
    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }
}

/// Actions that can be audited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditAction {
    /// A chat-originated command passed the zero-trust filter.
    AccessGranted {
        /// Chat sender.
        sender: String,
        /// Originating room.
        room_id: String,
        /// Command name.
        command: String,
    },

    /// A chat-originated command was rejected by the zero-trust filter.
    AccessDenied {
        /// Chat sender.
        sender: String,
        /// Originating room.
        room_id: String,
        /// Command name.
        command: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A credential was stored.
    CredentialStored {
        /// Credential id.
        id: CredentialId,
    },

    /// A credential was decrypted in memory.
    CredentialAccessed {
        /// Credential id.
        id: CredentialId,
        /// What the plaintext was needed for.
        purpose: String,
    },

    /// A credential was deleted.
    CredentialDeleted {
        /// Credential id.
        id: CredentialId,
    },

    /// A secret bundle was written for a container.
    SecretInjected {
        /// Container the bundle belongs to.
        container_id: ContainerId,
        /// Host-side bundle path.
        path: String,
    },

    /// A secret bundle was unlinked.
    SecretRemoved {
        /// Container the bundle belonged to.
        container_id: ContainerId,
        /// Host-side bundle path.
        path: String,
        /// Why it was removed (deletion delay, stop, failure).
        reason: String,
    },

    /// A container was started.
    ContainerStarted {
        /// Internal container id.
        container_id: ContainerId,
        /// Credential bound into the container.
        credential_id: CredentialId,
        /// Image reference.
        image: String,
    },

    /// A container was stopped.
    ContainerStopped {
        /// Internal container id.
        container_id: ContainerId,
        /// Stop reason.
        reason: String,
    },

    /// A configuration file was attached from the chat surface.
    ConfigAttached {
        /// Validated file name.
        name: String,
        /// Size in bytes after decoding.
        size: usize,
    },

    /// The budget tracker crossed its warning threshold.
    BudgetWarning {
        /// Scope description.
        scope: String,
        /// Amount used so far.
        used: f64,
        /// The configured limit.
        limit: f64,
    },

    /// The budget tracker denied an allocation.
    BudgetExceeded {
        /// Scope description.
        scope: String,
        /// Amount requested.
        requested: f64,
        /// Amount remaining.
        available: f64,
    },
}

impl AuditAction {
    /// The snake-case discriminant used for filtering.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AccessGranted { .. } => "access_granted",
            Self::AccessDenied { .. } => "access_denied",
            Self::CredentialStored { .. } => "credential_stored",
            Self::CredentialAccessed { .. } => "credential_accessed",
            Self::CredentialDeleted { .. } => "credential_deleted",
            Self::SecretInjected { .. } => "secret_injected",
            Self::SecretRemoved { .. } => "secret_removed",
            Self::ContainerStarted { .. } => "container_started",
            Self::ContainerStopped { .. } => "container_stopped",
            Self::ConfigAttached { .. } => "config_attached",
            Self::BudgetWarning { .. } => "budget_warning",
            Self::BudgetExceeded { .. } => "budget_exceeded",
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The action completed.
    Success {
        /// Optional detail.
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    /// The action failed.
    Failure {
        /// Error description.
        error: String,
    },
}

impl AuditOutcome {
    /// A success with no detail.
    #[must_use]
    pub fn ok() -> Self {
        Self::Success { details: None }
    }

    /// A failure with the given error text.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failure { error: error.into() }
    }
}
