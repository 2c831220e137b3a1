//! Coded error reports.
//!
//! Every failure anywhere in the bridge is materialized as an [`ErrorReport`]:
//! a `CAT-NNN` code, a severity, a trace id, and enough captured context to
//! diagnose the failure after the fact. Reports cross the RPC boundary
//! verbatim in `error.data`, so nothing here may ever carry plaintext secret
//! material.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{Timestamp, TraceId};

/// Well-known error codes.
///
/// The taxonomy is codified by prefix: CTX (container), MAT (chat protocol),
/// RPC (protocol surface), SYS (system and keystore), BGT (budget),
/// VOX (voice).
pub mod codes {
    /// Container failed to start.
    pub const CTX_START_FAILED: &str = "CTX-001";
    /// Container failed to stop or be removed.
    pub const CTX_STOP_FAILED: &str = "CTX-002";
    /// No such container.
    pub const CTX_NOT_FOUND: &str = "CTX-003";
    /// Concurrency limit reached.
    pub const CTX_LIMIT_REACHED: &str = "CTX-004";
    /// A concurrent start on the same credential is in flight.
    pub const CTX_START_CONTENDED: &str = "CTX-005";

    /// Chat connection failures (repeated).
    pub const MAT_CONNECTION: &str = "MAT-001";
    /// Chat sync timed out for a sustained period.
    pub const MAT_SYNC_TIMEOUT: &str = "MAT-003";
    /// Login or token refresh failed.
    pub const MAT_LOGIN_FAILED: &str = "MAT-010";
    /// Outbound send failed.
    pub const MAT_SEND_FAILED: &str = "MAT-021";

    /// Invalid params or unknown id on the RPC surface.
    pub const RPC_INVALID: &str = "RPC-001";
    /// Config attach rejected (traversal, size, encoding).
    pub const RPC_CONFIG_REJECTED: &str = "RPC-002";
    /// Command rejected by the zero-trust filter.
    pub const RPC_ACCESS_DENIED: &str = "RPC-003";

    /// Keystore open or decrypt failure.
    pub const SYS_KEYSTORE: &str = "SYS-001";
    /// Duplicate credential id without replace.
    pub const SYS_DUPLICATE_KEY: &str = "SYS-004";
    /// Runtime directory or secret injection failure.
    pub const SYS_INJECTION: &str = "SYS-010";

    /// Budget warning threshold crossed.
    pub const BGT_WARN: &str = "BGT-001";
    /// Budget exceeded; allocation denied.
    pub const BGT_EXCEEDED: &str = "BGT-002";

    /// Voice support is not enabled.
    pub const VOX_DISABLED: &str = "VOX-001";
}

/// Error category, derived from the code prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Container lifecycle and engine failures (CTX).
    Container,
    /// Chat protocol failures (MAT).
    Matrix,
    /// RPC surface failures (RPC).
    Rpc,
    /// System and keystore failures (SYS).
    System,
    /// Budget enforcement (BGT).
    Budget,
    /// Voice/call control (VOX).
    Voice,
}

impl ErrorCategory {
    /// The three-letter code prefix for this category.
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Container => "CTX",
            Self::Matrix => "MAT",
            Self::Rpc => "RPC",
            Self::System => "SYS",
            Self::Budget => "BGT",
            Self::Voice => "VOX",
        }
    }

    /// Derive the category from a `CAT-NNN` code string.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code.get(..3)? {
            "CTX" => Some(Self::Container),
            "MAT" => Some(Self::Matrix),
            "RPC" => Some(Self::Rpc),
            "SYS" => Some(Self::System),
            "BGT" => Some(Self::Budget),
            "VOX" => Some(Self::Voice),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Report severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Diagnostic detail.
    Debug,
    /// Expected but notable.
    Info,
    /// Degraded but operational.
    Warning,
    /// Operation failed.
    Error,
    /// The process cannot continue serving.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One entry in a report's per-component event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEvent {
    /// Component that recorded the event.
    pub component: String,
    /// When it was recorded.
    pub at: Timestamp,
    /// Free-form note.
    pub note: String,
}

/// A structured, coded error report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// `CAT-NNN` code.
    pub code: String,
    /// Category derived from the code prefix.
    pub category: ErrorCategory,
    /// Severity.
    pub severity: Severity,
    /// Correlation id; unique per report.
    pub trace_id: TraceId,
    /// Function (or component) that raised the report.
    pub function: String,
    /// Creation time.
    pub timestamp: Timestamp,
    /// Human-readable message.
    pub message: String,
    /// Operator remediation hint, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    /// Sanitized inputs at the failure site.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Relevant component state at the failure site.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state: BTreeMap<String, serde_json::Value>,
    /// Stringified cause chain, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cause_chain: Vec<String>,
    /// Per-component event log accumulated while the report crossed layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ReportEvent>,
    /// Whether the caller may retry the failed operation.
    #[serde(default)]
    pub retryable: bool,
    /// Whether an operator has marked the report resolved.
    #[serde(default)]
    pub resolved: bool,
}

impl ErrorReport {
    /// Create a report for `code` raised in `function`.
    ///
    /// The category is derived from the code prefix; an unknown prefix is
    /// treated as [`ErrorCategory::System`]. Severity defaults to
    /// [`Severity::Error`].
    #[must_use]
    pub fn new(code: &str, function: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.to_owned(),
            category: ErrorCategory::from_code(code).unwrap_or(ErrorCategory::System),
            severity: Severity::Error,
            trace_id: TraceId::new(),
            function: function.into(),
            timestamp: Timestamp::now(),
            message: message.into(),
            remediation: None,
            inputs: BTreeMap::new(),
            state: BTreeMap::new(),
            cause_chain: Vec::new(),
            events: Vec::new(),
            retryable: false,
            resolved: false,
        }
    }

    /// Set the severity.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the remediation hint.
    #[must_use]
    pub fn with_remediation(mut self, hint: impl Into<String>) -> Self {
        self.remediation = Some(hint.into());
        self
    }

    /// Record a sanitized input value.
    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    /// Record a component-state value.
    #[must_use]
    pub fn with_state(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.state.insert(key.into(), value.into());
        self
    }

    /// Append a cause to the chain.
    #[must_use]
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause_chain.push(cause.to_string());
        self
    }

    /// Mark the failure as retryable.
    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Append an event from `component` to the report's event log.
    pub fn record_event(&mut self, component: impl Into<String>, note: impl Into<String>) {
        self.events.push(ReportEvent {
            component: component.into(),
            at: Timestamp::now(),
            note: note.into(),
        });
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.severity, self.message)
    }
}
