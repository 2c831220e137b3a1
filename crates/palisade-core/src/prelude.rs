//! Prelude module - commonly used types for convenient import.
//!
//! Use `use palisade_core::prelude::*;` to import all essential types.

// Common types
pub use crate::{ContainerId, CredentialId, SubscriberId, Timestamp, TraceId};

// Provider tags
pub use crate::Provider;

// Container state machine
pub use crate::ContainerState;

// Error reports
pub use crate::{ErrorCategory, ErrorReport, ErrorStore, ReportEvent, ReportQuery, Severity, codes};
