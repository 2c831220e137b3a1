//! Palisade Core - Foundation types for the Palisade security bridge.
//!
//! This crate provides:
//! - Id newtypes and timestamps shared across the bridge
//! - The provider tag set for stored credentials
//! - The container state machine
//! - The coded error-report system and its bounded store

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod provider;
pub mod report;
pub mod state;
pub mod store;
pub mod types;

pub use provider::Provider;
pub use report::{ErrorCategory, ErrorReport, ReportEvent, Severity, codes};
pub use state::ContainerState;
pub use store::{ErrorStore, ReportQuery};
pub use types::{ContainerId, CredentialId, SubscriberId, Timestamp, TraceId};
