//! Palisade Audit - the append-only security log.
//!
//! Every authorization decision, secret operation, and policy event in the
//! bridge is recorded as a typed [`AuditEntry`]. Entries are appended to a
//! JSONL file (one entry per line, never rewritten) and mirrored into a
//! bounded in-memory window for cheap querying over RPC.
//!
//! The audit log is an operational record, not a tamper-evident ledger:
//! integrity of the file is delegated to filesystem permissions.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod entry;
mod error;
mod log;

pub use entry::{AuditAction, AuditEntry, AuditOutcome};
pub use error::{AuditError, AuditResult};
pub use log::AuditLog;
