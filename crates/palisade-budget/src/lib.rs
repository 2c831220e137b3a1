//! Palisade Budget - per-scope daily and monthly spend tracking.
//!
//! The ledger gates any RPC that would allocate paid resources. Each scope
//! (global, or one credential) carries two windows — day and month — that
//! roll over lazily against the daemon's local wall clock: every touch first
//! normalizes the window, so roll-over is atomic under the per-scope entry
//! without a dedicated timer task.
//!
//! `allocate` answers Ok / Warn / Deny against the current counters;
//! `record` adds actual spend. The two are split so a denied allocation
//! never pollutes the counters and callers can reconcile estimates with
//! actuals.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod ledger;
mod types;

pub use ledger::BudgetLedger;
pub use types::{
    AllocationDecision, BudgetLimits, BudgetScope, BudgetStatus, Window, WindowStatus,
};
