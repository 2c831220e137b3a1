//! Budget scope, window, and decision types.

use palisade_core::CredentialId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a counter is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// The process-wide counter.
    Global,
    /// One credential's counter.
    Credential(CredentialId),
}

impl BudgetScope {
    /// Stable key for map storage.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Global => "global".to_owned(),
            Self::Credential(id) => format!("credential:{id}"),
        }
    }
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Credential(id) => write!(f, "credential {id}"),
        }
    }
}

/// The two roll-over windows every scope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    /// Resets at local midnight.
    Day,
    /// Resets on the first of the month, local time.
    Month,
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day => f.write_str("day"),
            Self::Month => f.write_str("month"),
        }
    }
}

/// Configured limits shared by every scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// USD limit per local day.
    pub daily_limit_usd: f64,
    /// USD limit per local month.
    pub monthly_limit_usd: f64,
    /// Warn when used reaches this fraction of a limit (0–1).
    pub alert_threshold: f64,
    /// Whether exceeding a limit denies new allocations.
    pub hard_stop: bool,
}

impl BudgetLimits {
    /// Limit for one window.
    #[must_use]
    pub fn limit_for(&self, window: Window) -> f64 {
        match window {
            Window::Day => self.daily_limit_usd,
            Window::Month => self.monthly_limit_usd,
        }
    }
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily_limit_usd: 10.0,
            monthly_limit_usd: 100.0,
            alert_threshold: 0.8,
            hard_stop: true,
        }
    }
}

/// Result of an allocation check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AllocationDecision {
    /// Within budget.
    Ok,
    /// Allowed, but the warning threshold is crossed.
    Warn {
        /// Scope description.
        scope: String,
        /// Window that triggered the warning.
        window: Window,
        /// Spend including the requested amount.
        used: f64,
        /// The window's limit.
        limit: f64,
    },
    /// Denied: the window's limit would be exceeded and hard-stop is on.
    Deny {
        /// Scope description.
        scope: String,
        /// Window that denied.
        window: Window,
        /// Amount requested.
        requested: f64,
        /// Amount still available in the window.
        available: f64,
    },
}

impl AllocationDecision {
    /// Whether the allocation may proceed (possibly with a warning).
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Deny { .. })
    }
}

impl fmt::Display for AllocationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("within budget"),
            Self::Warn { used, limit, window, .. } => {
                write!(f, "budget warning: {used:.2}/{limit:.2} USD used this {window}")
            },
            Self::Deny {
                requested,
                available,
                window,
                ..
            } => write!(
                f,
                "budget exceeded ({window}): requested ${requested:.2}, available ${available:.2}"
            ),
        }
    }
}

/// Point-in-time counters for one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowStatus {
    /// Spend in the current window.
    pub used: f64,
    /// The window's limit.
    pub limit: f64,
    /// Remaining headroom (never negative).
    pub remaining: f64,
    /// ISO 8601 local date the current window began on.
    pub window_start: String,
}

/// Point-in-time counters for one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    /// The scope.
    pub scope: BudgetScope,
    /// Day window.
    pub day: WindowStatus,
    /// Month window.
    pub month: WindowStatus,
    /// Whether hard-stop is active.
    pub hard_stop: bool,
}
