//! The spend ledger.

use chrono::{DateTime, Datelike, Local, NaiveDate};
use dashmap::DashMap;
use std::sync::RwLock;

use crate::types::{
    AllocationDecision, BudgetLimits, BudgetScope, BudgetStatus, Window, WindowStatus,
};

/// Per-scope counters. Window starts are compared lazily on every touch.
#[derive(Debug, Clone)]
struct Counters {
    day_used: f64,
    day_start: NaiveDate,
    month_used: f64,
    month_start: (i32, u32),
}

impl Counters {
    fn new(now: DateTime<Local>) -> Self {
        Self {
            day_used: 0.0,
            day_start: now.date_naive(),
            month_used: 0.0,
            month_start: (now.year(), now.month()),
        }
    }

    /// Reset any window whose boundary has passed.
    fn roll(&mut self, now: DateTime<Local>) {
        let today = now.date_naive();
        if self.day_start != today {
            self.day_used = 0.0;
            self.day_start = today;
        }
        let month = (now.year(), now.month());
        if self.month_start != month {
            self.month_used = 0.0;
            self.month_start = month;
        }
    }

    fn used(&self, window: Window) -> f64 {
        match window {
            Window::Day => self.day_used,
            Window::Month => self.month_used,
        }
    }
}

/// Process-wide spend ledger keyed by scope.
///
/// Updates are serialized per scope through the map entry; status reads take
/// a snapshot without holding anything across the formatting work.
#[derive(Debug)]
pub struct BudgetLedger {
    limits: RwLock<BudgetLimits>,
    scopes: DashMap<String, Counters>,
}

impl BudgetLedger {
    /// Create a ledger with the given limits.
    #[must_use]
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits: RwLock::new(limits),
            scopes: DashMap::new(),
        }
    }

    /// Check whether `amount` USD may be allocated in `scope`.
    ///
    /// Does not record anything: call [`record`](Self::record) once the
    /// spend actually happens.
    #[must_use]
    pub fn allocate(&self, scope: &BudgetScope, amount: f64) -> AllocationDecision {
        self.allocate_at(scope, amount, Local::now())
    }

    /// Record `amount` USD of actual spend in `scope`.
    ///
    /// Negative, NaN, or infinite amounts are ignored so callers cannot
    /// manipulate counters with bad input.
    pub fn record(&self, scope: &BudgetScope, amount: f64) {
        self.record_at(scope, amount, Local::now());
    }

    /// Point-in-time counters for `scope`.
    #[must_use]
    pub fn status(&self, scope: &BudgetScope) -> BudgetStatus {
        self.status_at(scope, Local::now())
    }

    /// Zero both windows of `scope`.
    pub fn reset(&self, scope: &BudgetScope) {
        if let Some(mut counters) = self.scopes.get_mut(&scope.key()) {
            counters.day_used = 0.0;
            counters.month_used = 0.0;
        }
    }

    /// Replace the configured limits.
    pub fn set_limits(&self, limits: BudgetLimits) {
        let mut guard = self
            .limits
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = limits;
    }

    /// Snapshot the configured limits.
    #[must_use]
    pub fn limits(&self) -> BudgetLimits {
        self.limits
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn allocate_at(
        &self,
        scope: &BudgetScope,
        amount: f64,
        now: DateTime<Local>,
    ) -> AllocationDecision {
        let limits = self.limits();
        let mut counters = self
            .scopes
            .entry(scope.key())
            .or_insert_with(|| Counters::new(now));
        counters.roll(now);

        for window in [Window::Day, Window::Month] {
            let limit = limits.limit_for(window);
            let used = counters.used(window);
            if limits.hard_stop && used + amount > limit {
                tracing::warn!(scope = %scope, %window, used, limit, "Budget allocation denied");
                return AllocationDecision::Deny {
                    scope: scope.to_string(),
                    window,
                    requested: amount,
                    available: (limit - used).max(0.0),
                };
            }
        }

        for window in [Window::Day, Window::Month] {
            let limit = limits.limit_for(window);
            let used = counters.used(window);
            if limit > 0.0 && used + amount >= limits.alert_threshold * limit {
                return AllocationDecision::Warn {
                    scope: scope.to_string(),
                    window,
                    used: used + amount,
                    limit,
                };
            }
        }

        AllocationDecision::Ok
    }

    pub(crate) fn record_at(&self, scope: &BudgetScope, amount: f64, now: DateTime<Local>) {
        if !(amount > 0.0 && amount.is_finite()) {
            return;
        }
        let mut counters = self
            .scopes
            .entry(scope.key())
            .or_insert_with(|| Counters::new(now));
        counters.roll(now);
        counters.day_used += amount;
        counters.month_used += amount;
        tracing::debug!(scope = %scope, amount, day_used = counters.day_used, "Spend recorded");
    }

    pub(crate) fn status_at(&self, scope: &BudgetScope, now: DateTime<Local>) -> BudgetStatus {
        let limits = self.limits();
        let snapshot = {
            let mut counters = self
                .scopes
                .entry(scope.key())
                .or_insert_with(|| Counters::new(now));
            counters.roll(now);
            counters.clone()
        };

        let window_status = |window: Window| {
            let used = snapshot.used(window);
            let limit = limits.limit_for(window);
            let window_start = match window {
                Window::Day => snapshot.day_start.to_string(),
                Window::Month => {
                    format!("{:04}-{:02}-01", snapshot.month_start.0, snapshot.month_start.1)
                },
            };
            WindowStatus {
                used,
                limit,
                remaining: (limit - used).max(0.0),
                window_start,
            }
        };

        BudgetStatus {
            scope: scope.clone(),
            day: window_status(Window::Day),
            month: window_status(Window::Month),
            hard_stop: limits.hard_stop,
        }
    }
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::new(BudgetLimits::default())
    }
}
