//! Bounded in-memory store for error reports.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::report::{ErrorCategory, ErrorReport, Severity};
use crate::types::TraceId;

/// Default report retention.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Filter for querying stored reports. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ReportQuery {
    /// Exact code match (`CTX-001`).
    pub code: Option<String>,
    /// Category match.
    pub category: Option<ErrorCategory>,
    /// Minimum severity.
    pub min_severity: Option<Severity>,
    /// Resolved flag match.
    pub resolved: Option<bool>,
    /// Maximum number of reports to return (most recent first).
    pub limit: Option<usize>,
}

impl ReportQuery {
    fn matches(&self, report: &ErrorReport) -> bool {
        if let Some(code) = &self.code
            && report.code != *code
        {
            return false;
        }
        if let Some(category) = self.category
            && report.category != category
        {
            return false;
        }
        if let Some(min) = self.min_severity
            && report.severity < min
        {
            return false;
        }
        if let Some(resolved) = self.resolved
            && report.resolved != resolved
        {
            return false;
        }
        true
    }
}

/// Append-only ring of [`ErrorReport`]s, oldest evicted at capacity.
///
/// Shared across every component of the bridge; all mutation happens under a
/// single mutex, which is fine because reports are rare relative to requests.
#[derive(Debug)]
pub struct ErrorStore {
    ring: Mutex<VecDeque<ErrorReport>>,
    capacity: usize,
}

impl ErrorStore {
    /// Create a store with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a store retaining at most `capacity` reports.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Record a report, evicting the oldest at capacity.
    ///
    /// Returns the report's trace id for correlation.
    pub fn record(&self, report: ErrorReport) -> TraceId {
        let trace_id = report.trace_id;
        tracing::debug!(code = %report.code, trace_id = %trace_id, "Recording error report");
        let mut ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(report);
        trace_id
    }

    /// Fetch one report by trace id.
    #[must_use]
    pub fn get(&self, trace_id: TraceId) -> Option<ErrorReport> {
        let ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        ring.iter().find(|r| r.trace_id == trace_id).cloned()
    }

    /// Query reports, most recent first.
    #[must_use]
    pub fn query(&self, query: &ReportQuery) -> Vec<ErrorReport> {
        let ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let iter = ring.iter().rev().filter(|r| query.matches(r)).cloned();
        match query.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    /// Mark the report with `trace_id` resolved.
    ///
    /// Returns `false` when no such report is retained.
    pub fn resolve(&self, trace_id: TraceId) -> bool {
        let mut ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match ring.iter_mut().find(|r| r.trace_id == trace_id) {
            Some(report) => {
                report.resolved = true;
                true
            },
            None => false,
        }
    }

    /// Number of retained reports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ErrorStore {
    fn default() -> Self {
        Self::new()
    }
}
