//! Status, health, error-query, and budget RPC methods.

use palisade_budget::{BudgetLimits, BudgetScope};
use palisade_core::{CredentialId, ErrorCategory, ReportQuery, Severity, TraceId};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_params, to_value, Dispatcher, RpcFailure};

#[derive(Debug, Deserialize)]
struct GetErrorsParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    resolved: Option<bool>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ResolveErrorParams {
    trace_id: String,
}

#[derive(Debug, Deserialize)]
struct SetBudgetParams {
    #[serde(default)]
    daily_limit_usd: Option<f64>,
    #[serde(default)]
    monthly_limit_usd: Option<f64>,
    #[serde(default)]
    alert_threshold: Option<f64>,
    #[serde(default)]
    hard_stop: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct BudgetStatusParams {
    #[serde(default)]
    key_id: Option<String>,
}

impl Dispatcher {
    pub(super) async fn status(&self) -> Result<Value, RpcFailure> {
        let containers = self.state.manager.list();
        let container_ids: Vec<String> = containers
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.id.to_string())
            .collect();
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "state": "running",
            "socket": self.state.config.server.socket_path,
            "uptime_secs": self.state.started_at.elapsed_secs(),
            "containers": container_ids.len(),
            "container_ids": container_ids,
            "matrix_connected": self.state.matrix.as_ref().is_some_and(|m| m.has_session()),
        }))
    }

    /// The cheap liveness probe: no engine round-trip, just daemon state.
    pub(super) fn health(&self) -> Result<Value, RpcFailure> {
        let matrix_expected = self.state.config.matrix.enabled;
        let matrix_ok = self.state.matrix.as_ref().is_some_and(|m| m.has_session());
        let degraded = matrix_expected && !matrix_ok;
        Ok(json!({"status": if degraded { "degraded" } else { "ok" }}))
    }

    pub(super) async fn bridge_health(&self) -> Result<Value, RpcFailure> {
        let engine_ok = self.state.manager.engine().ping().await.is_ok();
        let matrix_expected = self.state.config.matrix.enabled;
        let matrix_ok = self.state.matrix.as_ref().is_some_and(|m| m.has_session());

        let degraded = !engine_ok || (matrix_expected && !matrix_ok);
        Ok(json!({
            "status": if degraded { "degraded" } else { "ok" },
            "engine": if engine_ok { "ok" } else { "unreachable" },
            "matrix": if !matrix_expected { "disabled" } else if matrix_ok { "ok" } else { "disconnected" },
            "live_containers": self.state.manager.live_count(),
        }))
    }

    pub(super) fn get_errors(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: GetErrorsParams = if params.is_null() {
            GetErrorsParams {
                code: None,
                category: None,
                severity: None,
                resolved: None,
                limit: None,
            }
        } else {
            parse_params(params)?
        };

        let category = params
            .category
            .as_deref()
            .map(|c| {
                ErrorCategory::from_code(&format!("{}-000", c.to_uppercase()))
                    .ok_or_else(|| RpcFailure::invalid_params(format!("unknown category {c:?}")))
            })
            .transpose()?;

        let min_severity = params
            .severity
            .as_deref()
            .map(|s| match s {
                "debug" => Ok(Severity::Debug),
                "info" => Ok(Severity::Info),
                "warning" => Ok(Severity::Warning),
                "error" => Ok(Severity::Error),
                "critical" => Ok(Severity::Critical),
                other => Err(RpcFailure::invalid_params(format!("unknown severity {other:?}"))),
            })
            .transpose()?;

        let reports = self.state.errors.query(&ReportQuery {
            code: params.code,
            category,
            min_severity,
            resolved: params.resolved,
            limit: Some(params.limit.unwrap_or(100)),
        });
        to_value(reports)
    }

    pub(super) fn resolve_error(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: ResolveErrorParams = parse_params(params)?;
        let trace_id: TraceId = params
            .trace_id
            .parse()
            .map_err(|_| RpcFailure::invalid_params(format!("bad trace id {:?}", params.trace_id)))?;
        Ok(json!({"resolved": self.state.errors.resolve(trace_id)}))
    }

    pub(super) fn set_budget(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: SetBudgetParams = parse_params(params)?;
        let current = self.state.budget.limits();
        let limits = BudgetLimits {
            daily_limit_usd: params.daily_limit_usd.unwrap_or(current.daily_limit_usd),
            monthly_limit_usd: params.monthly_limit_usd.unwrap_or(current.monthly_limit_usd),
            alert_threshold: params.alert_threshold.unwrap_or(current.alert_threshold),
            hard_stop: params.hard_stop.unwrap_or(current.hard_stop),
        };

        if !(limits.alert_threshold > 0.0 && limits.alert_threshold <= 1.0) {
            return Err(RpcFailure::invalid_params("alert_threshold must be within (0, 1]"));
        }
        if limits.daily_limit_usd < 0.0 || limits.monthly_limit_usd < 0.0 {
            return Err(RpcFailure::invalid_params("limits must be non-negative"));
        }

        self.state.budget.set_limits(limits.clone());
        to_value(limits)
    }

    pub(super) fn budget_status(&self, params: Value) -> Result<Value, RpcFailure> {
        let params: BudgetStatusParams = if params.is_null() {
            BudgetStatusParams { key_id: None }
        } else {
            parse_params(params)?
        };
        let scope = match params.key_id {
            Some(key_id) => BudgetScope::Credential(CredentialId::from(key_id)),
            None => BudgetScope::Global,
        };
        to_value(self.state.budget.status(&scope))
    }
}
