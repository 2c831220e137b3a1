//! The container lifecycle manager.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use palisade_audit::{AuditAction, AuditEntry, AuditLog, AuditOutcome};
use palisade_budget::{AllocationDecision, BudgetLedger, BudgetScope};
use palisade_core::{
    codes, ContainerId, ContainerState, CredentialId, ErrorReport, ErrorStore, Severity, Timestamp,
};
use palisade_engine::{CallCtx, ContainerEngine};
use palisade_events::{BridgeEvent, EventBus};
use palisade_keystore::Keystore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::injector::Injector;
use crate::types::{ContainerHealth, ContainerRecord, RuntimeConfig, StartOptions};

/// Estimated cost for providers without a configured cost.
const DEFAULT_START_COST_USD: f64 = 0.01;

/// Transient stop/remove failures are retried this many times.
const STOP_ATTEMPTS: u32 = 3;

/// Base delay for stop retries; doubles per attempt.
const STOP_RETRY_BASE: Duration = Duration::from_secs(1);

/// Tracks active containers, enforces concurrency and budget gates, and
/// owns every state transition.
pub struct LifecycleManager {
    config: RuntimeConfig,
    engine: Arc<dyn ContainerEngine>,
    keystore: Arc<Keystore>,
    budget: Arc<BudgetLedger>,
    audit: Arc<AuditLog>,
    errors: Arc<ErrorStore>,
    bus: Arc<EventBus>,
    injector: Arc<Injector>,
    containers: DashMap<ContainerId, ContainerRecord>,
    starts_in_flight: DashSet<CredentialId>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("containers", &self.containers.len())
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Create a manager. [`crate::prepare_runtime_dir`] must have run first.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        engine: Arc<dyn ContainerEngine>,
        keystore: Arc<Keystore>,
        budget: Arc<BudgetLedger>,
        audit: Arc<AuditLog>,
        errors: Arc<ErrorStore>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        let injector = Arc::new(Injector::new(
            config.clone(),
            Arc::clone(&engine),
            Arc::clone(&audit),
        ));
        Self {
            config,
            engine,
            keystore,
            budget,
            audit,
            errors,
            bus,
            injector,
            containers: DashMap::new(),
            starts_in_flight: DashSet::new(),
            cancel,
        }
    }

    /// The shared engine handle (used by the engine event consumer).
    #[must_use]
    pub fn engine(&self) -> Arc<dyn ContainerEngine> {
        Arc::clone(&self.engine)
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start a container bound to `credential_id`.
    ///
    /// Order of gates: credential metadata → budget → concurrency →
    /// per-credential serialization → injection. Nothing is created and no
    /// plaintext is decrypted until every gate has passed.
    ///
    /// # Errors
    ///
    /// Budget denials, the concurrency cap, contended starts (retryable),
    /// and injection/engine failures.
    pub async fn start(
        &self,
        credential_id: CredentialId,
        options: StartOptions,
    ) -> RuntimeResult<ContainerId> {
        let metadata = self.keystore.metadata(&credential_id)?;
        if metadata.is_expired() {
            return Err(RuntimeError::CredentialExpired { credential_id });
        }

        let cost = self
            .config
            .provider_costs
            .get(metadata.provider.as_str())
            .copied()
            .unwrap_or(DEFAULT_START_COST_USD);
        self.check_budget(&credential_id, cost)?;

        let live = self
            .containers
            .iter()
            .filter(|r| r.state.is_live() || r.state == ContainerState::Pending)
            .count();
        if live >= self.config.max_containers {
            return Err(RuntimeError::LimitReached {
                limit: self.config.max_containers,
            });
        }

        if !self.starts_in_flight.insert(credential_id.clone()) {
            return Err(RuntimeError::StartContended { credential_id });
        }
        let _guard = StartGuard {
            set: &self.starts_in_flight,
            id: credential_id.clone(),
        };

        let container_id = ContainerId::new();
        let secret_path = self.config.secret_path(&container_id);
        let record = ContainerRecord {
            id: container_id.clone(),
            engine_id: None,
            credential_id: credential_id.clone(),
            image: options
                .image
                .clone()
                .unwrap_or_else(|| self.config.image.clone()),
            secret_path,
            bind_path: self.config.bind_path.clone(),
            state: ContainerState::Pending,
            created_at: Timestamp::now(),
            last_heartbeat_at: Timestamp::now(),
            idle_timeout: options.idle_timeout.unwrap_or(self.config.idle_timeout),
            exit_code: None,
            stop_reason: None,
        };
        self.containers.insert(container_id.clone(), record);
        self.transition(&container_id, ContainerState::Starting, None);

        let decrypted = match self.keystore.get(&credential_id) {
            Ok(decrypted) => {
                self.audit.record(AuditEntry::new(
                    AuditAction::CredentialAccessed {
                        id: credential_id.clone(),
                        purpose: "container_start".to_owned(),
                    },
                    AuditOutcome::ok(),
                ));
                decrypted
            },
            Err(e) => {
                self.fail_container(&container_id, &e.to_string(), None);
                return Err(e.into());
            },
        };

        match self
            .injector
            .inject_and_start(&container_id, &decrypted, &options, &self.cancel)
            .await
        {
            Ok(engine_id) => {
                drop(decrypted);
                if let Some(mut record) = self.containers.get_mut(&container_id) {
                    record.engine_id = Some(engine_id);
                    record.last_heartbeat_at = Timestamp::now();
                }
                self.transition(&container_id, ContainerState::Running, None);

                self.budget.record(&BudgetScope::Global, cost);
                self.budget
                    .record(&BudgetScope::Credential(credential_id.clone()), cost);

                let image = self
                    .containers
                    .get(&container_id)
                    .map(|r| r.image.clone())
                    .unwrap_or_default();
                self.audit.record(AuditEntry::new(
                    AuditAction::ContainerStarted {
                        container_id: container_id.clone(),
                        credential_id,
                        image,
                    },
                    AuditOutcome::ok(),
                ));

                self.arm_deletion_delay(&container_id);
                info!(container = %container_id, "Container started");
                Ok(container_id)
            },
            Err(e) => {
                self.fail_container(&container_id, &e.to_string(), None);
                debug!(container = %container_id, error = %e, "Start failed");
                Err(e)
            },
        }
    }

    /// Stop a container. Returns `false` when it was already terminal.
    ///
    /// Transient engine failures are retried with exponential backoff
    /// (three attempts from one second).
    ///
    /// # Errors
    ///
    /// [`RuntimeError::NotFound`] for unknown ids; engine failures after
    /// the retries are exhausted.
    pub async fn stop(&self, container_id: &ContainerId, reason: &str) -> RuntimeResult<bool> {
        let (engine_id, state) = {
            let record = self
                .containers
                .get(container_id)
                .ok_or_else(|| RuntimeError::NotFound {
                    container_id: container_id.clone(),
                })?;
            (record.engine_id.clone(), record.state)
        };

        if state.is_terminal() {
            return Ok(false);
        }
        if state == ContainerState::Stopping {
            return Ok(false);
        }

        // Entering stopping unlinks the secret bundle immediately.
        self.transition(container_id, ContainerState::Stopping, Some(reason.to_owned()));

        let mut exit_code = None;
        if let Some(engine_id) = engine_id {
            let ctx = CallCtx {
                timeout: Duration::from_secs(30),
                cancel: self.cancel.clone(),
            };

            if let Err(e) = self
                .with_stop_retries("stop", || self.engine.stop(&engine_id, self.config.stop_grace_secs, &ctx))
                .await
            {
                self.transition(container_id, ContainerState::Failed, Some(reason.to_owned()));
                return Err(e);
            }

            exit_code = match self.engine.inspect(&engine_id, &ctx).await {
                Ok(report) => report.exit_code,
                Err(_) => None,
            };

            if let Err(e) = self
                .with_stop_retries("remove", || self.engine.remove(&engine_id, true, &ctx))
                .await
            {
                warn!(container = %container_id, error = %e, "Container remove failed; continuing");
            }
        }

        if let Some(mut record) = self.containers.get_mut(container_id) {
            record.exit_code = exit_code;
            record.stop_reason = Some(reason.to_owned());
        }
        self.transition(container_id, ContainerState::Stopped, Some(reason.to_owned()));

        self.audit.record(AuditEntry::new(
            AuditAction::ContainerStopped {
                container_id: container_id.clone(),
                reason: reason.to_owned(),
            },
            AuditOutcome::ok(),
        ));
        info!(container = %container_id, reason = %reason, "Container stopped");
        Ok(true)
    }

    /// Record a heartbeat. An idle container becomes running again.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::NotFound`] for unknown ids.
    pub fn heartbeat(&self, container_id: &ContainerId) -> RuntimeResult<()> {
        let state = {
            let mut record = self
                .containers
                .get_mut(container_id)
                .ok_or_else(|| RuntimeError::NotFound {
                    container_id: container_id.clone(),
                })?;
            record.last_heartbeat_at = Timestamp::now();
            record.state
        };
        if state == ContainerState::Idle {
            self.transition(container_id, ContainerState::Running, Some("heartbeat".to_owned()));
        }
        Ok(())
    }

    /// Snapshot every managed container.
    #[must_use]
    pub fn list(&self) -> Vec<ContainerRecord> {
        self.containers.iter().map(|r| r.clone()).collect()
    }

    /// Snapshot one container.
    #[must_use]
    pub fn get(&self, container_id: &ContainerId) -> Option<ContainerRecord> {
        self.containers.get(container_id).map(|r| r.clone())
    }

    /// The health view of one container.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::NotFound`] for unknown ids.
    pub fn health(&self, container_id: &ContainerId) -> RuntimeResult<ContainerHealth> {
        self.get(container_id)
            .map(|r| r.health())
            .ok_or_else(|| RuntimeError::NotFound {
                container_id: container_id.clone(),
            })
    }

    /// Number of live (non-terminal) containers.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.containers
            .iter()
            .filter(|r| r.state.is_live() || r.state == ContainerState::Pending)
            .count()
    }

    /// One reaper sweep: apply idle and lifetime policies to every live
    /// container. Errors on one container never abort the sweep.
    pub async fn sweep(&self) {
        let snapshot: Vec<(ContainerId, ContainerState, i64, i64, Duration)> = self
            .containers
            .iter()
            .filter(|r| r.state.is_live())
            .map(|r| {
                (
                    r.id.clone(),
                    r.state,
                    r.last_heartbeat_at.elapsed_secs(),
                    r.created_at.elapsed_secs(),
                    r.idle_timeout,
                )
            })
            .collect();

        for (id, state, heartbeat_age, uptime, idle_timeout) in snapshot {
            let idle_secs = i64::try_from(idle_timeout.as_secs()).unwrap_or(i64::MAX);

            if let Some(max_lifetime) = self.config.max_lifetime
                && uptime >= i64::try_from(max_lifetime.as_secs()).unwrap_or(i64::MAX)
            {
                if let Err(e) = self.stop(&id, "lifetime_expired").await {
                    self.record_sweep_failure(&id, &e, "lifetime stop failed");
                }
                continue;
            }

            if heartbeat_age >= idle_secs.saturating_mul(2) {
                if let Err(e) = self.stop(&id, "idle_expired").await {
                    self.record_sweep_failure(&id, &e, "idle stop failed");
                }
            } else if heartbeat_age >= idle_secs && state == ContainerState::Running {
                self.transition(&id, ContainerState::Idle, Some("no_heartbeat".to_owned()));
            }
        }
    }

    /// React to a best-effort engine event.
    pub fn on_engine_event(&self, event: &palisade_engine::EngineEvent) {
        let container_id = self
            .containers
            .iter()
            .find(|r| r.engine_id.as_deref() == Some(event.engine_id()))
            .map(|r| r.id.clone());
        let Some(container_id) = container_id else {
            return;
        };

        let state = self.containers.get(&container_id).map(|r| r.state);
        match state {
            Some(state) if state.is_live() => {},
            // Our own stop path or an already-terminal container.
            _ => return,
        }

        let (new_state, reason, exit_code) = match event {
            palisade_engine::EngineEvent::Died { exit_code, .. } => {
                (ContainerState::Failed, "engine_died", *exit_code)
            },
            palisade_engine::EngineEvent::OomKilled { .. } => {
                (ContainerState::Failed, "oom_killed", Some(137))
            },
            palisade_engine::EngineEvent::Stopped { .. } => {
                (ContainerState::Failed, "stopped_externally", None)
            },
        };

        if let Some(mut record) = self.containers.get_mut(&container_id) {
            record.exit_code = exit_code;
            record.stop_reason = Some(reason.to_owned());
        }
        self.transition(&container_id, new_state, Some(reason.to_owned()));
        warn!(container = %container_id, reason = %reason, "Container ended by engine event");
    }

    /// Stop every live container and purge the secrets directory.
    ///
    /// Called during graceful shutdown; per-container errors are logged
    /// and do not prevent the purge.
    pub async fn shutdown_all(&self) {
        let live: Vec<ContainerId> = self
            .containers
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.id.clone())
            .collect();

        for id in live {
            if let Err(e) = self.stop(&id, "shutdown").await {
                error!(container = %id, error = %e, "Shutdown stop failed");
            }
        }

        self.injector.purge_secrets_dir();
    }

    /// Force-purge every bundle without stopping anything.
    ///
    /// The shutdown-timeout path: containers that refused to stop are
    /// being killed anyway, and no secret file may survive the exit.
    pub fn purge_secrets(&self) {
        self.injector.purge_secrets_dir();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Reaper-driven stop failures have no RPC caller to surface them, so
    /// they are materialized and bus-published here.
    fn record_sweep_failure(&self, container_id: &ContainerId, e: &RuntimeError, what: &str) {
        warn!(container = %container_id, error = %e, "{what}");
        let report = ErrorReport::new(codes::CTX_STOP_FAILED, "manager::sweep", e.to_string())
            .with_input("container_id", container_id.to_string())
            .retryable();
        self.bus.publish(BridgeEvent::ErrorReport(report.clone()));
        self.errors.record(report);
    }

    fn check_budget(&self, credential_id: &CredentialId, cost: f64) -> RuntimeResult<()> {
        for scope in [
            BudgetScope::Global,
            BudgetScope::Credential(credential_id.clone()),
        ] {
            match self.budget.allocate(&scope, cost) {
                AllocationDecision::Ok => {},
                AllocationDecision::Warn { scope, window, used, limit } => {
                    self.audit.record(AuditEntry::new(
                        AuditAction::BudgetWarning {
                            scope: scope.clone(),
                            used,
                            limit,
                        },
                        AuditOutcome::ok(),
                    ));
                    self.errors.record(
                        ErrorReport::new(codes::BGT_WARN, "manager::check_budget", format!(
                            "budget warning for {scope}: {used:.2}/{limit:.2} USD this {window}"
                        ))
                        .with_severity(Severity::Warning),
                    );
                    self.bus.publish(BridgeEvent::BudgetAlert {
                        scope,
                        used,
                        limit,
                        denied: false,
                    });
                },
                AllocationDecision::Deny { scope, requested, available, window } => {
                    self.audit.record(AuditEntry::new(
                        AuditAction::BudgetExceeded {
                            scope: scope.clone(),
                            requested,
                            available,
                        },
                        AuditOutcome::ok(),
                    ));
                    self.bus.publish(BridgeEvent::BudgetAlert {
                        scope: scope.clone(),
                        used: requested,
                        limit: available,
                        denied: true,
                    });
                    return Err(RuntimeError::Budget {
                        decision: AllocationDecision::Deny {
                            scope,
                            window,
                            requested,
                            available,
                        },
                    });
                },
            }
        }
        Ok(())
    }

    /// Apply a state transition, unlinking the bundle where the state
    /// machine requires it, and publish the change to the bus.
    fn transition(&self, container_id: &ContainerId, next: ContainerState, reason: Option<String>) {
        let Some(mut record) = self.containers.get_mut(container_id) else {
            return;
        };
        let current = record.state;
        if !current.can_transition_to(next) {
            warn!(
                container = %container_id,
                from = %current,
                to = %next,
                "Ignoring illegal state transition"
            );
            return;
        }
        record.state = next;
        let secret_path = record.secret_path.clone();
        drop(record);

        // The bundle never survives the transition out of starting (except
        // into running, where the deletion delay takes over), nor entering
        // stopping or a terminal state.
        let unlink_reason = match (current, next) {
            (ContainerState::Starting, ContainerState::Running) => None,
            (ContainerState::Starting, _) => Some("left_starting"),
            (_, ContainerState::Stopping) => Some("stopping"),
            (_, ContainerState::Failed | ContainerState::Stopped) => Some("terminal"),
            _ => None,
        };
        if let Some(unlink_reason) = unlink_reason {
            self.injector
                .remove_bundle(container_id, &secret_path, unlink_reason);
        }

        debug!(container = %container_id, from = %current, to = %next, "State transition");
        self.bus.publish(BridgeEvent::ContainerState {
            container_id: container_id.clone(),
            state: next,
            reason,
        });
    }

    fn fail_container(&self, container_id: &ContainerId, reason: &str, exit_code: Option<i64>) {
        if let Some(mut record) = self.containers.get_mut(container_id) {
            record.stop_reason = Some(reason.to_owned());
            record.exit_code = exit_code;
        }
        self.transition(container_id, ContainerState::Failed, Some(reason.to_owned()));
    }

    /// Arm the deletion-delay unlink for a successfully started container.
    ///
    /// Cancellation (daemon shutdown) unlinks immediately instead of
    /// waiting out the delay.
    fn arm_deletion_delay(&self, container_id: &ContainerId) {
        let Some(record) = self.containers.get(container_id) else {
            return;
        };
        let secret_path = record.secret_path.clone();
        drop(record);

        let injector = Arc::clone(&self.injector);
        let cancel = self.cancel.clone();
        let delay = self.config.deletion_delay;
        let id = container_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {},
                () = tokio::time::sleep(delay) => {},
            }
            injector.remove_bundle(&id, &secret_path, "deletion_delay");
        });
    }

    async fn with_stop_retries<F, Fut>(&self, op: &'static str, mut call: F) -> RuntimeResult<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), palisade_engine::EngineError>>,
    {
        let mut delay = STOP_RETRY_BASE;
        let mut attempt = 1u32;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < STOP_ATTEMPTS => {
                    debug!(op, attempt, error = %e, "Transient engine failure; retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt = attempt.saturating_add(1);
                },
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Releases the per-credential start lock on scope exit.
struct StartGuard<'a> {
    set: &'a DashSet<CredentialId>,
    id: CredentialId,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}
