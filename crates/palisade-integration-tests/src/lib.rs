//! Shared harness for the end-to-end scenarios.
//!
//! Assembles the bridge the way the daemon does, against the fake engine
//! and a tempdir runtime, and exposes the pieces the scenarios poke at.

use std::sync::Arc;
use std::time::Duration;

use palisade_audit::AuditLog;
use palisade_budget::{BudgetLedger, BudgetLimits};
use palisade_config::Config;
use palisade_core::{CredentialId, ErrorStore, Provider};
use palisade_crypto::MasterKey;
use palisade_engine::FakeEngine;
use palisade_events::EventBus;
use palisade_gateway::rpc::Dispatcher;
use palisade_gateway::BridgeState;
use palisade_keystore::{Keystore, NewCredential};
use palisade_runtime::{prepare_runtime_dir, LifecycleManager, RuntimeConfig};
use tokio_util::sync::CancellationToken;

/// An assembled in-process bridge.
pub struct Bridge {
    /// Shared state, as the daemon builds it.
    pub state: Arc<BridgeState>,
    /// The dispatcher over that state.
    pub dispatcher: Dispatcher,
    /// The fake engine behind the lifecycle manager.
    pub engine: FakeEngine,
    /// Daemon-wide cancellation token.
    pub cancel: CancellationToken,
    /// Keeps the runtime directory alive for the test's duration.
    pub dir: tempfile::TempDir,
}

/// Build a bridge with `tweak` applied to the config before assembly.
///
/// A credential `k1` (provider openai, token `sk-TEST`) is pre-stored.
#[must_use]
pub fn bridge(tweak: impl FnOnce(&mut Config)) -> Bridge {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.server.runtime_dir = dir.path().to_path_buf();
    config.server.socket_path = dir.path().join("bridge.sock");
    config.server.pid_file = dir.path().join("bridge.pid");
    config.keystore.db_path = dir.path().join("keystore.db");
    config.keystore.salt_path = dir.path().join("salt");
    tweak(&mut config);

    let runtime_config = RuntimeConfig {
        runtime_dir: config.server.runtime_dir.clone(),
        require_tmpfs: false,
        start_grace: Duration::from_millis(200),
        deletion_delay: Duration::from_millis(150),
        max_containers: config.container.max_containers,
        idle_timeout: Duration::from_secs(config.ttl.idle_timeout),
        provider_costs: config.budget.provider_costs.clone(),
        ..RuntimeConfig::default()
    };
    prepare_runtime_dir(&runtime_config).expect("runtime dir");

    let keystore =
        Arc::new(Keystore::open(&config.keystore.db_path, MasterKey::from_bytes([3; 32])).expect("keystore"));
    keystore
        .store(
            NewCredential::new(CredentialId::from("k1"), Provider::OpenAi, "sk-TEST"),
            false,
        )
        .expect("seed credential");

    let budget = Arc::new(BudgetLedger::new(BudgetLimits {
        daily_limit_usd: config.budget.daily_limit_usd,
        monthly_limit_usd: config.budget.monthly_limit_usd,
        alert_threshold: config.budget.alert_threshold,
        hard_stop: config.budget.hard_stop,
    }));
    let audit = Arc::new(AuditLog::in_memory());
    let errors = Arc::new(ErrorStore::new());
    let bus = Arc::new(EventBus::with_queue_capacity(config.eventbus.queue_capacity));
    let cancel = CancellationToken::new();
    let engine = FakeEngine::new();

    let manager = Arc::new(LifecycleManager::new(
        runtime_config,
        Arc::new(engine.clone()),
        Arc::clone(&keystore),
        Arc::clone(&budget),
        Arc::clone(&audit),
        Arc::clone(&errors),
        Arc::clone(&bus),
        cancel.clone(),
    ));

    let state = Arc::new(BridgeState::new(
        config,
        keystore,
        manager,
        budget,
        audit,
        errors,
        bus,
        None,
        cancel.clone(),
    ));
    let dispatcher = Dispatcher::new(Arc::clone(&state));

    Bridge {
        state,
        dispatcher,
        engine,
        cancel,
        dir,
    }
}
