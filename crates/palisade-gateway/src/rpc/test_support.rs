//! Shared fixtures for RPC handler tests.

use std::sync::Arc;
use std::time::Duration;

use palisade_audit::AuditLog;
use palisade_budget::{BudgetLedger, BudgetLimits};
use palisade_config::Config;
use palisade_core::{CredentialId, ErrorStore, Provider};
use palisade_crypto::MasterKey;
use palisade_engine::FakeEngine;
use palisade_events::EventBus;
use palisade_keystore::{Keystore, NewCredential};
use palisade_runtime::{prepare_runtime_dir, LifecycleManager, RuntimeConfig};
use tokio_util::sync::CancellationToken;

use crate::rpc::Dispatcher;
use crate::state::BridgeState;

/// Build a dispatcher over a fake engine and a tempdir runtime.
///
/// `tweak` mutates the config before assembly (zero-trust policy, budget
/// limits, …). The temp dir guard is returned so it outlives the test.
pub(crate) async fn test_dispatcher(
    tweak: impl FnOnce(&mut Config),
) -> (Dispatcher, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.server.runtime_dir = dir.path().to_path_buf();
    config.server.socket_path = dir.path().join("bridge.sock");
    tweak(&mut config);

    let runtime_config = RuntimeConfig {
        runtime_dir: config.server.runtime_dir.clone(),
        require_tmpfs: false,
        start_grace: Duration::from_millis(200),
        deletion_delay: Duration::from_millis(100),
        max_containers: config.container.max_containers,
        provider_costs: config.budget.provider_costs.clone(),
        ..RuntimeConfig::default()
    };
    prepare_runtime_dir(&runtime_config).unwrap();

    let keystore = Arc::new(Keystore::open_in_memory(MasterKey::from_bytes([7; 32])).unwrap());
    keystore
        .store(
            NewCredential::new(CredentialId::from("k1"), Provider::OpenAi, "sk-TEST"),
            false,
        )
        .unwrap();

    let budget = Arc::new(BudgetLedger::new(BudgetLimits {
        daily_limit_usd: config.budget.daily_limit_usd,
        monthly_limit_usd: config.budget.monthly_limit_usd,
        alert_threshold: config.budget.alert_threshold,
        hard_stop: config.budget.hard_stop,
    }));
    let audit = Arc::new(AuditLog::in_memory());
    let errors = Arc::new(ErrorStore::new());
    let bus = Arc::new(EventBus::new());
    let cancel = CancellationToken::new();

    let manager = Arc::new(LifecycleManager::new(
        runtime_config,
        Arc::new(FakeEngine::new()),
        Arc::clone(&keystore),
        Arc::clone(&budget),
        Arc::clone(&audit),
        Arc::clone(&errors),
        Arc::clone(&bus),
        cancel.clone(),
    ));

    let state = Arc::new(BridgeState::new(
        config, keystore, manager, budget, audit, errors, bus, None, cancel,
    ));
    (Dispatcher::new(state), dir)
}
