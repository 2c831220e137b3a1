//! Daemon assembly: startup order, background tasks, graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use palisade_audit::AuditLog;
use palisade_budget::{BudgetLedger, BudgetLimits};
use palisade_config::Config;
use palisade_core::{CredentialId, ErrorStore, Provider};
use palisade_crypto::{host_identifier, MasterKey, SaltFile};
use palisade_engine::{ContainerEngine, DockerEngine};
use palisade_events::{BridgeEvent, EventBus, EventFilter};
use palisade_keystore::{Keystore, NewCredential};
use palisade_matrix::{run_sync_loop, MatrixClient, RetryPolicy, SyncLoopCtx};
use palisade_runtime::{
    prepare_runtime_dir, run_engine_events, run_reaper, LifecycleManager, RuntimeConfig,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::inbound::{run_inbound_router, InboundRouterCtx};
use crate::rpc::Dispatcher;
use crate::server::{bind_socket, run_socket_server};
use crate::state::BridgeState;
use crate::ws::{bind_ws, run_ws_server};

/// Credential id under which the chat session token is cached.
const MATRIX_SESSION_ID: &str = "matrix-session";

/// Documented process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Normal shutdown.
    Ok,
    /// Generic fatal error.
    Fatal,
    /// Configuration invalid.
    ConfigInvalid,
    /// Keystore open or decrypt failed.
    KeystoreFailed,
    /// Container engine unavailable.
    EngineUnavailable,
    /// Socket setup failed.
    SocketFailed,
    /// Shutdown timeout exceeded.
    ShutdownTimeout,
}

impl ExitCode {
    /// The numeric process exit code.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Fatal => 1,
            Self::ConfigInvalid => 2,
            Self::KeystoreFailed => 3,
            Self::EngineUnavailable => 4,
            Self::SocketFailed => 5,
            Self::ShutdownTimeout => 64,
        }
    }
}

/// Run the bridge with the Docker engine.
///
/// Blocks until shutdown and returns the exit code the process should
/// exit with.
pub async fn run_daemon(config: Config) -> ExitCode {
    let engine = match DockerEngine::connect() {
        Ok(engine) => Arc::new(engine) as Arc<dyn ContainerEngine>,
        Err(e) => {
            error!(error = %e, "Container engine unavailable");
            return ExitCode::EngineUnavailable;
        },
    };
    run_daemon_with_engine(config, engine).await
}

/// Run the bridge against an injected engine (tests use the fake).
#[allow(clippy::too_many_lines)]
pub async fn run_daemon_with_engine(config: Config, engine: Arc<dyn ContainerEngine>) -> ExitCode {
    info!(version = env!("CARGO_PKG_VERSION"), "Palisade bridge starting");
    if config.server.daemonize {
        // Self-forking daemons predate process supervisors; the bridge
        // expects systemd (or equivalent) to own its lifecycle.
        warn!("daemonize is configured but ignored; run under a process supervisor");
    }

    // Master key: a missing salt with an existing keystore is fatal, never
    // silently regenerated — that would orphan every ciphertext.
    let salt_file = SaltFile::at(&config.keystore.salt_path);
    let keystore_exists = config.keystore.db_path.exists();
    let salt = if keystore_exists {
        match salt_file.load() {
            Ok(salt) => salt,
            Err(e) => {
                error!(error = %e, "Master-key salt unavailable");
                return ExitCode::KeystoreFailed;
            },
        }
    } else {
        match salt_file.load_or_create() {
            Ok(salt) => salt,
            Err(e) => {
                error!(error = %e, "Master-key salt setup failed");
                return ExitCode::KeystoreFailed;
            },
        }
    };

    let host_id = match host_identifier() {
        Ok(host_id) => host_id,
        Err(e) => {
            error!(error = %e, "No host identifier for key derivation");
            return ExitCode::KeystoreFailed;
        },
    };
    let master_key = match MasterKey::derive(&salt, &host_id) {
        Ok(key) => key,
        Err(e) => {
            error!(error = %e, "Master-key derivation failed");
            return ExitCode::KeystoreFailed;
        },
    };

    let keystore = match Keystore::open(&config.keystore.db_path, master_key) {
        Ok(keystore) => Arc::new(keystore),
        Err(e) => {
            error!(error = %e, "Keystore open failed");
            return ExitCode::KeystoreFailed;
        },
    };

    if let Err(e) = engine.ping().await {
        error!(error = %e, "Container engine unavailable");
        return ExitCode::EngineUnavailable;
    }

    let runtime_config = runtime_config_from(&config);
    if let Err(e) = prepare_runtime_dir(&runtime_config) {
        error!(error = %e, "Runtime directory setup failed");
        return ExitCode::Fatal;
    }

    if let Err(e) = write_pid_file(&config) {
        error!(error = %e, "PID file setup failed");
        return ExitCode::Fatal;
    }

    let audit_path = config
        .keystore
        .db_path
        .parent()
        .map_or_else(|| std::path::PathBuf::from("audit.log"), |p| p.join("audit.log"));
    let audit = match AuditLog::open(&audit_path) {
        Ok(audit) => Arc::new(audit),
        Err(e) => {
            error!(error = %e, "Audit log open failed");
            return ExitCode::Fatal;
        },
    };

    let errors = Arc::new(ErrorStore::new());
    let bus = Arc::new(EventBus::with_queue_capacity(config.eventbus.queue_capacity));
    let budget = Arc::new(BudgetLedger::new(BudgetLimits {
        daily_limit_usd: config.budget.daily_limit_usd,
        monthly_limit_usd: config.budget.monthly_limit_usd,
        alert_threshold: config.budget.alert_threshold,
        hard_stop: config.budget.hard_stop,
    }));

    let cancel = CancellationToken::new();
    let manager = Arc::new(LifecycleManager::new(
        runtime_config,
        Arc::clone(&engine),
        Arc::clone(&keystore),
        Arc::clone(&budget),
        Arc::clone(&audit),
        Arc::clone(&errors),
        Arc::clone(&bus),
        cancel.clone(),
    ));

    // Chat login before state assembly so the client handle lands in state.
    let matrix = if config.matrix.enabled {
        match chat_login(&config, &keystore, &audit).await {
            Ok(client) => Some(client),
            Err(e) => {
                // A dead homeserver must not keep credentials unreachable.
                error!(error = %e, "Chat login failed; continuing without the chat channel");
                None
            },
        }
    } else {
        None
    };

    let state = Arc::new(BridgeState::new(
        config.clone(),
        Arc::clone(&keystore),
        Arc::clone(&manager),
        budget,
        audit,
        Arc::clone(&errors),
        Arc::clone(&bus),
        matrix.clone(),
        cancel.clone(),
    ));
    let dispatcher = Dispatcher::new(Arc::clone(&state));

    // RPC socket.
    let listener = match bind_socket(&state) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "RPC socket setup failed");
            return ExitCode::SocketFailed;
        },
    };
    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(run_socket_server(
        listener,
        Arc::clone(&state),
        dispatcher.clone(),
        cancel.clone(),
    ));

    // WebSocket event fan-out.
    if config.eventbus.websocket_enabled {
        match bind_ws(&state).await {
            Ok(listener) => {
                tasks.spawn(run_ws_server(listener, Arc::clone(&state), cancel.clone()));
            },
            Err(e) => {
                error!(error = %e, "WebSocket listener setup failed");
                return ExitCode::SocketFailed;
            },
        }
    }

    // Chat plane: sync loop, inbound router, recent-events recorder.
    if let Some(client) = matrix.clone() {
        let (command_tx, command_rx) = mpsc::channel(256);

        let policy = state.policy.clone();
        let sync_ctx = SyncLoopCtx {
            client,
            bus: Arc::clone(&bus),
            command_tx,
            sigil: config.matrix.command_sigil.clone(),
            own_user_id: None,
            sync_timeout_secs: config.matrix.sync_interval,
            retry: RetryPolicy {
                max_retries: config.matrix.retry.max_retries,
                retry_delay_secs: config.matrix.retry.retry_delay,
                backoff_multiplier: config.matrix.retry.backoff_multiplier,
            },
            auto_rooms: config.matrix.auto_rooms.clone(),
            invite_filter: Some(Arc::new(move |sender: &str| policy.sender_trusted(sender))),
            errors: Arc::clone(&errors),
            cancel: cancel.clone(),
        };
        tasks.spawn(run_sync_loop(sync_ctx));

        tasks.spawn(run_inbound_router(InboundRouterCtx {
            state: Arc::clone(&state),
            dispatcher,
            command_rx,
            cancel: cancel.clone(),
        }));

        // Scrubbed chat events feed the matrix.receive window.
        let recorder_state = Arc::clone(&state);
        let mut chat_receiver = bus.subscribe(EventFilter::all());
        let recorder_cancel = cancel.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = recorder_cancel.cancelled() => break,
                    delivery = chat_receiver.recv() => {
                        let Some(delivery) = delivery else { break };
                        if let BridgeEvent::Chat(chat) = &delivery.event {
                            recorder_state.record_chat_event(chat.clone());
                        }
                    },
                }
            }
        });
    }

    // Container plane background tasks.
    tasks.spawn(run_reaper(Arc::clone(&manager), cancel.clone()));
    tasks.spawn(run_engine_events(Arc::clone(&manager), cancel.clone()));

    info!("Palisade bridge is serving");
    wait_for_shutdown_signal(&cancel).await;

    // Graceful shutdown: stop accepting, cancel every loop, stop containers
    // with grace, drain within the timeout.
    info!("Shutting down");
    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let graceful = tokio::time::timeout(shutdown_timeout, async {
        manager.shutdown_all().await;
        while tasks.join_next().await.is_some() {}
    })
    .await;

    cleanup_files(&config);

    match graceful {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::Ok
        },
        Err(_) => {
            error!(timeout_secs = config.server.shutdown_timeout, "Shutdown timed out");
            manager.purge_secrets();
            ExitCode::ShutdownTimeout
        },
    }
}

fn runtime_config_from(config: &Config) -> RuntimeConfig {
    RuntimeConfig {
        runtime_dir: config.server.runtime_dir.clone(),
        image: config.container.image.clone(),
        bind_path: config.container.bind_path.clone(),
        max_containers: config.container.max_containers,
        start_grace: Duration::from_millis(config.container.start_grace_ms),
        deletion_delay: Duration::from_secs(config.container.deletion_delay),
        stop_grace_secs: config.container.stop_grace,
        idle_timeout: Duration::from_secs(config.ttl.idle_timeout),
        check_interval: Duration::from_secs(config.ttl.check_interval),
        max_lifetime: config.ttl.max_lifetime.map(Duration::from_secs),
        network_enabled: config.container.network_enabled,
        seccomp_profile: config.container.seccomp_profile.clone(),
        memory_limit_bytes: config.container.memory_limit_mb.saturating_mul(1024 * 1024),
        pids_limit: config.container.pids_limit,
        provider_costs: config.budget.provider_costs.clone(),
        require_tmpfs: true,
    }
}

/// Log in to the homeserver, preferring the cached session token.
async fn chat_login(
    config: &Config,
    keystore: &Arc<Keystore>,
    audit: &Arc<AuditLog>,
) -> Result<Arc<MatrixClient>, Box<dyn std::error::Error + Send + Sync>> {
    let client = Arc::new(MatrixClient::new(&config.matrix.homeserver_url)?);
    let session_id = CredentialId::from(MATRIX_SESSION_ID);

    // Cached token first.
    if let Ok(cached) = keystore.get(&session_id) {
        audit.record(palisade_audit::AuditEntry::new(
            palisade_audit::AuditAction::CredentialAccessed {
                id: session_id.clone(),
                purpose: "chat_session_restore".to_owned(),
            },
            palisade_audit::AuditOutcome::ok(),
        ));
        client.restore_session(&cached.token);
        match client.whoami().await {
            Ok(user_id) => {
                info!(user_id = %user_id, "Chat session restored from keystore");
                return Ok(client);
            },
            Err(e) if e.is_unknown_token() => {
                warn!("Cached chat token is stale; re-login required");
            },
            Err(e) => return Err(e.into()),
        }
    }

    let Some(password) = config.matrix.password.as_deref() else {
        return Err("no cached session and no matrix.password configured".into());
    };

    let session = client
        .login_password(
            &config.matrix.username,
            password,
            config.matrix.device_id.as_deref(),
        )
        .await?;

    let mut credential = NewCredential::new(
        session_id,
        Provider::Custom,
        session.access_token.clone(),
    );
    credential.display_name = Some("chat session token".to_owned());
    credential
        .additional
        .insert("user_id".to_owned(), session.user_id.clone());
    credential
        .additional
        .insert("device_id".to_owned(), session.device_id.clone());
    keystore.store(credential, true)?;

    Ok(client)
}

fn write_pid_file(config: &Config) -> std::io::Result<()> {
    let path = &config.server.pid_file;
    if let Ok(existing) = std::fs::read_to_string(path) {
        if let Ok(pid) = existing.trim().parse::<i32>() {
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
            if alive {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("another bridge is running with pid {pid}"),
                ));
            }
            warn!(stale_pid = pid, "Replacing stale PID file");
        }
        let _ = std::fs::remove_file(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

fn cleanup_files(config: &Config) {
    let _ = std::fs::remove_file(&config.server.pid_file);
    let _ = std::fs::remove_file(&config.server.socket_path);
}

async fn wait_for_shutdown_signal(cancel: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            cancel.cancelled().await;
            return;
        },
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGINT handler");
            cancel.cancelled().await;
            return;
        },
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
        () = cancel.cancelled() => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_match_contract() {
        assert_eq!(ExitCode::Ok.code(), 0);
        assert_eq!(ExitCode::Fatal.code(), 1);
        assert_eq!(ExitCode::ConfigInvalid.code(), 2);
        assert_eq!(ExitCode::KeystoreFailed.code(), 3);
        assert_eq!(ExitCode::EngineUnavailable.code(), 4);
        assert_eq!(ExitCode::SocketFailed.code(), 5);
        assert_eq!(ExitCode::ShutdownTimeout.code(), 64);
    }

    #[test]
    fn test_runtime_config_mapping() {
        let mut config = Config::default();
        config.container.memory_limit_mb = 2048;
        config.ttl.idle_timeout = 120;

        let runtime = runtime_config_from(&config);
        assert_eq!(runtime.memory_limit_bytes, 2048 * 1024 * 1024);
        assert_eq!(runtime.idle_timeout, Duration::from_secs(120));
        assert!(runtime.require_tmpfs);
    }

    #[tokio::test]
    async fn test_pid_file_rejects_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.pid_file = dir.path().join("bridge.pid");

        // Our own PID is definitely alive.
        std::fs::write(&config.server.pid_file, format!("{}\n", std::process::id())).unwrap();
        assert!(write_pid_file(&config).is_err());

        // A stale PID (unlikely to exist) is replaced.
        std::fs::write(&config.server.pid_file, "999999999\n").unwrap();
        write_pid_file(&config).unwrap();
        let written = std::fs::read_to_string(&config.server.pid_file).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());
    }
}
