//! Managed-container records and runtime configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use palisade_core::{ContainerId, ContainerState, CredentialId, Timestamp};
use serde::Serialize;

/// Runtime configuration, distilled from the daemon config at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// The tmpfs-backed runtime directory.
    pub runtime_dir: PathBuf,
    /// Default image reference.
    pub image: String,
    /// In-container path the secrets directory is bound to.
    pub bind_path: PathBuf,
    /// Concurrency cap across live containers.
    pub max_containers: usize,
    /// How long to wait for the engine to report running.
    pub start_grace: Duration,
    /// Delay before a successful start's bundle is unlinked.
    pub deletion_delay: Duration,
    /// Engine stop grace before kill, seconds.
    pub stop_grace_secs: u32,
    /// Idle threshold without a heartbeat.
    pub idle_timeout: Duration,
    /// Reaper tick interval.
    pub check_interval: Duration,
    /// Optional absolute lifetime cap.
    pub max_lifetime: Option<Duration>,
    /// Opt-in network for agent containers.
    pub network_enabled: bool,
    /// Seccomp profile path.
    pub seccomp_profile: Option<PathBuf>,
    /// Memory limit in bytes.
    pub memory_limit_bytes: i64,
    /// Pid limit.
    pub pids_limit: i64,
    /// Estimated USD cost per start, keyed by provider tag.
    pub provider_costs: HashMap<String, f64>,
    /// Whether init refuses a runtime dir that is not tmpfs.
    /// Always true in production; tests on non-tmpfs filesystems disable it.
    pub require_tmpfs: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/run/palisade"),
            image: "palisade-agent:latest".to_owned(),
            bind_path: PathBuf::from("/run/secrets/palisade"),
            max_containers: 10,
            start_grace: Duration::from_secs(1),
            deletion_delay: Duration::from_secs(10),
            stop_grace_secs: 10,
            idle_timeout: Duration::from_secs(600),
            check_interval: Duration::from_secs(60),
            max_lifetime: None,
            network_enabled: false,
            seccomp_profile: None,
            memory_limit_bytes: 1024 * 1024 * 1024,
            pids_limit: 256,
            provider_costs: HashMap::new(),
            require_tmpfs: true,
        }
    }
}

impl RuntimeConfig {
    /// The secrets directory under the runtime dir.
    #[must_use]
    pub fn secrets_dir(&self) -> PathBuf {
        self.runtime_dir.join("secrets")
    }

    /// The bundle path for one container.
    #[must_use]
    pub fn secret_path(&self, id: &ContainerId) -> PathBuf {
        self.secrets_dir().join(format!("{id}.json"))
    }
}

/// Per-start options accepted over RPC.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Image override.
    pub image: Option<String>,
    /// Extra environment entries, `KEY=value`. Values are caller-provided
    /// and never secret material.
    pub env: Vec<String>,
    /// Per-container idle timeout override.
    pub idle_timeout: Option<Duration>,
}

/// One managed container.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    /// Stable internal id.
    pub id: ContainerId,
    /// Engine-side id, once created.
    pub engine_id: Option<String>,
    /// The credential bound into the container.
    pub credential_id: CredentialId,
    /// Image reference.
    pub image: String,
    /// Host-side secret bundle path.
    pub secret_path: PathBuf,
    /// In-container bind path of the secrets directory.
    pub bind_path: PathBuf,
    /// Current lifecycle state.
    pub state: ContainerState,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last heartbeat time. Initialized to the creation time.
    pub last_heartbeat_at: Timestamp,
    /// Idle threshold for this container.
    pub idle_timeout: Duration,
    /// Exit code once terminal.
    pub exit_code: Option<i64>,
    /// Reason recorded on stop or failure.
    pub stop_reason: Option<String>,
}

/// Read-only health view returned over RPC.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerHealth {
    /// Internal id.
    pub container_id: ContainerId,
    /// Current state.
    pub state: ContainerState,
    /// Credential bound into the container.
    pub credential_id: CredentialId,
    /// Image reference.
    pub image: String,
    /// Seconds since creation.
    pub uptime_secs: i64,
    /// Seconds since the last heartbeat.
    pub heartbeat_age_secs: i64,
    /// Exit code once terminal.
    pub exit_code: Option<i64>,
    /// Stop or failure reason, when recorded.
    pub stop_reason: Option<String>,
}

impl ContainerRecord {
    /// Build the health view.
    #[must_use]
    pub fn health(&self) -> ContainerHealth {
        ContainerHealth {
            container_id: self.id.clone(),
            state: self.state,
            credential_id: self.credential_id.clone(),
            image: self.image.clone(),
            uptime_secs: self.created_at.elapsed_secs(),
            heartbeat_age_secs: self.last_heartbeat_at.elapsed_secs(),
            exit_code: self.exit_code,
            stop_reason: self.stop_reason.clone(),
        }
    }
}
