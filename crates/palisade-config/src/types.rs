//! Configuration types.
//!
//! Every struct implements [`Default`] with production values. Durations
//! are plain integer seconds under the names the config file uses
//! (`shutdown_timeout`, `idle_timeout`, …).

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration for the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Daemon socket, PID file, shutdown behaviour.
    pub server: ServerSection,
    /// Keystore and salt paths.
    pub keystore: KeystoreSection,
    /// Chat protocol account and sync behaviour.
    pub matrix: MatrixSection,
    /// Logging level, format, and destination.
    pub logging: LoggingSection,
    /// Spend limits and per-provider cost estimates.
    pub budget: BudgetSection,
    /// Zero-trust filter for chat-originated commands.
    pub zero_trust: ZeroTrustSection,
    /// Idle eviction policy.
    pub ttl: TtlSection,
    /// Event-bus WebSocket fan-out.
    pub eventbus: EventBusSection,
    /// Container image and hardening limits.
    pub container: ContainerSection,
}

// ---------------------------------------------------------------------------
// ServerSection
// ---------------------------------------------------------------------------

/// Daemon-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// RPC socket path.
    pub socket_path: PathBuf,
    /// Runtime directory holding the socket, PID file, secrets, and configs.
    /// Must live on a tmpfs mount.
    pub runtime_dir: PathBuf,
    /// PID file path (daemon mode).
    pub pid_file: PathBuf,
    /// Detach from the terminal.
    pub daemonize: bool,
    /// Seconds to wait for tasks and containers to drain on shutdown.
    pub shutdown_timeout: u64,
    /// Seconds an RPC handler may run before it is cancelled.
    pub handler_timeout: u64,
    /// Worker-pool parallelism. Zero means twice the CPU count.
    pub worker_parallelism: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/palisade/bridge.sock"),
            runtime_dir: PathBuf::from("/run/palisade"),
            pid_file: PathBuf::from("/run/palisade/bridge.pid"),
            daemonize: false,
            shutdown_timeout: 30,
            handler_timeout: 60,
            worker_parallelism: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// KeystoreSection
// ---------------------------------------------------------------------------

/// Keystore paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoreSection {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Master-key salt file path.
    pub salt_path: PathBuf,
}

impl Default for KeystoreSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/etc/palisade/keystore.db"),
            salt_path: PathBuf::from("/etc/palisade/salt"),
        }
    }
}

// ---------------------------------------------------------------------------
// MatrixSection
// ---------------------------------------------------------------------------

/// Chat protocol settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct MatrixSection {
    /// Whether the chat channel is active at all.
    pub enabled: bool,
    /// Homeserver base URL (`https://matrix.example.org`).
    pub homeserver_url: String,
    /// Fully-qualified or local-part user name.
    pub username: String,
    /// Password for first login. Prefer providing it over RPC once and
    /// letting the bridge cache the session token in the keystore.
    pub password: Option<String>,
    /// Device id to reuse across logins.
    pub device_id: Option<String>,
    /// Long-poll timeout per sync request, seconds.
    pub sync_interval: u64,
    /// Rooms to join automatically after login.
    pub auto_rooms: Vec<String>,
    /// Sigil that marks a message body as a command.
    pub command_sigil: String,
    /// Backoff policy for sync failures.
    pub retry: RetrySection,
}

impl std::fmt::Debug for MatrixSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixSection")
            .field("enabled", &self.enabled)
            .field("homeserver_url", &self.homeserver_url)
            .field("username", &self.username)
            .field("has_password", &self.password.is_some())
            .field("device_id", &self.device_id)
            .field("sync_interval", &self.sync_interval)
            .field("auto_rooms", &self.auto_rooms)
            .field("command_sigil", &self.command_sigil)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Serialize for MatrixSection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("MatrixSection", 8)?;
        state.serialize_field("enabled", &self.enabled)?;
        state.serialize_field("homeserver_url", &self.homeserver_url)?;
        state.serialize_field("username", &self.username)?;
        // password is intentionally omitted.
        state.serialize_field("device_id", &self.device_id)?;
        state.serialize_field("sync_interval", &self.sync_interval)?;
        state.serialize_field("auto_rooms", &self.auto_rooms)?;
        state.serialize_field("command_sigil", &self.command_sigil)?;
        state.serialize_field("retry", &self.retry)?;
        state.end()
    }
}

impl Default for MatrixSection {
    fn default() -> Self {
        Self {
            enabled: false,
            homeserver_url: String::new(),
            username: String::new(),
            password: None,
            device_id: None,
            sync_interval: 30,
            auto_rooms: Vec::new(),
            command_sigil: "/".to_owned(),
            retry: RetrySection::default(),
        }
    }
}

/// Backoff policy for transient chat failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Attempts before a failure is reported as sustained.
    pub max_retries: u32,
    /// Base delay in seconds.
    pub retry_delay: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: 1,
            backoff_multiplier: 2.0,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging settings. The allowed values are validated, not free-form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// One of `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// One of `text`, `json`.
    pub format: String,
    /// One of `stdout`, `stderr`, `file`.
    pub output: String,
    /// Log file path, required when `output = "file"`.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "text".to_owned(),
            output: "stderr".to_owned(),
            file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// BudgetSection
// ---------------------------------------------------------------------------

/// Spend limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    /// USD limit per local day.
    pub daily_limit_usd: f64,
    /// USD limit per local month.
    pub monthly_limit_usd: f64,
    /// Warn when a window reaches this fraction of its limit (0–1).
    pub alert_threshold: f64,
    /// Deny allocations past a limit instead of warning.
    pub hard_stop: bool,
    /// Estimated USD cost per container start, keyed by provider tag.
    pub provider_costs: HashMap<String, f64>,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            daily_limit_usd: 10.0,
            monthly_limit_usd: 100.0,
            alert_threshold: 0.8,
            hard_stop: true,
            provider_costs: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ZeroTrustSection
// ---------------------------------------------------------------------------

/// Authorization policy for chat-originated commands.
///
/// An empty trusted-sender set disables the filter entirely; a non-empty
/// one denies by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeroTrustSection {
    /// Trusted sender patterns: exact ids, `*@domain`, or `*:homeserver`.
    pub trusted_senders: Vec<String>,
    /// Trusted room ids. Empty means any room.
    pub trusted_rooms: Vec<String>,
    /// Send a rejection notice back to the originating room.
    pub reject_untrusted: bool,
}

// ---------------------------------------------------------------------------
// TtlSection
// ---------------------------------------------------------------------------

/// Idle eviction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlSection {
    /// Seconds without a heartbeat before a container is marked idle.
    /// Twice this without a heartbeat stops it.
    pub idle_timeout: u64,
    /// Reaper tick interval, seconds.
    pub check_interval: u64,
    /// Optional absolute lifetime cap, seconds.
    pub max_lifetime: Option<u64>,
}

impl Default for TtlSection {
    fn default() -> Self {
        Self {
            idle_timeout: 600,
            check_interval: 60,
            max_lifetime: None,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBusSection
// ---------------------------------------------------------------------------

/// WebSocket fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusSection {
    /// Whether the WebSocket listener runs at all.
    pub websocket_enabled: bool,
    /// Listener address, `host:port`.
    pub websocket_addr: String,
    /// URL path the upgrade must arrive on.
    pub websocket_path: String,
    /// Maximum concurrent subscribers; further connections are rejected.
    pub max_subscribers: usize,
    /// Seconds without any frame in either direction before a connection
    /// is closed with reason `inactivity`.
    pub inactivity_timeout: u64,
    /// Per-subscriber delivery queue depth.
    pub queue_capacity: usize,
}

impl Default for EventBusSection {
    fn default() -> Self {
        Self {
            websocket_enabled: false,
            websocket_addr: "127.0.0.1:8799".to_owned(),
            websocket_path: "/events".to_owned(),
            max_subscribers: 64,
            inactivity_timeout: 300,
            queue_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// ContainerSection
// ---------------------------------------------------------------------------

/// Container image and start policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSection {
    /// Default image reference; `start` may override per call.
    pub image: String,
    /// Concurrency limit across all live containers.
    pub max_containers: usize,
    /// Milliseconds to wait for the engine to report running after start.
    pub start_grace_ms: u64,
    /// Seconds after a successful start before the secret bundle is
    /// unlinked.
    pub deletion_delay: u64,
    /// Engine stop grace before kill, seconds.
    pub stop_grace: u32,
    /// Opt-in network access for agent containers.
    pub network_enabled: bool,
    /// Seccomp profile path applied to every create.
    pub seccomp_profile: Option<PathBuf>,
    /// Memory limit in MiB.
    pub memory_limit_mb: i64,
    /// Pid limit.
    pub pids_limit: i64,
    /// In-container path the secrets directory is bound to.
    pub bind_path: PathBuf,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            image: "palisade-agent:latest".to_owned(),
            max_containers: 10,
            start_grace_ms: 1000,
            deletion_delay: 10,
            stop_grace: 10,
            network_enabled: false,
            seccomp_profile: None,
            memory_limit_mb: 1024,
            pids_limit: 256,
            bind_path: PathBuf::from("/run/secrets/palisade"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.shutdown_timeout, 30);
        assert_eq!(config.ttl.idle_timeout, 600);
        assert_eq!(config.container.max_containers, 10);
        assert!(!config.matrix.enabled);
    }

    #[test]
    fn test_bare_section_headers_work() {
        let config: Config = toml::from_str("[server]\n[matrix]\n[budget]\n").unwrap();
        assert_eq!(config.server.socket_path, PathBuf::from("/run/palisade/bridge.sock"));
        assert!((config.budget.alert_threshold - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_section_merges_with_defaults() {
        let config: Config = toml::from_str("[ttl]\nidle_timeout = 120\n").unwrap();
        assert_eq!(config.ttl.idle_timeout, 120);
        assert_eq!(config.ttl.check_interval, 60);
    }

    #[test]
    fn test_password_never_serialized() {
        let mut config = Config::default();
        config.matrix.password = Some("hunter2".to_owned());

        let toml_out = toml::to_string(&config).unwrap();
        assert!(!toml_out.contains("hunter2"));

        let json_out = serde_json::to_string(&config).unwrap();
        assert!(!json_out.contains("hunter2"));

        let debug_out = format!("{config:?}");
        assert!(!debug_out.contains("hunter2"));
        assert!(debug_out.contains("has_password: true"));
    }

    #[test]
    fn test_provider_costs_parse() {
        let config: Config =
            toml::from_str("[budget]\n[budget.provider_costs]\nopenai = 0.05\nanthropic = 0.07\n")
                .unwrap();
        assert!((config.budget.provider_costs["openai"] - 0.05).abs() < f64::EPSILON);
    }
}
