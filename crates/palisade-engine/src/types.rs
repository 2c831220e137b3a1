//! Request and response types crossing the engine boundary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Per-call context: deadline plus cooperative cancellation.
#[derive(Debug, Clone)]
pub struct CallCtx {
    /// How long the call may take before failing with a timeout.
    pub timeout: Duration,
    /// Cancellation signal shared with the caller.
    pub cancel: CancellationToken,
}

impl CallCtx {
    /// A context with the given timeout and a fresh token.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for CallCtx {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }
}

/// One bind mount handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Host-side path.
    pub host: PathBuf,
    /// In-container path.
    pub container: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

impl BindMount {
    /// A read-only bind.
    #[must_use]
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    /// The `host:container[:ro]` string the engine API expects.
    #[must_use]
    pub fn to_bind_string(&self) -> String {
        let mut s = format!("{}:{}", self.host.display(), self.container.display());
        if self.read_only {
            s.push_str(":ro");
        }
        s
    }
}

/// The non-negotiable hardening applied to every create.
#[derive(Debug, Clone)]
pub struct HardeningPolicy {
    /// Path to the seccomp profile JSON loaded at create time.
    pub seccomp_profile: Option<PathBuf>,
    /// Memory limit in bytes.
    pub memory_limit_bytes: Option<i64>,
    /// Pid limit.
    pub pids_limit: Option<i64>,
}

impl Default for HardeningPolicy {
    fn default() -> Self {
        Self {
            seccomp_profile: None,
            memory_limit_bytes: Some(1024 * 1024 * 1024),
            pids_limit: Some(256),
        }
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Engine-side container name.
    pub name: String,
    /// Image reference. The adapter never pulls; the image must exist.
    pub image: String,
    /// Environment entries, `KEY=value`.
    pub env: Vec<String>,
    /// Bind mounts.
    pub binds: Vec<BindMount>,
    /// Opt-in network access. Off means `network_mode = none`.
    pub network_enabled: bool,
    /// Hardening knobs that are configurable (limits, profile path).
    pub hardening: HardeningPolicy,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

/// Snapshot of engine-side container state.
#[derive(Debug, Clone, Default)]
pub struct InspectReport {
    /// Whether the engine reports the container running.
    pub running: bool,
    /// Engine status string (`created`, `running`, `exited`, …).
    pub status: String,
    /// Exit code when the container has exited.
    pub exit_code: Option<i64>,
    /// Whether the container was OOM-killed.
    pub oom_killed: bool,
}

/// Output of an exec inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Process exit code.
    pub exit_code: i64,
    /// Combined captured stdout.
    pub stdout: String,
    /// Combined captured stderr.
    pub stderr: String,
}

/// Best-effort engine event, reduced to what the lifecycle manager needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The container's main process exited.
    Died {
        /// Engine-side id.
        engine_id: String,
        /// Exit code if the engine reported one.
        exit_code: Option<i64>,
    },
    /// The container was stopped or killed externally.
    Stopped {
        /// Engine-side id.
        engine_id: String,
    },
    /// The container was OOM-killed.
    OomKilled {
        /// Engine-side id.
        engine_id: String,
    },
}

impl EngineEvent {
    /// The engine id the event refers to.
    #[must_use]
    pub fn engine_id(&self) -> &str {
        match self {
            Self::Died { engine_id, .. }
            | Self::Stopped { engine_id }
            | Self::OomKilled { engine_id } => engine_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_string() {
        let bind = BindMount::read_only("/run/palisade/secrets", "/secrets");
        assert_eq!(bind.to_bind_string(), "/run/palisade/secrets:/secrets:ro");

        let rw = BindMount {
            host: "/tmp/a".into(),
            container: "/b".into(),
            read_only: false,
        };
        assert_eq!(rw.to_bind_string(), "/tmp/a:/b");
    }

    #[test]
    fn test_default_hardening_limits() {
        let policy = HardeningPolicy::default();
        assert!(policy.memory_limit_bytes.unwrap() > 0);
        assert!(policy.pids_limit.unwrap() > 0);
    }
}
