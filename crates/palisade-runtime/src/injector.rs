//! The secret injector: bundle write, container create/start, teardown.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use palisade_audit::{AuditAction, AuditEntry, AuditLog, AuditOutcome};
use palisade_core::ContainerId;
use palisade_engine::{BindMount, CallCtx, ContainerEngine, CreateSpec, HardeningPolicy};
use palisade_keystore::DecryptedCredential;
use tracing::{debug, info, warn};

use crate::bundle::{unlink_bundle, SecretBundle};
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::{RuntimeConfig, StartOptions};

/// Poll cadence while waiting for the engine to report running.
const START_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Create the runtime directory tree and verify the tmpfs requirement.
///
/// `<runtime-dir>` is created 0700; `<runtime-dir>/secrets` and
/// `<runtime-dir>/configs` beneath it. With `require_tmpfs` the runtime
/// dir must be on a tmpfs mount — secret plaintext must never be able to
/// reach a disk-backed filesystem.
///
/// # Errors
///
/// [`RuntimeError::NotTmpfs`] or filesystem failures.
pub fn prepare_runtime_dir(config: &RuntimeConfig) -> RuntimeResult<()> {
    create_dir_0700(&config.runtime_dir)?;

    if config.require_tmpfs {
        verify_tmpfs(&config.runtime_dir)?;
    }

    create_dir_0700(&config.secrets_dir())?;
    create_dir_0700(&config.runtime_dir.join("configs"))?;
    info!(dir = %config.runtime_dir.display(), "Runtime directory ready");
    Ok(())
}

fn create_dir_0700(path: &Path) -> RuntimeResult<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o700);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn verify_tmpfs(path: &Path) -> RuntimeResult<()> {
    let stat = nix::sys::statfs::statfs(path)
        .map_err(|e| RuntimeError::Injection(format!("statfs {}: {e}", path.display())))?;
    if stat.filesystem_type() != nix::sys::statfs::TMPFS_MAGIC {
        return Err(RuntimeError::NotTmpfs {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn verify_tmpfs(path: &Path) -> RuntimeResult<()> {
    warn!(path = %path.display(), "tmpfs verification is only available on Linux");
    Ok(())
}

/// The injector. Stateless apart from its handles; all bookkeeping lives
/// in the lifecycle manager.
pub struct Injector {
    config: RuntimeConfig,
    engine: Arc<dyn ContainerEngine>,
    audit: Arc<AuditLog>,
}

impl Injector {
    /// Create an injector.
    #[must_use]
    pub fn new(config: RuntimeConfig, engine: Arc<dyn ContainerEngine>, audit: Arc<AuditLog>) -> Self {
        Self { config, engine, audit }
    }

    /// Run the injection protocol for one container.
    ///
    /// On success the container is running with the bundle bound read-only
    /// and the engine id is returned. On any failure after the bundle was
    /// written, the bundle is unlinked before this returns — the caller
    /// never has to clean up the secret file on the error path.
    ///
    /// # Errors
    ///
    /// Keystore, filesystem, and engine failures; [`RuntimeError::StartGraceExceeded`]
    /// when the container does not come up in time.
    pub async fn inject_and_start(
        &self,
        container_id: &ContainerId,
        credential: &DecryptedCredential,
        options: &StartOptions,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> RuntimeResult<String> {
        let secret_path = self.config.secret_path(container_id);

        // Build and shape-check the bundle before anything touches disk.
        let bundle = SecretBundle::from_credential(credential)?;
        bundle.write_atomic(&secret_path)?;
        self.audit.record(AuditEntry::new(
            AuditAction::SecretInjected {
                container_id: container_id.clone(),
                path: secret_path.display().to_string(),
            },
            AuditOutcome::ok(),
        ));

        match self
            .create_and_start(container_id, options, cancel)
            .await
        {
            Ok(engine_id) => Ok(engine_id),
            Err(e) => {
                // Failure after the write: the bundle must not survive.
                self.remove_bundle(container_id, &secret_path, "start_failed");
                Err(e)
            },
        }
    }

    async fn create_and_start(
        &self,
        container_id: &ContainerId,
        options: &StartOptions,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> RuntimeResult<String> {
        let ctx = CallCtx {
            timeout: Duration::from_secs(30),
            cancel: cancel.clone(),
        };

        let mut labels = BTreeMap::new();
        labels.insert("io.palisade.container-id".to_owned(), container_id.to_string());

        let mut env = options.env.clone();
        env.push(format!(
            "PALISADE_SECRETS_FILE={}/{container_id}.json",
            self.config.bind_path.display()
        ));

        let spec = CreateSpec {
            name: format!("palisade-{container_id}"),
            image: options
                .image
                .clone()
                .unwrap_or_else(|| self.config.image.clone()),
            env,
            binds: vec![BindMount::read_only(
                self.config.secrets_dir(),
                self.config.bind_path.clone(),
            )],
            network_enabled: self.config.network_enabled,
            hardening: HardeningPolicy {
                seccomp_profile: self.config.seccomp_profile.clone(),
                memory_limit_bytes: Some(self.config.memory_limit_bytes),
                pids_limit: Some(self.config.pids_limit),
            },
            labels,
        };

        let engine_id = self.engine.create(&spec, &ctx).await?;
        debug!(container = %container_id, engine_id = %engine_id, "Container created");

        if let Err(e) = self.engine.start(&engine_id, &ctx).await {
            self.teardown(&engine_id, &ctx).await;
            return Err(e.into());
        }

        if let Err(e) = self.await_running(container_id, &engine_id, &ctx).await {
            self.teardown(&engine_id, &ctx).await;
            return Err(e);
        }

        Ok(engine_id)
    }

    /// Poll the engine until it reports running, within the start grace.
    async fn await_running(
        &self,
        container_id: &ContainerId,
        engine_id: &str,
        ctx: &CallCtx,
    ) -> RuntimeResult<()> {
        let deadline = tokio::time::Instant::now() + self.config.start_grace;
        loop {
            let report = self.engine.inspect(engine_id, ctx).await?;
            if report.running {
                return Ok(());
            }
            if report.exit_code.is_some() {
                return Err(RuntimeError::Injection(format!(
                    "container exited during start with code {:?}",
                    report.exit_code
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                #[allow(clippy::cast_possible_truncation)]
                return Err(RuntimeError::StartGraceExceeded {
                    container_id: container_id.clone(),
                    grace_ms: self.config.start_grace.as_millis() as u64,
                });
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
    }

    /// Best-effort stop + remove on the failure path.
    async fn teardown(&self, engine_id: &str, ctx: &CallCtx) {
        if let Err(e) = self.engine.stop(engine_id, 0, ctx).await {
            debug!(engine_id = %engine_id, error = %e, "Teardown stop failed");
        }
        if let Err(e) = self.engine.remove(engine_id, true, ctx).await {
            warn!(engine_id = %engine_id, error = %e, "Teardown remove failed");
        }
    }

    /// Unlink a container's bundle, recording the removal. Idempotent.
    pub(crate) fn remove_bundle(&self, container_id: &ContainerId, path: &Path, reason: &str) {
        match unlink_bundle(path) {
            Ok(true) => {
                self.audit.record(AuditEntry::new(
                    AuditAction::SecretRemoved {
                        container_id: container_id.clone(),
                        path: path.display().to_string(),
                        reason: reason.to_owned(),
                    },
                    AuditOutcome::ok(),
                ));
            },
            Ok(false) => {},
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to unlink secret bundle");
                self.audit.record(AuditEntry::new(
                    AuditAction::SecretRemoved {
                        container_id: container_id.clone(),
                        path: path.display().to_string(),
                        reason: reason.to_owned(),
                    },
                    AuditOutcome::failed(e.to_string()),
                ));
            },
        }
    }

    /// Sweep every remaining bundle out of the secrets directory.
    ///
    /// Shutdown insurance: by the time this runs, every container has been
    /// stopped and each stop already unlinked its bundle.
    pub fn purge_secrets_dir(&self) {
        let dir = self.config.secrets_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                warn!(path = %path.display(), "Purging leftover secret bundle");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("runtime_dir", &self.config.runtime_dir)
            .finish_non_exhaustive()
    }
}
