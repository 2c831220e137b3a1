//! Docker Engine implementation of the adapter.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::system::EventsOptions;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::traits::ContainerEngine;
use crate::types::{CallCtx, CreateSpec, EngineEvent, ExecOutput, InspectReport};

/// The fixed in-container identity every agent runs as.
const CONTAINER_USER: &str = "10001:10001";

/// Adapter over the local Docker daemon.
///
/// Holds one shared client; bollard clients are cheap to clone and
/// internally pooled.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the local defaults (unix socket, standard env).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unavailable`] when no daemon is reachable.
    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Wrap an existing client (tests against a mocked daemon).
    #[must_use]
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Build the hardened host configuration for `spec`.
    async fn host_config(spec: &CreateSpec) -> EngineResult<HostConfig> {
        let mut security_opt = vec!["no-new-privileges:true".to_owned()];
        if let Some(profile_path) = &spec.hardening.seccomp_profile {
            let profile = tokio::fs::read_to_string(profile_path).await.map_err(|source| {
                EngineError::SeccompProfile {
                    path: profile_path.display().to_string(),
                    source,
                }
            })?;
            security_opt.push(format!("seccomp={profile}"));
        }

        let binds: Vec<String> = spec.binds.iter().map(super::BindMount::to_bind_string).collect();

        Ok(HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            cap_drop: Some(vec!["ALL".to_owned()]),
            security_opt: Some(security_opt),
            readonly_rootfs: Some(true),
            network_mode: Some(if spec.network_enabled {
                "bridge".to_owned()
            } else {
                "none".to_owned()
            }),
            memory: spec.hardening.memory_limit_bytes,
            pids_limit: spec.hardening.pids_limit,
            ..HostConfig::default()
        })
    }
}

/// Run `fut` under the call context's deadline and cancellation.
async fn bounded<T, F>(op: &'static str, ctx: &CallCtx, fut: F) -> EngineResult<T>
where
    F: Future<Output = Result<T, bollard::errors::Error>>,
{
    tokio::select! {
        () = ctx.cancel.cancelled() => Err(EngineError::Cancelled { op }),
        outcome = tokio::time::timeout(ctx.timeout, fut) => match outcome {
            Err(_) => Err(EngineError::Timeout { op, secs: ctx.timeout.as_secs() }),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_api_error(op, e)),
        },
    }
}

fn map_api_error(op: &'static str, error: bollard::errors::Error) -> EngineError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        other => EngineError::Api {
            op,
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    async fn create(&self, spec: &CreateSpec, ctx: &CallCtx) -> EngineResult<String> {
        let host_config = Self::host_config(spec).await?;
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            user: Some(CONTAINER_USER.to_owned()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Config::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = bounded("create", ctx, self.docker.create_container(Some(options), config)).await?;
        for warning in &response.warnings {
            warn!(container = %spec.name, warning = %warning, "Engine create warning");
        }
        debug!(container = %spec.name, engine_id = %response.id, "Container created");
        Ok(response.id)
    }

    async fn start(&self, engine_id: &str, ctx: &CallCtx) -> EngineResult<()> {
        bounded(
            "start",
            ctx,
            self.docker
                .start_container(engine_id, None::<StartContainerOptions<String>>),
        )
        .await?;
        debug!(engine_id = %engine_id, "Container started");
        Ok(())
    }

    async fn inspect(&self, engine_id: &str, ctx: &CallCtx) -> EngineResult<InspectReport> {
        let response = bounded(
            "inspect",
            ctx,
            self.docker
                .inspect_container(engine_id, None::<InspectContainerOptions>),
        )
        .await?;

        let state = response.state.unwrap_or_default();
        Ok(InspectReport {
            running: state.running.unwrap_or(false),
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            exit_code: state.exit_code,
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn exec(&self, engine_id: &str, cmd: &[String], ctx: &CallCtx) -> EngineResult<ExecOutput> {
        let docker = self.docker.clone();
        let cmd = cmd.to_vec();
        let engine_id_owned = engine_id.to_owned();

        bounded("exec", ctx, async move {
            let created = docker
                .create_exec(
                    &engine_id_owned,
                    CreateExecOptions::<String> {
                        cmd: Some(cmd),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        ..CreateExecOptions::default()
                    },
                )
                .await?;

            let mut stdout = String::new();
            let mut stderr = String::new();
            if let StartExecResults::Attached { mut output, .. } =
                docker.start_exec(&created.id, None).await?
            {
                while let Some(chunk) = output.next().await {
                    match chunk? {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        },
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        },
                        LogOutput::StdIn { .. } | LogOutput::Console { .. } => {},
                    }
                }
            }

            let inspected = docker.inspect_exec(&created.id).await?;
            Ok(ExecOutput {
                exit_code: inspected.exit_code.unwrap_or(-1),
                stdout,
                stderr,
            })
        })
        .await
    }

    async fn stop(&self, engine_id: &str, grace_secs: u32, ctx: &CallCtx) -> EngineResult<()> {
        bounded(
            "stop",
            ctx,
            self.docker
                .stop_container(engine_id, Some(StopContainerOptions { t: i64::from(grace_secs) })),
        )
        .await?;
        debug!(engine_id = %engine_id, "Container stopped");
        Ok(())
    }

    async fn remove(&self, engine_id: &str, force: bool, ctx: &CallCtx) -> EngineResult<()> {
        bounded(
            "remove",
            ctx,
            self.docker.remove_container(
                engine_id,
                Some(RemoveContainerOptions {
                    force,
                    ..RemoveContainerOptions::default()
                }),
            ),
        )
        .await?;
        debug!(engine_id = %engine_id, "Container removed");
        Ok(())
    }

    async fn events(&self, cancel: CancellationToken) -> EngineResult<mpsc::Receiver<EngineEvent>> {
        let mut filters = HashMap::new();
        filters.insert("type".to_owned(), vec!["container".to_owned()]);

        let mut stream = self.docker.events(Some(EventsOptions::<String> {
            filters,
            ..EventsOptions::default()
        }));

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    message = stream.next() => {
                        let Some(message) = message else { break };
                        let message = match message {
                            Ok(m) => m,
                            Err(e) => {
                                warn!(error = %e, "Engine event stream error — ending stream");
                                break;
                            },
                        };
                        let Some(engine_id) =
                            message.actor.as_ref().and_then(|a| a.id.clone())
                        else {
                            continue;
                        };
                        let event = match message.action.as_deref() {
                            Some("die") => {
                                let exit_code = message
                                    .actor
                                    .and_then(|a| a.attributes)
                                    .and_then(|attrs| attrs.get("exitCode").cloned())
                                    .and_then(|code| code.parse::<i64>().ok());
                                Some(EngineEvent::Died { engine_id, exit_code })
                            },
                            Some("stop" | "kill") => Some(EngineEvent::Stopped { engine_id }),
                            Some("oom") => Some(EngineEvent::OomKilled { engine_id }),
                            _ => None,
                        };
                        if let Some(event) = event
                            && tx.send(event).await.is_err()
                        {
                            break;
                        }
                    },
                }
            }
            info!("Engine event stream consumer stopped");
        });

        Ok(rx)
    }
}
