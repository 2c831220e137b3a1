//! A deterministic in-memory engine for tests.
//!
//! The fake records every create spec it sees, lets tests flip failure
//! knobs, and can emit engine events on demand. It lives in the crate
//! proper (not behind `cfg(test)`) so the integration suite can drive the
//! whole daemon against it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::traits::ContainerEngine;
use crate::types::{CallCtx, CreateSpec, EngineEvent, ExecOutput, InspectReport};

/// One fake container.
#[derive(Debug, Clone)]
pub struct FakeContainer {
    /// The spec it was created with.
    pub spec: CreateSpec,
    /// Whether `start` was called.
    pub started: bool,
    /// Whether inspect reports running.
    pub running: bool,
    /// Exit code once stopped or killed.
    pub exit_code: Option<i64>,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    next_id: u64,
    fail_create: bool,
    fail_start: bool,
    /// Containers report running after start unless this is false
    /// (exercises the start-grace timeout path).
    no_auto_run: bool,
    /// Remaining transient stop failures before stop succeeds.
    transient_stop_failures: u32,
    event_senders: Vec<mpsc::Sender<EngineEvent>>,
}

/// Deterministic engine double.
#[derive(Debug, Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
}

impl FakeEngine {
    /// A fresh fake with no containers and no failure knobs set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make every `create` fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    /// Make every `start` fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    /// Keep containers in the created-but-not-running state after start.
    pub fn set_no_auto_run(&self, no_auto_run: bool) {
        self.lock().no_auto_run = no_auto_run;
    }

    /// Fail the next `n` stop calls with a retryable error.
    pub fn set_transient_stop_failures(&self, n: u32) {
        self.lock().transient_stop_failures = n;
    }

    /// Snapshot one container.
    #[must_use]
    pub fn container(&self, engine_id: &str) -> Option<FakeContainer> {
        self.lock().containers.get(engine_id).cloned()
    }

    /// Number of containers the engine currently knows.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Simulate the container's main process dying.
    ///
    /// Marks it stopped and emits a `Died` event to every subscriber.
    pub fn kill(&self, engine_id: &str, exit_code: i64) {
        let senders = {
            let mut state = self.lock();
            if let Some(container) = state.containers.get_mut(engine_id) {
                container.running = false;
                container.exit_code = Some(exit_code);
            }
            state.event_senders.clone()
        };
        for sender in senders {
            let _ = sender.try_send(EngineEvent::Died {
                engine_id: engine_id.to_owned(),
                exit_code: Some(exit_code),
            });
        }
    }

    fn check_cancelled(op: &'static str, ctx: &CallCtx) -> EngineResult<()> {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled { op });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn create(&self, spec: &CreateSpec, ctx: &CallCtx) -> EngineResult<String> {
        Self::check_cancelled("create", ctx)?;
        let mut state = self.lock();
        if state.fail_create {
            return Err(EngineError::Api {
                op: "create",
                message: "fake create failure".to_owned(),
            });
        }
        state.next_id = state.next_id.wrapping_add(1);
        let engine_id = format!("fake-{}", state.next_id);
        state.containers.insert(
            engine_id.clone(),
            FakeContainer {
                spec: spec.clone(),
                started: false,
                running: false,
                exit_code: None,
            },
        );
        Ok(engine_id)
    }

    async fn start(&self, engine_id: &str, ctx: &CallCtx) -> EngineResult<()> {
        Self::check_cancelled("start", ctx)?;
        let mut state = self.lock();
        if state.fail_start {
            return Err(EngineError::Api {
                op: "start",
                message: "fake start failure".to_owned(),
            });
        }
        let no_auto_run = state.no_auto_run;
        let container = state
            .containers
            .get_mut(engine_id)
            .ok_or_else(|| EngineError::NotFound(engine_id.to_owned()))?;
        container.started = true;
        container.running = !no_auto_run;
        Ok(())
    }

    async fn inspect(&self, engine_id: &str, ctx: &CallCtx) -> EngineResult<InspectReport> {
        Self::check_cancelled("inspect", ctx)?;
        let state = self.lock();
        let container = state
            .containers
            .get(engine_id)
            .ok_or_else(|| EngineError::NotFound(engine_id.to_owned()))?;
        Ok(InspectReport {
            running: container.running,
            status: if container.running {
                "running".to_owned()
            } else if container.started {
                "exited".to_owned()
            } else {
                "created".to_owned()
            },
            exit_code: container.exit_code,
            oom_killed: false,
        })
    }

    async fn exec(&self, engine_id: &str, _cmd: &[String], ctx: &CallCtx) -> EngineResult<ExecOutput> {
        Self::check_cancelled("exec", ctx)?;
        let state = self.lock();
        if !state.containers.contains_key(engine_id) {
            return Err(EngineError::NotFound(engine_id.to_owned()));
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn stop(&self, engine_id: &str, _grace_secs: u32, ctx: &CallCtx) -> EngineResult<()> {
        Self::check_cancelled("stop", ctx)?;
        let mut state = self.lock();
        if state.transient_stop_failures > 0 {
            state.transient_stop_failures = state.transient_stop_failures.saturating_sub(1);
            return Err(EngineError::Api {
                op: "stop",
                message: "fake transient stop failure".to_owned(),
            });
        }
        let container = state
            .containers
            .get_mut(engine_id)
            .ok_or_else(|| EngineError::NotFound(engine_id.to_owned()))?;
        container.running = false;
        if container.exit_code.is_none() {
            container.exit_code = Some(0);
        }
        Ok(())
    }

    async fn remove(&self, engine_id: &str, _force: bool, ctx: &CallCtx) -> EngineResult<()> {
        Self::check_cancelled("remove", ctx)?;
        let mut state = self.lock();
        state.containers.remove(engine_id);
        Ok(())
    }

    async fn events(&self, cancel: CancellationToken) -> EngineResult<mpsc::Receiver<EngineEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.lock().event_senders.push(tx.clone());
        // Drop the sender when the consumer cancels so the receiver ends.
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            cancel.cancelled().await;
            let mut state = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.event_senders.retain(|s| !s.same_channel(&tx));
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HardeningPolicy;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> CreateSpec {
        CreateSpec {
            name: name.to_owned(),
            image: "palisade-agent:latest".to_owned(),
            env: vec![],
            binds: vec![],
            network_enabled: false,
            hardening: HardeningPolicy::default(),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_start_inspect_stop() {
        let engine = FakeEngine::new();
        let ctx = CallCtx::default();

        let id = engine.create(&spec("c1"), &ctx).await.unwrap();
        engine.start(&id, &ctx).await.unwrap();
        assert!(engine.inspect(&id, &ctx).await.unwrap().running);

        engine.stop(&id, 10, &ctx).await.unwrap();
        let report = engine.inspect(&id, &ctx).await.unwrap();
        assert!(!report.running);
        assert_eq!(report.exit_code, Some(0));

        engine.remove(&id, false, &ctx).await.unwrap();
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_start_knob() {
        let engine = FakeEngine::new();
        engine.set_fail_start(true);
        let ctx = CallCtx::default();
        let id = engine.create(&spec("c1"), &ctx).await.unwrap();
        assert!(engine.start(&id, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_transient_stop_failures_then_success() {
        let engine = FakeEngine::new();
        let ctx = CallCtx::default();
        let id = engine.create(&spec("c1"), &ctx).await.unwrap();
        engine.start(&id, &ctx).await.unwrap();

        engine.set_transient_stop_failures(2);
        assert!(engine.stop(&id, 10, &ctx).await.is_err());
        assert!(engine.stop(&id, 10, &ctx).await.is_err());
        assert!(engine.stop(&id, 10, &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_kill_emits_event() {
        let engine = FakeEngine::new();
        let ctx = CallCtx::default();
        let id = engine.create(&spec("c1"), &ctx).await.unwrap();
        engine.start(&id, &ctx).await.unwrap();

        let cancel = CancellationToken::new();
        let mut events = engine.events(cancel).await.unwrap();
        engine.kill(&id, 137);

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            EngineEvent::Died {
                engine_id: id.clone(),
                exit_code: Some(137)
            }
        );
        assert!(!engine.inspect(&id, &ctx).await.unwrap().running);
    }

    #[tokio::test]
    async fn test_cancelled_call_rejected() {
        let engine = FakeEngine::new();
        let ctx = CallCtx::default();
        ctx.cancel.cancel();
        let err = engine.create(&spec("c1"), &ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
    }
}
