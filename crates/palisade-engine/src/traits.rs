//! The engine seam.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineResult;
use crate::types::{CallCtx, CreateSpec, EngineEvent, ExecOutput, InspectReport};

/// Minimal operations against a local container runtime.
///
/// Implementations must be thread-safe; the adapter is shared across the
/// lifecycle manager and the reaper. All ids are engine-side ids — the
/// bridge's internal container ids never reach this trait.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Verify the engine is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EngineError::Unavailable`] when it is not.
    async fn ping(&self) -> EngineResult<()>;

    /// Create a container. Returns the engine-side id.
    ///
    /// The full hardening policy is applied here; see the crate docs.
    ///
    /// # Errors
    ///
    /// Engine API failures, timeouts, and cancellation.
    async fn create(&self, spec: &CreateSpec, ctx: &CallCtx) -> EngineResult<String>;

    /// Start a created container.
    ///
    /// # Errors
    ///
    /// Engine API failures, timeouts, and cancellation.
    async fn start(&self, engine_id: &str, ctx: &CallCtx) -> EngineResult<()>;

    /// Inspect current engine-side state.
    ///
    /// # Errors
    ///
    /// [`crate::EngineError::NotFound`] for unknown ids.
    async fn inspect(&self, engine_id: &str, ctx: &CallCtx) -> EngineResult<InspectReport>;

    /// Run a command inside the container and capture its output.
    ///
    /// # Errors
    ///
    /// Engine API failures, timeouts, and cancellation.
    async fn exec(&self, engine_id: &str, cmd: &[String], ctx: &CallCtx) -> EngineResult<ExecOutput>;

    /// Stop with a grace period, then kill.
    ///
    /// # Errors
    ///
    /// Engine API failures, timeouts, and cancellation.
    async fn stop(&self, engine_id: &str, grace_secs: u32, ctx: &CallCtx) -> EngineResult<()>;

    /// Remove the container, optionally by force.
    ///
    /// # Errors
    ///
    /// Engine API failures, timeouts, and cancellation.
    async fn remove(&self, engine_id: &str, force: bool, ctx: &CallCtx) -> EngineResult<()>;

    /// Subscribe to the engine's container event stream.
    ///
    /// Best-effort: the stream may end on engine restart, and the consumer
    /// is expected to fall back to polling. The stream task stops when
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error only when the subscription itself cannot be set up.
    async fn events(&self, cancel: CancellationToken) -> EngineResult<mpsc::Receiver<EngineEvent>>;
}
