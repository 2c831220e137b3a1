//! Palisade Engine - a thin, scoped wrapper over the local container runtime.
//!
//! The adapter exposes exactly the operations the bridge needs — create,
//! start, inspect, exec, stop, remove, events — behind the
//! [`ContainerEngine`] trait so the lifecycle manager can be driven by a
//! test double. Every operation takes a call context carrying a timeout and
//! a cancellation token.
//!
//! The hardening policy is not configurable per call: every create drops
//! all capabilities, sets no-new-privileges, mounts the root filesystem
//! read-only, runs as UID 10001, disables networking unless explicitly
//! opted in, and applies the configured seccomp profile and memory/pid
//! limits. The adapter never pulls or manages images.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod docker;
mod error;
mod fake;
mod traits;
mod types;

pub use docker::DockerEngine;
pub use error::{EngineError, EngineResult};
pub use fake::FakeEngine;
pub use traits::ContainerEngine;
pub use types::{
    BindMount, CallCtx, CreateSpec, EngineEvent, ExecOutput, HardeningPolicy, InspectReport,
};
