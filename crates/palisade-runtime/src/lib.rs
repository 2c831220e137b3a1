//! Palisade Runtime - the container plane.
//!
//! This crate owns the end-to-end credential lifecycle during container
//! start: decrypt from the keystore, materialize a secret bundle on tmpfs,
//! bind it read-only into exactly one hardened container, confirm the
//! container is running, and guarantee the bundle disappears — after the
//! deletion delay on success, immediately on any failure or stop.
//!
//! The [`LifecycleManager`] tracks every managed container, serializes
//! starts per credential, enforces the concurrency cap and budget gate,
//! and runs the reaper that applies idle and lifetime policies.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod bundle;
mod error;
mod injector;
mod manager;
mod reaper;
mod types;

pub use bundle::SecretBundle;
pub use error::{RuntimeError, RuntimeResult};
pub use injector::{prepare_runtime_dir, Injector};
pub use manager::LifecycleManager;
pub use reaper::{run_engine_events, run_reaper};
pub use types::{ContainerHealth, ContainerRecord, RuntimeConfig, StartOptions};
