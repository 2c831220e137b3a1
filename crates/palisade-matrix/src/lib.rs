//! Palisade Matrix - the chat protocol adapter.
//!
//! A deliberately small Matrix client: password login with session-token
//! reuse, a cancellable long-poll `/sync` loop, and thin wrappers over the
//! send-side client-server APIs (message, reaction, reply, file upload).
//! The bridge is a client only; no server semantics live here.
//!
//! One long-lived HTTP client with keep-alive carries every request. Sync
//! failures back off exponentially with full jitter and surface as MAT
//! error reports after sustained failure.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod backoff;
mod client;
mod error;
mod sync;
mod types;

pub use backoff::Backoff;
pub use client::MatrixClient;
pub use error::{MatrixError, MatrixResult};
pub use sync::{run_sync_loop, InviteFilter, SyncLoopCtx};
pub use types::{LoginSession, RetryPolicy, RoomInvite, SyncBatch};
