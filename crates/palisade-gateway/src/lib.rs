//! Palisade Gateway - the bridge daemon.
//!
//! Assembles every subsystem into the running daemon: the line-delimited
//! JSON-RPC server on the Unix socket, the zero-trust filter in front of
//! chat-originated commands, the chat command parser and inbound router,
//! the WebSocket event fan-out, and the startup/shutdown orchestration
//! with its documented exit codes.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod command;
pub mod daemon;
pub mod inbound;
pub mod logging;
pub mod rpc;
pub mod server;
pub mod state;
pub mod ws;
pub mod zerotrust;

pub use daemon::{run_daemon, ExitCode};
pub use state::BridgeState;
