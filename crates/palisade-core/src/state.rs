//! The container lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed container.
///
/// ```text
///               created
///                 │
///                 ▼
///   pending ──► starting ──► running ──► idle ──► stopping ──► stopped
///                 │             │         │           │
///                 └──────────── failed ◄──┴───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Recorded but not yet handed to the engine.
    Pending,
    /// Engine create/start issued; waiting for a running confirmation.
    Starting,
    /// Confirmed running and heartbeating.
    Running,
    /// Alive but past the idle timeout without a heartbeat.
    Idle,
    /// Stop requested; engine teardown in progress.
    Stopping,
    /// Terminal: exited cleanly or was stopped.
    Stopped,
    /// Terminal: failed to start, or died unexpectedly.
    Failed,
}

impl ContainerState {
    /// Whether the state is terminal (no further transitions allowed).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether the container is still considered live by the reaper.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Idle)
    }

    /// Whether a transition from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use ContainerState::{Failed, Idle, Pending, Running, Starting, Stopped, Stopping};
        match (self, next) {
            (Pending, Starting)
            | (Starting, Running | Failed)
            | (Running, Idle | Stopping | Failed)
            | (Idle, Running | Stopping | Failed)
            | (Stopping, Stopped | Failed) => true,
            // Stop can be requested before the start confirmation arrives.
            (Starting, Stopping) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use ContainerState::{Idle, Pending, Running, Starting, Stopped, Stopping};
        let path = [Pending, Starting, Running, Idle, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        for terminal in [ContainerState::Stopped, ContainerState::Failed] {
            assert!(terminal.is_terminal());
            for next in [
                ContainerState::Pending,
                ContainerState::Starting,
                ContainerState::Running,
                ContainerState::Idle,
                ContainerState::Stopping,
                ContainerState::Stopped,
                ContainerState::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_stop_during_starting_is_legal() {
        assert!(ContainerState::Starting.can_transition_to(ContainerState::Stopping));
    }

    #[test]
    fn test_no_resurrection() {
        assert!(!ContainerState::Stopped.can_transition_to(ContainerState::Running));
        assert!(!ContainerState::Failed.can_transition_to(ContainerState::Starting));
    }

    #[test]
    fn test_wire_format_is_snake_case() {
        let json = serde_json::to_string(&ContainerState::Starting).unwrap();
        assert_eq!(json, "\"starting\"");
    }
}
