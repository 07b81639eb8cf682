//! Execution state vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single code submission (a UUID v4 string).
pub type ExecutionId = String;

/// Identifier assigned to a duplex client connection.
pub type ClientId = String;

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// The interpreter is running and not blocked on input.
    Running,
    /// The interpreter asked for input and is blocked reading stdin.
    WaitingInput,
    /// The interpreter exited with status zero.
    Completed,
    /// The interpreter failed, could not be spawned, or timed out.
    Error,
    /// The execution was stopped on request.
    Stopped,
}

impl ExecutionState {
    /// Whether no further transitions can happen from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Error | ExecutionState::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Running => "running",
            ExecutionState::WaitingInput => "waiting_input",
            ExecutionState::Completed => "completed",
            ExecutionState::Error => "error",
            ExecutionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
