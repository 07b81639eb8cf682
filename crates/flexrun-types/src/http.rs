//! Request and response bodies of the HTTP API.

use crate::execution::{ClientId, ExecutionId, ExecutionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Source text to run. Optional so a missing field maps to a 400.
    #[serde(default)]
    pub code: Option<String>,
}

/// Query string of `POST /api/execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteQuery {
    /// `async` returns as soon as the process is spawned.
    #[serde(default)]
    pub mode: Option<String>,
}

impl ExecuteQuery {
    pub fn is_async(&self) -> bool {
        matches!(self.mode.as_deref(), Some("async"))
    }
}

/// Terminal result of a synchronous `POST /api/execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// The execution identifier.
    #[serde(rename = "executionId")]
    pub execution_id: ExecutionId,
    /// Program stdout with sentinel tokens removed.
    pub output: String,
    /// Program stderr, one entry per line.
    pub stderr: Vec<String>,
    /// Final state of the execution.
    pub status: ExecutionState,
    /// Process exit code when the process exited on its own.
    #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Immediate reply of `POST /api/execute?mode=async`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteAccepted {
    #[serde(rename = "executionId")]
    pub execution_id: ExecutionId,
    pub status: ExecutionState,
}

/// Body of `POST /api/input`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputRequestBody {
    /// Target execution.
    #[serde(rename = "executionId", default)]
    pub execution_id: Option<ExecutionId>,
    /// Line of input; a newline is appended when written to the process.
    #[serde(default)]
    pub input: Option<String>,
}

/// Reply of a successful `POST /api/input`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAccepted {
    pub status: String,
    pub state: ExecutionState,
    pub message: String,
}

/// Reply of `GET /api/execution-status/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatusResponse {
    pub status: String,
    #[serde(rename = "executionId")]
    pub execution_id: ExecutionId,
    pub state: ExecutionState,
    #[serde(rename = "waitingForInput")]
    pub waiting_for_input: bool,
}

/// An execution currently blocked on input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingExecution {
    pub id: ExecutionId,
    #[serde(rename = "waitingSince")]
    pub waiting_since: Option<DateTime<Utc>>,
    #[serde(rename = "hasClient")]
    pub has_client: bool,
    #[serde(rename = "clientId")]
    pub client_id: Option<ClientId>,
    pub state: ExecutionState,
}

/// Reply of `GET /api/input-status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputStatusResponse {
    pub status: String,
    #[serde(rename = "waitingExecutions")]
    pub waiting_executions: Vec<WaitingExecution>,
    #[serde(rename = "activeExecutionCount")]
    pub active_execution_count: usize,
    #[serde(rename = "clientCount")]
    pub client_count: usize,
}

/// One active execution as reported by `GET /api/test-input`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub state: ExecutionState,
    #[serde(rename = "waitingForInput")]
    pub waiting_for_input: bool,
    #[serde(rename = "hasClient")]
    pub has_client: bool,
    #[serde(rename = "clientId")]
    pub client_id: Option<ClientId>,
}

/// JSON body of every error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(rename = "executionId", default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stderr: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
