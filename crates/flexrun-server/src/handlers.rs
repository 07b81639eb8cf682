//! HTTP handlers for the `/api` routes.

use crate::error::{Result, ServerError};
use crate::AppState;
use axum::extract::{Json as AxumJson, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use flexrun_core::{BrokerError, OutcomeStatus};
use flexrun_types::{
    ExecuteAccepted, ExecuteQuery, ExecuteRequest, ExecuteResponse, ExecutionState,
    ExecutionStatusResponse, ExecutionSummary, InputAccepted, InputRequestBody,
    InputStatusResponse, WaitingExecution,
};
use serde::Serialize;
use serde_json::json;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    #[serde(rename = "activeExecutions")]
    pub active_executions: usize,
    #[serde(rename = "connectedClients")]
    pub connected_clients: usize,
}

/// Handler for `POST /api/execute`.
///
/// Blocks until the execution finishes unless `?mode=async` is given.
pub async fn execute_handler(
    State(state): State<AppState>,
    Query(query): Query<ExecuteQuery>,
    AxumJson(request): AxumJson<ExecuteRequest>,
) -> Result<Response> {
    let code = request.code.ok_or(BrokerError::CodeMissing)?;
    log::info!("Received execute request ({} characters)", code.chars().count());

    let handle = state.supervisor.start(&code).await?;
    let execution_id = handle.execution_id.clone();

    if query.is_async() {
        log::info!("Execution {} accepted in async mode", execution_id);
        return Ok((
            StatusCode::ACCEPTED,
            Json(ExecuteAccepted {
                execution_id,
                status: ExecutionState::Running,
            }),
        )
            .into_response());
    }

    let outcome = handle.wait().await;
    match outcome.status {
        OutcomeStatus::Completed | OutcomeStatus::Stopped => Ok(Json(ExecuteResponse {
            execution_id: outcome.execution_id,
            output: outcome.output,
            stderr: outcome.stderr,
            status: outcome.status.state(),
            exit_code: outcome.exit_code,
        })
        .into_response()),
        OutcomeStatus::TimedOut => Err(ServerError::Timeout {
            execution_id: outcome.execution_id,
            stderr: outcome.stderr,
        }),
        OutcomeStatus::Failed => Err(ServerError::ExecutionFailed {
            execution_id: outcome.execution_id,
            stderr: outcome.stderr,
        }),
    }
}

/// Handler for `POST /api/input`.
pub async fn input_handler(
    State(state): State<AppState>,
    AxumJson(body): AxumJson<InputRequestBody>,
) -> Result<Json<InputAccepted>> {
    let execution_id = body
        .execution_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ServerError::missing_field("executionId"))?;
    let input = body.input.ok_or_else(|| ServerError::missing_field("input"))?;

    state.supervisor.submit_input(&execution_id, &input).await?;

    Ok(Json(InputAccepted {
        status: "success".to_string(),
        state: ExecutionState::Running,
        message: "Input sent successfully".to_string(),
    }))
}

/// Handler for `GET /api/execution-status/{id}`.
pub async fn execution_status_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Json<ExecutionStatusResponse> {
    let (execution_state, waiting_for_input) = state.supervisor.status(&execution_id).await;
    Json(ExecutionStatusResponse {
        status: "success".to_string(),
        execution_id,
        state: execution_state,
        waiting_for_input,
    })
}

/// Handler for `GET /api/input-status`.
pub async fn input_status_handler(State(state): State<AppState>) -> Json<InputStatusResponse> {
    let registry = state.supervisor.registry();
    let multiplexer = state.supervisor.multiplexer();

    let waiting_executions = registry
        .list_waiting()
        .await
        .into_iter()
        .map(|snapshot| WaitingExecution {
            has_client: snapshot
                .client_id
                .as_deref()
                .is_some_and(|client| multiplexer.is_connected(client)),
            id: snapshot.id,
            waiting_since: snapshot.input_requested_at,
            client_id: snapshot.client_id,
            state: snapshot.state,
        })
        .collect();

    Json(InputStatusResponse {
        status: "success".to_string(),
        waiting_executions,
        active_execution_count: registry.count_active().await,
        client_count: multiplexer.client_count(),
    })
}

/// Handler for `GET /api/test-input`, a diagnostic dump of live executions.
pub async fn test_input_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let multiplexer = state.supervisor.multiplexer();
    let executions: Vec<ExecutionSummary> = state
        .supervisor
        .registry()
        .list()
        .await
        .into_iter()
        .map(|snapshot| ExecutionSummary {
            has_client: snapshot
                .client_id
                .as_deref()
                .is_some_and(|client| multiplexer.is_connected(client)),
            id: snapshot.id,
            state: snapshot.state,
            waiting_for_input: snapshot.waiting_for_input,
            client_id: snapshot.client_id,
        })
        .collect();

    Json(json!({
        "status": "success",
        "clientCount": multiplexer.client_count(),
        "executionCount": executions.len(),
        "executions": executions,
        "timestamp": chrono::Utc::now()
    }))
}

/// Handler for `GET /api/status` and `GET /health`.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_executions: state.supervisor.registry().count_active().await,
        connected_clients: state.supervisor.multiplexer().client_count(),
    })
}
