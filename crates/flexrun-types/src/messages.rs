//! Duplex channel envelopes.
//!
//! Every frame is a JSON object carrying a `type` discriminator. Inbound
//! frames decode into [`ClientMessage`], outbound frames are built from
//! [`ServerMessage`].

use crate::error::{ProtocolError, ProtocolResult};
use crate::execution::{ClientId, ExecutionId, ExecutionState};
use serde::{Deserialize, Serialize};

/// Prompt used when no output preceded an input request.
pub const DEFAULT_INPUT_PROMPT: &str = "Input required";

const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "register_execution",
    "input",
    "stop_execution",
    "check_execution_status",
    "ping",
    "pong",
];

fn is_false(value: &bool) -> bool {
    !*value
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A message sent by a browser client over the duplex channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Associate this connection with an execution.
    RegisterExecution {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
    },
    /// Deliver a line of input to a waiting execution.
    Input {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
        #[serde(alias = "input")]
        content: String,
    },
    /// Stop a running execution.
    StopExecution {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
    },
    /// Ask for the current state of an execution.
    CheckExecutionStatus {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
    },
    /// Application-level keepalive.
    Ping,
    /// Reply to a server ping.
    Pong,
}

impl ClientMessage {
    /// Decode a raw text frame.
    pub fn parse(raw: &str) -> ProtocolResult<Self> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::invalid_json(e.to_string()))?;

        let message_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !CLIENT_MESSAGE_TYPES.contains(&message_type.as_str()) {
            return Err(ProtocolError::UnknownType(message_type));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::malformed(message_type, e.to_string()))
    }

    /// The execution this message refers to, if any.
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            ClientMessage::RegisterExecution { execution_id }
            | ClientMessage::Input { execution_id, .. }
            | ClientMessage::StopExecution { execution_id }
            | ClientMessage::CheckExecutionStatus { execution_id } => Some(execution_id),
            ClientMessage::Ping | ClientMessage::Pong => None,
        }
    }
}

/// A message sent by the broker to a browser client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection.
    Connected {
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },
    /// Acknowledges a `register_execution` request.
    RegistrationConfirmed {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
        status: ExecutionState,
    },
    /// A chunk of program stdout, sentinels removed.
    Output {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
        data: String,
        #[serde(default, skip_serializing_if = "is_false")]
        broadcast: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        replay: bool,
    },
    /// A chunk of program stderr, or a protocol error for this connection.
    Error {
        content: String,
        #[serde(
            rename = "executionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        execution_id: Option<ExecutionId>,
        #[serde(default, skip_serializing_if = "is_false")]
        broadcast: bool,
    },
    /// The program is blocked reading stdin.
    InputRequest {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
        /// Always set; the frontend handles flagged requests ahead of queued output.
        priority: bool,
        attempt: u32,
        status: ExecutionState,
        prompt: String,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "is_false")]
        broadcast: bool,
    },
    /// Input submitted over the duplex channel reached the program.
    InputProcessed {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
        status: ExecutionState,
        timestamp: i64,
    },
    /// The execution reached a terminal state.
    ExecutionComplete {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
        status: ExecutionState,
        #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(rename = "timedOut", default, skip_serializing_if = "is_false")]
        timed_out: bool,
        #[serde(default, skip_serializing_if = "is_false")]
        broadcast: bool,
    },
    /// Reply to `check_execution_status` and `register_execution` for unknown ids.
    ExecutionStatus {
        #[serde(rename = "executionId")]
        execution_id: ExecutionId,
        status: ExecutionState,
        #[serde(rename = "waitingForInput")]
        waiting_for_input: bool,
    },
    /// Reply to a client `ping`.
    Pong { timestamp: i64 },
}

impl ServerMessage {
    pub fn connected(client_id: impl Into<ClientId>) -> Self {
        ServerMessage::Connected {
            client_id: client_id.into(),
        }
    }

    pub fn output(execution_id: impl Into<ExecutionId>, data: impl Into<String>) -> Self {
        ServerMessage::Output {
            execution_id: execution_id.into(),
            data: data.into(),
            broadcast: false,
            replay: false,
        }
    }

    /// An output chunk re-sent to a client that registered late.
    pub fn replayed_output(execution_id: impl Into<ExecutionId>, data: impl Into<String>) -> Self {
        ServerMessage::Output {
            execution_id: execution_id.into(),
            data: data.into(),
            broadcast: false,
            replay: true,
        }
    }

    /// An error frame not tied to any execution.
    pub fn error(content: impl Into<String>) -> Self {
        ServerMessage::Error {
            content: content.into(),
            execution_id: None,
            broadcast: false,
        }
    }

    pub fn execution_error(
        execution_id: impl Into<ExecutionId>,
        content: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            content: content.into(),
            execution_id: Some(execution_id.into()),
            broadcast: false,
        }
    }

    pub fn input_request(
        execution_id: impl Into<ExecutionId>,
        attempt: u32,
        prompt: impl Into<String>,
    ) -> Self {
        ServerMessage::InputRequest {
            execution_id: execution_id.into(),
            priority: true,
            attempt,
            status: ExecutionState::WaitingInput,
            prompt: prompt.into(),
            timestamp: now_millis(),
            broadcast: false,
        }
    }

    pub fn input_processed(execution_id: impl Into<ExecutionId>) -> Self {
        ServerMessage::InputProcessed {
            execution_id: execution_id.into(),
            status: ExecutionState::Running,
            timestamp: now_millis(),
        }
    }

    pub fn execution_complete(
        execution_id: impl Into<ExecutionId>,
        status: ExecutionState,
        exit_code: Option<i32>,
        timed_out: bool,
    ) -> Self {
        ServerMessage::ExecutionComplete {
            execution_id: execution_id.into(),
            status,
            exit_code,
            timed_out,
            broadcast: false,
        }
    }

    pub fn execution_status(
        execution_id: impl Into<ExecutionId>,
        status: ExecutionState,
        waiting_for_input: bool,
    ) -> Self {
        ServerMessage::ExecutionStatus {
            execution_id: execution_id.into(),
            status,
            waiting_for_input,
        }
    }

    pub fn registration_confirmed(
        execution_id: impl Into<ExecutionId>,
        status: ExecutionState,
    ) -> Self {
        ServerMessage::RegistrationConfirmed {
            execution_id: execution_id.into(),
            status,
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: now_millis(),
        }
    }

    /// The execution this message refers to, if any.
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            ServerMessage::RegistrationConfirmed { execution_id, .. }
            | ServerMessage::Output { execution_id, .. }
            | ServerMessage::InputRequest { execution_id, .. }
            | ServerMessage::InputProcessed { execution_id, .. }
            | ServerMessage::ExecutionComplete { execution_id, .. }
            | ServerMessage::ExecutionStatus { execution_id, .. } => Some(execution_id),
            ServerMessage::Error { execution_id, .. } => execution_id.as_deref(),
            ServerMessage::Connected { .. } | ServerMessage::Pong { .. } => None,
        }
    }

    /// The wire name of this message's `type` field.
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::RegistrationConfirmed { .. } => "registration_confirmed",
            ServerMessage::Output { .. } => "output",
            ServerMessage::Error { .. } => "error",
            ServerMessage::InputRequest { .. } => "input_request",
            ServerMessage::InputProcessed { .. } => "input_processed",
            ServerMessage::ExecutionComplete { .. } => "execution_complete",
            ServerMessage::ExecutionStatus { .. } => "execution_status",
            ServerMessage::Pong { .. } => "pong",
        }
    }

    /// Flag this message as sent through the broadcast fallback.
    pub fn into_broadcast(mut self) -> Self {
        match &mut self {
            ServerMessage::Output { broadcast, .. }
            | ServerMessage::Error { broadcast, .. }
            | ServerMessage::InputRequest { broadcast, .. }
            | ServerMessage::ExecutionComplete { broadcast, .. } => *broadcast = true,
            _ => {}
        }
        self
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> String {
        // Every variant holds only strings, integers and booleans.
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"error","content":"failed to encode {}: {}"}}"#,
                self.message_type(),
                e
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_register_execution() {
        let msg =
            ClientMessage::parse(r#"{"type":"register_execution","executionId":"e1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RegisterExecution {
                execution_id: "e1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_input_accepts_input_alias() {
        let msg = ClientMessage::parse(r#"{"type":"input","executionId":"e1","input":"42"}"#)
            .unwrap();
        match msg {
            ClientMessage::Input { content, .. } => assert_eq!(content, "42"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ping_ignores_extra_fields() {
        let msg = ClientMessage::parse(r#"{"type":"ping","timestamp":123}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
        assert_eq!(msg.execution_id(), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(
            ClientMessage::parse(r#"{"executionId":"e1"}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"launch_missiles"}"#),
            Err(ProtocolError::UnknownType("launch_missiles".to_string()))
        );
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"input","executionId":"e1"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_output_omits_false_flags() {
        let value = serde_json::to_value(ServerMessage::output("e1", "hi")).unwrap();
        assert_eq!(value, json!({"type": "output", "executionId": "e1", "data": "hi"}));

        let value = serde_json::to_value(ServerMessage::output("e1", "hi").into_broadcast()).unwrap();
        assert_eq!(value["broadcast"], true);
    }

    #[test]
    fn test_input_request_shape() {
        let value = serde_json::to_value(ServerMessage::input_request("e1", 2, "Name?")).unwrap();
        assert_eq!(value["type"], "input_request");
        assert_eq!(value["executionId"], "e1");
        assert_eq!(value["priority"], true);
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["status"], "waiting_input");
        assert_eq!(value["prompt"], "Name?");
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_execution_complete_shape() {
        let msg = ServerMessage::execution_complete("e1", ExecutionState::Error, None, true);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["timedOut"], true);
        assert!(value.get("exitCode").is_none());
        assert_eq!(msg.execution_id(), Some("e1"));
    }

    #[test]
    fn test_into_broadcast_leaves_unflagged_variants_alone() {
        let msg = ServerMessage::pong().into_broadcast();
        assert_eq!(msg.message_type(), "pong");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert!(value.get("broadcast").is_none());
    }
}
