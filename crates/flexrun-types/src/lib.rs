//! Wire types shared by the flexrun broker and its browser clients.
//!
//! Everything that crosses a process boundary lives here: the duplex
//! channel envelopes exchanged over the WebSocket, the JSON bodies of the
//! HTTP API, and the execution state vocabulary both sides agree on.
//!
//! ## Example
//!
//! ```rust
//! use flexrun_types::{ClientMessage, ServerMessage, ExecutionState};
//!
//! let msg = ClientMessage::parse(r#"{"type":"register_execution","executionId":"abc"}"#).unwrap();
//! assert_eq!(msg.execution_id(), Some("abc"));
//!
//! let status = ServerMessage::execution_status("abc", ExecutionState::Running, false);
//! let json = serde_json::to_value(&status).unwrap();
//! assert_eq!(json["type"], "execution_status");
//! ```

pub mod error;
pub mod execution;
pub mod http;
pub mod messages;

pub use error::*;
pub use execution::*;
pub use http::*;
pub use messages::*;
