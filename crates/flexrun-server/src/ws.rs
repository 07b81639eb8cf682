//! WebSocket session loop.
//!
//! One task per socket multiplexes three sources: the connection's outbound
//! queue, inbound frames, and the heartbeat timer.

use crate::AppState;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use flexrun_core::HeartbeatAction;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

/// Handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let multiplexer = Arc::clone(state.supervisor.multiplexer());
    let (client_id, mut outbound) = multiplexer.connect();
    let (mut sink, mut stream) = socket.split();

    let mut heartbeat = tokio::time::interval(multiplexer.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(message) = queued else {
                    break;
                };
                if let Err(e) = sink.send(Message::Text(message.to_json().into())).await {
                    log::warn!("Failed to send {} to client {}: {}", message.message_type(), client_id, e);
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        multiplexer
                            .handle_message(&client_id, text.as_str(), &state.supervisor)
                            .await;
                    }
                    Some(Ok(Message::Pong(_))) => multiplexer.record_pong(&client_id),
                    // Pings are answered by the protocol layer
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Ignoring {} byte binary frame from client {}", data.len(), client_id);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error for client {}: {}", client_id, e);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                match multiplexer.heartbeat(&client_id) {
                    HeartbeatAction::Ping => {
                        if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                            break;
                        }
                    }
                    HeartbeatAction::Terminate => {
                        log::warn!("Client {} stopped answering pings, closing", client_id);
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        }
    }

    multiplexer.disconnect(&client_id);
}
