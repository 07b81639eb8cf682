//! Duplex client connections and event routing.
//!
//! Each connection owns an unbounded outbound queue drained by its
//! transport task, so sending never blocks and can safely happen while the
//! registry lock is held. Events for an execution go to its associated
//! connection when that connection is live, otherwise they are broadcast to
//! every connection with the `broadcast` flag set.

use crate::config::BrokerConfig;
use crate::errors::Result;
use crate::registry::{ExecutionEntry, ExecutionRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flexrun_types::{ClientId, ClientMessage, ExecutionState, ProtocolError, ServerMessage};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Operations a client may trigger on an execution.
#[async_trait]
pub trait ExecutionControl: Send + Sync {
    /// Write one line of input to a waiting execution.
    async fn submit_input(&self, execution_id: &str, input: &str) -> Result<()>;

    /// Stop a live execution.
    async fn stop(&self, execution_id: &str) -> Result<()>;

    /// Current state and waiting flag; unknown ids report `completed`.
    async fn status(&self, execution_id: &str) -> (ExecutionState, bool);
}

/// What the transport should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping frame.
    Ping,
    /// Too many pings went unanswered; close the connection.
    Terminate,
}

struct Connection {
    sender: mpsc::UnboundedSender<ServerMessage>,
    missed_pongs: u32,
    connected_at: DateTime<Utc>,
}

/// Registry of live duplex connections.
pub struct ConnectionMultiplexer {
    connections: Mutex<HashMap<ClientId, Connection>>,
    registry: ExecutionRegistry,
    missed_pong_limit: u32,
    heartbeat_interval: Duration,
    input_request_retries: u32,
    input_request_backoff: Duration,
}

impl ConnectionMultiplexer {
    pub fn new(registry: ExecutionRegistry, config: &BrokerConfig) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            registry,
            missed_pong_limit: config.connections.missed_pong_limit,
            heartbeat_interval: config.connections.heartbeat_interval(),
            input_request_retries: config.execution.input_request_retries,
            input_request_backoff: config.execution.input_request_backoff(),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ClientId, Connection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Register a new connection and queue its `connected` frame.
    ///
    /// The returned receiver yields every message addressed to the connection.
    pub fn connect(&self) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();

        // The receiver is still in hand, so this cannot fail
        let _ = sender.send(ServerMessage::connected(client_id.clone()));

        let mut table = self.table();
        table.insert(
            client_id.clone(),
            Connection {
                sender,
                missed_pongs: 0,
                connected_at: Utc::now(),
            },
        );
        log::info!(
            "Client {} connected ({} active connections)",
            client_id,
            table.len()
        );
        (client_id, receiver)
    }

    /// Forget a connection. Associated executions keep running headless.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let mut table = self.table();
        match table.remove(client_id) {
            Some(connection) => {
                log::info!(
                    "Client {} disconnected after {}s ({} active connections)",
                    client_id,
                    (Utc::now() - connection.connected_at).num_seconds(),
                    table.len()
                );
                true
            }
            None => false,
        }
    }

    /// Drop every connection. Transport tasks see their queue close and exit.
    pub fn disconnect_all(&self) -> usize {
        let mut table = self.table();
        let count = table.len();
        table.clear();
        if count > 0 {
            log::info!("Closed {} client connections", count);
        }
        count
    }

    pub fn client_count(&self) -> usize {
        self.table().len()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.table()
            .get(client_id)
            .map(|c| !c.sender.is_closed())
            .unwrap_or(false)
    }

    /// Queue a message for one connection. Returns false if it is gone.
    pub fn send_to(&self, client_id: &str, message: ServerMessage) -> bool {
        let table = self.table();
        let Some(connection) = table.get(client_id) else {
            log::debug!(
                "Dropping {} for unknown client {}",
                message.message_type(),
                client_id
            );
            return false;
        };

        match connection.sender.send(message) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "Failed to send {} to client {}: transport closed",
                    e.0.message_type(),
                    client_id
                );
                false
            }
        }
    }

    /// Queue a message for every connection. Returns how many accepted it.
    pub fn broadcast(&self, message: ServerMessage) -> usize {
        self.broadcast_to_all(message).len()
    }

    fn broadcast_to_all(&self, message: ServerMessage) -> Vec<ClientId> {
        let message = message.into_broadcast();
        let table = self.table();
        let delivered: Vec<ClientId> = table
            .iter()
            .filter(|(_, connection)| connection.sender.send(message.clone()).is_ok())
            .map(|(client_id, _)| client_id.clone())
            .collect();
        log::debug!(
            "Broadcast {} to {}/{} clients",
            message.message_type(),
            delivered.len(),
            table.len()
        );
        delivered
    }

    /// Send directly to `client_id` when it is live, otherwise broadcast.
    ///
    /// Returns the clients that accepted the message.
    pub fn dispatch(&self, client_id: Option<&str>, message: ServerMessage) -> Vec<ClientId> {
        if let Some(client_id) = client_id {
            if self.send_to(client_id, message.clone()) {
                return vec![client_id.to_string()];
            }
        }
        self.broadcast_to_all(message)
    }

    pub fn route(&self, client_id: Option<&str>, message: ServerMessage) -> bool {
        !self.dispatch(client_id, message).is_empty()
    }

    /// Route a stdout chunk and buffer it for clients that have not seen it.
    ///
    /// Call with the entry borrowed from [`ExecutionRegistry::with_entry`] so
    /// that buffering and delivery cannot interleave with a registration.
    pub fn stream_output(&self, entry: &mut ExecutionEntry, chunk: &str) {
        let recipients = self.dispatch(
            entry.client_id.as_deref(),
            ServerMessage::output(entry.id.as_str(), chunk),
        );
        entry.push_output(chunk, recipients);
    }

    /// Deliver an execution event to whoever should see it.
    pub async fn deliver(&self, execution_id: &str, message: ServerMessage) -> bool {
        let mut pending = Some(message);
        let routed = self
            .registry
            .with_entry(execution_id, |entry| {
                pending
                    .take()
                    .map(|message| self.route(entry.client_id.as_deref(), message))
                    .unwrap_or(false)
            })
            .await;

        match (routed, pending) {
            (Some(delivered), _) => delivered,
            (None, Some(message)) => self.broadcast(message) > 0,
            (None, None) => false,
        }
    }

    /// Account for a heartbeat tick on `client_id`.
    pub fn heartbeat(&self, client_id: &str) -> HeartbeatAction {
        let mut table = self.table();
        let Some(connection) = table.get_mut(client_id) else {
            return HeartbeatAction::Terminate;
        };

        if connection.missed_pongs >= self.missed_pong_limit {
            log::warn!(
                "Client {} missed {} heartbeats, terminating",
                client_id,
                connection.missed_pongs
            );
            return HeartbeatAction::Terminate;
        }
        connection.missed_pongs += 1;
        HeartbeatAction::Ping
    }

    pub fn record_pong(&self, client_id: &str) {
        if let Some(connection) = self.table().get_mut(client_id) {
            connection.missed_pongs = 0;
        }
    }

    /// Send `input_request` for request `seq`, retrying with exponential backoff.
    ///
    /// Stops as soon as the execution completes, receives input, or starts a
    /// newer request. Returns the number of attempts made.
    pub async fn notify_input_request(&self, execution_id: &str, seq: u64) -> u32 {
        let mut attempts = 0;

        for attempt in 0..=self.input_request_retries {
            if attempt > 0 {
                let delay = self.input_request_backoff * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }

            let sent = self
                .registry
                .with_entry(execution_id, |entry| {
                    if entry.is_completed()
                        || !entry.waiting_for_input
                        || entry.input_request_seq != seq
                    {
                        return false;
                    }
                    let message = ServerMessage::input_request(execution_id, attempt, entry.prompt());
                    if !self.route(entry.client_id.as_deref(), message) {
                        log::warn!(
                            "No client received input request {} for {} (attempt {})",
                            seq,
                            execution_id,
                            attempt
                        );
                    }
                    true
                })
                .await
                .unwrap_or(false);

            if !sent {
                break;
            }
            attempts += 1;
            log::info!(
                "Input request {} for {} sent (attempt {})",
                seq,
                execution_id,
                attempt
            );
        }

        attempts
    }

    /// Associate `client_id` with an execution and bring it up to date.
    pub async fn register(&self, client_id: &str, execution_id: &str) {
        let registered = self
            .registry
            .with_entry(execution_id, |entry| {
                if let Some(previous) = entry.client_id.replace(client_id.to_string()) {
                    if previous != client_id {
                        log::info!(
                            "Execution {} moved from client {} to {}",
                            execution_id,
                            previous,
                            client_id
                        );
                    }
                }

                self.send_to(
                    client_id,
                    ServerMessage::registration_confirmed(execution_id, entry.state),
                );
                let mut replayed = 0;
                for chunk in entry.output.iter_mut().filter(|c| !c.was_seen_by(client_id)) {
                    let message = ServerMessage::replayed_output(execution_id, chunk.data.as_str());
                    if self.send_to(client_id, message) {
                        chunk.seen_by.push(client_id.to_string());
                        replayed += 1;
                    }
                }
                if entry.waiting_for_input && !entry.is_completed() {
                    self.send_to(
                        client_id,
                        ServerMessage::input_request(execution_id, 0, entry.prompt()),
                    );
                }
                replayed
            })
            .await;

        match registered {
            Some(replayed) => log::info!(
                "Client {} registered for execution {} ({} chunks replayed)",
                client_id,
                execution_id,
                replayed
            ),
            None => {
                log::info!(
                    "Client {} registered for unknown execution {}, reporting completed",
                    client_id,
                    execution_id
                );
                self.send_to(
                    client_id,
                    ServerMessage::execution_status(execution_id, ExecutionState::Completed, false),
                );
            }
        }
    }

    /// Decode and act on one inbound text frame.
    pub async fn handle_message(&self, client_id: &str, raw: &str, control: &dyn ExecutionControl) {
        let message = match ClientMessage::parse(raw) {
            Ok(message) => message,
            Err(error @ ProtocolError::Malformed { .. }) => {
                log::warn!("Malformed message from client {}: {}", client_id, error);
                self.send_to(client_id, ServerMessage::error(error.to_string()));
                return;
            }
            Err(error) => {
                log::warn!("Ignoring message from client {}: {}", client_id, error);
                return;
            }
        };

        match message {
            ClientMessage::RegisterExecution { execution_id } => {
                self.register(client_id, &execution_id).await;
            }
            ClientMessage::Input {
                execution_id,
                content,
            } => match control.submit_input(&execution_id, &content).await {
                Ok(()) => {
                    self.send_to(client_id, ServerMessage::input_processed(execution_id));
                }
                Err(e) => {
                    log::warn!("Input from client {} rejected: {}", client_id, e);
                    self.send_to(client_id, ServerMessage::execution_error(execution_id, e.to_string()));
                }
            },
            ClientMessage::StopExecution { execution_id } => {
                match control.stop(&execution_id).await {
                    Ok(()) => log::info!(
                        "Client {} stopped execution {}",
                        client_id,
                        execution_id
                    ),
                    Err(e) => {
                        log::warn!("Stop from client {} rejected: {}", client_id, e);
                        self.send_to(
                            client_id,
                            ServerMessage::execution_error(execution_id, e.to_string()),
                        );
                    }
                }
            }
            ClientMessage::CheckExecutionStatus { execution_id } => {
                self.registry.associate_client(&execution_id, client_id).await;
                let (state, waiting) = control.status(&execution_id).await;
                self.send_to(
                    client_id,
                    ServerMessage::execution_status(execution_id, state, waiting),
                );
            }
            ClientMessage::Ping => {
                self.send_to(client_id, ServerMessage::pong());
            }
            ClientMessage::Pong => self.record_pong(client_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::KillReason;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    struct FakeControl {
        registry: ExecutionRegistry,
    }

    #[async_trait]
    impl ExecutionControl for FakeControl {
        async fn submit_input(&self, execution_id: &str, input: &str) -> Result<()> {
            self.registry
                .accept_input(execution_id, format!("{}\n", input))
                .await
        }

        async fn stop(&self, execution_id: &str) -> Result<()> {
            match self
                .registry
                .claim_termination(execution_id, ExecutionState::Stopped, KillReason::Stopped)
                .await
            {
                Err(e) if e.is_finished() => Ok(()),
                other => other,
            }
        }

        async fn status(&self, execution_id: &str) -> (ExecutionState, bool) {
            self.registry
                .get(execution_id)
                .await
                .map(|s| (s.state, s.waiting_for_input))
                .unwrap_or((ExecutionState::Completed, false))
        }
    }

    struct Harness {
        registry: ExecutionRegistry,
        mux: Arc<ConnectionMultiplexer>,
        control: FakeControl,
        _stdin: mpsc::UnboundedReceiver<String>,
        _kill: oneshot::Receiver<KillReason>,
    }

    async fn harness(config: BrokerConfig) -> Harness {
        let registry = ExecutionRegistry::new();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        registry
            .add(ExecutionEntry::new("e1", PathBuf::from("/tmp/code_e1.lx"), stdin_tx, kill_tx))
            .await;
        Harness {
            mux: Arc::new(ConnectionMultiplexer::new(registry.clone(), &config)),
            control: FakeControl {
                registry: registry.clone(),
            },
            registry,
            _stdin: stdin_rx,
            _kill: kill_rx,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn test_connect_sends_client_id() {
        let h = harness(BrokerConfig::default()).await;
        let (client, mut rx) = h.mux.connect();

        assert_eq!(drain(&mut rx), vec![ServerMessage::connected(client.clone())]);
        assert_eq!(h.mux.client_count(), 1);
        assert!(h.mux.disconnect(&client));
        assert!(!h.mux.disconnect(&client));
        assert_eq!(h.mux.client_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_output_is_broadcast() {
        let h = harness(BrokerConfig::default()).await;
        let (_a, mut rx_a) = h.mux.connect();
        let (_b, mut rx_b) = h.mux.connect();
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert!(h.mux.deliver("e1", ServerMessage::output("e1", "hello")).await);

        let expected = vec![ServerMessage::output("e1", "hello").into_broadcast()];
        assert_eq!(drain(&mut rx_a), expected);
        assert_eq!(drain(&mut rx_b), expected);
    }

    #[tokio::test]
    async fn test_most_recent_registration_wins() {
        let h = harness(BrokerConfig::default()).await;
        let (a, mut rx_a) = h.mux.connect();
        let (b, mut rx_b) = h.mux.connect();

        h.mux.register(&a, "e1").await;
        h.mux.register(&b, "e1").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        h.mux.deliver("e1", ServerMessage::output("e1", "x")).await;
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![ServerMessage::output("e1", "x")]);
    }

    #[tokio::test]
    async fn test_dead_client_falls_back_to_broadcast() {
        let h = harness(BrokerConfig::default()).await;
        let (a, rx_a) = h.mux.connect();
        let (_b, mut rx_b) = h.mux.connect();
        h.mux.register(&a, "e1").await;
        drop(rx_a);
        drain(&mut rx_b);

        assert!(h.mux.deliver("e1", ServerMessage::output("e1", "y")).await);
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::output("e1", "y").into_broadcast()]
        );
    }

    #[tokio::test]
    async fn test_late_registration_replays_output_and_pending_request() {
        let h = harness(BrokerConfig::default()).await;
        h.registry
            .with_entry("e1", |e| {
                e.push_output("one\n", Vec::new());
                e.push_output("Your name? ", Vec::new());
            })
            .await;
        h.registry.begin_input_request("e1").await.unwrap();

        let (client, mut rx) = h.mux.connect();
        drain(&mut rx);
        h.mux.register(&client, "e1").await;

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages[0],
            ServerMessage::registration_confirmed("e1", ExecutionState::WaitingInput)
        );
        assert_eq!(messages[1], ServerMessage::replayed_output("e1", "one\n"));
        assert_eq!(messages[2], ServerMessage::replayed_output("e1", "Your name? "));
        match &messages[3] {
            ServerMessage::InputRequest { prompt, attempt, .. } => {
                assert_eq!(prompt, "Your name?");
                assert_eq!(*attempt, 0);
            }
            other => panic!("expected input_request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registering_client_gets_each_chunk_once() {
        let h = harness(BrokerConfig::default()).await;
        let (client, mut rx) = h.mux.connect();
        drain(&mut rx);

        // Output streams before the client registers, so it arrives as a broadcast
        h.registry
            .with_entry("e1", |e| h.mux.stream_output(e, "hello\n"))
            .await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::output("e1", "hello\n").into_broadcast()]
        );

        h.mux.register(&client, "e1").await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::registration_confirmed("e1", ExecutionState::Running)]
        );

        // Registering again replays nothing new either
        h.mux.register(&client, "e1").await;
        assert_eq!(drain(&mut rx).len(), 1);

        // A connection that never saw the chunk still catches up
        let (late, mut late_rx) = h.mux.connect();
        drain(&mut late_rx);
        h.mux.register(&late, "e1").await;
        assert_eq!(
            drain(&mut late_rx),
            vec![
                ServerMessage::registration_confirmed("e1", ExecutionState::Running),
                ServerMessage::replayed_output("e1", "hello\n"),
            ]
        );
    }

    #[tokio::test]
    async fn test_streamed_output_skips_replay_for_direct_recipient() {
        let h = harness(BrokerConfig::default()).await;
        let (client, mut rx) = h.mux.connect();
        h.mux.register(&client, "e1").await;
        drain(&mut rx);

        h.registry
            .with_entry("e1", |e| h.mux.stream_output(e, "direct\n"))
            .await;
        assert_eq!(drain(&mut rx), vec![ServerMessage::output("e1", "direct\n")]);

        h.mux.register(&client, "e1").await;
        assert_eq!(drain(&mut rx).len(), 1);

        // Nobody was connected for this one
        h.mux.disconnect(&client);
        h.registry
            .with_entry("e1", |e| h.mux.stream_output(e, "headless\n"))
            .await;
        let (back, mut back_rx) = h.mux.connect();
        drain(&mut back_rx);
        h.mux.register(&back, "e1").await;
        let replayed: Vec<ServerMessage> = drain(&mut back_rx).into_iter().skip(1).collect();
        assert_eq!(
            replayed,
            vec![
                ServerMessage::replayed_output("e1", "direct\n"),
                ServerMessage::replayed_output("e1", "headless\n"),
            ]
        );
    }

    #[tokio::test]
    async fn test_register_unknown_execution_reports_completed() {
        let h = harness(BrokerConfig::default()).await;
        let (client, mut rx) = h.mux.connect();
        drain(&mut rx);

        h.mux.register(&client, "ghost").await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::execution_status("ghost", ExecutionState::Completed, false)]
        );
    }

    #[tokio::test]
    async fn test_heartbeat_terminates_after_missed_pongs() {
        let h = harness(BrokerConfig::default()).await;
        let (client, _rx) = h.mux.connect();

        assert_eq!(h.mux.heartbeat(&client), HeartbeatAction::Ping);
        h.mux.record_pong(&client);
        assert_eq!(h.mux.heartbeat(&client), HeartbeatAction::Ping);
        assert_eq!(h.mux.heartbeat(&client), HeartbeatAction::Ping);
        assert_eq!(h.mux.heartbeat(&client), HeartbeatAction::Terminate);
        assert_eq!(h.mux.heartbeat("unknown"), HeartbeatAction::Terminate);
    }

    #[tokio::test]
    async fn test_disconnect_all_closes_queues() {
        let h = harness(BrokerConfig::default()).await;
        let (_a, mut rx_a) = h.mux.connect();
        let (_b, _rx_b) = h.mux.connect();

        assert_eq!(h.mux.disconnect_all(), 2);
        assert_eq!(h.mux.client_count(), 0);
        drain(&mut rx_a);
        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_request_retries_until_answered() {
        let h = harness(BrokerConfig::default()).await;
        let (client, mut rx) = h.mux.connect();
        h.mux.register(&client, "e1").await;
        drain(&mut rx);

        let seq = h.registry.begin_input_request("e1").await.unwrap();
        let mux = Arc::clone(&h.mux);
        let retries = tokio::spawn(async move { mux.notify_input_request("e1", seq).await });

        // Attempts at 0s and 1s, then the input arrives before the 3s attempt
        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.control.submit_input("e1", "42").await.unwrap();

        assert_eq!(retries.await.unwrap(), 2);
        let attempts: Vec<u32> = drain(&mut rx)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::InputRequest { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_request_retry_budget() {
        let h = harness(BrokerConfig::default()).await;
        let seq = h.registry.begin_input_request("e1").await.unwrap();
        assert_eq!(h.mux.notify_input_request("e1", seq).await, 4);

        // A stale sequence number sends nothing
        assert_eq!(h.mux.notify_input_request("e1", seq + 1).await, 0);
    }

    #[tokio::test]
    async fn test_handle_message_dispatch() {
        let h = harness(BrokerConfig::default()).await;
        let (client, mut rx) = h.mux.connect();
        drain(&mut rx);

        h.mux.handle_message(&client, r#"{"type":"ping"}"#, &h.control).await;
        assert!(matches!(drain(&mut rx)[..], [ServerMessage::Pong { .. }]));

        h.mux.handle_message(&client, "garbage", &h.control).await;
        h.mux.handle_message(&client, r#"{"type":"unknown"}"#, &h.control).await;
        assert!(drain(&mut rx).is_empty());

        h.mux.handle_message(&client, r#"{"type":"input"}"#, &h.control).await;
        assert!(matches!(drain(&mut rx)[..], [ServerMessage::Error { execution_id: None, .. }]));

        // Not waiting yet
        h.mux
            .handle_message(&client, r#"{"type":"input","executionId":"e1","content":"5"}"#, &h.control)
            .await;
        match &drain(&mut rx)[..] {
            [ServerMessage::Error { execution_id, content, .. }] => {
                assert_eq!(execution_id.as_deref(), Some("e1"));
                assert!(content.contains("not waiting"));
            }
            other => panic!("unexpected messages: {:?}", other),
        }

        h.registry.begin_input_request("e1").await.unwrap();
        h.mux
            .handle_message(&client, r#"{"type":"input","executionId":"e1","content":"5"}"#, &h.control)
            .await;
        assert!(matches!(drain(&mut rx)[..], [ServerMessage::InputProcessed { .. }]));

        h.mux
            .handle_message(&client, r#"{"type":"check_execution_status","executionId":"e1"}"#, &h.control)
            .await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::execution_status("e1", ExecutionState::Running, false)]
        );
        assert_eq!(
            h.registry.get("e1").await.unwrap().client_id.as_deref(),
            Some(client.as_str())
        );

        h.mux
            .handle_message(&client, r#"{"type":"stop_execution","executionId":"e1"}"#, &h.control)
            .await;
        assert!(drain(&mut rx).is_empty());
        h.mux
            .handle_message(&client, r#"{"type":"stop_execution","executionId":"e1"}"#, &h.control)
            .await;
        assert!(drain(&mut rx).is_empty());
        h.registry.remove("e1").await;
        h.mux
            .handle_message(&client, r#"{"type":"stop_execution","executionId":"e1"}"#, &h.control)
            .await;
        assert!(drain(&mut rx).is_empty());
    }
}
