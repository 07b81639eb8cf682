//! Shared table of live executions.
//!
//! An execution is present from the moment its process is spawned until
//! cleanup removes it; callers treat absence as "completed". Every read and
//! write goes through one async mutex, and [`ExecutionRegistry::with_entry`]
//! lets callers run a synchronous closure under that lock so that buffering
//! output and routing it to a client happen atomically.

use crate::errors::BrokerError;
use chrono::{DateTime, Utc};
use flexrun_types::{ClientId, ExecutionId, ExecutionState, DEFAULT_INPUT_PROMPT};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Why the broker killed a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// A client asked to stop the execution.
    Stopped,
    /// The time budget ran out.
    TimedOut,
    /// The server is shutting down.
    Shutdown,
}

/// One buffered stdout chunk and the clients it already reached.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub data: String,
    pub seen_by: Vec<ClientId>,
}

impl OutputChunk {
    pub fn was_seen_by(&self, client_id: &str) -> bool {
        self.seen_by.iter().any(|c| c == client_id)
    }
}

/// Mutable record of one execution.
#[derive(Debug)]
pub struct ExecutionEntry {
    pub id: ExecutionId,
    pub state: ExecutionState,
    pub waiting_for_input: bool,
    pub input_requested_at: Option<DateTime<Utc>>,
    /// Bumped on every new input request; retries for older requests stop.
    pub input_request_seq: u64,
    pub input_prompt: Option<String>,
    pub client_id: Option<ClientId>,
    /// Every output chunk so far, replayed to clients that register late.
    pub output: Vec<OutputChunk>,
    last_output_line: Option<String>,
    pub process_exited: bool,
    pub exit_code: Option<i32>,
    pub termination: Option<KillReason>,
    pub source_path: PathBuf,
    pub created_at: DateTime<Utc>,
    stdin: Option<mpsc::UnboundedSender<String>>,
    kill: Option<oneshot::Sender<KillReason>>,
}

impl ExecutionEntry {
    pub fn new(
        id: impl Into<ExecutionId>,
        source_path: PathBuf,
        stdin: mpsc::UnboundedSender<String>,
        kill: oneshot::Sender<KillReason>,
    ) -> Self {
        Self {
            id: id.into(),
            state: ExecutionState::Running,
            waiting_for_input: false,
            input_requested_at: None,
            input_request_seq: 0,
            input_prompt: None,
            client_id: None,
            output: Vec::new(),
            last_output_line: None,
            process_exited: false,
            exit_code: None,
            termination: None,
            source_path,
            created_at: Utc::now(),
            stdin: Some(stdin),
            kill: Some(kill),
        }
    }

    /// Absent from the registry, terminal, or already exited.
    pub fn is_completed(&self) -> bool {
        self.state.is_terminal() || self.process_exited
    }

    /// Append an output chunk and remember its last non-empty line.
    ///
    /// `seen_by` lists the clients the chunk was already delivered to.
    pub fn push_output(&mut self, chunk: &str, seen_by: Vec<ClientId>) {
        if let Some(line) = chunk.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
            self.last_output_line = Some(line.to_string());
        }
        self.output.push(OutputChunk {
            data: chunk.to_string(),
            seen_by,
        });
    }

    /// Enter `waiting_input`. Returns the new request sequence number, or
    /// `None` if the execution is finished or already waiting.
    pub fn begin_input_request(&mut self) -> Option<u64> {
        if self.is_completed() || self.waiting_for_input {
            return None;
        }
        self.state = ExecutionState::WaitingInput;
        self.waiting_for_input = true;
        self.input_requested_at = Some(Utc::now());
        self.input_request_seq += 1;
        self.input_prompt = self.last_output_line.clone();
        Some(self.input_request_seq)
    }

    /// Write a line to the process and return to `running`.
    pub fn accept_input(&mut self, line: String) -> Result<(), BrokerError> {
        if !self.waiting_for_input || self.is_completed() {
            return Err(BrokerError::NotWaitingForInput {
                id: self.id.clone(),
                state: self.state,
            });
        }

        let stdin = self.stdin.as_ref().ok_or_else(|| BrokerError::InputDelivery {
            id: self.id.clone(),
            message: "stdin is closed".to_string(),
        })?;
        stdin.send(line).map_err(|_| BrokerError::InputDelivery {
            id: self.id.clone(),
            message: "stdin writer has stopped".to_string(),
        })?;

        self.waiting_for_input = false;
        self.state = ExecutionState::Running;
        self.input_requested_at = None;
        self.input_prompt = None;
        Ok(())
    }

    /// Leave `waiting_input` without delivering anything. False if finished.
    pub fn end_waiting(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.waiting_for_input = false;
        self.state = ExecutionState::Running;
        self.input_requested_at = None;
        true
    }

    /// Take the kill switch, if no one has used it yet.
    pub(crate) fn take_kill_switch(&mut self) -> Option<oneshot::Sender<KillReason>> {
        self.kill.take()
    }

    pub fn prompt(&self) -> String {
        self.input_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_INPUT_PROMPT.to_string())
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: self.id.clone(),
            state: self.state,
            waiting_for_input: self.waiting_for_input,
            input_requested_at: self.input_requested_at,
            input_prompt: self.input_prompt.clone(),
            client_id: self.client_id.clone(),
            process_exited: self.process_exited,
            output_chunks: self.output.len(),
            created_at: self.created_at,
        }
    }
}

/// Read-only copy of an entry's observable fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSnapshot {
    pub id: ExecutionId,
    pub state: ExecutionState,
    pub waiting_for_input: bool,
    pub input_requested_at: Option<DateTime<Utc>>,
    pub input_prompt: Option<String>,
    pub client_id: Option<ClientId>,
    pub process_exited: bool,
    pub output_chunks: usize,
    pub created_at: DateTime<Utc>,
}

/// Final state reported once a process has exited and its streams drained.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub state: ExecutionState,
    pub termination: Option<KillReason>,
}

/// Shared handle to the execution table.
#[derive(Clone, Default)]
pub struct ExecutionRegistry {
    entries: Arc<Mutex<HashMap<ExecutionId, ExecutionEntry>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, entry: ExecutionEntry) {
        let mut entries = self.entries.lock().await;
        log::debug!("Registered execution {}", entry.id);
        entries.insert(entry.id.clone(), entry);
    }

    pub async fn get(&self, id: &str) -> Option<ExecutionSnapshot> {
        self.entries.lock().await.get(id).map(ExecutionEntry::snapshot)
    }

    /// Remove an entry. Returns `None` if it was already gone.
    pub async fn remove(&self, id: &str) -> Option<ExecutionEntry> {
        self.entries.lock().await.remove(id)
    }

    /// Run `f` against the entry under the registry lock.
    pub async fn with_entry<R>(&self, id: &str, f: impl FnOnce(&mut ExecutionEntry) -> R) -> Option<R> {
        self.entries.lock().await.get_mut(id).map(f)
    }

    pub async fn set_state(&self, id: &str, state: ExecutionState) -> bool {
        self.with_entry(id, |entry| {
            log::debug!("Execution {} state {} -> {}", id, entry.state, state);
            entry.state = state;
            entry.waiting_for_input = state == ExecutionState::WaitingInput;
        })
        .await
        .is_some()
    }

    /// Flip the waiting flag, keeping `state` consistent with it.
    pub async fn set_waiting_for_input(&self, id: &str, waiting: bool) -> bool {
        self.with_entry(id, |entry| {
            if !waiting {
                return entry.end_waiting();
            }
            if entry.state.is_terminal() {
                return false;
            }
            entry.waiting_for_input = true;
            entry.state = ExecutionState::WaitingInput;
            entry.input_requested_at = Some(Utc::now());
            true
        })
        .await
        .unwrap_or(false)
    }

    pub async fn is_completed(&self, id: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(id)
            .map(ExecutionEntry::is_completed)
            .unwrap_or(true)
    }

    pub async fn list(&self) -> Vec<ExecutionSnapshot> {
        let entries = self.entries.lock().await;
        let mut list: Vec<_> = entries.values().map(ExecutionEntry::snapshot).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub async fn list_waiting(&self) -> Vec<ExecutionSnapshot> {
        self.list()
            .await
            .into_iter()
            .filter(|e| e.waiting_for_input)
            .collect()
    }

    /// Executions that have not reached a terminal state.
    pub async fn count_active(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| !e.state.is_terminal())
            .count()
    }

    pub async fn ids(&self) -> Vec<ExecutionId> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn associate_client(&self, id: &str, client_id: &str) -> bool {
        self.with_entry(id, |entry| {
            entry.client_id = Some(client_id.to_string());
        })
        .await
        .is_some()
    }

    /// Enter `waiting_input`. Returns the new request sequence number, or
    /// `None` if the execution is gone, finished, or already waiting.
    pub async fn begin_input_request(&self, id: &str) -> Option<u64> {
        self.with_entry(id, ExecutionEntry::begin_input_request)
            .await
            .flatten()
    }

    /// Write a line to the process and return to `running`.
    pub async fn accept_input(&self, id: &str, line: String) -> Result<(), BrokerError> {
        self.with_entry(id, |entry| entry.accept_input(line))
            .await
            .unwrap_or_else(|| Err(BrokerError::ExecutionNotFound(id.to_string())))
    }

    /// Move a live execution into a terminal state and signal its process to die.
    ///
    /// Fails if the execution is unknown, already terminal, or its process has exited.
    pub async fn claim_termination(
        &self,
        id: &str,
        state: ExecutionState,
        reason: KillReason,
    ) -> Result<(), BrokerError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| BrokerError::ExecutionNotFound(id.to_string()))?;

        if entry.is_completed() {
            return Err(BrokerError::AlreadyFinished {
                id: id.to_string(),
                state: if entry.state.is_terminal() {
                    entry.state
                } else {
                    ExecutionState::Completed
                },
            });
        }

        entry.state = state;
        entry.waiting_for_input = false;
        entry.termination = Some(reason);
        entry.stdin = None;
        if let Some(kill) = entry.kill.take() {
            if kill.send(reason).is_err() {
                log::debug!("Process waiter for {} is already gone", id);
            }
        }
        Ok(())
    }

    pub async fn mark_exited(&self, id: &str, exit_code: Option<i32>) {
        self.with_entry(id, |entry| {
            entry.process_exited = true;
            entry.exit_code = exit_code;
            entry.stdin = None;
        })
        .await;
    }

    /// Resolve the final state of an exited process.
    ///
    /// A natural exit maps to `completed` or `error` by exit code; an
    /// execution already claimed by a stop or timeout keeps its state.
    pub async fn settle(&self, id: &str) -> Option<Settlement> {
        self.with_entry(id, |entry| {
            if !entry.state.is_terminal() {
                entry.state = if entry.exit_code == Some(0) {
                    ExecutionState::Completed
                } else {
                    ExecutionState::Error
                };
            }
            entry.waiting_for_input = false;
            Settlement {
                state: entry.state,
                termination: entry.termination,
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> (ExecutionEntry, mpsc::UnboundedReceiver<String>, oneshot::Receiver<KillReason>) {
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        (
            ExecutionEntry::new(id, PathBuf::from(format!("/tmp/code_{}.lx", id)), stdin_tx, kill_tx),
            stdin_rx,
            kill_rx,
        )
    }

    #[tokio::test]
    async fn test_absent_execution_counts_as_completed() {
        let registry = ExecutionRegistry::new();
        assert!(registry.is_completed("missing").await);
        assert!(registry.get("missing").await.is_none());
        assert!(registry.remove("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ExecutionRegistry::new();
        let (e, _stdin, _kill) = entry("e1");
        registry.add(e).await;
        assert_eq!(registry.count_active().await, 1);

        assert!(registry.remove("e1").await.is_some());
        assert!(registry.remove("e1").await.is_none());
        assert_eq!(registry.count_active().await, 0);
    }

    #[tokio::test]
    async fn test_waiting_flag_tracks_state() {
        let registry = ExecutionRegistry::new();
        let (e, _stdin, _kill) = entry("e1");
        registry.add(e).await;

        assert!(registry.set_waiting_for_input("e1", true).await);
        let snapshot = registry.get("e1").await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::WaitingInput);
        assert!(snapshot.waiting_for_input);
        assert!(snapshot.input_requested_at.is_some());
        assert_eq!(registry.list_waiting().await.len(), 1);

        assert!(registry.set_waiting_for_input("e1", false).await);
        let snapshot = registry.get("e1").await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::Running);
        assert!(!snapshot.waiting_for_input);
        assert!(registry.list_waiting().await.is_empty());
    }

    #[tokio::test]
    async fn test_input_request_uses_last_output_line_as_prompt() {
        let registry = ExecutionRegistry::new();
        let (e, _stdin, _kill) = entry("e1");
        registry.add(e).await;

        registry
            .with_entry("e1", |e| e.push_output("Welcome\nEnter your name: ", Vec::new()))
            .await;
        assert_eq!(registry.begin_input_request("e1").await, Some(1));
        // Already waiting
        assert_eq!(registry.begin_input_request("e1").await, None);

        let prompt = registry.with_entry("e1", |e| e.prompt()).await.unwrap();
        assert_eq!(prompt, "Enter your name:");
    }

    #[tokio::test]
    async fn test_set_state_couples_waiting_flag() {
        let registry = ExecutionRegistry::new();
        let (e, _stdin, _kill) = entry("e1");
        registry.add(e).await;

        assert!(registry.set_state("e1", ExecutionState::WaitingInput).await);
        assert!(registry.get("e1").await.unwrap().waiting_for_input);

        assert!(registry.set_state("e1", ExecutionState::Running).await);
        assert!(!registry.get("e1").await.unwrap().waiting_for_input);

        assert!(!registry.set_state("missing", ExecutionState::Running).await);
    }

    #[tokio::test]
    async fn test_output_chunks_remember_their_recipients() {
        let registry = ExecutionRegistry::new();
        let (e, _stdin, _kill) = entry("e1");
        registry.add(e).await;

        registry
            .with_entry("e1", |e| {
                e.push_output("a\n", vec!["c1".to_string()]);
                e.push_output("b\n", Vec::new());
            })
            .await;

        let seen = registry
            .with_entry("e1", |e| {
                e.output
                    .iter()
                    .map(|chunk| chunk.was_seen_by("c1"))
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![true, false]);
        assert_eq!(registry.get("e1").await.unwrap().output_chunks, 2);
    }

    #[tokio::test]
    async fn test_accept_input_requires_waiting_state() {
        let registry = ExecutionRegistry::new();
        let (e, mut stdin, _kill) = entry("e1");
        registry.add(e).await;

        let err = registry.accept_input("e1", "42\n".to_string()).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotWaitingForInput { .. }));

        let err = registry.accept_input("nope", "42\n".to_string()).await.unwrap_err();
        assert_eq!(err, BrokerError::ExecutionNotFound("nope".to_string()));

        registry.begin_input_request("e1").await.unwrap();
        registry.accept_input("e1", "42\n".to_string()).await.unwrap();
        assert_eq!(stdin.recv().await.as_deref(), Some("42\n"));

        let snapshot = registry.get("e1").await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::Running);
        assert!(!snapshot.waiting_for_input);
    }

    #[tokio::test]
    async fn test_claim_termination_happens_once() {
        let registry = ExecutionRegistry::new();
        let (e, _stdin, kill) = entry("e1");
        registry.add(e).await;

        registry
            .claim_termination("e1", ExecutionState::Stopped, KillReason::Stopped)
            .await
            .unwrap();
        assert_eq!(kill.await.unwrap(), KillReason::Stopped);

        let err = registry
            .claim_termination("e1", ExecutionState::Error, KillReason::TimedOut)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::AlreadyFinished {
                state: ExecutionState::Stopped,
                ..
            }
        ));

        let settlement = registry.settle("e1").await.unwrap();
        assert_eq!(settlement.state, ExecutionState::Stopped);
        assert_eq!(settlement.termination, Some(KillReason::Stopped));
    }

    #[tokio::test]
    async fn test_exited_process_cannot_be_claimed() {
        let registry = ExecutionRegistry::new();
        let (e, _stdin, _kill) = entry("e1");
        registry.add(e).await;

        registry.mark_exited("e1", Some(3)).await;
        assert!(registry.is_completed("e1").await);
        assert!(registry
            .claim_termination("e1", ExecutionState::Error, KillReason::TimedOut)
            .await
            .is_err());

        let settlement = registry.settle("e1").await.unwrap();
        assert_eq!(settlement.state, ExecutionState::Error);
        assert_eq!(settlement.termination, None);
    }
}
