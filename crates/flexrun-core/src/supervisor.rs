//! Interpreter process supervision.
//!
//! Every execution gets four tasks: a stdout reader feeding the sentinel
//! filter, a stderr reader, a stdin writer, and a waiter. The waiter is the
//! only task that finalizes an execution. Stops and timeouts merely claim
//! a terminal state in the registry and signal the waiter to kill the
//! process, so exactly one teardown runs no matter which event wins.

use crate::config::{BrokerConfig, InterpreterConfig};
use crate::errors::{BrokerError, Result};
use crate::multiplexer::{ConnectionMultiplexer, ExecutionControl};
use crate::registry::{ExecutionEntry, ExecutionRegistry, KillReason};
use crate::sentinel::{Classified, SentinelFilter, SentinelStream, Signal};
use crate::timeout::TimeoutController;
use crate::workspace::SourceWorkspace;
use async_trait::async_trait;
use flexrun_types::{ExecutionId, ExecutionState, ServerMessage};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Appended to stderr when the time budget runs out.
pub const TIMEOUT_MESSAGE: &str = "Execution took too long and was terminated.";

const READ_BUFFER_SIZE: usize = 8192;

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Exited with status zero.
    Completed,
    /// Exited with a non-zero status or was killed by a signal.
    Failed,
    /// Killed after exceeding its time budget.
    TimedOut,
    /// Killed on request or at shutdown.
    Stopped,
}

impl OutcomeStatus {
    pub fn state(&self) -> ExecutionState {
        match self {
            OutcomeStatus::Completed => ExecutionState::Completed,
            OutcomeStatus::Failed | OutcomeStatus::TimedOut => ExecutionState::Error,
            OutcomeStatus::Stopped => ExecutionState::Stopped,
        }
    }
}

/// Terminal result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub execution_id: ExecutionId,
    pub status: OutcomeStatus,
    /// Stdout with sentinels removed, chunks concatenated as produced.
    pub output: String,
    /// Stderr split into non-empty lines.
    pub stderr: Vec<String>,
    pub exit_code: Option<i32>,
}

/// Returned by [`ProcessSupervisor::start`]; resolves once the execution is cleaned up.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    outcome: oneshot::Receiver<ExecutionOutcome>,
}

impl ExecutionHandle {
    /// Wait for the terminal result.
    pub async fn wait(self) -> ExecutionOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => ExecutionOutcome {
                execution_id: self.execution_id,
                status: OutcomeStatus::Failed,
                output: String::new(),
                stderr: vec!["Execution supervisor terminated unexpectedly".to_string()],
                exit_code: None,
            },
        }
    }
}

struct SupervisorInner {
    interpreter: InterpreterConfig,
    timeout: Duration,
    max_code_length: usize,
    stream_drain: Duration,
    registry: ExecutionRegistry,
    multiplexer: Arc<ConnectionMultiplexer>,
    timeouts: TimeoutController,
    workspace: SourceWorkspace,
    filter: SentinelFilter,
}

/// Spawns and supervises interpreter processes.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    /// Build a supervisor. Must be called inside a tokio runtime.
    pub fn new(
        config: &BrokerConfig,
        registry: ExecutionRegistry,
        multiplexer: Arc<ConnectionMultiplexer>,
    ) -> Self {
        let (timeouts, expired) = TimeoutController::new(config.execution.min_remaining());
        let inner = Arc::new(SupervisorInner {
            interpreter: config.interpreter.clone(),
            timeout: config.execution.timeout(),
            max_code_length: config.execution.max_code_length,
            stream_drain: config.execution.stream_drain(),
            registry,
            multiplexer,
            timeouts,
            workspace: SourceWorkspace::new(&config.execution),
            filter: SentinelFilter::new(&config.sentinels),
        });

        tokio::spawn(expire_executions(Arc::downgrade(&inner), expired));
        Self { inner }
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.inner.registry
    }

    pub fn multiplexer(&self) -> &Arc<ConnectionMultiplexer> {
        &self.inner.multiplexer
    }

    pub fn workspace(&self) -> &SourceWorkspace {
        &self.inner.workspace
    }

    pub fn max_code_length(&self) -> usize {
        self.inner.max_code_length
    }

    /// Validate, persist and spawn a program. Returns as soon as it is running.
    pub async fn start(&self, code: &str) -> Result<ExecutionHandle> {
        let inner = &self.inner;

        if code.trim().is_empty() {
            return Err(BrokerError::CodeMissing);
        }
        let length = code.chars().count();
        if length > inner.max_code_length {
            return Err(BrokerError::CodeTooLarge {
                max: inner.max_code_length,
                actual: length,
            });
        }

        inner.workspace.sweep_stale().await;

        let execution_id = uuid::Uuid::new_v4().to_string();
        let source_path = inner.workspace.persist(&execution_id, code).await?;

        let mut command = Command::new(&inner.interpreter.program);
        command
            .args(&inner.interpreter.args)
            .arg(&inner.interpreter.entry_script)
            .arg(&source_path);
        if let Some(flag) = &inner.interpreter.mode_flag {
            command.arg(flag);
        }
        if let Some(dir) = &inner.interpreter.working_dir {
            command.current_dir(dir);
        }
        command
            .envs(&inner.interpreter.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!(
                    "Failed to spawn {} for execution {}: {}",
                    inner.interpreter.program,
                    execution_id,
                    e
                );
                inner.workspace.remove(&source_path).await;
                return Err(BrokerError::SpawnFailed(e.to_string()));
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            // Unreachable with piped stdio, but never leave a stray process behind
            let _ = child.start_kill();
            inner.workspace.remove(&source_path).await;
            return Err(BrokerError::SpawnFailed(
                "interpreter stdio was not captured".to_string(),
            ));
        };

        log::info!(
            "Started execution {} (pid {:?}) from {}",
            execution_id,
            child.id(),
            source_path.display()
        );

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        inner
            .registry
            .add(ExecutionEntry::new(
                execution_id.clone(),
                source_path,
                stdin_tx,
                kill_tx,
            ))
            .await;
        inner.timeouts.start(&execution_id, inner.timeout);

        tokio::spawn(write_stdin(execution_id.clone(), stdin, stdin_rx));
        let stdout_task = tokio::spawn(read_stdout(
            Arc::clone(inner),
            execution_id.clone(),
            stdout,
        ));
        let stderr_task = tokio::spawn(read_stderr(
            Arc::clone(inner),
            execution_id.clone(),
            stderr,
        ));

        let supervisor = self.clone();
        let id = execution_id.clone();
        tokio::spawn(async move {
            let outcome = supervisor
                .supervise(&id, child, kill_rx, stdout_task, stderr_task)
                .await;
            if outcome_tx.send(outcome).is_err() {
                log::debug!("Nobody is waiting on the outcome of {}", id);
            }
        });

        Ok(ExecutionHandle {
            execution_id,
            outcome: outcome_rx,
        })
    }

    /// Deliver one line of input to a waiting execution and resume its clock.
    pub async fn submit_input(&self, execution_id: &str, input: &str) -> Result<()> {
        let mut line = input.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let inner = &self.inner;
        inner
            .registry
            .with_entry(execution_id, |entry| -> Result<()> {
                entry.accept_input(line)?;
                inner.timeouts.resume(execution_id);
                Ok(())
            })
            .await
            .unwrap_or_else(|| Err(BrokerError::ExecutionNotFound(execution_id.to_string())))?;
        log::info!("Input delivered to execution {}", execution_id);
        Ok(())
    }

    /// Stop a live execution. Teardown finishes asynchronously.
    ///
    /// Stopping an execution that already finished or was cleaned up is a no-op.
    pub async fn stop(&self, execution_id: &str) -> Result<()> {
        match self
            .inner
            .registry
            .claim_termination(execution_id, ExecutionState::Stopped, KillReason::Stopped)
            .await
        {
            Ok(()) => {
                self.inner.timeouts.cancel(execution_id);
                log::info!("Stopping execution {}", execution_id);
                Ok(())
            }
            Err(e) if e.is_finished() => {
                log::debug!("Nothing to stop for {}: {}", execution_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Current state and waiting flag; unknown ids report `completed`.
    pub async fn status(&self, execution_id: &str) -> (ExecutionState, bool) {
        self.inner
            .registry
            .get(execution_id)
            .await
            .map(|snapshot| (snapshot.state, snapshot.waiting_for_input))
            .unwrap_or((ExecutionState::Completed, false))
    }

    /// Release every resource held by an execution.
    ///
    /// Safe to call any number of times; only the first call does anything.
    pub async fn cleanup(&self, execution_id: &str) -> bool {
        let inner = &self.inner;
        inner.timeouts.cancel(execution_id);

        let Some(mut entry) = inner.registry.remove(execution_id).await else {
            return false;
        };

        if let Some(kill) = entry.take_kill_switch() {
            // Waiter still running: make sure the process does not outlive its entry
            let _ = kill.send(KillReason::Stopped);
        }
        inner.workspace.remove(&entry.source_path).await;
        log::info!("Cleaned up execution {}", execution_id);
        true
    }

    /// Stop every live execution and wait for their teardown.
    pub async fn shutdown(&self, grace: Duration) {
        let ids = self.inner.registry.ids().await;
        if ids.is_empty() {
            return;
        }

        log::info!("Stopping {} active executions", ids.len());
        for id in &ids {
            if let Err(e) = self
                .inner
                .registry
                .claim_termination(id, ExecutionState::Stopped, KillReason::Shutdown)
                .await
            {
                log::debug!("Execution {} not stopped at shutdown: {}", id, e);
            }
        }

        let drained = tokio::time::timeout(grace, async {
            while !self.inner.registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if drained.is_err() {
            for id in self.inner.registry.ids().await {
                log::warn!("Forcing cleanup of execution {} at shutdown", id);
                self.cleanup(&id).await;
            }
        }
    }

    async fn supervise(
        &self,
        execution_id: &str,
        mut child: tokio::process::Child,
        mut kill_rx: oneshot::Receiver<KillReason>,
        mut stdout_task: JoinHandle<String>,
        mut stderr_task: JoinHandle<Vec<String>>,
    ) -> ExecutionOutcome {
        let inner = &self.inner;

        let status = tokio::select! {
            status = child.wait() => status,
            Ok(reason) = &mut kill_rx => {
                log::info!("Killing execution {} ({:?})", execution_id, reason);
                if let Err(e) = child.start_kill() {
                    log::debug!("Kill of {} failed, process already gone: {}", execution_id, e);
                }
                child.wait().await
            }
        };

        let exit_code = match &status {
            Ok(status) => status.code(),
            Err(e) => {
                log::error!("Failed to wait for execution {}: {}", execution_id, e);
                None
            }
        };
        inner.registry.mark_exited(execution_id, exit_code).await;
        inner.timeouts.cancel(execution_id);

        // Give the readers a chance to forward what is left in the pipes
        let (stdout, stderr) = tokio::join!(
            drain(&mut stdout_task, inner.stream_drain),
            drain(&mut stderr_task, inner.stream_drain)
        );
        let output = stdout.unwrap_or_default();
        let mut stderr = stderr.unwrap_or_default();

        let (state, termination) = match inner.registry.settle(execution_id).await {
            Some(settlement) => (settlement.state, settlement.termination),
            None => (ExecutionState::Stopped, Some(KillReason::Stopped)),
        };

        let status = match termination {
            Some(KillReason::TimedOut) => OutcomeStatus::TimedOut,
            Some(KillReason::Stopped) | Some(KillReason::Shutdown) => OutcomeStatus::Stopped,
            None if state == ExecutionState::Completed => OutcomeStatus::Completed,
            None => OutcomeStatus::Failed,
        };
        if status == OutcomeStatus::TimedOut {
            stderr.push(TIMEOUT_MESSAGE.to_string());
        }
        let exit_code = if termination.is_none() { exit_code } else { None };

        log::info!(
            "Execution {} finished: {:?} (exit code {:?})",
            execution_id,
            status,
            exit_code
        );

        inner
            .multiplexer
            .deliver(
                execution_id,
                ServerMessage::execution_complete(
                    execution_id,
                    status.state(),
                    exit_code,
                    status == OutcomeStatus::TimedOut,
                ),
            )
            .await;
        self.cleanup(execution_id).await;

        ExecutionOutcome {
            execution_id: execution_id.to_string(),
            status,
            output,
            stderr,
            exit_code,
        }
    }
}

#[async_trait]
impl ExecutionControl for ProcessSupervisor {
    async fn submit_input(&self, execution_id: &str, input: &str) -> Result<()> {
        ProcessSupervisor::submit_input(self, execution_id, input).await
    }

    async fn stop(&self, execution_id: &str) -> Result<()> {
        ProcessSupervisor::stop(self, execution_id).await
    }

    async fn status(&self, execution_id: &str) -> (ExecutionState, bool) {
        ProcessSupervisor::status(self, execution_id).await
    }
}

async fn drain<T>(task: &mut JoinHandle<T>, limit: Duration) -> Option<T> {
    match tokio::time::timeout(limit, &mut *task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log::error!("Output reader task failed: {}", e);
            None
        }
        Err(_) => {
            log::warn!("Output reader did not drain within {:?}, abandoning it", limit);
            task.abort();
            None
        }
    }
}

/// Claim timed-out executions as they are reported.
async fn expire_executions(
    inner: Weak<SupervisorInner>,
    mut expired: mpsc::UnboundedReceiver<ExecutionId>,
) {
    while let Some(execution_id) = expired.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match inner
            .registry
            .claim_termination(&execution_id, ExecutionState::Error, KillReason::TimedOut)
            .await
        {
            Ok(()) => log::warn!("Execution {} timed out, terminating", execution_id),
            Err(e) => log::debug!("Ignoring timeout for {}: {}", execution_id, e),
        }
    }
}

async fn write_stdin(
    execution_id: ExecutionId,
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            log::warn!("Failed to write input to execution {}: {}", execution_id, e);
            break;
        }
    }
    log::debug!("Stdin of execution {} closed", execution_id);
}

async fn read_stdout<R>(inner: Arc<SupervisorInner>, execution_id: ExecutionId, mut pipe: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut stream = SentinelStream::new(inner.filter.clone());
    let mut collected = String::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::warn!("Failed to read stdout of execution {}: {}", execution_id, e);
                break;
            }
        };
        let classified = stream.push(&buf[..read]);
        forward_stdout(&inner, &execution_id, classified, &mut collected).await;
    }

    let rest = stream.finish();
    forward_stdout(&inner, &execution_id, rest, &mut collected).await;
    collected
}

async fn forward_stdout(
    inner: &Arc<SupervisorInner>,
    execution_id: &str,
    classified: Classified,
    collected: &mut String,
) {
    if !classified.output.is_empty() {
        collected.push_str(&classified.output);
        let multiplexer = &inner.multiplexer;
        let chunk = classified.output;
        inner
            .registry
            .with_entry(execution_id, |entry| multiplexer.stream_output(entry, &chunk))
            .await;
    }

    match classified.signal {
        Some(Signal::InputRequest) => {
            let Some((seq, remaining)) = begin_waiting(inner, execution_id).await else {
                log::debug!("Ignoring input request from {}", execution_id);
                return;
            };
            log::info!(
                "Execution {} is waiting for input ({:?} of budget left)",
                execution_id,
                remaining
            );

            let multiplexer = Arc::clone(&inner.multiplexer);
            let id = execution_id.to_string();
            tokio::spawn(async move {
                multiplexer.notify_input_request(&id, seq).await;
            });
        }
        Some(Signal::InputReceived) => {
            // Input normally flips the state when it is accepted; this only
            // catches input that reached the process some other way
            if end_waiting(inner, execution_id).await {
                log::info!("Execution {} acknowledged input", execution_id);
            }
        }
        None => {}
    }
}

/// Enter `waiting_input` and pause the clock under one registry lock, so
/// input accepted concurrently always finds the clock paused.
async fn begin_waiting(inner: &SupervisorInner, execution_id: &str) -> Option<(u64, Option<Duration>)> {
    inner
        .registry
        .with_entry(execution_id, |entry| {
            let seq = entry.begin_input_request()?;
            Some((seq, inner.timeouts.pause(execution_id)))
        })
        .await
        .flatten()
}

/// Leave `waiting_input` and resume the clock. False if nothing was waiting.
async fn end_waiting(inner: &SupervisorInner, execution_id: &str) -> bool {
    inner
        .registry
        .with_entry(execution_id, |entry| {
            entry.waiting_for_input && entry.end_waiting() && inner.timeouts.resume(execution_id)
        })
        .await
        .unwrap_or(false)
}

/// Splits stderr into lines, holding back a line until its newline arrives.
#[derive(Debug, Default)]
struct StderrLines {
    pending: Vec<u8>,
}

impl StderrLines {
    /// Feed one read. Returns the complete, non-blank lines it finished.
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let Some(end) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.pending.drain(..=end).collect();
        split_lines(&complete)
    }

    /// Whatever trailed the last newline when the pipe closed.
    fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.pending);
        split_lines(&rest)
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

async fn read_stderr<R>(
    inner: Arc<SupervisorInner>,
    execution_id: ExecutionId,
    mut pipe: R,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut splitter = StderrLines::default();
    let mut lines = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::warn!("Failed to read stderr of execution {}: {}", execution_id, e);
                break;
            }
        };
        let batch = splitter.push(&buf[..read]);
        forward_stderr(&inner, &execution_id, batch, &mut lines).await;
    }

    let rest = splitter.finish();
    forward_stderr(&inner, &execution_id, rest, &mut lines).await;
    lines
}

async fn forward_stderr(
    inner: &SupervisorInner,
    execution_id: &str,
    batch: Vec<String>,
    lines: &mut Vec<String>,
) {
    if batch.is_empty() {
        return;
    }
    let content = batch.join("\n");
    log::debug!("Execution {} stderr: {}", execution_id, content);
    lines.extend(batch);
    inner
        .multiplexer
        .deliver(execution_id, ServerMessage::execution_error(execution_id, content))
        .await;
}
