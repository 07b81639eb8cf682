//! Pausable wall-clock timeouts.
//!
//! [`TimeoutClock`] is the pure bookkeeping for one budget. The
//! [`TimeoutController`] owns one clock per execution, keeps at most one
//! scheduled timer alive for each, and reports expiry on a channel exactly
//! once.

use flexrun_types::ExecutionId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Remaining budget of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutClock {
    remaining: Duration,
    floor: Duration,
    running_since: Option<Instant>,
}

impl TimeoutClock {
    /// A stopped clock holding the full `budget`.
    pub fn new(budget: Duration, floor: Duration) -> Self {
        Self {
            remaining: budget,
            floor,
            running_since: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    /// Start or resume counting down. No-op if already running.
    pub fn resume(&mut self, now: Instant) -> bool {
        if self.running_since.is_some() {
            return false;
        }
        self.running_since = Some(now);
        true
    }

    /// Stop counting down, charging the time elapsed since the last resume.
    ///
    /// The remaining budget never drops below the floor. No-op if already paused.
    pub fn pause(&mut self, now: Instant) -> bool {
        let Some(since) = self.running_since.take() else {
            return false;
        };
        let elapsed = now.saturating_duration_since(since);
        self.remaining = self.remaining.saturating_sub(elapsed).max(self.floor);
        true
    }

    /// Budget left at `now`.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.running_since {
            Some(since) => self
                .remaining
                .saturating_sub(now.saturating_duration_since(since)),
            None => self.remaining,
        }
    }
}

struct TimerRecord {
    clock: TimeoutClock,
    generation: u64,
    task: Option<JoinHandle<()>>,
    fired: bool,
}

impl TimerRecord {
    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

type TimerTable = Arc<Mutex<HashMap<ExecutionId, TimerRecord>>>;

/// Per-execution timers reporting expiry on a channel.
#[derive(Clone)]
pub struct TimeoutController {
    timers: TimerTable,
    floor: Duration,
    expired_tx: mpsc::UnboundedSender<ExecutionId>,
}

impl TimeoutController {
    /// Create a controller and the receiver on which expired ids arrive.
    pub fn new(floor: Duration) -> (Self, mpsc::UnboundedReceiver<ExecutionId>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let controller = Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            floor,
            expired_tx,
        };
        (controller, expired_rx)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ExecutionId, TimerRecord>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a countdown of `budget`, replacing any previous timer for `id`.
    pub fn start(&self, id: &str, budget: Duration) {
        let mut table = self.table();
        let generation = match table.remove(id) {
            Some(mut previous) => {
                previous.abort_task();
                previous.generation + 1
            }
            None => 0,
        };

        let mut clock = TimeoutClock::new(budget, self.floor);
        clock.resume(Instant::now());
        let mut record = TimerRecord {
            clock,
            generation,
            task: None,
            fired: false,
        };
        record.task = Some(self.schedule(id, generation, budget));
        table.insert(id.to_string(), record);
        log::debug!("Timeout started for {} with budget {:?}", id, budget);
    }

    /// Pause the countdown. Returns the budget left, or `None` for unknown ids.
    pub fn pause(&self, id: &str) -> Option<Duration> {
        let mut table = self.table();
        let record = table.get_mut(id)?;
        if record.fired {
            return Some(Duration::ZERO);
        }
        if record.clock.pause(Instant::now()) {
            record.abort_task();
            record.generation += 1;
            log::debug!(
                "Timeout paused for {} with {:?} remaining",
                id,
                record.clock.remaining(Instant::now())
            );
        }
        Some(record.clock.remaining(Instant::now()))
    }

    /// Resume a paused countdown. Returns false if unknown, fired or already running.
    pub fn resume(&self, id: &str) -> bool {
        let mut table = self.table();
        let Some(record) = table.get_mut(id) else {
            return false;
        };
        if record.fired || !record.clock.resume(Instant::now()) {
            return false;
        }

        record.generation += 1;
        let remaining = record.clock.remaining(Instant::now());
        let task = self.schedule(id, record.generation, remaining);
        record.task = Some(task);
        log::debug!("Timeout resumed for {} with {:?} remaining", id, remaining);
        true
    }

    /// Drop the timer for `id`. Safe to call repeatedly.
    pub fn cancel(&self, id: &str) {
        if let Some(mut record) = self.table().remove(id) {
            record.abort_task();
            log::debug!("Timeout cancelled for {}", id);
        }
    }

    pub fn remaining(&self, id: &str) -> Option<Duration> {
        self.table()
            .get(id)
            .map(|record| record.clock.remaining(Instant::now()))
    }

    pub fn is_running(&self, id: &str) -> Option<bool> {
        self.table().get(id).map(|record| record.clock.is_running())
    }

    fn schedule(&self, id: &str, generation: u64, after: Duration) -> JoinHandle<()> {
        let timers = Arc::clone(&self.timers);
        let expired_tx = self.expired_tx.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(after).await;

            let fire = {
                let mut table = timers.lock().unwrap_or_else(|e| e.into_inner());
                match table.get_mut(&id) {
                    Some(record) if record.generation == generation && !record.fired => {
                        record.fired = true;
                        record.task = None;
                        record.clock.pause(Instant::now());
                        true
                    }
                    _ => false,
                }
            };

            if fire {
                log::warn!("Execution {} exceeded its time budget", id);
                if expired_tx.send(id).is_err() {
                    log::debug!("Timeout receiver dropped before expiry could be reported");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: Duration = Duration::from_secs(1);

    #[test]
    fn test_clock_pause_charges_elapsed_time() {
        let start = Instant::now();
        let mut clock = TimeoutClock::new(Duration::from_secs(30), FLOOR);
        clock.resume(start);

        assert!(clock.pause(start + Duration::from_secs(10)));
        assert_eq!(clock.remaining(start + Duration::from_secs(60)), Duration::from_secs(20));

        // Pausing twice changes nothing
        assert!(!clock.pause(start + Duration::from_secs(20)));
        assert_eq!(clock.remaining(start), Duration::from_secs(20));
    }

    #[test]
    fn test_clock_never_resets_across_cycles() {
        let t0 = Instant::now();
        let mut clock = TimeoutClock::new(Duration::from_secs(30), FLOOR);
        clock.resume(t0);
        clock.pause(t0 + Duration::from_secs(5));

        // Paused interval is not charged
        assert!(clock.resume(t0 + Duration::from_secs(100)));
        assert!(!clock.resume(t0 + Duration::from_secs(101)));
        clock.pause(t0 + Duration::from_secs(107));

        assert_eq!(clock.remaining(t0), Duration::from_secs(18));
    }

    #[test]
    fn test_clock_pause_respects_floor() {
        let t0 = Instant::now();
        let mut clock = TimeoutClock::new(Duration::from_secs(3), FLOOR);
        clock.resume(t0);
        clock.pause(t0 + Duration::from_secs(10));
        assert_eq!(clock.remaining(t0), FLOOR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (controller, mut expired) = TimeoutController::new(FLOOR);
        controller.start("exec-1", Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(expired.recv().await.as_deref(), Some("exec-1"));

        // A fired timer cannot be resumed into firing again
        assert_eq!(controller.pause("exec-1"), Some(Duration::ZERO));
        assert!(!controller.resume("exec-1"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_timer_does_not_fire() {
        let (controller, mut expired) = TimeoutController::new(FLOOR);
        controller.start("exec-1", Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let remaining = controller.pause("exec-1").unwrap();
        assert_eq!(remaining, Duration::from_secs(3));
        assert_eq!(controller.is_running("exec-1"), Some(false));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(expired.try_recv().is_err());

        assert!(controller.resume("exec-1"));
        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(expired.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(expired.recv().await.as_deref(), Some("exec-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_pause_resume_does_not_leak_timers() {
        let (controller, mut expired) = TimeoutController::new(FLOOR);
        controller.start("exec-1", Duration::from_secs(4));

        for _ in 0..5 {
            controller.pause("exec-1");
            assert!(controller.resume("exec-1"));
        }
        assert!(!controller.resume("exec-1"));

        tokio::time::sleep(Duration::from_millis(4100)).await;
        assert_eq!(expired.recv().await.as_deref(), Some("exec-1"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (controller, mut expired) = TimeoutController::new(FLOOR);
        controller.start("exec-1", Duration::from_secs(1));

        controller.cancel("exec-1");
        controller.cancel("exec-1");
        assert_eq!(controller.remaining("exec-1"), None);
        assert_eq!(controller.pause("exec-1"), None);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(expired.try_recv().is_err());
    }
}
