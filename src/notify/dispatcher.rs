use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::job::{
    Attempt, BatchOutcome, Completion, DispatchStats, JobId, JobQueue, NotificationJob,
    NotificationKind, Payload, PendingJob, DEFAULT_KEY_RETENTION,
};
use crate::error::{EnqueueError, TransportError};
use crate::transport::Transport;

const DEFAULT_CAPACITY: usize = 1024;
const DEFAULT_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_RETRY_DELAYS_S: [u64; 3] = [5, 15, 30];
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of monotonic time for scheduling decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum number of live (non-terminal) jobs.
    pub capacity: usize,
    pub max_attempts: u32,
    /// Delay after the n-th failed attempt; the last entry repeats.
    pub retry_delays: Vec<Duration>,
    pub attempt_timeout: Duration,
    /// How many SENT/DEAD idempotency keys stay remembered after their jobs finish.
    /// Keys of live jobs are always kept.
    pub key_retention: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delays: DEFAULT_RETRY_DELAYS_S
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            key_retention: DEFAULT_KEY_RETENTION,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(anyhow!("dispatch capacity must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("dispatch max_attempts must be >= 1"));
        }
        if self.retry_delays.is_empty() {
            return Err(anyhow!("dispatch retry_delays must not be empty"));
        }
        if self.retry_delays.windows(2).any(|w| w[1] < w[0]) {
            return Err(anyhow!("dispatch retry_delays must be non-decreasing"));
        }
        if self.attempt_timeout.is_zero() {
            return Err(anyhow!("dispatch attempt_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Terminal outcome of a job, sent on the channel returned by [`Dispatcher::start`].
#[derive(Debug)]
pub enum DeliveryReport {
    Sent(NotificationJob),
    Dead {
        job: NotificationJob,
        error: TransportError,
    },
}

impl DeliveryReport {
    pub fn job(&self) -> &NotificationJob {
        match self {
            DeliveryReport::Sent(job) => job,
            DeliveryReport::Dead { job, .. } => job,
        }
    }
}

struct State {
    queue: JobQueue,
    stopping: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded, retrying notice delivery with one background worker.
///
/// Producers call [`enqueue`](Self::enqueue) from any thread; the call validates and
/// admits the job under a short lock and never touches the transport.
pub struct Dispatcher {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn start(
        config: DispatchConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, Receiver<DeliveryReport>)> {
        Self::start_with_clock(config, transport, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        config: DispatchConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, Receiver<DeliveryReport>)> {
        config.validate()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: JobQueue::new(
                    config.capacity,
                    config.max_attempts,
                    config.retry_delays.clone(),
                )
                .with_key_retention(config.key_retention),
                stopping: false,
            }),
            wake: Condvar::new(),
        });
        let (reports_tx, reports_rx) = mpsc::channel();
        let worker = {
            let shared = shared.clone();
            let clock = clock.clone();
            let timeout = config.attempt_timeout;
            thread::Builder::new()
                .name("notice-dispatch".to_string())
                .spawn(move || run_worker(shared, transport, clock, reports_tx, timeout))?
        };
        log::info!(
            "dispatcher started (capacity={}, max_attempts={}, retry_delays={:?})",
            config.capacity,
            config.max_attempts,
            config.retry_delays
        );
        Ok((
            Self {
                shared,
                clock,
                worker: Some(worker),
            },
            reports_rx,
        ))
    }

    pub fn enqueue(&self, payload: Payload, kind: NotificationKind) -> Result<JobId, EnqueueError> {
        self.admit(payload, kind, 0)
    }

    /// Enqueue each payload independently; one rejection does not affect the others.
    pub fn enqueue_batch(&self, payloads: Vec<Payload>, kind: NotificationKind) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (idx, payload) in payloads.into_iter().enumerate() {
            match self.enqueue(payload, kind) {
                Ok(id) => outcome.queued.push(id),
                Err(err) => outcome.rejected.push((idx, err)),
            }
        }
        outcome
    }

    /// Re-admit jobs returned by an earlier [`shutdown`](Self::shutdown), keeping their
    /// attempt counts. Restored jobs get new ids.
    pub fn restore(&self, pending: Vec<PendingJob>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (idx, job) in pending.into_iter().enumerate() {
            match self.admit(job.payload, job.kind, job.attempt_count) {
                Ok(id) => outcome.queued.push(id),
                Err(err) => outcome.rejected.push((idx, err)),
            }
        }
        outcome
    }

    fn admit(
        &self,
        payload: Payload,
        kind: NotificationKind,
        attempt_count: u32,
    ) -> Result<JobId, EnqueueError> {
        let mut state = self.shared.lock();
        if state.stopping {
            return Err(EnqueueError::ShutDown);
        }
        let recipient = payload.recipient.clone();
        let id = state
            .queue
            .push(payload, kind, attempt_count, self.clock.now())?;
        drop(state);
        self.shared.wake.notify_all();
        log::debug!("enqueued {} {} for {}", kind.as_str(), id, recipient);
        Ok(id)
    }

    pub fn stats(&self) -> DispatchStats {
        let mut state = self.shared.lock();
        state.queue.promote_due(self.clock.now());
        state.queue.stats()
    }

    /// Wake the worker so it re-reads the clock. Call after moving a manual [`Clock`]
    /// forward; with [`SystemClock`] the worker wakes on its own.
    pub fn tick(&self) {
        drop(self.shared.lock());
        self.shared.wake.notify_all();
    }

    /// Block until no live jobs remain or `timeout` elapses. Returns true when idle.
    /// `timeout` is wall time regardless of the injected clock.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if state.queue.live() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stop taking jobs, let an in-flight attempt finish or time out, join the worker and
    /// hand back whatever was still waiting.
    pub fn shutdown(mut self) -> Vec<PendingJob> {
        self.stop()
    }

    fn stop(&mut self) -> Vec<PendingJob> {
        {
            let mut state = self.shared.lock();
            state.stopping = true;
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("dispatcher worker panicked");
            }
        }
        let pending = self.shared.lock().queue.drain_pending();
        log::info!("dispatcher stopped with {} pending job(s)", pending.len());
        pending
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        let pending = self.stop();
        if !pending.is_empty() {
            log::warn!(
                "dispatcher dropped without shutdown; {} pending job(s) discarded",
                pending.len()
            );
        }
    }
}

fn run_worker(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    reports: Sender<DeliveryReport>,
    attempt_timeout: Duration,
) {
    loop {
        let Some(attempt) = next_attempt(&shared, clock.as_ref()) else {
            return;
        };
        let Attempt {
            id,
            payload,
            attempt: n,
        } = attempt;
        let outcome = attempt_with_timeout(&transport, payload, attempt_timeout);

        // Report under the lock: once `wait_idle` sees no live jobs, every report is queued.
        let mut state = shared.lock();
        let report = match state.queue.complete(id, outcome, clock.now()) {
            Some(Completion::Sent(job)) => {
                log::info!("{} sent after {} attempt(s)", id, job.attempt_count());
                Some(DeliveryReport::Sent(job))
            }
            Some(Completion::Retry { attempt, delay }) => {
                log::warn!(
                    "{} attempt {} failed; retrying in {} ms",
                    id,
                    attempt,
                    delay.as_millis()
                );
                None
            }
            Some(Completion::Dead(job, error)) => {
                log::error!("{} dead after {} attempt(s): {}", id, n, error);
                Some(DeliveryReport::Dead { job, error })
            }
            None => None,
        };
        if let Some(report) = report {
            if reports.send(report).is_err() {
                log::debug!("delivery report for {} dropped: no receiver", id);
            }
        }
        drop(state);
        shared.wake.notify_all();
    }
}

/// Wait for the next due job. Returns `None` once the dispatcher is stopping.
fn next_attempt(shared: &Shared, clock: &dyn Clock) -> Option<Attempt> {
    let mut state = shared.lock();
    loop {
        if state.stopping {
            return None;
        }
        let now = clock.now();
        state.queue.promote_due(now);
        if let Some(attempt) = state.queue.take_due(now) {
            return Some(attempt);
        }
        state = match state.queue.next_due_at() {
            Some(at) => {
                shared
                    .wake
                    .wait_timeout(state, at.saturating_duration_since(now))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => shared
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}

/// One transport call on a helper thread, bounded by `timeout`.
///
/// A timed-out call keeps running detached; its late result is discarded.
fn attempt_with_timeout(
    transport: &Arc<dyn Transport>,
    payload: Payload,
    timeout: Duration,
) -> Result<(), TransportError> {
    let (tx, rx) = mpsc::channel();
    let transport = transport.clone();
    let spawned = thread::Builder::new()
        .name("notice-attempt".to_string())
        .spawn(move || {
            let _ = tx.send(transport.send(&payload));
        });
    if let Err(err) = spawned {
        return Err(TransportError::Network(format!(
            "could not start attempt: {}",
            err
        )));
    }
    match rx.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => Err(TransportError::TimedOut(timeout.as_millis() as u64)),
        Err(RecvTimeoutError::Disconnected) => {
            Err(TransportError::Network("transport attempt panicked".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        failures_left: AtomicUsize,
    }

    impl Transport for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn send(&self, _payload: &Payload) -> Result<(), TransportError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(TransportError::Network("flap".into()));
            }
            Ok(())
        }
    }

    struct Hangs;

    impl Transport for Hangs {
        fn name(&self) -> &'static str {
            "hangs"
        }

        fn send(&self, _payload: &Payload) -> Result<(), TransportError> {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }
    }

    fn fast_config(max_attempts: u32) -> DispatchConfig {
        DispatchConfig {
            capacity: 16,
            max_attempts,
            retry_delays: vec![Duration::from_millis(5)],
            attempt_timeout: Duration::from_secs(2),
            key_retention: 64,
        }
    }

    fn notice(to: &str) -> Payload {
        Payload::new(to, "Traffic Violation Notice", "body")
    }

    #[test]
    fn config_validation() {
        assert!(DispatchConfig::default().validate().is_ok());
        let mut cfg = DispatchConfig::default();
        cfg.retry_delays = vec![Duration::from_secs(10), Duration::from_secs(1)];
        assert!(cfg.validate().is_err());
        cfg.retry_delays.clear();
        assert!(cfg.validate().is_err());
        let cfg = DispatchConfig {
            capacity: 0,
            ..DispatchConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retries_then_reports_sent() {
        let transport = Arc::new(Flaky {
            failures_left: AtomicUsize::new(2),
        });
        let (dispatcher, reports) = Dispatcher::start(fast_config(4), transport).unwrap();
        let id = dispatcher
            .enqueue(notice("owner@example.org"), NotificationKind::ViolationNotice)
            .unwrap();

        match reports.recv_timeout(Duration::from_secs(5)).unwrap() {
            DeliveryReport::Sent(job) => {
                assert_eq!(job.id(), id);
                assert_eq!(job.attempt_count(), 3);
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert!(dispatcher.shutdown().is_empty());
    }

    #[test]
    fn hung_transport_times_out_as_failure() {
        let cfg = DispatchConfig {
            attempt_timeout: Duration::from_millis(20),
            ..fast_config(1)
        };
        let (dispatcher, reports) = Dispatcher::start(cfg, Arc::new(Hangs)).unwrap();
        dispatcher
            .enqueue(notice("owner@example.org"), NotificationKind::FineReceipt)
            .unwrap();
        match reports.recv_timeout(Duration::from_secs(5)).unwrap() {
            DeliveryReport::Dead { error, job } => {
                assert_eq!(error, TransportError::TimedOut(20));
                assert_eq!(job.kind(), NotificationKind::FineReceipt);
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn enqueue_after_shutdown_is_rejected() {
        let transport = Arc::new(Flaky {
            failures_left: AtomicUsize::new(0),
        });
        let (dispatcher, _reports) = Dispatcher::start(fast_config(2), transport).unwrap();
        let shared = dispatcher.shared.clone();
        let clock = dispatcher.clock.clone();
        dispatcher.shutdown();

        let ghost = Dispatcher {
            shared,
            clock,
            worker: None,
        };
        assert_eq!(
            ghost.enqueue(notice("owner@example.org"), NotificationKind::ViolationNotice),
            Err(EnqueueError::ShutDown)
        );
    }
}
