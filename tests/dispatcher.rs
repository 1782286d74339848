use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rider_enforcement::{
    Clock, DeliveryReport, DispatchConfig, DispatchStats, Dispatcher, EnqueueError, JobStatus,
    LogTransport, NotificationKind, Payload, Transport, TransportError,
};

/// Records the instant of every call and fails the first `failures` of them.
struct Recording {
    failures: usize,
    calls: Mutex<Vec<Instant>>,
}

impl Recording {
    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transport for Recording {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn send(&self, _payload: &Payload) -> Result<(), TransportError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(Instant::now());
        if calls.len() <= self.failures {
            return Err(TransportError::Rejected("mailbox unavailable".into()));
        }
        Ok(())
    }
}

/// Holds every call for a fixed time.
struct Slow {
    delay: Duration,
    calls: AtomicUsize,
}

impl Transport for Slow {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn send(&self, _payload: &Payload) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        Ok(())
    }
}

fn config(max_attempts: u32, delays_ms: &[u64]) -> DispatchConfig {
    DispatchConfig {
        capacity: 1024,
        max_attempts,
        retry_delays: delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        attempt_timeout: Duration::from_secs(2),
        ..DispatchConfig::default()
    }
}

fn notice(to: &str) -> Payload {
    Payload::new(to, "Traffic Violation Notice - KA01AB1234", "body")
}

#[test]
fn concurrent_producers_all_reach_a_terminal_state() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 25;

    let (dispatcher, reports) =
        Dispatcher::start(config(3, &[5]), Arc::new(LogTransport::new())).unwrap();
    let dispatcher = Arc::new(dispatcher);

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                (0..PER_PRODUCER)
                    .map(|i| {
                        let payload = notice(&format!("owner{}@example.org", p))
                            .with_idempotency_key(format!("violation:{}-{}", p, i));
                        dispatcher
                            .enqueue(payload, NotificationKind::ViolationNotice)
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut ids = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(ids.insert(id), "duplicate job id {}", id);
        }
    }

    let mut terminal = 0;
    while terminal < PRODUCERS * PER_PRODUCER {
        let report = reports.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(ids.contains(&report.job().id()));
        terminal += 1;
    }
    let stats = dispatcher.stats();
    assert_eq!(stats.sent + stats.dead, PRODUCERS * PER_PRODUCER);
    assert_eq!(stats.live(), 0);
}

#[test]
fn always_failing_transport_goes_dead_on_schedule() {
    let transport = Recording::failing(usize::MAX);
    let (dispatcher, reports) =
        Dispatcher::start(config(3, &[40, 80]), transport.clone()).unwrap();
    let id = dispatcher
        .enqueue(notice("owner@example.org"), NotificationKind::ViolationNotice)
        .unwrap();

    match reports.recv_timeout(Duration::from_secs(10)).unwrap() {
        DeliveryReport::Dead { job, error } => {
            assert_eq!(job.id(), id);
            assert_eq!(job.attempt_count(), 3);
            assert_eq!(job.status(), JobStatus::Dead);
            assert_eq!(error, TransportError::Rejected("mailbox unavailable".into()));
        }
        other => panic!("expected dead report, got {:?}", other),
    }

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[1] - calls[0] >= Duration::from_millis(40));
    assert!(calls[2] - calls[1] >= Duration::from_millis(80));
    assert!(calls[2] - calls[0] < Duration::from_secs(5));

    let stats = dispatcher.stats();
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.sent, 0);
}

#[test]
fn schedule_clamps_to_last_delay() {
    let transport = Recording::failing(usize::MAX);
    let (dispatcher, reports) = Dispatcher::start(config(4, &[30]), transport.clone()).unwrap();
    dispatcher
        .enqueue(notice("owner@example.org"), NotificationKind::FineReceipt)
        .unwrap();
    reports.recv_timeout(Duration::from_secs(10)).unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 4);
    for pair in calls.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(30));
    }
}

#[test]
fn saturation_counts_in_flight_jobs() {
    let transport = Arc::new(Slow {
        delay: Duration::from_millis(300),
        calls: AtomicUsize::new(0),
    });
    let cfg = DispatchConfig {
        capacity: 2,
        ..config(1, &[5])
    };
    let (dispatcher, reports) = Dispatcher::start(cfg, transport).unwrap();
    dispatcher
        .enqueue(notice("a@example.org"), NotificationKind::ViolationNotice)
        .unwrap();
    dispatcher
        .enqueue(notice("b@example.org"), NotificationKind::ViolationNotice)
        .unwrap();
    let err = dispatcher
        .enqueue(notice("c@example.org"), NotificationKind::ViolationNotice)
        .unwrap_err();
    assert_eq!(err, EnqueueError::Saturated { live: 2, capacity: 2 });

    reports.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(dispatcher
        .enqueue(notice("c@example.org"), NotificationKind::ViolationNotice)
        .is_ok());
}

#[test]
fn invalid_recipient_never_enters_the_queue() {
    let (dispatcher, _reports) =
        Dispatcher::start(config(3, &[5]), Arc::new(LogTransport::new())).unwrap();
    let err = dispatcher
        .enqueue(notice("not an address"), NotificationKind::ViolationNotice)
        .unwrap_err();
    assert_eq!(err, EnqueueError::InvalidRecipient("not an address".into()));
    let stats = dispatcher.stats();
    assert_eq!(stats.live() + stats.sent + stats.dead, 0);
}

#[test]
fn batch_items_are_independent() {
    let (dispatcher, reports) =
        Dispatcher::start(config(3, &[5]), Arc::new(LogTransport::new())).unwrap();
    let outcome = dispatcher.enqueue_batch(
        vec![
            notice("a@example.org").with_idempotency_key("violation:1"),
            notice("broken"),
            notice("b@example.org").with_idempotency_key("violation:2"),
            notice("c@example.org").with_idempotency_key("violation:1"),
        ],
        NotificationKind::ViolationNotice,
    );
    assert_eq!(outcome.queued.len(), 2);
    let rejected: Vec<usize> = outcome.rejected.iter().map(|(idx, _)| *idx).collect();
    assert_eq!(rejected, vec![1, 3]);
    assert!(matches!(
        outcome.rejected[1].1,
        EnqueueError::Duplicate { ref key, existing } if key == "violation:1" && existing == outcome.queued[0].0
    ));

    for _ in 0..2 {
        assert!(matches!(
            reports.recv_timeout(Duration::from_secs(5)).unwrap(),
            DeliveryReport::Sent(_)
        ));
    }
}

#[test]
fn shutdown_hands_back_waiting_jobs_for_restore() {
    let failing = Recording::failing(usize::MAX);
    let (dispatcher, _reports) =
        Dispatcher::start(config(4, &[60_000]), failing.clone()).unwrap();
    dispatcher
        .enqueue(
            notice("owner@example.org").with_idempotency_key("violation:9"),
            NotificationKind::ViolationNotice,
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while dispatcher.stats().retry_scheduled == 0 {
        assert!(Instant::now() < deadline, "first attempt never happened");
        thread::sleep(Duration::from_millis(5));
    }
    let pending = dispatcher.shutdown();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt_count, 1);
    assert_eq!(pending[0].status, JobStatus::RetryScheduled);

    let (dispatcher, reports) =
        Dispatcher::start(config(4, &[5]), Arc::new(LogTransport::new())).unwrap();
    let restored = dispatcher.restore(pending);
    assert_eq!(restored.queued.len(), 1);
    match reports.recv_timeout(Duration::from_secs(5)).unwrap() {
        DeliveryReport::Sent(job) => assert_eq!(job.attempt_count(), 2),
        other => panic!("expected sent report, got {:?}", other),
    }

    let dup = dispatcher.enqueue(
        notice("owner@example.org").with_idempotency_key("violation:9"),
        NotificationKind::ViolationNotice,
    );
    assert!(matches!(dup, Err(EnqueueError::Duplicate { .. })));
}

#[test]
fn wait_idle_reports_drained_queue() {
    let transport = Arc::new(Slow {
        delay: Duration::from_millis(20),
        calls: AtomicUsize::new(0),
    });
    let (dispatcher, _reports) = Dispatcher::start(config(2, &[5]), transport.clone()).unwrap();
    for i in 0..5 {
        dispatcher
            .enqueue(notice(&format!("o{}@example.org", i)), NotificationKind::FineReceipt)
            .unwrap();
    }
    assert!(dispatcher.wait_idle(Duration::from_secs(5)));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 5);
    assert_eq!(dispatcher.stats().sent, 5);
}

/// Clock that only moves when told to.
struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        })
    }

    fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }

    fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}

/// Always fails, recording the manual clock offset of every call.
struct FailsOnClock {
    clock: Arc<ManualClock>,
    calls: Mutex<Vec<Duration>>,
}

impl Transport for FailsOnClock {
    fn name(&self) -> &'static str {
        "fails-on-clock"
    }

    fn send(&self, _payload: &Payload) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(self.clock.elapsed());
        Err(TransportError::Network("connection refused".into()))
    }
}

fn wait_for_stats(dispatcher: &Dispatcher, done: impl Fn(&DispatchStats) -> bool) -> DispatchStats {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = dispatcher.stats();
        if done(&stats) || Instant::now() >= deadline {
            return stats;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn manual_clock_drives_retry_schedule_exactly() {
    let clock = ManualClock::new();
    let transport = Arc::new(FailsOnClock {
        clock: clock.clone(),
        calls: Mutex::new(Vec::new()),
    });
    let cfg = DispatchConfig {
        max_attempts: 3,
        retry_delays: vec![Duration::from_secs(60), Duration::from_secs(120)],
        ..DispatchConfig::default()
    };
    let (dispatcher, reports) =
        Dispatcher::start_with_clock(cfg, transport.clone(), clock.clone()).unwrap();
    dispatcher
        .enqueue(notice("rider@example.org"), NotificationKind::ViolationNotice)
        .unwrap();

    let stats = wait_for_stats(&dispatcher, |s| s.retry_scheduled == 1);
    assert_eq!(stats.retry_scheduled, 1);

    // One second short of the first delay: nothing may happen.
    clock.advance(Duration::from_secs(59));
    dispatcher.tick();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(transport.calls.lock().unwrap().len(), 1);
    assert_eq!(dispatcher.stats().retry_scheduled, 1);

    clock.advance(Duration::from_secs(1));
    dispatcher.tick();
    let stats = wait_for_stats(&dispatcher, |_| transport.calls.lock().unwrap().len() == 2);
    assert_eq!(transport.calls.lock().unwrap().len(), 2, "{:?}", stats);
    wait_for_stats(&dispatcher, |s| s.retry_scheduled == 1);

    clock.advance(Duration::from_secs(120));
    dispatcher.tick();
    let report = reports.recv_timeout(Duration::from_secs(5)).expect("dead report");
    match report {
        DeliveryReport::Dead { job, .. } => assert_eq!(job.attempt_count(), 3),
        other => panic!("expected dead job, got {:?}", other),
    }

    assert_eq!(
        *transport.calls.lock().unwrap(),
        vec![
            Duration::ZERO,
            Duration::from_secs(60),
            Duration::from_secs(180)
        ]
    );
    let stats = dispatcher.stats();
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.live(), 0);
    dispatcher.shutdown();
}
