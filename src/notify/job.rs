//! Notification jobs and the queue state machine the dispatcher worker drives.
//!
//! `JobQueue` holds no threads and reads no clock; every transition takes `now`
//! explicitly so the state machine can be exercised deterministically.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::{EnqueueError, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Sending,
    RetryScheduled,
    Sent,
    Dead,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Dead)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ViolationNotice,
    FineReceipt,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::ViolationNotice => "violation_notice",
            NotificationKind::FineReceipt => "fine_receipt",
        }
    }
}

/// Rendered outbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Reference to an evidence image; the transport decides how to attach it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<PathBuf>,
    /// Jobs sharing a key are rejected after the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Payload {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            attachment: None,
            idempotency_key: None,
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachment = Some(path.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Recipient addresses must look like `local@domain.tld`.
pub fn validate_recipient(recipient: &str) -> Result<(), EnqueueError> {
    static RECIPIENT_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RECIPIENT_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9._%+-]{1,64}@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$")
            .unwrap()
    });
    if re.is_match(recipient) {
        Ok(())
    } else {
        Err(EnqueueError::InvalidRecipient(recipient.to_string()))
    }
}

/// A job owned by the dispatcher until it is SENT or DEAD.
#[derive(Clone, Debug)]
pub struct NotificationJob {
    id: JobId,
    payload: Payload,
    kind: NotificationKind,
    attempt_count: u32,
    next_attempt_at: Instant,
    status: JobStatus,
    last_error: Option<TransportError>,
}

impl NotificationJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> NotificationKind {
        self.kind
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn next_attempt_at(&self) -> Instant {
        self.next_attempt_at
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }
}

/// Snapshot of an unfinished job, handed back at shutdown for persistence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
    pub id: JobId,
    pub payload: Payload,
    pub kind: NotificationKind,
    pub attempt_count: u32,
    pub status: JobStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub queued: usize,
    pub retry_scheduled: usize,
    pub sending: usize,
    pub sent: usize,
    pub dead: usize,
}

impl DispatchStats {
    /// Jobs not yet terminal.
    pub fn live(&self) -> usize {
        self.queued + self.retry_scheduled + self.sending
    }
}

/// Result of `enqueue_batch`; rejections carry the index of the payload in the batch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub queued: Vec<JobId>,
    pub rejected: Vec<(usize, EnqueueError)>,
}

/// A job handed to the worker for one attempt.
#[derive(Clone, Debug)]
pub(crate) struct Attempt {
    pub id: JobId,
    pub payload: Payload,
    pub attempt: u32,
}

/// What an attempt's outcome did to its job.
#[derive(Debug)]
pub(crate) enum Completion {
    Sent(NotificationJob),
    Retry { attempt: u32, delay: Duration },
    Dead(NotificationJob, TransportError),
}

pub(crate) const DEFAULT_KEY_RETENTION: usize = 4096;

pub(crate) struct JobQueue {
    capacity: usize,
    max_attempts: u32,
    retry_delays: Vec<Duration>,
    next_id: u64,
    seq: u64,
    jobs: HashMap<JobId, NotificationJob>,
    /// QUEUED and RETRY_SCHEDULED jobs keyed by (next_attempt_at, arrival order).
    schedule: BTreeMap<(Instant, u64), JobId>,
    /// Keys of live jobs plus the most recent `key_retention` terminal ones.
    keys: HashMap<String, JobId>,
    retired_keys: VecDeque<String>,
    key_retention: usize,
    sent: usize,
    dead: usize,
}

impl JobQueue {
    pub fn new(capacity: usize, max_attempts: u32, retry_delays: Vec<Duration>) -> Self {
        Self {
            capacity,
            max_attempts,
            retry_delays,
            next_id: 1,
            seq: 0,
            jobs: HashMap::new(),
            schedule: BTreeMap::new(),
            keys: HashMap::new(),
            retired_keys: VecDeque::new(),
            key_retention: DEFAULT_KEY_RETENTION,
            sent: 0,
            dead: 0,
        }
    }

    pub fn with_key_retention(mut self, key_retention: usize) -> Self {
        self.key_retention = key_retention;
        self
    }

    /// Keep a terminal job's key for duplicate checks, forgetting the oldest beyond
    /// `key_retention`.
    fn retire_key(&mut self, job: &NotificationJob) {
        let Some(key) = &job.payload.idempotency_key else {
            return;
        };
        self.retired_keys.push_back(key.clone());
        while self.retired_keys.len() > self.key_retention {
            if let Some(oldest) = self.retired_keys.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }

    pub fn live(&self) -> usize {
        self.jobs.len()
    }

    /// Admit a job due at `now`. `attempt_count` is non-zero only for restored jobs.
    pub fn push(
        &mut self,
        payload: Payload,
        kind: NotificationKind,
        attempt_count: u32,
        now: Instant,
    ) -> Result<JobId, EnqueueError> {
        validate_recipient(&payload.recipient)?;
        if let Some(key) = &payload.idempotency_key {
            if let Some(existing) = self.keys.get(key) {
                return Err(EnqueueError::Duplicate {
                    key: key.clone(),
                    existing: existing.0,
                });
            }
        }
        if self.jobs.len() >= self.capacity {
            return Err(EnqueueError::Saturated {
                live: self.jobs.len(),
                capacity: self.capacity,
            });
        }

        let id = JobId(self.next_id);
        self.next_id += 1;
        if let Some(key) = &payload.idempotency_key {
            self.keys.insert(key.clone(), id);
        }
        let job = NotificationJob {
            id,
            payload,
            kind,
            attempt_count: attempt_count.min(self.max_attempts.saturating_sub(1)),
            next_attempt_at: now,
            status: JobStatus::Queued,
            last_error: None,
        };
        self.schedule_at(now, id);
        self.jobs.insert(id, job);
        Ok(id)
    }

    fn schedule_at(&mut self, at: Instant, id: JobId) {
        self.seq += 1;
        self.schedule.insert((at, self.seq), id);
    }

    /// RETRY_SCHEDULED jobs whose delay has elapsed become QUEUED.
    pub fn promote_due(&mut self, now: Instant) {
        for (_, id) in self.schedule.range(..(now, u64::MAX)) {
            if let Some(job) = self.jobs.get_mut(id) {
                if job.status == JobStatus::RetryScheduled {
                    job.status = JobStatus::Queued;
                }
            }
        }
    }

    pub fn next_due_at(&self) -> Option<Instant> {
        self.schedule.keys().next().map(|(at, _)| *at)
    }

    /// Take the earliest due job and mark it SENDING.
    pub fn take_due(&mut self, now: Instant) -> Option<Attempt> {
        let (&(at, seq), _) = self.schedule.iter().next()?;
        if at > now {
            return None;
        }
        let id = self.schedule.remove(&(at, seq))?;
        let job = self.jobs.get_mut(&id)?;
        job.status = JobStatus::Sending;
        job.attempt_count += 1;
        Some(Attempt {
            id,
            payload: job.payload.clone(),
            attempt: job.attempt_count,
        })
    }

    /// Apply the outcome of the attempt on `id`.
    pub fn complete(
        &mut self,
        id: JobId,
        outcome: Result<(), TransportError>,
        now: Instant,
    ) -> Option<Completion> {
        match outcome {
            Ok(()) => {
                let mut job = self.jobs.remove(&id)?;
                job.status = JobStatus::Sent;
                self.sent += 1;
                self.retire_key(&job);
                Some(Completion::Sent(job))
            }
            Err(err) => {
                let job = self.jobs.get_mut(&id)?;
                job.last_error = Some(err.clone());
                if job.attempt_count < self.max_attempts {
                    let delay = retry_delay(&self.retry_delays, job.attempt_count);
                    let at = now + delay;
                    job.status = JobStatus::RetryScheduled;
                    job.next_attempt_at = at;
                    let attempt = job.attempt_count;
                    self.schedule_at(at, id);
                    Some(Completion::Retry { attempt, delay })
                } else {
                    let mut job = self.jobs.remove(&id)?;
                    job.status = JobStatus::Dead;
                    self.dead += 1;
                    self.retire_key(&job);
                    Some(Completion::Dead(job, err))
                }
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let mut stats = DispatchStats {
            sent: self.sent,
            dead: self.dead,
            ..DispatchStats::default()
        };
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::RetryScheduled => stats.retry_scheduled += 1,
                JobStatus::Sending => stats.sending += 1,
                JobStatus::Sent | JobStatus::Dead => {}
            }
        }
        stats
    }

    /// Remove every waiting job, in id order. SENDING jobs stay put.
    pub fn drain_pending(&mut self) -> Vec<PendingJob> {
        let ids: Vec<JobId> = self.schedule.values().copied().collect();
        self.schedule.clear();
        let mut pending: Vec<PendingJob> = ids
            .into_iter()
            .filter_map(|id| self.jobs.remove(&id))
            .map(|job| PendingJob {
                id: job.id,
                payload: job.payload,
                kind: job.kind,
                attempt_count: job.attempt_count,
                status: job.status,
            })
            .collect();
        pending.sort_by_key(|job| job.id);
        pending
    }
}

/// Delay after the `attempt`-th failure; the schedule's last entry repeats.
pub(crate) fn retry_delay(delays: &[Duration], attempt: u32) -> Duration {
    if delays.is_empty() {
        return Duration::ZERO;
    }
    let idx = (attempt.max(1) as usize - 1).min(delays.len() - 1);
    delays[idx]
}
