//! Delayed-job queue contract and an in-memory implementation
//!
//! Delivery is at-least-once: a job taken by [`JobQueue::take_due`] stays
//! leased until it is completed or failed, and a failed job is re-queued
//! with backoff until its attempts are exhausted. Handlers must therefore
//! be idempotent.

use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Retry delay strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `base * 2^(attempt - 1)`
    Exponential { base_ms: u64 },
}

impl Backoff {
    const MAX_DELAY_MS: u64 = 60 * 60 * 1000;

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Exponential { base_ms } => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(Self::MAX_DELAY_MS))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential { base_ms: 1_000 }
    }
}

/// Enqueue options
#[derive(Clone, Debug, PartialEq)]
pub struct JobOptions {
    pub delay: Duration,
    pub attempts: u32,
    pub backoff: Backoff,
    /// Deduplication key: while a job with the same key is queued or
    /// running, further enqueues are dropped
    pub key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            attempts: 3,
            backoff: Backoff::default(),
            key: None,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
}

/// A unit of deferred work
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub state: JobState,
    /// Deliveries so far, including the current one
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub run_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    /// Decode the payload into a typed value
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> QueueResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| QueueError::InvalidPayload {
            job: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

/// A keyed recurring schedule that materializes a job every `every`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schedule {
    pub key: String,
    pub job_name: String,
    #[serde(default)]
    pub payload: Value,
    pub every: Duration,
    pub next_run_at: DateTime<Utc>,
    pub attempts: u32,
}

impl Schedule {
    /// First run one interval from now
    pub fn every(key: impl Into<String>, job_name: impl Into<String>, every: Duration) -> Self {
        Self {
            key: key.into(),
            job_name: job_name.into(),
            payload: Value::Null,
            every,
            next_run_at: Utc::now() + to_chrono(every),
            attempts: 1,
        }
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = at;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Result of reporting a failed delivery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailOutcome {
    Retry { run_at: DateTime<Utc> },
    Exhausted,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

/// Delayed-job queue with keyed recurring schedules
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue a job. Returns `None` when the key deduplicated it.
    async fn enqueue(&self, name: &str, payload: Value, options: JobOptions)
        -> QueueResult<Option<JobId>>;

    /// Create or replace a schedule by key. Replacing keeps the pending
    /// run time unless the interval changed.
    async fn upsert_schedule(&self, schedule: Schedule) -> QueueResult<()>;

    /// Remove a schedule; `false` when no schedule had that key
    async fn remove_schedule(&self, key: &str) -> QueueResult<bool>;

    async fn list_schedules(&self) -> QueueResult<Vec<Schedule>>;

    /// Lease up to `limit` due jobs, materializing due schedules first
    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<Job>>;

    async fn complete(&self, job: &Job) -> QueueResult<()>;

    async fn fail(&self, job: &Job, error: &str) -> QueueResult<FailOutcome>;
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: IndexMap<JobId, Job>,
    schedules: IndexMap<String, Schedule>,
}

impl QueueState {
    fn key_in_use(&self, key: &str) -> bool {
        self.jobs.values().any(|j| j.key.as_deref() == Some(key))
    }

    fn push(&mut self, name: &str, payload: Value, options: JobOptions, now: DateTime<Utc>) -> Option<JobId> {
        if let Some(key) = options.key.as_deref() {
            if self.key_in_use(key) {
                return None;
            }
        }
        let job = Job {
            id: JobId::generate(),
            name: name.to_string(),
            payload,
            key: options.key,
            state: JobState::Queued,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            backoff: options.backoff,
            run_at: now + to_chrono(options.delay),
            last_error: None,
        };
        let id = job.id.clone();
        self.jobs.insert(id.clone(), job);
        Some(id)
    }
}

/// In-process job queue
#[derive(Debug, Clone, Default)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job currently queued or leased
    pub async fn jobs(&self) -> Vec<Job> {
        self.state.lock().await.jobs.values().cloned().collect()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<Option<JobId>> {
        let mut state = self.state.lock().await;
        let id = state.push(name, payload, options, Utc::now());
        match &id {
            Some(id) => tracing::debug!(job = %name, job_id = %id, "Job enqueued"),
            None => tracing::debug!(job = %name, "Job deduplicated by key"),
        }
        Ok(id)
    }

    async fn upsert_schedule(&self, schedule: Schedule) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let schedule = match state.schedules.get(&schedule.key) {
            Some(existing) if existing.every == schedule.every => Schedule {
                next_run_at: existing.next_run_at,
                ..schedule
            },
            _ => schedule,
        };
        tracing::info!(schedule = %schedule.key, job = %schedule.job_name, every_ms = schedule.every.as_millis() as u64, "Schedule registered");
        state.schedules.insert(schedule.key.clone(), schedule);
        Ok(())
    }

    async fn remove_schedule(&self, key: &str) -> QueueResult<bool> {
        Ok(self.state.lock().await.schedules.shift_remove(key).is_some())
    }

    async fn list_schedules(&self) -> QueueResult<Vec<Schedule>> {
        Ok(self.state.lock().await.schedules.values().cloned().collect())
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> QueueResult<Vec<Job>> {
        let mut state = self.state.lock().await;

        let due_schedules: Vec<Schedule> = state
            .schedules
            .values()
            .filter(|s| s.next_run_at <= now)
            .cloned()
            .collect();
        for schedule in due_schedules {
            let options = JobOptions::new()
                .with_attempts(schedule.attempts)
                .with_key(format!("schedule:{}", schedule.key));
            state.push(&schedule.job_name, schedule.payload.clone(), options, now);
            if let Some(s) = state.schedules.get_mut(&schedule.key) {
                s.next_run_at = now + to_chrono(s.every);
            }
        }

        let mut due: Vec<&mut Job> = state
            .jobs
            .values_mut()
            .filter(|j| j.state == JobState::Queued && j.run_at <= now)
            .collect();
        due.sort_by_key(|j| j.run_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.state = JobState::Running;
                job.attempts_made += 1;
                job.clone()
            })
            .collect())
    }

    async fn complete(&self, job: &Job) -> QueueResult<()> {
        self.state
            .lock()
            .await
            .jobs
            .shift_remove(&job.id)
            .map(|_| ())
            .ok_or_else(|| QueueError::JobNotFound(job.id.to_string()))
    }

    async fn fail(&self, job: &Job, error: &str) -> QueueResult<FailOutcome> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.jobs.get_mut(&job.id) else {
            return Err(QueueError::JobNotFound(job.id.to_string()));
        };

        if stored.attempts_made >= stored.max_attempts {
            state.jobs.shift_remove(&job.id);
            return Ok(FailOutcome::Exhausted);
        }

        let run_at = Utc::now() + to_chrono(stored.backoff.delay_for(stored.attempts_made));
        stored.state = JobState::Queued;
        stored.run_at = run_at;
        stored.last_error = Some(error.to_string());
        Ok(FailOutcome::Retry { run_at })
    }
}
