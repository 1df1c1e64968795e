//! Timeout runtime: scheduled scans, escalation and reminder jobs, and the
//! runner loop that drives them
//!
//! Two keyed recurring schedules feed the queue: `timeout-scan` finds
//! overdue and nearly-due tasks, `due-cleanup` clears stale due times. The
//! scan enqueues one keyed job per task, which the worker applies.

mod scheduler;
mod worker;

pub use scheduler::{ScanSummary, TimeoutScheduler};
pub use worker::{TimeoutOutcome, TimeoutWorker};

use crate::config::TimeoutConfig;
use crate::engine::Engine;
use crate::error::QueueError;
use crate::events::EventBus;
use crate::queue::{Backoff, FailOutcome, Job, JobOptions, JobQueue, Schedule};
use crate::store::FlowStore;
use bpm_types::{FlowError, FlowResult, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

pub const SCAN_SCHEDULE: &str = "timeout-scan";
pub const CLEANUP_SCHEDULE: &str = "due-cleanup";

pub const SCAN_JOB: &str = "timeout.scan";
pub const CLEANUP_JOB: &str = "timeout.cleanup";
pub const ESCALATE_JOB: &str = "task.escalate";
pub const REMIND_JOB: &str = "task.remind";

/// Payload of the per-task jobs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskJob {
    pub task_id: TaskId,
}

impl TaskJob {
    pub(crate) fn payload(task_id: &TaskId) -> FlowResult<Value> {
        serde_json::to_value(TaskJob {
            task_id: task_id.clone(),
        })
        .map_err(|e| FlowError::Queue(e.to_string()))
    }
}

pub(crate) fn job_options(config: &TimeoutConfig) -> JobOptions {
    JobOptions::new()
        .with_attempts(config.job_attempts)
        .with_backoff(Backoff::Exponential {
            base_ms: config.backoff_base_ms,
        })
}

/// Owns the scheduler, the worker and the runner loop
pub struct TimeoutService {
    scheduler: TimeoutScheduler,
    worker: TimeoutWorker,
    queue: Arc<dyn JobQueue>,
    config: TimeoutConfig,
    trigger_tx: mpsc::Sender<()>,
    running: Arc<RwLock<bool>>,
}

impl TimeoutService {
    /// Create the service. The receiver is handed back to
    /// [`TimeoutService::start`].
    pub fn new(
        store: Arc<dyn FlowStore>,
        engine: Arc<Engine>,
        events: EventBus,
        queue: Arc<dyn JobQueue>,
        config: TimeoutConfig,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(10);
        let service = Arc::new(Self {
            scheduler: TimeoutScheduler::new(store.clone(), queue.clone(), config.clone()),
            worker: TimeoutWorker::new(store, engine, events),
            queue,
            config,
            trigger_tx,
            running: Arc::new(RwLock::new(false)),
        });
        (service, trigger_rx)
    }

    pub fn scheduler(&self) -> &TimeoutScheduler {
        &self.scheduler
    }

    pub fn worker(&self) -> &TimeoutWorker {
        &self.worker
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Register (or replace) the scan and cleanup schedules
    pub async fn register_schedules(&self) -> Result<(), QueueError> {
        let attempts = self.config.job_attempts;
        let mut scan = Schedule::every(SCAN_SCHEDULE, SCAN_JOB, self.config.scan_interval());
        scan.attempts = attempts;
        let mut cleanup =
            Schedule::every(CLEANUP_SCHEDULE, CLEANUP_JOB, self.config.cleanup_interval());
        cleanup.attempts = attempts;

        self.queue.upsert_schedule(scan).await?;
        self.queue.upsert_schedule(cleanup).await?;
        Ok(())
    }

    /// Run one runner tick immediately
    pub async fn trigger(&self) {
        let _ = self.trigger_tx.send(()).await;
    }

    /// Take every due job and run it. Returns how many jobs ran.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let jobs = self.queue.take_due(now, self.config.jobs_per_tick).await?;
        let count = jobs.len();

        for job in jobs {
            match self.dispatch(&job, now).await {
                Ok(()) => self.queue.complete(&job).await?,
                Err(e) => match self.queue.fail(&job, &e.to_string()).await? {
                    FailOutcome::Retry { run_at } => {
                        tracing::warn!(job = %job.name, job_id = %job.id, attempt = job.attempts_made, retry_at = %run_at, error = %e, "Job failed; retrying");
                    }
                    FailOutcome::Exhausted => {
                        tracing::error!(job = %job.name, job_id = %job.id, attempts = job.attempts_made, error = %e, "Job failed; attempts exhausted");
                    }
                },
            }
        }
        Ok(count)
    }

    async fn dispatch(&self, job: &Job, now: DateTime<Utc>) -> FlowResult<()> {
        match job.name.as_str() {
            SCAN_JOB => {
                self.scheduler.scan(now).await?;
            }
            CLEANUP_JOB => {
                self.scheduler.cleanup().await?;
            }
            ESCALATE_JOB => {
                let payload: TaskJob = job.decode()?;
                self.worker.escalate(&payload.task_id, now).await?;
            }
            REMIND_JOB => {
                let payload: TaskJob = job.decode()?;
                self.worker.remind(&payload.task_id, now).await?;
            }
            other => {
                tracing::warn!(job = %other, job_id = %job.id, "Unknown job dropped");
            }
        }
        Ok(())
    }

    /// Register schedules and poll the queue until [`TimeoutService::stop`]
    pub async fn start(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<()>) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        if let Err(e) = self.register_schedules().await {
            tracing::error!(error = %e, "Failed to register timeout schedules");
        }

        tracing::info!(
            scan_interval_secs = self.config.scan_interval_secs,
            poll_interval_ms = self.config.poll_interval_ms,
            "Timeout runtime started"
        );

        let mut ticker = interval(self.config.poll_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(_) = trigger_rx.recv() => {}
                else => break,
            }

            if !*self.running.read().await {
                break;
            }

            if let Err(e) = self.run_once(Utc::now()).await {
                tracing::error!(error = %e, "Timeout runner tick failed");
            }
        }

        tracing::info!("Timeout runtime stopped");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);
        self.trigger().await;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
