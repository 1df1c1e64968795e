//! Periodic scans that turn due tasks into jobs

use super::{job_options, TaskJob, ESCALATE_JOB, REMIND_JOB};
use crate::config::TimeoutConfig;
use crate::queue::JobQueue;
use crate::store::FlowStore;
use bpm_types::FlowResult;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// What one scan enqueued
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub escalations: usize,
    pub reminders: usize,
}

/// Finds pending tasks that are overdue or about to be, and enqueues one
/// keyed job per task. Overlapping scans do not duplicate jobs.
pub struct TimeoutScheduler {
    store: Arc<dyn FlowStore>,
    queue: Arc<dyn JobQueue>,
    config: TimeoutConfig,
}

impl TimeoutScheduler {
    pub fn new(store: Arc<dyn FlowStore>, queue: Arc<dyn JobQueue>, config: TimeoutConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub async fn scan(&self, now: DateTime<Utc>) -> FlowResult<ScanSummary> {
        let horizon = now + self.config.reminder_lookahead();
        let tasks = {
            let mut tx = self.store.begin().await?;
            tx.tasks_awaiting_timeout(now, horizon, self.config.scan_batch_size)
                .await?
        };

        let mut summary = ScanSummary::default();
        for task in tasks {
            let Some(due_at) = task.due_at else {
                continue;
            };
            let payload = TaskJob::payload(&task.id)?;

            if due_at <= now {
                let options = job_options(&self.config).with_key(format!("escalate:{}", task.id));
                if self.queue.enqueue(ESCALATE_JOB, payload, options).await?.is_some() {
                    summary.escalations += 1;
                }
            } else {
                let options = job_options(&self.config).with_key(format!("remind:{}", task.id));
                if self.queue.enqueue(REMIND_JOB, payload, options).await?.is_some() {
                    summary.reminders += 1;
                }
            }
        }

        if summary.escalations + summary.reminders > 0 {
            tracing::info!(
                escalations = summary.escalations,
                reminders = summary.reminders,
                "Timeout scan enqueued jobs"
            );
        }
        Ok(summary)
    }

    /// Clear due times left on tasks that are no longer pending
    pub async fn cleanup(&self) -> FlowResult<usize> {
        let mut tx = self.store.begin().await?;
        let tasks = tx.resolved_tasks_with_due(self.config.scan_batch_size).await?;
        let cleared = tasks.len();
        for mut task in tasks {
            task.due_at = None;
            tx.save_task(&task).await?;
        }
        tx.commit().await?;

        if cleared > 0 {
            tracing::debug!(cleared, "Cleared due times on resolved tasks");
        }
        Ok(cleared)
    }
}
