//! Per-task timeout jobs
//!
//! Each handler re-reads the task first. A task that is no longer pending,
//! no longer due, or already handled makes the job a silent no-op, so
//! redelivery never duplicates a log entry or a node advance.

use crate::engine::{Engine, StepReport};
use crate::events::EventBus;
use crate::store::FlowStore;
use crate::task_manager::{apply_approval, apply_rejection};
use bpm_types::{Actor, FlowEvent, FlowResult, LogAction, TaskId, TimeoutAction};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// What an escalation or reminder job did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    AutoPassed,
    AutoRejected,
    Reminded,
    DueSoonNotified,
    /// Nothing to do; the reason is logged at debug
    Skipped,
}

pub struct TimeoutWorker {
    store: Arc<dyn FlowStore>,
    engine: Arc<Engine>,
    events: EventBus,
}

impl TimeoutWorker {
    pub fn new(store: Arc<dyn FlowStore>, engine: Arc<Engine>, events: EventBus) -> Self {
        Self {
            store,
            engine,
            events,
        }
    }

    /// Apply the node's timeout action to an overdue task
    pub async fn escalate(&self, task_id: &TaskId, now: DateTime<Utc>) -> FlowResult<TimeoutOutcome> {
        let mut tx = self.store.begin().await?;
        let Some(mut task) = tx.get_task(task_id).await? else {
            tracing::debug!(task_id = %task_id, "Escalation skipped: task gone");
            return Ok(TimeoutOutcome::Skipped);
        };
        if !task.is_overdue(now) || task.escalated_at.is_some() {
            tracing::debug!(task_id = %task_id, status = %task.status, "Escalation skipped: task not pending or not due");
            return Ok(TimeoutOutcome::Skipped);
        }
        let Some(instance) = tx.get_instance(&task.instance_id).await? else {
            return Ok(TimeoutOutcome::Skipped);
        };
        if !instance.is_running() || !instance.is_active_at(&task.node_id) {
            tracing::debug!(task_id = %task_id, instance_status = %instance.status, "Escalation skipped: instance closed or node passed");
            return Ok(TimeoutOutcome::Skipped);
        }
        let action = match tx.get_definition(&instance.definition_id).await? {
            Some(definition) => definition
                .node_config(&task.node_id)
                .and_then(|c| c.time_limit)
                .map(|limit| limit.action),
            None => None,
        };
        let Some(action) = action else {
            tracing::warn!(task_id = %task_id, node_id = %task.node_id, "Overdue task has no timeout action");
            return Ok(TimeoutOutcome::Skipped);
        };

        let system = Actor::System;
        let (outcome, report) = match action {
            TimeoutAction::AutoPass => {
                let report = apply_approval(
                    &self.engine,
                    tx.as_mut(),
                    task.clone(),
                    instance,
                    &system,
                    Some("Auto-approved after timeout".to_string()),
                    None,
                )
                .await?;
                (TimeoutOutcome::AutoPassed, report)
            }
            TimeoutAction::AutoReject => {
                let report = apply_rejection(
                    &self.engine,
                    tx.as_mut(),
                    task.clone(),
                    instance,
                    &system,
                    Some("Auto-rejected after timeout".to_string()),
                )
                .await?;
                (TimeoutOutcome::AutoRejected, report)
            }
            TimeoutAction::Remind => {
                task.escalated_at = Some(now);
                tx.save_task(&task).await?;

                let log = self
                    .engine
                    .system_log(instance.id.clone(), LogAction::Auto)
                    .for_task(task.id.clone(), task.node_id.clone())
                    .with_comment(Some(format!("Task overdue; reminded {}", task.assignee_name)))
                    .at(now);
                tx.append_log(&log).await?;

                let mut report = StepReport::default();
                report.events.push(FlowEvent::TaskUrged {
                    instance_id: instance.id.clone(),
                    task_id: task.id.clone(),
                    assignee_id: task.assignee_id.clone(),
                });
                (TimeoutOutcome::Reminded, report)
            }
        };

        tx.commit().await?;
        self.events.publish_all(report.events);
        tracing::info!(task_id = %task.id, instance_id = %task.instance_id, outcome = ?outcome, "Overdue task escalated");
        Ok(outcome)
    }

    /// Notify the assignee of a task that is about to fall due
    pub async fn remind(&self, task_id: &TaskId, now: DateTime<Utc>) -> FlowResult<TimeoutOutcome> {
        let mut tx = self.store.begin().await?;
        let Some(mut task) = tx.get_task(task_id).await? else {
            return Ok(TimeoutOutcome::Skipped);
        };
        let Some(due_at) = task.due_at else {
            return Ok(TimeoutOutcome::Skipped);
        };
        if !task.is_pending() || task.reminded_at.is_some() {
            tracing::debug!(task_id = %task_id, "Reminder skipped");
            return Ok(TimeoutOutcome::Skipped);
        }
        let Some(instance) = tx.get_instance(&task.instance_id).await? else {
            return Ok(TimeoutOutcome::Skipped);
        };
        if !instance.is_running() || !instance.is_active_at(&task.node_id) {
            tracing::debug!(task_id = %task_id, "Reminder skipped: node passed");
            return Ok(TimeoutOutcome::Skipped);
        }

        task.reminded_at = Some(now);
        tx.save_task(&task).await?;
        tx.commit().await?;

        self.events.publish(FlowEvent::TaskDueSoon {
            instance_id: task.instance_id.clone(),
            task_id: task.id.clone(),
            assignee_id: task.assignee_id.clone(),
            due_at,
        });
        tracing::debug!(task_id = %task.id, due_at = %due_at, "Due-soon reminder sent");
        Ok(TimeoutOutcome::DueSoonNotified)
    }
}
