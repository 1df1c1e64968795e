//! Task manager: lifecycle operations on individual approval tasks
//!
//! Every operation runs in one transaction and re-reads the task and its
//! instance inside it before writing. A task that is no longer PENDING or
//! whose node the flow has moved past, or an instance that is no longer
//! RUNNING, fails with a precondition error and nothing is written. Events are published only after commit.

use crate::engine::{Engine, StepReport};
use crate::events::EventBus;
use crate::store::{FlowStore, StoreTx};
use bpm_types::{
    Actor, DirectoryUser, FlowError, FlowEvent, FlowInstance, FlowResult, InstanceStatus,
    LogAction, RecordedStatus, Task, TaskId, TaskResult, TaskStatus, UserId,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Result of a task action
#[derive(Debug, Clone)]
pub struct TaskActionOutcome {
    /// The acted-on task after the action
    pub task: Task,
    /// Instance status after the action, including any engine advance
    pub instance_status: InstanceStatus,
    /// Tasks created by the action (transfer, countersign, next nodes)
    pub created_tasks: Vec<TaskId>,
}

/// Approve / reject / transfer / countersign / urge
#[derive(Clone)]
pub struct TaskManager {
    store: Arc<dyn FlowStore>,
    engine: Arc<Engine>,
    events: EventBus,
}

impl TaskManager {
    pub fn new(store: Arc<dyn FlowStore>, engine: Arc<Engine>, events: EventBus) -> Self {
        Self {
            store,
            engine,
            events,
        }
    }

    /// Approve a pending task and advance the flow. `form_data`, when an
    /// object, is merged into the instance's form snapshot first so
    /// downstream conditions see it.
    pub async fn approve(
        &self,
        task_id: &TaskId,
        actor: &Actor,
        comment: Option<String>,
        form_data: Option<Value>,
    ) -> FlowResult<TaskActionOutcome> {
        let mut tx = self.store.begin().await?;
        let (task, instance) = load_for_assignee(tx.as_mut(), task_id, actor).await?;

        let report = apply_approval(
            &self.engine,
            tx.as_mut(),
            task,
            instance,
            actor,
            comment,
            form_data.as_ref(),
        )
        .await?;

        let outcome = outcome_after(tx.as_mut(), task_id, report.created_tasks.clone()).await?;
        tx.commit().await?;
        self.events.publish_all(report.events);

        tracing::info!(task_id = %task_id, actor = %actor, instance_status = %outcome.instance_status, "Task approved");
        Ok(outcome)
    }

    /// Reject a pending task: cancels its pending siblings at the node and
    /// ends the instance as REJECTED.
    pub async fn reject(
        &self,
        task_id: &TaskId,
        actor: &Actor,
        comment: Option<String>,
    ) -> FlowResult<TaskActionOutcome> {
        let mut tx = self.store.begin().await?;
        let (task, instance) = load_for_assignee(tx.as_mut(), task_id, actor).await?;

        let report = apply_rejection(&self.engine, tx.as_mut(), task, instance, actor, comment).await?;

        let outcome = outcome_after(tx.as_mut(), task_id, Vec::new()).await?;
        tx.commit().await?;
        self.events.publish_all(report.events);

        tracing::info!(task_id = %task_id, actor = %actor, "Task rejected");
        Ok(outcome)
    }

    /// Hand a pending task to another user at the same node
    pub async fn transfer(
        &self,
        task_id: &TaskId,
        actor: &Actor,
        target: &UserId,
        comment: Option<String>,
    ) -> FlowResult<TaskActionOutcome> {
        let mut tx = self.store.begin().await?;
        let (mut task, instance) = load_for_assignee(tx.as_mut(), task_id, actor).await?;

        if target == &task.assignee_id {
            return Err(FlowError::validation("cannot transfer a task to its current assignee"));
        }
        ensure_not_pending_at_node(tx.as_mut(), &task, std::slice::from_ref(target)).await?;
        let target_user = self.require_active_users(std::slice::from_ref(target)).await?;
        let target_user = target_user
            .into_iter()
            .next()
            .ok_or_else(|| FlowError::validation(format!("unknown transfer target {}", target)))?;

        let now = Utc::now();
        task.resolve(
            TaskStatus::Transferred,
            Some(TaskResult::Transferred),
            comment.clone(),
            now,
        );
        tx.save_task(&task).await?;

        let new_task = derived_task(&task, &target_user, now);
        tx.save_task(&new_task).await?;

        let log = self
            .engine
            .log_for(instance.id.clone(), LogAction::Transfer, actor)
            .for_task(task.id.clone(), task.node_id.clone())
            .transition(
                RecordedStatus::Task(TaskStatus::Pending),
                RecordedStatus::Task(TaskStatus::Transferred),
            )
            .with_comment(Some(match &comment {
                Some(c) => format!("Transferred to {}: {}", target_user.name, c),
                None => format!("Transferred to {}", target_user.name),
            }))
            .at(now);
        tx.append_log(&log).await?;

        tx.commit().await?;
        self.events.publish(task_created(&new_task));

        tracing::info!(task_id = %task.id, new_task_id = %new_task.id, target = %target, "Task transferred");
        Ok(TaskActionOutcome {
            task,
            instance_status: instance.status,
            created_tasks: vec![new_task.id],
        })
    }

    /// Add approvers at the same node. The node then waits until every
    /// pending task at it has cleared.
    pub async fn countersign(
        &self,
        task_id: &TaskId,
        actor: &Actor,
        user_ids: &[UserId],
        comment: Option<String>,
    ) -> FlowResult<TaskActionOutcome> {
        if user_ids.is_empty() {
            return Err(FlowError::validation("countersign requires at least one user"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = user_ids.iter().find(|id| !seen.insert(*id)) {
            return Err(FlowError::validation(format!("duplicate countersign user {}", dup)));
        }

        let mut tx = self.store.begin().await?;
        let (mut task, instance) = load_for_assignee(tx.as_mut(), task_id, actor).await?;
        ensure_not_pending_at_node(tx.as_mut(), &task, user_ids).await?;
        let users = self.require_active_users(user_ids).await?;

        let now = Utc::now();
        task.resolve(
            TaskStatus::Countersigned,
            Some(TaskResult::Countersigned),
            comment.clone(),
            now,
        );
        tx.save_task(&task).await?;

        let mut created = Vec::with_capacity(users.len());
        for user in &users {
            let new_task = derived_task(&task, user, now);
            tx.save_task(&new_task).await?;
            created.push(new_task);
        }

        let names: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
        let log = self
            .engine
            .log_for(instance.id.clone(), LogAction::Countersign, actor)
            .for_task(task.id.clone(), task.node_id.clone())
            .transition(
                RecordedStatus::Task(TaskStatus::Pending),
                RecordedStatus::Task(TaskStatus::Countersigned),
            )
            .with_comment(Some(match &comment {
                Some(c) => format!("Countersign added {}: {}", names.join(", "), c),
                None => format!("Countersign added {}", names.join(", ")),
            }))
            .at(now);
        tx.append_log(&log).await?;

        tx.commit().await?;
        self.events.publish_all(created.iter().map(task_created));

        tracing::info!(task_id = %task.id, added = created.len(), "Task countersigned");
        Ok(TaskActionOutcome {
            task,
            instance_status: instance.status,
            created_tasks: created.into_iter().map(|t| t.id).collect(),
        })
    }

    /// Nudge the assignee of a pending task. Only the initiator may urge;
    /// the only effect is an URGE log entry and a TASK_URGED event.
    pub async fn urge(
        &self,
        task_id: &TaskId,
        actor: &Actor,
        comment: Option<String>,
    ) -> FlowResult<TaskActionOutcome> {
        let mut tx = self.store.begin().await?;
        let task = tx
            .get_task(task_id)
            .await?
            .ok_or_else(|| FlowError::TaskNotFound(task_id.clone()))?;
        let instance = load_instance(tx.as_mut(), &task).await?;

        if !actor.is(&instance.initiator_id) {
            return Err(FlowError::unauthorized("only the initiator may urge a task"));
        }
        ensure_actionable(&task, &instance)?;

        let log = self
            .engine
            .log_for(instance.id.clone(), LogAction::Urge, actor)
            .for_task(task.id.clone(), task.node_id.clone())
            .with_comment(comment);
        tx.append_log(&log).await?;
        tx.commit().await?;

        self.events.publish(FlowEvent::TaskUrged {
            instance_id: instance.id.clone(),
            task_id: task.id.clone(),
            assignee_id: task.assignee_id.clone(),
        });
        tracing::info!(task_id = %task.id, assignee = %task.assignee_id, "Task urged");

        Ok(TaskActionOutcome {
            task,
            instance_status: instance.status,
            created_tasks: Vec::new(),
        })
    }

    async fn require_active_users(&self, ids: &[UserId]) -> FlowResult<Vec<DirectoryUser>> {
        let users = self.engine.resolver().directory().users_by_ids(ids).await?;
        for id in ids {
            match users.iter().find(|u| &u.id == id) {
                Some(user) if user.is_active() => {}
                Some(_) => return Err(FlowError::validation(format!("user {} is disabled", id))),
                None => return Err(FlowError::validation(format!("unknown user {}", id))),
            }
        }
        Ok(users)
    }
}

async fn load_instance(tx: &mut dyn StoreTx, task: &Task) -> FlowResult<FlowInstance> {
    tx.get_instance(&task.instance_id)
        .await?
        .ok_or_else(|| FlowError::InstanceNotFound(task.instance_id.clone()))
}

fn ensure_actionable(task: &Task, instance: &FlowInstance) -> FlowResult<()> {
    if !task.is_pending() {
        return Err(FlowError::precondition(format!(
            "task {} is already {}",
            task.id, task.status
        )));
    }
    if !instance.is_running() {
        return Err(FlowError::precondition(format!(
            "instance {} is {}",
            instance.id, instance.status
        )));
    }
    // a sibling left pending by an OR_SIGN node the flow has moved past
    if !instance.is_active_at(&task.node_id) {
        return Err(FlowError::precondition(format!(
            "node {} of instance {} is no longer active",
            task.node_id, instance.id
        )));
    }
    Ok(())
}

/// Re-read the task and its instance and check the guards every
/// assignee action shares.
async fn load_for_assignee(
    tx: &mut dyn StoreTx,
    task_id: &TaskId,
    actor: &Actor,
) -> FlowResult<(Task, FlowInstance)> {
    let task = tx
        .get_task(task_id)
        .await?
        .ok_or_else(|| FlowError::TaskNotFound(task_id.clone()))?;
    let instance = load_instance(tx, &task).await?;

    ensure_actionable(&task, &instance)?;
    if !actor.is(&task.assignee_id) {
        return Err(FlowError::unauthorized(format!(
            "{} is not the assignee of task {}",
            actor, task.id
        )));
    }
    Ok((task, instance))
}

async fn outcome_after(
    tx: &mut dyn StoreTx,
    task_id: &TaskId,
    created_tasks: Vec<TaskId>,
) -> FlowResult<TaskActionOutcome> {
    let task = tx
        .get_task(task_id)
        .await?
        .ok_or_else(|| FlowError::TaskNotFound(task_id.clone()))?;
    let instance = load_instance(tx, &task).await?;
    Ok(TaskActionOutcome {
        task,
        instance_status: instance.status,
        created_tasks,
    })
}

/// Reject users who already hold another pending task at the task's node
async fn ensure_not_pending_at_node(
    tx: &mut dyn StoreTx,
    task: &Task,
    users: &[UserId],
) -> FlowResult<()> {
    let holders: HashSet<UserId> = tx
        .tasks_at_node(&task.instance_id, &task.node_id)
        .await?
        .into_iter()
        .filter(|t| t.is_pending() && t.id != task.id)
        .map(|t| t.assignee_id)
        .collect();
    match users.iter().find(|u| holders.contains(*u)) {
        Some(user) => Err(FlowError::validation(format!(
            "{} already has a pending task at node {}",
            user, task.node_id
        ))),
        None => Ok(()),
    }
}

fn derived_task(source: &Task, user: &DirectoryUser, now: chrono::DateTime<Utc>) -> Task {
    Task::pending(source.instance_id.clone(), source.node_id.clone(), user.id.clone(), now)
        .with_node_name(source.node_name.clone())
        .with_assignee_name(user.name.clone())
        .with_due_at(source.due_at)
        .with_source(source.id.clone())
}

fn task_created(task: &Task) -> FlowEvent {
    FlowEvent::TaskCreated {
        instance_id: task.instance_id.clone(),
        task_id: task.id.clone(),
        node_id: task.node_id.clone(),
        assignee_id: task.assignee_id.clone(),
    }
}

/// Approval effect shared by manual approval and AUTO_PASS escalation.
/// The caller has already checked the guards.
pub(crate) async fn apply_approval(
    engine: &Engine,
    tx: &mut dyn StoreTx,
    mut task: Task,
    mut instance: FlowInstance,
    actor: &Actor,
    comment: Option<String>,
    form_data: Option<&Value>,
) -> FlowResult<StepReport> {
    let now = Utc::now();
    task.resolve(
        TaskStatus::Completed,
        Some(TaskResult::Approved),
        comment.clone(),
        now,
    );
    tx.save_task(&task).await?;

    if let Some(form) = form_data.filter(|f| f.is_object()) {
        instance.merge_form(form);
        instance.updated_at = now;
        tx.save_instance(&instance).await?;
    }

    let log = engine
        .log_for(instance.id.clone(), LogAction::Approve, actor)
        .for_task(task.id.clone(), task.node_id.clone())
        .transition(
            RecordedStatus::Task(TaskStatus::Pending),
            RecordedStatus::Task(TaskStatus::Completed),
        )
        .with_comment(comment)
        .at(now);
    tx.append_log(&log).await?;

    let mut report = StepReport::default();
    report.events.push(FlowEvent::TaskApproved {
        instance_id: instance.id.clone(),
        task_id: task.id.clone(),
        node_id: task.node_id.clone(),
    });

    let advanced = engine
        .advance_flow(tx, &instance.id, &task.node_id, TaskResult::Approved, actor)
        .await?;
    report.merge(advanced);
    Ok(report)
}

/// Rejection effect shared by manual rejection and AUTO_REJECT escalation:
/// the task is rejected, its pending siblings at the node are cancelled,
/// and the instance ends as REJECTED. The caller has already checked the
/// guards.
pub(crate) async fn apply_rejection(
    engine: &Engine,
    tx: &mut dyn StoreTx,
    mut task: Task,
    mut instance: FlowInstance,
    actor: &Actor,
    comment: Option<String>,
) -> FlowResult<StepReport> {
    let now = Utc::now();
    task.resolve(
        TaskStatus::Completed,
        Some(TaskResult::Rejected),
        comment.clone(),
        now,
    );
    tx.save_task(&task).await?;

    let siblings = tx.tasks_at_node(&instance.id, &task.node_id).await?;
    let mut cancelled = 0usize;
    for mut sibling in siblings
        .into_iter()
        .filter(|t| t.is_pending() && t.id != task.id)
    {
        sibling.resolve(TaskStatus::Cancelled, None, None, now);
        tx.save_task(&sibling).await?;
        cancelled += 1;
    }

    let before = instance.status;
    instance.finish(InstanceStatus::Rejected, now);
    tx.save_instance(&instance).await?;

    let log = engine
        .log_for(instance.id.clone(), LogAction::Reject, actor)
        .for_task(task.id.clone(), task.node_id.clone())
        .transition(
            RecordedStatus::Instance(before),
            RecordedStatus::Instance(InstanceStatus::Rejected),
        )
        .with_comment(comment)
        .at(now);
    tx.append_log(&log).await?;

    tracing::info!(
        instance_id = %instance.id,
        node_id = %task.node_id,
        cancelled_siblings = cancelled,
        "Flow rejected"
    );

    let mut report = StepReport::default();
    report.events.push(FlowEvent::TaskRejected {
        instance_id: instance.id.clone(),
        task_id: task.id.clone(),
        node_id: task.node_id.clone(),
    });
    report.events.push(FlowEvent::FlowRejected {
        instance_id: instance.id.clone(),
        node_id: task.node_id.clone(),
    });
    Ok(report)
}
