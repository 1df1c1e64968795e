//! Instance service: starting, closing and querying flow instances

use crate::definition_service::main_definition;
use crate::engine::Engine;
use crate::events::EventBus;
use crate::store::{FlowStore, StoreTx};
use bpm_types::{
    Actor, CopyRecord, CopyRecordId, FlowError, FlowEvent, FlowInstance, FlowInstanceId, FlowLog,
    FlowResult, InstanceStatus, LogAction, RecordedStatus, Task, TaskStatus, UserId,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// An instance with everything recorded against it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceDetail {
    pub instance: FlowInstance,
    pub tasks: Vec<Task>,
    pub logs: Vec<FlowLog>,
    pub copies: Vec<CopyRecord>,
}

#[derive(Clone)]
pub struct InstanceService {
    store: Arc<dyn FlowStore>,
    engine: Arc<Engine>,
    events: EventBus,
}

impl InstanceService {
    pub fn new(store: Arc<dyn FlowStore>, engine: Arc<Engine>, events: EventBus) -> Self {
        Self {
            store,
            engine,
            events,
        }
    }

    /// Start a new instance of the main published version of `code`.
    ///
    /// The instance, its START log and whatever the first walk produces
    /// are written in one transaction. A walk that fails leaves nothing
    /// behind.
    pub async fn start(
        &self,
        code: &str,
        initiator: &Actor,
        title: Option<String>,
        form_data: Value,
    ) -> FlowResult<FlowInstance> {
        let initiator_id = initiator
            .user_id()
            .ok_or_else(|| FlowError::unauthorized("instances are started by users"))?;
        let form = match form_data {
            Value::Null => Value::Object(Map::new()),
            Value::Object(_) => form_data,
            other => {
                return Err(FlowError::validation(format!(
                    "form data must be an object, got {}",
                    other
                )))
            }
        };

        let user = self
            .engine
            .resolver()
            .directory()
            .user(initiator_id)
            .await?
            .filter(|u| u.is_active())
            .ok_or_else(|| FlowError::validation(format!("unknown initiator {}", initiator_id)))?;

        let mut tx = self.store.begin().await?;
        let definition = main_definition(tx.as_mut(), code).await?;
        definition.validate_form(&form)?;

        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("{} - {}", definition.name, user.name));
        let instance = FlowInstance::new(
            definition.id.clone(),
            definition.code.clone(),
            definition.version,
            initiator_id.clone(),
            form,
        )
        .with_title(title)
        .with_initiator(user.name.clone(), user.dept_id.clone());
        let instance_id = instance.id.clone();
        tx.save_instance(&instance).await?;

        let mut log = self
            .engine
            .log_for(instance_id.clone(), LogAction::Start, initiator)
            .with_comment(Some(instance.title.clone()))
            .at(instance.started_at);
        log.after = Some(RecordedStatus::Instance(InstanceStatus::Running));
        tx.append_log(&log).await?;

        let report = self.engine.start_flow(tx.as_mut(), &instance_id, initiator).await?;
        let instance = require(tx.as_mut(), &instance_id).await?;
        tx.commit().await?;

        self.events.publish(FlowEvent::FlowStarted {
            instance_id: instance_id.clone(),
            definition_code: definition.code.clone(),
            initiator_id: initiator_id.clone(),
        });
        self.events.publish_all(report.events);

        tracing::info!(
            instance_id = %instance_id,
            definition = %definition.code,
            version = definition.version,
            initiator = %initiator_id,
            status = %instance.status,
            tasks = report.created_tasks.len(),
            "Flow instance started"
        );
        Ok(instance)
    }

    /// Withdraw a running instance. Only its initiator may cancel.
    pub async fn cancel(
        &self,
        instance_id: &FlowInstanceId,
        actor: &Actor,
        reason: Option<String>,
    ) -> FlowResult<FlowInstance> {
        let mut tx = self.store.begin().await?;
        let instance = require(tx.as_mut(), instance_id).await?;
        if !actor.is(&instance.initiator_id) {
            return Err(FlowError::unauthorized("only the initiator may cancel an instance"));
        }
        ensure_running(&instance)?;

        let instance = self
            .close(tx.as_mut(), instance, InstanceStatus::Cancelled, actor, reason)
            .await?;
        tx.commit().await?;

        self.events.publish(FlowEvent::FlowCancelled {
            instance_id: instance.id.clone(),
        });
        tracing::info!(instance_id = %instance.id, actor = %actor, "Flow instance cancelled");
        Ok(instance)
    }

    /// Force a running instance to end. Requires the admin role.
    pub async fn terminate(
        &self,
        instance_id: &FlowInstanceId,
        actor: &Actor,
        reason: String,
    ) -> FlowResult<FlowInstance> {
        self.require_admin(actor).await?;

        let mut tx = self.store.begin().await?;
        let instance = require(tx.as_mut(), instance_id).await?;
        ensure_running(&instance)?;

        let instance = self
            .close(
                tx.as_mut(),
                instance,
                InstanceStatus::Terminated,
                actor,
                Some(reason.clone()),
            )
            .await?;
        tx.commit().await?;

        self.events.publish(FlowEvent::FlowTerminated {
            instance_id: instance.id.clone(),
            reason,
        });
        tracing::warn!(instance_id = %instance.id, actor = %actor, "Flow instance terminated by admin");
        Ok(instance)
    }

    pub async fn get(&self, instance_id: &FlowInstanceId) -> FlowResult<FlowInstance> {
        let mut tx = self.store.begin().await?;
        require(tx.as_mut(), instance_id).await
    }

    pub async fn detail(&self, instance_id: &FlowInstanceId) -> FlowResult<InstanceDetail> {
        let mut tx = self.store.begin().await?;
        let instance = require(tx.as_mut(), instance_id).await?;
        let tasks = tx.tasks_for_instance(instance_id).await?;
        let logs = tx.logs_for_instance(instance_id).await?;
        let copies = tx.copies_for_instance(instance_id).await?;
        Ok(InstanceDetail {
            instance,
            tasks,
            logs,
            copies,
        })
    }

    /// Instances a user started, newest first
    pub async fn started_by(&self, user: &UserId) -> FlowResult<Vec<FlowInstance>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.instances_by_initiator(user).await?)
    }

    /// Pending tasks assigned to a user, oldest first
    pub async fn todo(&self, user: &UserId) -> FlowResult<Vec<Task>> {
        let mut tx = self.store.begin().await?;
        let tasks = tx.tasks_for_assignee(user).await?;
        Ok(tasks.into_iter().filter(|t| t.is_pending()).collect())
    }

    /// Tasks a user has resolved, most recently resolved first
    pub async fn done(&self, user: &UserId) -> FlowResult<Vec<Task>> {
        let mut tx = self.store.begin().await?;
        let mut tasks: Vec<Task> = tx
            .tasks_for_assignee(user)
            .await?
            .into_iter()
            .filter(|t| t.status.is_terminal())
            .collect();
        tasks.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        Ok(tasks)
    }

    pub async fn copies_for(&self, user: &UserId) -> FlowResult<Vec<CopyRecord>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.copies_for_recipient(user).await?)
    }

    /// Mark a CC record read. Only the recipient may; the first read time
    /// is kept on repeated calls.
    pub async fn mark_copy_read(&self, copy_id: &CopyRecordId, actor: &Actor) -> FlowResult<CopyRecord> {
        let mut tx = self.store.begin().await?;
        let mut copy = tx
            .get_copy(copy_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("copy record {}", copy_id)))?;
        if !actor.is(&copy.recipient_id) {
            return Err(FlowError::unauthorized("only the recipient may mark a copy read"));
        }
        if copy.mark_read(Utc::now()) {
            tx.save_copy(&copy).await?;
            tx.commit().await?;
        }
        Ok(copy)
    }

    async fn require_admin(&self, actor: &Actor) -> FlowResult<()> {
        let admin_role = &self.engine.config().admin_role;
        let Some(user_id) = actor.user_id() else {
            return Ok(());
        };
        let user = self.engine.resolver().directory().user(user_id).await?;
        match user {
            Some(user) if user.is_active() && user.has_role(admin_role) => Ok(()),
            _ => Err(FlowError::unauthorized(format!(
                "{} does not hold the {} role",
                actor, admin_role
            ))),
        }
    }

    /// Cancel every pending task and end the instance with `status`
    async fn close(
        &self,
        tx: &mut dyn StoreTx,
        mut instance: FlowInstance,
        status: InstanceStatus,
        actor: &Actor,
        reason: Option<String>,
    ) -> FlowResult<FlowInstance> {
        let now = Utc::now();
        let mut cancelled = 0usize;
        for mut task in tx.tasks_for_instance(&instance.id).await? {
            if task.is_pending() {
                task.resolve(TaskStatus::Cancelled, None, None, now);
                tx.save_task(&task).await?;
                cancelled += 1;
            }
        }

        let before = instance.status;
        if reason.is_some() {
            instance.remark = reason.clone();
        }
        instance.finish(status, now);
        tx.save_instance(&instance).await?;

        let action = match status {
            InstanceStatus::Cancelled => LogAction::Cancel,
            _ => LogAction::Terminate,
        };
        let log = self
            .engine
            .log_for(instance.id.clone(), action, actor)
            .transition(
                RecordedStatus::Instance(before),
                RecordedStatus::Instance(status),
            )
            .with_comment(reason)
            .at(now);
        tx.append_log(&log).await?;

        tracing::debug!(instance_id = %instance.id, cancelled, "Pending tasks cancelled");
        Ok(instance)
    }
}

async fn require(tx: &mut dyn StoreTx, id: &FlowInstanceId) -> FlowResult<FlowInstance> {
    tx.get_instance(id)
        .await?
        .ok_or_else(|| FlowError::InstanceNotFound(id.clone()))
}

fn ensure_running(instance: &FlowInstance) -> FlowResult<()> {
    if instance.is_running() {
        Ok(())
    } else {
        Err(FlowError::precondition(format!(
            "instance {} is {}",
            instance.id, instance.status
        )))
    }
}
