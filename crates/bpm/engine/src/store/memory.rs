//! In-memory storage implementation
//!
//! Transactions are fully serialized: `begin` takes an owned lock on the
//! shared state, writes go to a private copy, and `commit` swaps the copy
//! in. Dropping the transaction releases the lock and discards the copy.

use super::traits::*;
use crate::error::StoreResult;
use async_trait::async_trait;
use bpm_types::{
    CopyRecord, CopyRecordId, FlowDefinition, FlowDefinitionId, FlowInstance, FlowInstanceId,
    FlowLog, NodeId, ParallelBranchState, Task, TaskId, UserId,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default, Clone)]
struct StoreState {
    definitions: IndexMap<FlowDefinitionId, FlowDefinition>,
    instances: IndexMap<FlowInstanceId, FlowInstance>,
    tasks: IndexMap<TaskId, Task>,
    logs: Vec<FlowLog>,
    copies: IndexMap<CopyRecordId, CopyRecord>,
    branches: HashMap<(FlowInstanceId, NodeId), ParallelBranchState>,
}

/// In-memory store for development and testing
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<StoreState>,
    staged: StoreState,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_definition(&mut self, id: &FlowDefinitionId) -> StoreResult<Option<FlowDefinition>> {
        Ok(self.staged.definitions.get(id).cloned())
    }

    async fn definitions_by_code(&mut self, code: &str) -> StoreResult<Vec<FlowDefinition>> {
        let mut defs: Vec<FlowDefinition> = self
            .staged
            .definitions
            .values()
            .filter(|d| d.code == code)
            .cloned()
            .collect();
        defs.sort_by_key(|d| d.version);
        Ok(defs)
    }

    async fn list_definitions(&mut self) -> StoreResult<Vec<FlowDefinition>> {
        Ok(self.staged.definitions.values().cloned().collect())
    }

    async fn save_definition(&mut self, definition: &FlowDefinition) -> StoreResult<()> {
        self.staged
            .definitions
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn get_instance(&mut self, id: &FlowInstanceId) -> StoreResult<Option<FlowInstance>> {
        Ok(self.staged.instances.get(id).cloned())
    }

    async fn instances_by_initiator(&mut self, user: &UserId) -> StoreResult<Vec<FlowInstance>> {
        let mut out: Vec<FlowInstance> = self
            .staged
            .instances
            .values()
            .filter(|i| &i.initiator_id == user)
            .cloned()
            .collect();
        out.reverse();
        Ok(out)
    }

    async fn save_instance(&mut self, instance: &FlowInstance) -> StoreResult<()> {
        self.staged
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn get_task(&mut self, id: &TaskId) -> StoreResult<Option<Task>> {
        Ok(self.staged.tasks.get(id).cloned())
    }

    async fn tasks_for_instance(&mut self, instance: &FlowInstanceId) -> StoreResult<Vec<Task>> {
        Ok(self
            .staged
            .tasks
            .values()
            .filter(|t| &t.instance_id == instance)
            .cloned()
            .collect())
    }

    async fn tasks_at_node(
        &mut self,
        instance: &FlowInstanceId,
        node: &NodeId,
    ) -> StoreResult<Vec<Task>> {
        Ok(self
            .staged
            .tasks
            .values()
            .filter(|t| &t.instance_id == instance && &t.node_id == node)
            .cloned()
            .collect())
    }

    async fn tasks_for_assignee(&mut self, user: &UserId) -> StoreResult<Vec<Task>> {
        Ok(self
            .staged
            .tasks
            .values()
            .filter(|t| &t.assignee_id == user)
            .cloned()
            .collect())
    }

    async fn tasks_awaiting_timeout(
        &mut self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Task>> {
        let mut due: Vec<Task> = self
            .staged
            .tasks
            .values()
            .filter(|t| t.awaits_timeout_job(now) && t.due_at.is_some_and(|d| d <= until))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.due_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn resolved_tasks_with_due(&mut self, limit: usize) -> StoreResult<Vec<Task>> {
        Ok(self
            .staged
            .tasks
            .values()
            .filter(|t| !t.is_pending() && t.due_at.is_some())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_task(&mut self, task: &Task) -> StoreResult<()> {
        self.staged.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn append_log(&mut self, log: &FlowLog) -> StoreResult<()> {
        self.staged.logs.push(log.clone());
        Ok(())
    }

    async fn logs_for_instance(&mut self, instance: &FlowInstanceId) -> StoreResult<Vec<FlowLog>> {
        Ok(self
            .staged
            .logs
            .iter()
            .filter(|l| &l.instance_id == instance)
            .cloned()
            .collect())
    }

    async fn get_copy(&mut self, id: &CopyRecordId) -> StoreResult<Option<CopyRecord>> {
        Ok(self.staged.copies.get(id).cloned())
    }

    async fn copies_for_instance(
        &mut self,
        instance: &FlowInstanceId,
    ) -> StoreResult<Vec<CopyRecord>> {
        Ok(self
            .staged
            .copies
            .values()
            .filter(|c| &c.instance_id == instance)
            .cloned()
            .collect())
    }

    async fn copies_for_recipient(&mut self, user: &UserId) -> StoreResult<Vec<CopyRecord>> {
        Ok(self
            .staged
            .copies
            .values()
            .filter(|c| &c.recipient_id == user)
            .cloned()
            .collect())
    }

    async fn save_copy(&mut self, copy: &CopyRecord) -> StoreResult<()> {
        self.staged.copies.insert(copy.id.clone(), copy.clone());
        Ok(())
    }

    async fn get_branch_state(
        &mut self,
        instance: &FlowInstanceId,
        node: &NodeId,
    ) -> StoreResult<Option<ParallelBranchState>> {
        Ok(self
            .staged
            .branches
            .get(&(instance.clone(), node.clone()))
            .cloned())
    }

    async fn save_branch_state(&mut self, state: &ParallelBranchState) -> StoreResult<()> {
        self.staged.branches.insert(
            (state.instance_id.clone(), state.node_id.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}
