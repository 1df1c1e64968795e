//! Storage trait definitions

use crate::error::StoreResult;
use async_trait::async_trait;
use bpm_types::{
    CopyRecord, CopyRecordId, FlowDefinition, FlowDefinitionId, FlowInstance, FlowInstanceId,
    FlowLog, NodeId, ParallelBranchState, Task, TaskId, UserId,
};
use chrono::{DateTime, Utc};

/// Durable store for flow state. All access goes through a transaction.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Open a transaction. Dropping it without [`StoreTx::commit`] discards
    /// every staged write.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;
}

/// One atomic unit of work across every flow table.
///
/// Reads observe this transaction's own staged writes. Flow logs are
/// append-only: there is no way to update or delete one.
#[async_trait]
pub trait StoreTx: Send {
    // ── Definitions ──────────────────────────────────────────────────

    async fn get_definition(&mut self, id: &FlowDefinitionId) -> StoreResult<Option<FlowDefinition>>;

    /// Every version of a code, ascending by version
    async fn definitions_by_code(&mut self, code: &str) -> StoreResult<Vec<FlowDefinition>>;

    async fn list_definitions(&mut self) -> StoreResult<Vec<FlowDefinition>>;

    async fn save_definition(&mut self, definition: &FlowDefinition) -> StoreResult<()>;

    // ── Instances ────────────────────────────────────────────────────

    async fn get_instance(&mut self, id: &FlowInstanceId) -> StoreResult<Option<FlowInstance>>;

    /// Instances started by a user, newest first
    async fn instances_by_initiator(&mut self, user: &UserId) -> StoreResult<Vec<FlowInstance>>;

    async fn save_instance(&mut self, instance: &FlowInstance) -> StoreResult<()>;

    // ── Tasks ────────────────────────────────────────────────────────

    async fn get_task(&mut self, id: &TaskId) -> StoreResult<Option<Task>>;

    /// Tasks of an instance in creation order
    async fn tasks_for_instance(&mut self, instance: &FlowInstanceId) -> StoreResult<Vec<Task>>;

    /// Tasks of one node of an instance in creation order
    async fn tasks_at_node(&mut self, instance: &FlowInstanceId, node: &NodeId)
        -> StoreResult<Vec<Task>>;

    /// Every task assigned to a user, in creation order
    async fn tasks_for_assignee(&mut self, user: &UserId) -> StoreResult<Vec<Task>>;

    /// Pending tasks due at or before `until` that still need a timeout job,
    /// earliest first. Tasks due by `now` qualify until escalated; later
    /// ones until reminded.
    async fn tasks_awaiting_timeout(
        &mut self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Task>>;

    /// Resolved tasks that still carry a due time
    async fn resolved_tasks_with_due(&mut self, limit: usize) -> StoreResult<Vec<Task>>;

    async fn save_task(&mut self, task: &Task) -> StoreResult<()>;

    // ── Audit ────────────────────────────────────────────────────────

    async fn append_log(&mut self, log: &FlowLog) -> StoreResult<()>;

    /// Log entries of an instance in append order
    async fn logs_for_instance(&mut self, instance: &FlowInstanceId) -> StoreResult<Vec<FlowLog>>;

    // ── CC records ───────────────────────────────────────────────────

    async fn get_copy(&mut self, id: &CopyRecordId) -> StoreResult<Option<CopyRecord>>;

    async fn copies_for_instance(&mut self, instance: &FlowInstanceId)
        -> StoreResult<Vec<CopyRecord>>;

    async fn copies_for_recipient(&mut self, user: &UserId) -> StoreResult<Vec<CopyRecord>>;

    async fn save_copy(&mut self, copy: &CopyRecord) -> StoreResult<()>;

    // ── Parallel branches ────────────────────────────────────────────

    async fn get_branch_state(
        &mut self,
        instance: &FlowInstanceId,
        node: &NodeId,
    ) -> StoreResult<Option<ParallelBranchState>>;

    async fn save_branch_state(&mut self, state: &ParallelBranchState) -> StoreResult<()>;

    /// Make every staged write durable
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
