//! Audit trail and CC records
//!
//! Flow logs are append-only: once written an entry is never updated or
//! deleted. They are always written in the same transaction as the state
//! change they describe.

use crate::{
    Actor, CopyRecordId, FlowInstanceId, FlowLogId, InstanceStatus, NodeId, TaskId, TaskStatus,
    UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogAction {
    Start,
    Approve,
    Reject,
    Transfer,
    Countersign,
    Cancel,
    Terminate,
    Auto,
    Urge,
}

/// Status captured before or after an action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordedStatus {
    Instance(InstanceStatus),
    Task(TaskStatus),
}

/// One audit entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowLog {
    pub id: FlowLogId,
    pub instance_id: FlowInstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub action: LogAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<RecordedStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<RecordedStatus>,
    /// `None` for system-attributed entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<UserId>,
    pub operator_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FlowLog {
    pub fn new(instance_id: FlowInstanceId, action: LogAction, actor: &Actor) -> Self {
        Self {
            id: FlowLogId::generate(),
            instance_id,
            task_id: None,
            node_id: None,
            action,
            before: None,
            after: None,
            operator_id: actor.user_id().cloned(),
            operator_name: actor.display_name().to_string(),
            comment: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_id: TaskId, node_id: NodeId) -> Self {
        self.task_id = Some(task_id);
        self.node_id = Some(node_id);
        self
    }

    pub fn at_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn transition(mut self, before: RecordedStatus, after: RecordedStatus) -> Self {
        self.before = Some(before);
        self.after = Some(after);
        self
    }

    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Read-tracked notification copy for a non-approving observer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CopyRecord {
    pub id: CopyRecordId,
    pub instance_id: FlowInstanceId,
    pub node_id: NodeId,
    pub recipient_id: UserId,
    #[serde(default)]
    pub recipient_name: String,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CopyRecord {
    pub fn new(
        instance_id: FlowInstanceId,
        node_id: NodeId,
        recipient_id: UserId,
        recipient_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CopyRecordId::generate(),
            instance_id,
            node_id,
            recipient_id,
            recipient_name: recipient_name.into(),
            is_read: false,
            read_at: None,
            created_at,
        }
    }

    /// Mark as read. Returns `false` when already read; the first read
    /// timestamp is kept.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_read {
            return false;
        }
        self.is_read = true;
        self.read_at = Some(at);
        true
    }
}
