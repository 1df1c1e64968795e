//! Approval tasks

use crate::{FlowInstanceId, NodeId, TaskId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Completed,
    Cancelled,
    Transferred,
    Countersigned,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Transferred => "TRANSFERRED",
            Self::Countersigned => "COUNTERSIGNED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResult {
    Approved,
    Rejected,
    Transferred,
    Countersigned,
}

/// One assignee's unit of work at an approval node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub instance_id: FlowInstanceId,
    pub node_id: NodeId,
    #[serde(default)]
    pub node_name: String,
    pub assignee_id: UserId,
    #[serde(default)]
    pub assignee_name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Task this one was transferred or countersigned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn pending(
        instance_id: FlowInstanceId,
        node_id: NodeId,
        assignee_id: UserId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            instance_id,
            node_id,
            node_name: String::new(),
            assignee_id,
            assignee_name: String::new(),
            status: TaskStatus::Pending,
            result: None,
            comment: None,
            source_task_id: None,
            due_at: None,
            created_at,
            completed_at: None,
            reminded_at: None,
            escalated_at: None,
        }
    }

    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn with_assignee_name(mut self, name: impl Into<String>) -> Self {
        self.assignee_name = name.into();
        self
    }

    pub fn with_due_at(mut self, due_at: Option<DateTime<Utc>>) -> Self {
        self.due_at = due_at;
        self
    }

    pub fn with_source(mut self, source: TaskId) -> Self {
        self.source_task_id = Some(source);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.due_at.is_some_and(|due| due <= now)
    }

    /// Whether a timeout scan at `now` still has work for this task: an
    /// overdue task not yet escalated, or an upcoming one not yet reminded
    pub fn awaits_timeout_job(&self, now: DateTime<Utc>) -> bool {
        match self.due_at {
            Some(due) if self.is_pending() => {
                if due <= now {
                    self.escalated_at.is_none()
                } else {
                    self.reminded_at.is_none()
                }
            }
            _ => false,
        }
    }

    /// Resolve the task. Callers check `is_pending` first.
    pub fn resolve(
        &mut self,
        status: TaskStatus,
        result: Option<TaskResult>,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.status = status;
        self.result = result;
        if comment.is_some() {
            self.comment = comment;
        }
        self.completed_at = Some(at);
    }
}
