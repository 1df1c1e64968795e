//! Lifecycle events
//!
//! Structured records for outbound integrations. The engine publishes them
//! only after the transaction that produced them commits; delivery belongs
//! to whoever subscribes.

use crate::{FlowInstanceId, NodeId, TaskId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowEvent {
    FlowStarted {
        instance_id: FlowInstanceId,
        definition_code: String,
        initiator_id: UserId,
    },
    FlowCompleted {
        instance_id: FlowInstanceId,
    },
    FlowRejected {
        instance_id: FlowInstanceId,
        node_id: NodeId,
    },
    FlowCancelled {
        instance_id: FlowInstanceId,
    },
    FlowTerminated {
        instance_id: FlowInstanceId,
        reason: String,
    },
    TaskCreated {
        instance_id: FlowInstanceId,
        task_id: TaskId,
        node_id: NodeId,
        assignee_id: UserId,
    },
    TaskApproved {
        instance_id: FlowInstanceId,
        task_id: TaskId,
        node_id: NodeId,
    },
    TaskRejected {
        instance_id: FlowInstanceId,
        task_id: TaskId,
        node_id: NodeId,
    },
    TaskUrged {
        instance_id: FlowInstanceId,
        task_id: TaskId,
        assignee_id: UserId,
    },
    TaskDueSoon {
        instance_id: FlowInstanceId,
        task_id: TaskId,
        assignee_id: UserId,
        due_at: DateTime<Utc>,
    },
}

impl FlowEvent {
    pub fn instance_id(&self) -> &FlowInstanceId {
        match self {
            Self::FlowStarted { instance_id, .. }
            | Self::FlowCompleted { instance_id }
            | Self::FlowRejected { instance_id, .. }
            | Self::FlowCancelled { instance_id }
            | Self::FlowTerminated { instance_id, .. }
            | Self::TaskCreated { instance_id, .. }
            | Self::TaskApproved { instance_id, .. }
            | Self::TaskRejected { instance_id, .. }
            | Self::TaskUrged { instance_id, .. }
            | Self::TaskDueSoon { instance_id, .. } => instance_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FlowStarted { .. } => "FLOW_STARTED",
            Self::FlowCompleted { .. } => "FLOW_COMPLETED",
            Self::FlowRejected { .. } => "FLOW_REJECTED",
            Self::FlowCancelled { .. } => "FLOW_CANCELLED",
            Self::FlowTerminated { .. } => "FLOW_TERMINATED",
            Self::TaskCreated { .. } => "TASK_CREATED",
            Self::TaskApproved { .. } => "TASK_APPROVED",
            Self::TaskRejected { .. } => "TASK_REJECTED",
            Self::TaskUrged { .. } => "TASK_URGED",
            Self::TaskDueSoon { .. } => "TASK_DUE_SOON",
        }
    }
}

/// Event plus delivery metadata
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowEventEnvelope {
    pub id: String,
    pub occurred_at: DateTime<Utc>,
    pub event: FlowEvent,
}

impl FlowEventEnvelope {
    pub fn new(event: FlowEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_name_matches_name() {
        let event = FlowEvent::FlowRejected {
            instance_id: FlowInstanceId::new("i1"),
            node_id: NodeId::new("review"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.name());
        assert_eq!(event.instance_id().as_str(), "i1");
    }
}
