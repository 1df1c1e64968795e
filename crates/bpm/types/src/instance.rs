//! Flow instances: one execution of a definition version

use crate::{DeptId, FlowDefinitionId, FlowInstanceId, NodeId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Instance lifecycle status. Every status except `Running` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Completed,
    Rejected,
    Cancelled,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// A running or finished execution of one definition version
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowInstance {
    pub id: FlowInstanceId,
    /// Pinned at start; later definition edits never reach this instance
    pub definition_id: FlowDefinitionId,
    pub definition_code: String,
    pub definition_version: u32,
    pub title: String,
    pub status: InstanceStatus,
    /// Nodes currently holding the instance, in activation order
    pub active_nodes: Vec<NodeId>,
    pub initiator_id: UserId,
    #[serde(default)]
    pub initiator_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_dept: Option<DeptId>,
    /// Snapshot of the submitted form, merged with approver-supplied data
    pub form_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl FlowInstance {
    pub fn new(
        definition_id: FlowDefinitionId,
        definition_code: impl Into<String>,
        definition_version: u32,
        initiator_id: UserId,
        form_data: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: FlowInstanceId::generate(),
            definition_id,
            definition_code: definition_code.into(),
            definition_version,
            title: String::new(),
            status: InstanceStatus::Running,
            active_nodes: Vec::new(),
            initiator_id,
            initiator_name: String::new(),
            initiator_dept: None,
            form_data,
            remark: None,
            started_at: now,
            ended_at: None,
            duration_secs: None,
            updated_at: now,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_initiator(mut self, name: impl Into<String>, dept: Option<DeptId>) -> Self {
        self.initiator_name = name.into();
        self.initiator_dept = dept;
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn is_active_at(&self, node_id: &NodeId) -> bool {
        self.active_nodes.contains(node_id)
    }

    pub fn activate(&mut self, node_id: NodeId) {
        if !self.active_nodes.contains(&node_id) {
            self.active_nodes.push(node_id);
        }
    }

    pub fn deactivate(&mut self, node_id: &NodeId) {
        self.active_nodes.retain(|n| n != node_id);
    }

    /// Move to a terminal status, stamping end time and duration and
    /// clearing the active-node set.
    pub fn finish(&mut self, status: InstanceStatus, at: DateTime<Utc>) {
        self.status = status;
        self.active_nodes.clear();
        self.ended_at = Some(at);
        self.duration_secs = Some((at - self.started_at).num_seconds().max(0));
        self.updated_at = at;
    }

    /// Shallow-merge an object into the form snapshot. Non-object input is
    /// ignored.
    pub fn merge_form(&mut self, patch: &Value) {
        let Value::Object(patch) = patch else {
            return;
        };
        if !self.form_data.is_object() {
            self.form_data = Value::Object(Default::default());
        }
        if let Value::Object(form) = &mut self.form_data {
            for (key, value) in patch {
                form.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Fan-out bookkeeping for one PARALLEL node of one instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelBranchState {
    pub instance_id: FlowInstanceId,
    pub node_id: NodeId,
    pub total: u32,
    /// Branches that have reached the matching JOIN
    pub completed: u32,
}

impl ParallelBranchState {
    pub fn new(instance_id: FlowInstanceId, node_id: NodeId, total: u32) -> Self {
        Self {
            instance_id,
            node_id,
            total,
            completed: 0,
        }
    }
}
