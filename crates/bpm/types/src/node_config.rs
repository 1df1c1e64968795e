//! Per-node configuration for approval nodes
//!
//! Graph nodes only carry their kind; everything that shapes how an
//! approval node behaves (who approves, how many must approve, what
//! happens when nobody resolves, deadlines, CC) lives here, keyed by
//! node id on the definition.

use crate::{DeptId, RoleId, UserId};
use serde::{Deserialize, Serialize};

/// Configuration attached to one node of a definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    pub assignee: AssigneeRule,
    #[serde(default)]
    pub empty_assignee_policy: EmptyAssigneePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<TimeLimit>,
    /// Observers who receive a read-tracked copy when the node is entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<AssigneeRule>,
}

impl NodeConfig {
    pub fn new(assignee: AssigneeRule) -> Self {
        Self {
            approval_mode: ApprovalMode::default(),
            assignee,
            empty_assignee_policy: EmptyAssigneePolicy::default(),
            time_limit: None,
            cc: None,
        }
    }

    pub fn with_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_empty_policy(mut self, policy: EmptyAssigneePolicy) -> Self {
        self.empty_assignee_policy = policy;
        self
    }

    pub fn with_time_limit(mut self, minutes: u32, action: TimeoutAction) -> Self {
        self.time_limit = Some(TimeLimit { minutes, action });
        self
    }

    pub fn with_cc(mut self, cc: AssigneeRule) -> Self {
        self.cc = Some(cc);
        self
    }
}

/// How many of a node's assignees must approve
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalMode {
    /// Any one approval advances the node
    #[default]
    OrSign,
    /// Every pending task at the node must clear first
    AndSign,
}

/// Approver-selection strategy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "assigneeType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssigneeRule {
    /// Every enabled user holding any of the roles
    Role {
        #[serde(rename = "roleIds")]
        role_ids: Vec<RoleId>,
    },
    /// The leader of a department; the initiator's department when unset
    DeptLeader {
        #[serde(rename = "deptId", default, skip_serializing_if = "Option::is_none")]
        dept_id: Option<DeptId>,
    },
    /// An explicit list of users
    SpecificUser {
        #[serde(rename = "userIds")]
        user_ids: Vec<UserId>,
    },
    /// The leader of the initiator's own department
    InitiatorLeader,
    /// User id(s) read from a submitted form field
    FormField { field: String },
}

/// What to do when an approval node resolves no assignee
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmptyAssigneePolicy {
    /// Auto-complete the node and move on
    Skip,
    /// Route the node to the fallback admin
    ToAdmin,
    /// Terminate the instance
    #[default]
    Error,
}

/// Deadline for tasks created at a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLimit {
    pub minutes: u32,
    pub action: TimeoutAction,
}

impl TimeLimit {
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.minutes))
    }
}

/// Escalation applied to a task once it is overdue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutAction {
    AutoPass,
    AutoReject,
    Remind,
}
