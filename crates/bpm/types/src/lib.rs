//! Approval-flow domain types
//!
//! Versioned flow definitions (graph + per-node configuration), the
//! instances and tasks that execute them, the append-only audit trail,
//! and the lifecycle events the engine emits.
//!
//! # Core Concepts
//!
//! - **FlowDefinition**: a versioned template identified by a business code
//! - **FlowInstance**: one execution of one definition version
//! - **Task**: one assignee's unit of work at an approval node
//! - **FlowLog**: an append-only audit entry per action
//! - **CopyRecord**: read-tracked CC notification for an observer
//! - **NodeConfig**: approval mode, assignee rule, empty-assignee policy,
//!   deadline and CC for an approval node
//!
//! This crate performs no I/O. Evaluation and execution live in
//! `bpm-engine`.

#![deny(unsafe_code)]

pub mod audit;
pub mod condition;
pub mod definition;
pub mod errors;
pub mod event;
pub mod identity;
pub mod ids;
pub mod instance;
pub mod node_config;
pub mod task;

pub use audit::{CopyRecord, FlowLog, LogAction, RecordedStatus};
pub use condition::{ConditionExpr, ConditionGroup, ConditionOperator, Logic, SingleCondition};
pub use definition::{
    DefinitionStatus, FlowDefinition, FlowEdge, FlowGraph, FlowNode, FormField, FormFieldType,
    NodeKind,
};
pub use errors::{ErrorKind, FlowError, FlowResult};
pub use event::{FlowEvent, FlowEventEnvelope};
pub use identity::{Actor, Department, DirectoryUser, Identity};
pub use ids::{
    CopyRecordId, DeptId, FlowDefinitionId, FlowInstanceId, FlowLogId, NodeId, RoleId, TaskId,
    UserId,
};
pub use instance::{FlowInstance, InstanceStatus, ParallelBranchState};
pub use node_config::{
    ApprovalMode, AssigneeRule, EmptyAssigneePolicy, NodeConfig, TimeLimit, TimeoutAction,
};
pub use task::{Task, TaskResult, TaskStatus};
