//! Approval-flow engine
//!
//! Interprets versioned flow definitions as directed graphs of typed nodes
//! and drives each instance through them:
//!
//! - [`Engine`] walks the graph, dispatching each node to the handler for
//!   its kind, until every branch waits on approvals or the instance ends
//! - [`TaskManager`] resolves individual tasks (approve, reject, transfer,
//!   countersign, urge) and advances the engine
//! - [`DefinitionService`] and [`InstanceService`] manage templates and
//!   instances
//! - [`TimeoutService`] escalates overdue tasks through a delayed-job queue
//!
//! Every mutating operation runs in one store transaction and re-checks
//! the status it expects before writing. Lifecycle events go out on the
//! [`EventBus`] after commit.
//!
//! # Example
//!
//! ```rust,ignore
//! use bpm_engine::{Engine, EngineConfig, EventBus, InstanceService, MemoryDirectory, MemoryStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let engine = Arc::new(Engine::new(Arc::new(MemoryDirectory::new()), EngineConfig::default()));
//! let instances = InstanceService::new(store, engine, EventBus::default());
//!
//! let instance = instances.start("leave", &initiator, None, form).await?;
//! ```

#![deny(unsafe_code)]

pub mod assignee_resolver;
pub mod condition_evaluator;
pub mod config;
pub mod definition_service;
pub mod directory;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod instance_service;
pub mod queue;
pub mod store;
pub mod task_manager;
pub mod timeout;

#[cfg(test)]
mod testing;

pub use assignee_resolver::{AssigneeResolver, ResolveContext};
pub use condition_evaluator::ConditionEvaluator;
pub use config::{EngineConfig, TimeoutConfig};
pub use definition_service::{DefinitionDraft, DefinitionPatch, DefinitionService};
pub use directory::{Directory, MemoryDirectory};
pub use engine::{Engine, NodeHandler, NodeOutcome, StepContext, StepReport};
pub use error::{
    DirectoryError, DirectoryResult, QueueError, QueueResult, StoreError, StoreResult,
};
pub use events::EventBus;
pub use graph::{validate_definition, FlowGraphIndex, GraphCache};
pub use instance_service::{InstanceDetail, InstanceService};
pub use queue::{Backoff, FailOutcome, Job, JobId, JobOptions, JobQueue, MemoryJobQueue, Schedule};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use store::{FlowStore, MemoryStore, StoreTx};
pub use task_manager::{TaskActionOutcome, TaskManager};
pub use timeout::{ScanSummary, TimeoutOutcome, TimeoutScheduler, TimeoutService, TimeoutWorker};
