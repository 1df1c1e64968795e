//! Shared fixtures for unit tests

use crate::config::EngineConfig;
use crate::directory::MemoryDirectory;
use crate::engine::{Engine, StepReport};
use crate::events::EventBus;
use crate::store::{FlowStore, MemoryStore};
use crate::task_manager::TaskManager;
use bpm_types::{
    Actor, AssigneeRule, CopyRecord, DefinitionStatus, Department, DirectoryUser, FlowDefinition,
    FlowGraph, FlowInstance, FlowInstanceId, FlowLog, FlowNode, NodeConfig, RoleId, Task, UserId,
};
use serde_json::Value;
use std::sync::Arc;

pub(crate) fn uid(id: &str) -> UserId {
    UserId::new(id)
}

pub(crate) fn actor(id: &str) -> Actor {
    Actor::user(UserId::new(id), id)
}

pub(crate) fn specific(ids: &[&str]) -> AssigneeRule {
    AssigneeRule::SpecificUser {
        user_ids: ids.iter().map(|id| UserId::new(*id)).collect(),
    }
}

pub(crate) fn role(id: &str) -> AssigneeRule {
    AssigneeRule::Role {
        role_ids: vec![RoleId::new(id)],
    }
}

/// start -> review -> end, with `review` assigned per `config`
pub(crate) fn single_approval(code: &str, config: NodeConfig) -> FlowDefinition {
    let graph = FlowGraph::new()
        .node(FlowNode::start("start"))
        .node(FlowNode::approval("review", "Review"))
        .node(FlowNode::end("end"))
        .connect("start", "review")
        .connect("review", "end");
    FlowDefinition::draft(code, code, graph, uid("admin")).with_node_config("review", config)
}

/// start -> review -> second -> end
pub(crate) fn two_approvals(code: &str, review: NodeConfig, second: NodeConfig) -> FlowDefinition {
    let graph = FlowGraph::new()
        .node(FlowNode::start("start"))
        .node(FlowNode::approval("review", "Review"))
        .node(FlowNode::approval("second", "Second Review"))
        .node(FlowNode::end("end"))
        .connect("start", "review")
        .connect("review", "second")
        .connect("second", "end");
    FlowDefinition::draft(code, code, graph, uid("admin"))
        .with_node_config("review", review)
        .with_node_config("second", second)
}

/// Directory used by most tests:
///
/// * alice: engineering, staff
/// * bob: engineering lead, manager
/// * carol: finance lead, manager
/// * dave: finance
/// * erin: admin
/// * frank: disabled manager
pub(crate) async fn seeded_directory() -> Arc<MemoryDirectory> {
    let directory = Arc::new(MemoryDirectory::new());
    for user in [
        DirectoryUser::new("alice", "Alice").in_dept("eng", "Engineering").with_role("staff"),
        DirectoryUser::new("bob", "Bob").in_dept("eng", "Engineering").with_role("manager"),
        DirectoryUser::new("carol", "Carol").in_dept("fin", "Finance").with_role("manager"),
        DirectoryUser::new("dave", "Dave").in_dept("fin", "Finance"),
        DirectoryUser::new("erin", "Erin").with_role("admin"),
        DirectoryUser::new("frank", "Frank").with_role("manager").disabled(),
    ] {
        directory.insert_user(user).await;
    }
    directory
        .insert_department(Department::new("eng", "Engineering").with_leader("bob"))
        .await;
    directory
        .insert_department(Department::new("fin", "Finance").with_leader("carol"))
        .await;
    directory
}

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub directory: Arc<MemoryDirectory>,
    pub engine: Arc<Engine>,
    pub events: EventBus,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let directory = seeded_directory().await;
        let engine = Arc::new(Engine::new(directory.clone(), config));
        Self {
            store: Arc::new(MemoryStore::new()),
            directory,
            engine,
            events: EventBus::new(256),
        }
    }

    pub fn task_manager(&self) -> TaskManager {
        TaskManager::new(self.store.clone(), self.engine.clone(), self.events.clone())
    }

    /// Save a definition as the published main version of its code
    pub async fn install(&self, mut definition: FlowDefinition) -> FlowDefinition {
        definition.status = DefinitionStatus::Published;
        definition.is_main = true;
        let mut tx = self.store.begin().await.unwrap();
        tx.save_definition(&definition).await.unwrap();
        tx.commit().await.unwrap();
        definition
    }

    /// Create an instance for alice and run it from START
    pub async fn start(&self, definition: &FlowDefinition, form: Value) -> (FlowInstanceId, StepReport) {
        self.try_start(definition, form).await.unwrap()
    }

    pub async fn try_start(
        &self,
        definition: &FlowDefinition,
        form: Value,
    ) -> bpm_types::FlowResult<(FlowInstanceId, StepReport)> {
        let instance = FlowInstance::new(
            definition.id.clone(),
            definition.code.clone(),
            definition.version,
            uid("alice"),
            form,
        )
        .with_initiator("Alice", Some(bpm_types::DeptId::new("eng")));
        let id = instance.id.clone();

        let mut tx = self.store.begin().await?;
        tx.save_instance(&instance).await?;
        let report = self.engine.start_flow(tx.as_mut(), &id, &actor("alice")).await?;
        tx.commit().await?;
        Ok((id, report))
    }

    pub async fn instance(&self, id: &FlowInstanceId) -> FlowInstance {
        let mut tx = self.store.begin().await.unwrap();
        tx.get_instance(id).await.unwrap().unwrap()
    }

    pub async fn tasks(&self, id: &FlowInstanceId) -> Vec<Task> {
        let mut tx = self.store.begin().await.unwrap();
        tx.tasks_for_instance(id).await.unwrap()
    }

    pub async fn pending_for(&self, id: &FlowInstanceId, user: &str) -> Task {
        self.tasks(id)
            .await
            .into_iter()
            .find(|t| t.is_pending() && t.assignee_id.as_str() == user)
            .unwrap_or_else(|| panic!("no pending task for {}", user))
    }

    pub async fn logs(&self, id: &FlowInstanceId) -> Vec<FlowLog> {
        let mut tx = self.store.begin().await.unwrap();
        tx.logs_for_instance(id).await.unwrap()
    }

    pub async fn copies(&self, id: &FlowInstanceId) -> Vec<CopyRecord> {
        let mut tx = self.store.begin().await.unwrap();
        tx.copies_for_instance(id).await.unwrap()
    }
}
