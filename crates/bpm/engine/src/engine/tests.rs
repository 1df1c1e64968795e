use super::*;
use crate::directory::{Directory, MemoryDirectory};
use crate::error::{DirectoryError, DirectoryResult};
use crate::store::FlowStore;
use crate::testing::{actor, role, seeded_directory, single_approval, specific, two_approvals, Harness};
use async_trait::async_trait;
use bpm_types::{
    ConditionExpr, ConditionOperator, Department, DeptId, DirectoryUser, EmptyAssigneePolicy,
    ErrorKind, FlowEdge, FlowGraph, FlowNode, NodeConfig, RoleId, TimeoutAction, UserId,
};
use serde_json::json;

fn amount_router() -> FlowDefinition {
    let graph = FlowGraph::new()
        .node(FlowNode::start("start"))
        .node(FlowNode::condition("route"))
        .node(FlowNode::approval("manager", "Manager review"))
        .node(FlowNode::approval("finance", "Finance review"))
        .node(FlowNode::end("end"))
        .connect("start", "route")
        .edge(FlowEdge::conditional(
            "route",
            "finance",
            ConditionExpr::single("amount", ConditionOperator::Gt, json!(1000)),
        ))
        .edge(FlowEdge::new("route", "manager").with_label("default"))
        .connect("manager", "end")
        .connect("finance", "end");
    FlowDefinition::draft("expense", "Expense", graph, UserId::new("admin"))
        .with_node_config("manager", NodeConfig::new(specific(&["bob"])))
        .with_node_config("finance", NodeConfig::new(specific(&["carol"])))
}

async fn approve_in_tx(h: &Harness, task_id: &TaskId) -> StepReport {
    let task = {
        let mut tx = h.store.begin().await.unwrap();
        tx.get_task(task_id).await.unwrap().unwrap()
    };
    let mut tx = h.store.begin().await.unwrap();
    let mut resolved = task.clone();
    resolved.resolve(
        TaskStatus::Completed,
        Some(TaskResult::Approved),
        None,
        Utc::now(),
    );
    tx.save_task(&resolved).await.unwrap();
    let report = h
        .engine
        .advance_flow(
            tx.as_mut(),
            &task.instance_id,
            &task.node_id,
            TaskResult::Approved,
            &actor(task.assignee_id.as_str()),
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();
    report
}

#[tokio::test]
async fn test_start_creates_task_and_waits() {
    let h = Harness::new().await;
    let def = h
        .install(single_approval("leave", NodeConfig::new(specific(&["bob"]))))
        .await;

    let (id, report) = h.start(&def, json!({"days": 2})).await;
    let instance = h.instance(&id).await;
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.active_nodes, vec![NodeId::new("review")]);
    assert_eq!(report.created_tasks.len(), 1);
    assert_eq!(
        report.visited,
        vec![NodeId::new("start"), NodeId::new("review")]
    );

    let tasks = h.tasks(&id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].assignee_id.as_str(), "bob");
    assert_eq!(tasks[0].node_name, "Review");
    assert!(tasks[0].due_at.is_none());
    assert!(report
        .events
        .iter()
        .any(|e| matches!(e, FlowEvent::TaskCreated { .. })));
}

#[tokio::test]
async fn test_linear_flow_completes_after_approval() {
    let h = Harness::new().await;
    let def = h
        .install(single_approval("leave", NodeConfig::new(specific(&["bob"]))))
        .await;
    let (id, report) = h.start(&def, json!({})).await;

    let report = approve_in_tx(&h, &report.created_tasks[0]).await;
    let instance = h.instance(&id).await;
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.active_nodes.is_empty());
    assert!(instance.ended_at.is_some());
    assert!(instance.duration_secs.is_some());
    assert!(report
        .events
        .iter()
        .any(|e| matches!(e, FlowEvent::FlowCompleted { .. })));
}

#[tokio::test]
async fn test_and_sign_waits_for_every_task() {
    let h = Harness::new().await;
    let config = NodeConfig::new(specific(&["bob", "carol"])).with_mode(ApprovalMode::AndSign);
    let def = h.install(single_approval("purchase", config)).await;
    let (id, report) = h.start(&def, json!({})).await;
    assert_eq!(report.created_tasks.len(), 2);

    let first = approve_in_tx(&h, &report.created_tasks[0]).await;
    assert!(first.visited.is_empty());
    assert_eq!(h.instance(&id).await.status, InstanceStatus::Running);

    approve_in_tx(&h, &report.created_tasks[1]).await;
    assert_eq!(h.instance(&id).await.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_or_sign_advances_once() {
    let h = Harness::new().await;
    let def = h
        .install(single_approval("purchase", NodeConfig::new(role("manager"))))
        .await;
    let (id, report) = h.start(&def, json!({})).await;
    // frank is disabled
    assert_eq!(report.created_tasks.len(), 2);

    approve_in_tx(&h, &report.created_tasks[0]).await;
    assert_eq!(h.instance(&id).await.status, InstanceStatus::Completed);

    // the sibling stays pending; approving it later changes nothing
    let sibling = h.pending_for(&id, "carol").await;
    let late = approve_in_tx(&h, &sibling.id).await;
    assert!(late.visited.is_empty());
    assert!(late.events.is_empty());
    assert_eq!(h.instance(&id).await.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_rejected_result_is_noop() {
    let h = Harness::new().await;
    let def = h
        .install(single_approval("leave", NodeConfig::new(specific(&["bob"]))))
        .await;
    let (id, _) = h.start(&def, json!({})).await;

    let mut tx = h.store.begin().await.unwrap();
    let report = h
        .engine
        .advance_flow(
            tx.as_mut(),
            &id,
            &NodeId::new("review"),
            TaskResult::Rejected,
            &actor("bob"),
        )
        .await
        .unwrap();
    drop(tx);
    assert!(report.visited.is_empty());
    assert_eq!(h.instance(&id).await.status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_condition_selects_matching_branch() {
    let h = Harness::new().await;
    let def = h.install(amount_router()).await;

    let (big, _) = h.start(&def, json!({"amount": 5000})).await;
    assert_eq!(h.instance(&big).await.active_nodes, vec![NodeId::new("finance")]);

    let (small, _) = h.start(&def, json!({"amount": 200})).await;
    assert_eq!(h.instance(&small).await.active_nodes, vec![NodeId::new("manager")]);

    // string amounts are coerced
    let (coerced, _) = h.start(&def, json!({"amount": "2500"})).await;
    assert_eq!(h.instance(&coerced).await.active_nodes, vec![NodeId::new("finance")]);
}

fn strict_router() -> FlowDefinition {
    let graph = FlowGraph::new()
        .node(FlowNode::start("start"))
        .node(FlowNode::condition("route"))
        .node(FlowNode::approval("finance", "Finance review"))
        .node(FlowNode::end("end"))
        .connect("start", "route")
        .edge(FlowEdge::conditional(
            "route",
            "finance",
            ConditionExpr::single("amount", ConditionOperator::Gt, json!(1000)),
        ))
        .connect("finance", "end");
    FlowDefinition::draft("strict", "Strict", graph, UserId::new("admin"))
        .with_node_config("finance", NodeConfig::new(specific(&["carol"])))
}

#[tokio::test]
async fn test_unmatched_condition_stalls() {
    let h = Harness::new().await;
    let def = h.install(strict_router()).await;

    let (id, report) = h.start(&def, json!({"amount": 10})).await;
    let instance = h.instance(&id).await;
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.active_nodes, vec![NodeId::new("route")]);
    assert!(report.created_tasks.is_empty());
}

#[tokio::test]
async fn test_unmatched_condition_can_terminate() {
    let h = Harness::with_config(EngineConfig::default().with_terminate_on_unmatched_condition(true))
        .await;
    let def = h.install(strict_router()).await;

    let (id, report) = h.start(&def, json!({"amount": 10})).await;
    let instance = h.instance(&id).await;
    assert_eq!(instance.status, InstanceStatus::Terminated);
    assert!(instance.remark.is_some());
    assert!(report
        .events
        .iter()
        .any(|e| matches!(e, FlowEvent::FlowTerminated { .. })));
    let logs = h.logs(&id).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].action, LogAction::Terminate);
}

#[tokio::test]
async fn test_skip_policy_moves_on() {
    let h = Harness::new().await;
    let config = NodeConfig::new(role("nobody")).with_empty_policy(EmptyAssigneePolicy::Skip);
    let def = h.install(single_approval("skip", config)).await;

    let (id, _) = h.start(&def, json!({})).await;
    assert_eq!(h.instance(&id).await.status, InstanceStatus::Completed);
    assert!(h.tasks(&id).await.is_empty());

    let logs = h.logs(&id).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].action, LogAction::Auto);
    assert_eq!(logs[0].operator_id, None);
    assert_eq!(logs[0].operator_name, "system");
}

#[tokio::test]
async fn test_to_admin_policy_routes_to_admin() {
    let h = Harness::new().await;
    let config = NodeConfig::new(role("nobody")).with_empty_policy(EmptyAssigneePolicy::ToAdmin);
    let def = h.install(single_approval("admin", config)).await;

    let (id, _) = h.start(&def, json!({})).await;
    let tasks = h.tasks(&id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].assignee_id.as_str(), "erin");
    assert_eq!(h.instance(&id).await.status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_to_admin_without_admin_terminates() {
    let h = Harness::with_config(EngineConfig::default().with_admin_role("root")).await;
    let config = NodeConfig::new(role("nobody")).with_empty_policy(EmptyAssigneePolicy::ToAdmin);
    let def = h.install(single_approval("admin", config)).await;

    let (id, _) = h.start(&def, json!({})).await;
    assert_eq!(h.instance(&id).await.status, InstanceStatus::Terminated);
}

#[tokio::test]
async fn test_error_policy_terminates() {
    let h = Harness::new().await;
    let def = h
        .install(single_approval("err", NodeConfig::new(specific(&["ghost"]))))
        .await;

    let (id, _) = h.start(&def, json!({})).await;
    let instance = h.instance(&id).await;
    assert_eq!(instance.status, InstanceStatus::Terminated);
    assert!(instance.active_nodes.is_empty());
    assert!(instance.remark.unwrap().contains("Review"));
}

#[tokio::test]
async fn test_parallel_fans_out_and_records_branches() {
    let h = Harness::new().await;
    let graph = FlowGraph::new()
        .node(FlowNode::start("start"))
        .node(FlowNode::parallel("split"))
        .node(FlowNode::approval("legal", "Legal"))
        .node(FlowNode::approval("finance", "Finance"))
        .node(FlowNode::join("join"))
        .node(FlowNode::end("end"))
        .connect("start", "split")
        .connect("split", "legal")
        .connect("split", "finance")
        .connect("legal", "join")
        .connect("finance", "join")
        .connect("join", "end");
    let def = h
        .install(
            FlowDefinition::draft("contract", "Contract", graph, UserId::new("admin"))
                .with_node_config("legal", NodeConfig::new(specific(&["bob"])))
                .with_node_config("finance", NodeConfig::new(specific(&["carol"]))),
        )
        .await;

    let (id, report) = h.start(&def, json!({})).await;
    assert_eq!(report.created_tasks.len(), 2);
    let instance = h.instance(&id).await;
    assert_eq!(
        instance.active_nodes,
        vec![NodeId::new("legal"), NodeId::new("finance")]
    );

    let state = {
        let mut tx = h.store.begin().await.unwrap();
        tx.get_branch_state(&id, &NodeId::new("split")).await.unwrap().unwrap()
    };
    assert_eq!(state.total, 2);
    assert_eq!(state.completed, 0);

    // joins do not wait: the first finished branch reaches END
    approve_in_tx(&h, &report.created_tasks[0]).await;
    assert_eq!(h.instance(&id).await.status, InstanceStatus::Completed);

    let state = {
        let mut tx = h.store.begin().await.unwrap();
        tx.get_branch_state(&id, &NodeId::new("split")).await.unwrap().unwrap()
    };
    assert_eq!(state.total, 2);
    assert_eq!(state.completed, 1);
}

#[tokio::test]
async fn test_cycle_hits_step_ceiling() {
    let h = Harness::with_config(EngineConfig::default().with_max_steps(16)).await;
    let graph = FlowGraph::new()
        .node(FlowNode::start("start"))
        .node(FlowNode::condition("a"))
        .node(FlowNode::condition("b"))
        .node(FlowNode::end("end"))
        .connect("start", "a")
        .connect("a", "b")
        .connect("b", "a")
        .edge(FlowEdge::conditional(
            "b",
            "end",
            ConditionExpr::single("never", ConditionOperator::Eq, json!(true)),
        ));
    let def = h
        .install(FlowDefinition::draft("loop", "Loop", graph, UserId::new("admin")))
        .await;

    let err = h.try_start(&def, json!({})).await.unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));
}

#[tokio::test]
async fn test_cc_copies_created() {
    let h = Harness::new().await;
    let config = NodeConfig::new(specific(&["bob"])).with_cc(specific(&["dave", "frank"]));
    let def = h.install(single_approval("cc", config)).await;

    let (id, _) = h.start(&def, json!({})).await;
    let copies = h.copies(&id).await;
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].recipient_id.as_str(), "dave");
    assert!(!copies[0].is_read);
}

#[tokio::test]
async fn test_time_limit_sets_due() {
    let h = Harness::new().await;
    let config = NodeConfig::new(specific(&["bob"])).with_time_limit(30, TimeoutAction::Remind);
    let def = h.install(single_approval("timed", config)).await;

    let (id, _) = h.start(&def, json!({})).await;
    let task = h.pending_for(&id, "bob").await;
    let due = task.due_at.unwrap();
    let delta = due - task.created_at;
    assert_eq!(delta.num_minutes(), 30);
}

#[tokio::test]
async fn test_form_field_assignee() {
    let h = Harness::new().await;
    let config = NodeConfig::new(bpm_types::AssigneeRule::FormField {
        field: "approver".into(),
    });
    let def = h.install(single_approval("form", config)).await;

    let (id, _) = h.start(&def, json!({"approver": "carol"})).await;
    assert_eq!(h.tasks(&id).await[0].assignee_id.as_str(), "carol");
}

/// Serves role lookups but fails every lookup by user id
struct IdLookupOutage(Arc<MemoryDirectory>);

#[async_trait]
impl Directory for IdLookupOutage {
    async fn users_by_ids(&self, _ids: &[UserId]) -> DirectoryResult<Vec<DirectoryUser>> {
        Err(DirectoryError::Unavailable("identity service timed out".into()))
    }

    async fn users_by_roles(&self, roles: &[RoleId]) -> DirectoryResult<Vec<DirectoryUser>> {
        self.0.users_by_roles(roles).await
    }

    async fn users_by_department(&self, dept: &DeptId) -> DirectoryResult<Vec<DirectoryUser>> {
        self.0.users_by_department(dept).await
    }

    async fn department(&self, dept: &DeptId) -> DirectoryResult<Option<Department>> {
        self.0.department(dept).await
    }
}

#[tokio::test]
async fn test_node_fault_rolls_back_the_approval() {
    let directory = seeded_directory().await;
    let h = Harness {
        store: Arc::new(crate::store::MemoryStore::new()),
        directory: directory.clone(),
        engine: Arc::new(Engine::new(
            Arc::new(IdLookupOutage(directory)),
            crate::config::EngineConfig::default(),
        )),
        events: crate::events::EventBus::new(16),
    };
    let def = h
        .install(two_approvals(
            "vendor",
            NodeConfig::new(role("manager")),
            NodeConfig::new(specific(&["dave"])),
        ))
        .await;
    let (id, _) = h.start(&def, json!({})).await;
    let before = h.instance(&id).await;
    let bob = h.pending_for(&id, "bob").await;
    let mut rx = h.events.subscribe();

    // entering `second` needs an id lookup, which fails
    let err = h
        .task_manager()
        .approve(&bob.id, &actor("bob"), None, Some(json!({"note": "x"})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    let after = h.instance(&id).await;
    assert_eq!(after.status, InstanceStatus::Running);
    assert_eq!(after.active_nodes, before.active_nodes);
    assert!(after.is_active_at(&NodeId::new("review")));
    assert!(after.form_data.get("note").is_none());

    assert!(h.pending_for(&id, "bob").await.is_pending());
    assert_eq!(h.tasks(&id).await.len(), 2);
    assert!(h.logs(&id).await.iter().all(|l| l.action != LogAction::Approve));
    assert!(rx.try_recv().is_err());
}
