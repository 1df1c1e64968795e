//! One handler per node kind, selected by the node's declared kind

use super::StepContext;
use crate::assignee_resolver::ResolveContext;
use async_trait::async_trait;
use bpm_types::{
    CopyRecord, EmptyAssigneePolicy, FlowError, FlowEvent, FlowNode, FlowResult, Identity,
    InstanceStatus, LogAction, NodeConfig, NodeId, NodeKind, ParallelBranchState, Task,
};

/// What the walk does after a node executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Queue these nodes next
    Continue(Vec<NodeId>),
    /// This branch waits here; the node stays in the active set
    Wait,
    /// The instance reached a terminal status; stop the walk
    Finished,
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, ctx: &mut StepContext<'_>, node: &FlowNode) -> FlowResult<NodeOutcome>;
}

pub(super) fn handler_for(kind: NodeKind) -> &'static dyn NodeHandler {
    match kind {
        NodeKind::Start => &StartHandler,
        NodeKind::End => &EndHandler,
        NodeKind::Approval => &ApprovalHandler,
        NodeKind::Condition => &ConditionHandler,
        NodeKind::Parallel => &ParallelHandler,
        NodeKind::Join => &JoinHandler,
    }
}

struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    async fn execute(&self, ctx: &mut StepContext<'_>, node: &FlowNode) -> FlowResult<NodeOutcome> {
        let successors = ctx.index.successors(&node.id);
        if successors.is_empty() {
            return Err(FlowError::validation(format!(
                "START node {} has no successor",
                node.id
            )));
        }
        Ok(NodeOutcome::Continue(successors))
    }
}

struct EndHandler;

#[async_trait]
impl NodeHandler for EndHandler {
    async fn execute(&self, ctx: &mut StepContext<'_>, node: &FlowNode) -> FlowResult<NodeOutcome> {
        ctx.instance.finish(InstanceStatus::Completed, ctx.now);
        tracing::info!(
            instance_id = %ctx.instance.id,
            node_id = %node.id,
            duration_secs = ctx.instance.duration_secs.unwrap_or_default(),
            "Flow completed"
        );
        ctx.report.events.push(FlowEvent::FlowCompleted {
            instance_id: ctx.instance.id.clone(),
        });
        Ok(NodeOutcome::Finished)
    }
}

struct ApprovalHandler;

impl ApprovalHandler {
    async fn create_tasks(
        &self,
        ctx: &mut StepContext<'_>,
        node: &FlowNode,
        config: &NodeConfig,
        assignees: &[Identity],
    ) -> FlowResult<()> {
        let due_at = config.time_limit.map(|limit| ctx.now + limit.duration());
        for assignee in assignees {
            let task = Task::pending(
                ctx.instance.id.clone(),
                node.id.clone(),
                assignee.id.clone(),
                ctx.now,
            )
            .with_node_name(node.display_name())
            .with_assignee_name(assignee.name.clone())
            .with_due_at(due_at);
            ctx.tx.save_task(&task).await?;

            ctx.report.created_tasks.push(task.id.clone());
            ctx.report.events.push(FlowEvent::TaskCreated {
                instance_id: ctx.instance.id.clone(),
                task_id: task.id.clone(),
                node_id: node.id.clone(),
                assignee_id: task.assignee_id.clone(),
            });
        }
        ctx.instance.activate(node.id.clone());
        tracing::info!(
            instance_id = %ctx.instance.id,
            node_id = %node.id,
            tasks = assignees.len(),
            "Approval tasks created"
        );
        Ok(())
    }

    async fn fan_out_copies(
        &self,
        ctx: &mut StepContext<'_>,
        node: &FlowNode,
        config: &NodeConfig,
    ) -> FlowResult<()> {
        let Some(cc) = &config.cc else {
            return Ok(());
        };
        let recipients = ctx
            .engine
            .resolver()
            .resolve(cc, resolve_context(ctx))
            .await?;
        for recipient in recipients {
            let copy = CopyRecord::new(
                ctx.instance.id.clone(),
                node.id.clone(),
                recipient.id,
                recipient.name,
                ctx.now,
            );
            ctx.tx.save_copy(&copy).await?;
        }
        Ok(())
    }
}

fn resolve_context<'a>(ctx: &'a StepContext<'_>) -> ResolveContext<'a> {
    ResolveContext {
        initiator_id: &ctx.instance.initiator_id,
        initiator_dept: ctx.instance.initiator_dept.as_ref(),
        form: &ctx.instance.form_data,
    }
}

#[async_trait]
impl NodeHandler for ApprovalHandler {
    async fn execute(&self, ctx: &mut StepContext<'_>, node: &FlowNode) -> FlowResult<NodeOutcome> {
        let definition = ctx.definition;
        let config = definition.node_config(&node.id).ok_or_else(|| {
            FlowError::validation(format!("approval node {} has no configuration", node.id))
        })?;

        let assignees = ctx
            .engine
            .resolver()
            .resolve(&config.assignee, resolve_context(ctx))
            .await?;

        if !assignees.is_empty() {
            self.create_tasks(ctx, node, config, &assignees).await?;
            self.fan_out_copies(ctx, node, config).await?;
            return Ok(NodeOutcome::Wait);
        }

        match config.empty_assignee_policy {
            EmptyAssigneePolicy::Skip => {
                let log = ctx
                    .engine
                    .system_log(ctx.instance.id.clone(), LogAction::Auto)
                    .at_node(node.id.clone())
                    .with_comment(Some(format!(
                        "No assignee resolved for {}; node skipped",
                        node.display_name()
                    )))
                    .at(ctx.now);
                ctx.tx.append_log(&log).await?;
                tracing::info!(instance_id = %ctx.instance.id, node_id = %node.id, "Approval node skipped");
                self.fan_out_copies(ctx, node, config).await?;
                Ok(NodeOutcome::Continue(ctx.index.successors(&node.id)))
            }
            EmptyAssigneePolicy::ToAdmin => {
                let admin_role = ctx.engine.config().admin_role.clone();
                match ctx.engine.resolver().admin_fallback(&admin_role).await? {
                    Some(admin) => {
                        let log = ctx
                            .engine
                            .system_log(ctx.instance.id.clone(), LogAction::Auto)
                            .at_node(node.id.clone())
                            .with_comment(Some(format!(
                                "No assignee resolved for {}; routed to admin {}",
                                node.display_name(),
                                admin.name
                            )))
                            .at(ctx.now);
                        ctx.tx.append_log(&log).await?;
                        self.create_tasks(ctx, node, config, std::slice::from_ref(&admin))
                            .await?;
                        self.fan_out_copies(ctx, node, config).await?;
                        Ok(NodeOutcome::Wait)
                    }
                    None => {
                        tracing::warn!(role = %admin_role, node_id = %node.id, "No enabled admin for fallback");
                        terminate_stuck(ctx, node).await
                    }
                }
            }
            EmptyAssigneePolicy::Error => terminate_stuck(ctx, node).await,
        }
    }
}

async fn terminate_stuck(ctx: &mut StepContext<'_>, node: &FlowNode) -> FlowResult<NodeOutcome> {
    let remark = format!("No assignee resolved for node {}", node.display_name());
    ctx.engine
        .force_terminate(ctx.tx, ctx.instance, &node.id, remark, ctx.now, ctx.report)
        .await?;
    Ok(NodeOutcome::Finished)
}

struct ConditionHandler;

#[async_trait]
impl NodeHandler for ConditionHandler {
    async fn execute(&self, ctx: &mut StepContext<'_>, node: &FlowNode) -> FlowResult<NodeOutcome> {
        let index = ctx.index;
        let mut fallback = None;
        let mut chosen = None;
        for edge in index.outgoing(&node.id) {
            match &edge.condition {
                Some(condition) => {
                    if ctx.engine.evaluator().evaluate(condition, &ctx.instance.form_data) {
                        chosen = Some(edge.target.clone());
                        break;
                    }
                }
                None => {
                    fallback.get_or_insert_with(|| edge.target.clone());
                }
            }
        }

        if let Some(target) = chosen.or(fallback) {
            tracing::debug!(instance_id = %ctx.instance.id, node_id = %node.id, target = %target, "Condition branch selected");
            return Ok(NodeOutcome::Continue(vec![target]));
        }

        if ctx.engine.config().terminate_on_unmatched_condition {
            let remark = format!("No condition branch matched at node {}", node.display_name());
            ctx.engine
                .force_terminate(ctx.tx, ctx.instance, &node.id, remark, ctx.now, ctx.report)
                .await?;
            return Ok(NodeOutcome::Finished);
        }

        tracing::warn!(
            instance_id = %ctx.instance.id,
            node_id = %node.id,
            "No condition branch matched; instance stalled"
        );
        ctx.instance.activate(node.id.clone());
        Ok(NodeOutcome::Wait)
    }
}

struct ParallelHandler;

#[async_trait]
impl NodeHandler for ParallelHandler {
    async fn execute(&self, ctx: &mut StepContext<'_>, node: &FlowNode) -> FlowResult<NodeOutcome> {
        let successors = ctx.index.successors(&node.id);
        let state = ParallelBranchState::new(
            ctx.instance.id.clone(),
            node.id.clone(),
            successors.len() as u32,
        );
        ctx.tx.save_branch_state(&state).await?;
        Ok(NodeOutcome::Continue(successors))
    }
}

/// Counts the arriving branch against its PARALLEL node, then passes
/// straight through. Branch synchronization is not performed: every
/// arriving branch continues past the join.
struct JoinHandler;

#[async_trait]
impl NodeHandler for JoinHandler {
    async fn execute(&self, ctx: &mut StepContext<'_>, node: &FlowNode) -> FlowResult<NodeOutcome> {
        if let Some(parallel) = ctx.index.opening_parallel(&node.id) {
            if let Some(mut state) = ctx.tx.get_branch_state(&ctx.instance.id, &parallel).await? {
                state.completed = (state.completed + 1).min(state.total);
                ctx.tx.save_branch_state(&state).await?;
                tracing::debug!(
                    instance_id = %ctx.instance.id,
                    node_id = %node.id,
                    completed = state.completed,
                    total = state.total,
                    "Branch reached join"
                );
            }
        }
        Ok(NodeOutcome::Continue(ctx.index.successors(&node.id)))
    }
}
