//! Engine: interprets a flow graph for one instance
//!
//! The engine walks the graph from a starting point, dispatching each node
//! to the handler for its kind, until every branch either waits (an
//! approval node with pending tasks, a stalled condition) or the instance
//! reaches a terminal status. All effects go through the caller's
//! transaction; the engine never commits and never retries.
//!
//! Walks are iterative: successors are queued FIFO in declared edge order,
//! and a configurable step ceiling turns runaway cycles into a validation
//! error instead of an unbounded loop.

mod handlers;

pub use handlers::{NodeHandler, NodeOutcome};

use crate::assignee_resolver::AssigneeResolver;
use crate::condition_evaluator::ConditionEvaluator;
use crate::config::EngineConfig;
use crate::directory::Directory;
use crate::graph::{FlowGraphIndex, GraphCache};
use crate::store::StoreTx;
use bpm_types::{
    Actor, ApprovalMode, FlowDefinition, FlowError, FlowEvent, FlowInstance, FlowInstanceId,
    FlowLog, FlowResult, InstanceStatus, LogAction, NodeId, RecordedStatus, TaskId, TaskResult,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;

/// What one engine call did
#[derive(Debug, Default, Clone)]
pub struct StepReport {
    /// Nodes executed, in execution order
    pub visited: Vec<NodeId>,
    /// Tasks created by approval nodes
    pub created_tasks: Vec<TaskId>,
    /// Events to publish once the transaction commits
    pub events: Vec<FlowEvent>,
}

impl StepReport {
    pub fn merge(&mut self, other: StepReport) {
        self.visited.extend(other.visited);
        self.created_tasks.extend(other.created_tasks);
        self.events.extend(other.events);
    }
}

/// Mutable state shared by the handlers during one walk
pub struct StepContext<'a> {
    pub engine: &'a Engine,
    pub tx: &'a mut dyn StoreTx,
    pub index: &'a FlowGraphIndex,
    pub definition: &'a FlowDefinition,
    pub instance: &'a mut FlowInstance,
    pub actor: &'a Actor,
    pub now: DateTime<Utc>,
    pub report: &'a mut StepReport,
}

/// The graph interpreter
pub struct Engine {
    resolver: AssigneeResolver,
    evaluator: ConditionEvaluator,
    graphs: GraphCache,
    config: EngineConfig,
}

impl Engine {
    pub fn new(directory: Arc<dyn Directory>, config: EngineConfig) -> Self {
        Self {
            resolver: AssigneeResolver::new(directory),
            evaluator: ConditionEvaluator::new(),
            graphs: GraphCache::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &AssigneeResolver {
        &self.resolver
    }

    pub fn evaluator(&self) -> &ConditionEvaluator {
        &self.evaluator
    }

    pub fn graphs(&self) -> &GraphCache {
        &self.graphs
    }

    /// Start executing a freshly created instance: locate the START node and
    /// run its successors.
    pub async fn start_flow(
        &self,
        tx: &mut dyn StoreTx,
        instance_id: &FlowInstanceId,
        actor: &Actor,
    ) -> FlowResult<StepReport> {
        let (mut instance, definition) = load(tx, instance_id).await?;
        if !instance.is_running() {
            return Err(FlowError::precondition(format!(
                "instance {} is {}",
                instance.id, instance.status
            )));
        }

        let index = self.graphs.get_or_build(&definition)?;
        let start = index.start().clone();
        let successors = index.successors(&start);
        if successors.is_empty() {
            return Err(FlowError::validation(format!(
                "START node {} has no successor",
                start
            )));
        }

        tracing::info!(
            instance_id = %instance.id,
            definition = %definition.code,
            version = definition.version,
            "Starting flow"
        );

        let mut report = StepReport {
            visited: vec![start],
            ..Default::default()
        };
        self.walk(tx, &index, &definition, &mut instance, actor, successors, &mut report)
            .await?;
        tx.save_instance(&instance).await?;
        Ok(report)
    }

    /// Advance past a node after one of its tasks resolved.
    ///
    /// A rejection is a no-op here; the task manager owns rejection. An
    /// approval advances only if the node is still active and, for AND_SIGN
    /// nodes or nodes that have been countersigned, no task at the node is
    /// still pending.
    pub async fn advance_flow(
        &self,
        tx: &mut dyn StoreTx,
        instance_id: &FlowInstanceId,
        completed_node: &NodeId,
        result: TaskResult,
        actor: &Actor,
    ) -> FlowResult<StepReport> {
        if result != TaskResult::Approved {
            return Ok(StepReport::default());
        }

        let (mut instance, definition) = load(tx, instance_id).await?;
        if !instance.is_running() {
            tracing::debug!(instance_id = %instance.id, status = %instance.status, "Advance on finished instance ignored");
            return Ok(StepReport::default());
        }
        if !instance.is_active_at(completed_node) {
            tracing::debug!(instance_id = %instance.id, node_id = %completed_node, "Node no longer active; advance ignored");
            return Ok(StepReport::default());
        }

        let mode = definition
            .node_config(completed_node)
            .map(|c| c.approval_mode)
            .unwrap_or_default();
        let tasks = tx.tasks_at_node(&instance.id, completed_node).await?;
        let countersigned = tasks.iter().any(|t| t.status == TaskStatus::Countersigned);
        let pending = tasks.iter().filter(|t| t.is_pending()).count();

        if (mode == ApprovalMode::AndSign || countersigned) && pending > 0 {
            tracing::debug!(
                instance_id = %instance.id,
                node_id = %completed_node,
                pending,
                "Waiting for remaining approvals"
            );
            return Ok(StepReport::default());
        }

        let index = self.graphs.get_or_build(&definition)?;
        instance.deactivate(completed_node);
        let successors = index.successors(completed_node);

        tracing::info!(instance_id = %instance.id, node_id = %completed_node, "Node approved; advancing");

        let mut report = StepReport::default();
        self.walk(tx, &index, &definition, &mut instance, actor, successors, &mut report)
            .await?;
        instance.updated_at = Utc::now();
        tx.save_instance(&instance).await?;
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn walk(
        &self,
        tx: &mut dyn StoreTx,
        index: &FlowGraphIndex,
        definition: &FlowDefinition,
        instance: &mut FlowInstance,
        actor: &Actor,
        start: Vec<NodeId>,
        report: &mut StepReport,
    ) -> FlowResult<()> {
        let mut queue: VecDeque<NodeId> = start.into();
        let mut steps = 0usize;

        while let Some(node_id) = queue.pop_front() {
            if !instance.is_running() {
                break;
            }
            steps += 1;
            if steps > self.config.max_steps {
                return Err(FlowError::validation(format!(
                    "flow exceeded {} steps in one request; check the graph for cycles",
                    self.config.max_steps
                )));
            }

            let node = index.require_node(&node_id)?;
            report.visited.push(node_id.clone());
            tracing::debug!(instance_id = %instance.id, node_id = %node.id, kind = %node.kind, "Executing node");

            let mut ctx = StepContext {
                engine: self,
                tx: &mut *tx,
                index,
                definition,
                instance: &mut *instance,
                actor,
                now: Utc::now(),
                report: &mut *report,
            };
            match handlers::handler_for(node.kind).execute(&mut ctx, node).await? {
                NodeOutcome::Continue(next) => queue.extend(next),
                NodeOutcome::Wait => {}
                NodeOutcome::Finished => break,
            }
        }
        Ok(())
    }

    /// Build a log entry attributed to the system actor
    pub fn system_log(&self, instance_id: FlowInstanceId, action: LogAction) -> FlowLog {
        let mut log = FlowLog::new(instance_id, action, &Actor::System);
        log.operator_name = self.config.system_actor_name.clone();
        log
    }

    /// Build a log entry for an actor, using the configured system name for
    /// system-attributed entries
    pub fn log_for(&self, instance_id: FlowInstanceId, action: LogAction, actor: &Actor) -> FlowLog {
        match actor {
            Actor::System => self.system_log(instance_id, action),
            user => FlowLog::new(instance_id, action, user),
        }
    }

    /// Force a running instance into TERMINATED with a remark and a
    /// TERMINATE log, in the caller's transaction.
    pub(crate) async fn force_terminate(
        &self,
        tx: &mut dyn StoreTx,
        instance: &mut FlowInstance,
        node_id: &NodeId,
        remark: String,
        now: DateTime<Utc>,
        report: &mut StepReport,
    ) -> FlowResult<()> {
        let before = instance.status;
        instance.remark = Some(remark.clone());
        instance.finish(InstanceStatus::Terminated, now);

        let log = self
            .system_log(instance.id.clone(), LogAction::Terminate)
            .at_node(node_id.clone())
            .transition(
                RecordedStatus::Instance(before),
                RecordedStatus::Instance(InstanceStatus::Terminated),
            )
            .with_comment(Some(remark.clone()))
            .at(now);
        tx.append_log(&log).await?;

        tracing::warn!(instance_id = %instance.id, node_id = %node_id, remark = %remark, "Instance terminated");
        report.events.push(FlowEvent::FlowTerminated {
            instance_id: instance.id.clone(),
            reason: remark,
        });
        Ok(())
    }
}

async fn load(
    tx: &mut dyn StoreTx,
    instance_id: &FlowInstanceId,
) -> FlowResult<(FlowInstance, FlowDefinition)> {
    let instance = tx
        .get_instance(instance_id)
        .await?
        .ok_or_else(|| FlowError::InstanceNotFound(instance_id.clone()))?;
    let definition = tx
        .get_definition(&instance.definition_id)
        .await?
        .ok_or_else(|| FlowError::DefinitionNotFound(instance.definition_id.clone()))?;
    Ok((instance, definition))
}

#[cfg(test)]
mod tests;
