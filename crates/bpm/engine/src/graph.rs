//! Adjacency-indexed view of a flow graph
//!
//! Built once per definition and cached. Outgoing edges keep their
//! declaration order so condition branches are tried as authored.

use bpm_types::{
    FlowDefinition, FlowDefinitionId, FlowEdge, FlowError, FlowGraph, FlowNode, FlowResult,
    NodeId, NodeKind,
};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Indexed, structurally validated flow graph
#[derive(Debug, Clone)]
pub struct FlowGraphIndex {
    nodes: HashMap<NodeId, FlowNode>,
    edges: Vec<FlowEdge>,
    outgoing: HashMap<NodeId, Vec<usize>>,
    start: NodeId,
}

impl FlowGraphIndex {
    /// Index a graph. Fails on duplicate node ids, edges that reference
    /// unknown nodes, or anything other than exactly one START node.
    pub fn build(graph: &FlowGraph) -> FlowResult<Self> {
        let mut nodes = HashMap::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            if nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(FlowError::validation(format!("duplicate node id: {}", node.id)));
            }
        }

        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();
        for (i, edge) in graph.edges.iter().enumerate() {
            for end in [&edge.source, &edge.target] {
                if !nodes.contains_key(end) {
                    return Err(FlowError::validation(format!(
                        "edge {} -> {} references unknown node {}",
                        edge.source, edge.target, end
                    )));
                }
            }
            outgoing.entry(edge.source.clone()).or_default().push(i);
        }

        let mut starts = graph.nodes.iter().filter(|n| n.kind == NodeKind::Start);
        let start = match (starts.next(), starts.next()) {
            (Some(start), None) => start.id.clone(),
            (None, _) => return Err(FlowError::validation("graph has no START node")),
            (Some(_), Some(_)) => {
                return Err(FlowError::validation("graph has more than one START node"))
            }
        };

        Ok(Self {
            nodes,
            edges: graph.edges.clone(),
            outgoing,
            start,
        })
    }

    pub fn start(&self) -> &NodeId {
        &self.start
    }

    pub fn node(&self, id: &NodeId) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    pub fn require_node(&self, id: &NodeId) -> FlowResult<&FlowNode> {
        self.node(id).ok_or_else(|| FlowError::NodeNotFound(id.clone()))
    }

    /// Outgoing edges in declaration order
    pub fn outgoing(&self, id: &NodeId) -> impl Iterator<Item = &FlowEdge> + '_ {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    /// Successor node ids in declaration order
    pub fn successors(&self, id: &NodeId) -> Vec<NodeId> {
        self.outgoing(id).map(|e| e.target.clone()).collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    /// The PARALLEL node whose branches meet at `join`, found by walking
    /// edges backwards. Inner PARALLEL/JOIN pairs on the way are skipped.
    pub fn opening_parallel(&self, join: &NodeId) -> Option<NodeId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([(join.clone(), 0usize)]);
        while let Some((id, depth)) = queue.pop_front() {
            for edge in self.edges.iter().filter(|e| e.target == id) {
                let Some(node) = self.nodes.get(&edge.source) else {
                    continue;
                };
                let depth = match node.kind {
                    NodeKind::Parallel if depth == 0 => return Some(node.id.clone()),
                    NodeKind::Parallel => depth - 1,
                    NodeKind::Join => depth + 1,
                    _ => depth,
                };
                if seen.insert((node.id.clone(), depth)) {
                    queue.push_back((node.id.clone(), depth));
                }
            }
        }
        None
    }
}

/// Publish-time validation: structural checks plus configuration coverage
pub fn validate_definition(definition: &FlowDefinition) -> FlowResult<FlowGraphIndex> {
    let index = FlowGraphIndex::build(&definition.graph)?;

    if index.successors(index.start()).is_empty() {
        return Err(FlowError::validation("START node has no outgoing edge"));
    }
    if !index.nodes().any(|n| n.kind == NodeKind::End) {
        return Err(FlowError::validation("graph has no END node"));
    }

    let mut unconfigured: Vec<&str> = index
        .nodes()
        .filter(|n| n.kind == NodeKind::Approval)
        .filter(|n| definition.node_config(&n.id).is_none())
        .map(|n| n.id.as_str())
        .collect();
    if !unconfigured.is_empty() {
        unconfigured.sort_unstable();
        return Err(FlowError::validation(format!(
            "approval node(s) without configuration: {}",
            unconfigured.join(", ")
        )));
    }

    Ok(index)
}

/// Per-definition cache of graph indexes.
///
/// Keyed by definition id. Published graphs are immutable, so an entry
/// never goes stale; drafts are indexed on demand and evicted on edit.
#[derive(Debug, Default)]
pub struct GraphCache {
    entries: DashMap<FlowDefinitionId, Arc<FlowGraphIndex>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(&self, definition: &FlowDefinition) -> FlowResult<Arc<FlowGraphIndex>> {
        if let Some(index) = self.entries.get(&definition.id) {
            return Ok(Arc::clone(index.value()));
        }
        let index = Arc::new(FlowGraphIndex::build(&definition.graph)?);
        self.entries.insert(definition.id.clone(), Arc::clone(&index));
        Ok(index)
    }

    pub fn invalidate(&self, id: &FlowDefinitionId) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpm_types::{AssigneeRule, ConditionExpr, ConditionOperator, NodeConfig, UserId};
    use serde_json::json;

    fn linear() -> FlowGraph {
        FlowGraph::new()
            .node(FlowNode::start("start"))
            .node(FlowNode::approval("review", "Review"))
            .node(FlowNode::end("end"))
            .connect("start", "review")
            .connect("review", "end")
    }

    #[test]
    fn test_build_and_successors() {
        let index = FlowGraphIndex::build(&linear()).unwrap();
        assert_eq!(index.start().as_str(), "start");
        assert_eq!(index.successors(&NodeId::new("start")), vec![NodeId::new("review")]);
        assert!(index.successors(&NodeId::new("end")).is_empty());
    }

    #[test]
    fn test_outgoing_preserves_declaration_order() {
        let graph = FlowGraph::new()
            .node(FlowNode::start("s"))
            .node(FlowNode::condition("c"))
            .node(FlowNode::end("z"))
            .node(FlowNode::end("a"))
            .node(FlowNode::end("m"))
            .connect("s", "c")
            .edge(FlowEdge::conditional(
                "c",
                "z",
                ConditionExpr::single("x", ConditionOperator::Eq, json!(1)),
            ))
            .connect("c", "a")
            .connect("c", "m");
        let index = FlowGraphIndex::build(&graph).unwrap();
        let targets: Vec<&str> = index
            .outgoing(&NodeId::new("c"))
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(targets, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_opening_parallel_skips_nested_pairs() {
        let graph = FlowGraph::new()
            .node(FlowNode::start("s"))
            .node(FlowNode::parallel("outer"))
            .node(FlowNode::parallel("inner"))
            .node(FlowNode::approval("a", "A"))
            .node(FlowNode::approval("b", "B"))
            .node(FlowNode::join("inner_join"))
            .node(FlowNode::approval("c", "C"))
            .node(FlowNode::join("outer_join"))
            .node(FlowNode::end("e"))
            .connect("s", "outer")
            .connect("outer", "inner")
            .connect("outer", "c")
            .connect("inner", "a")
            .connect("inner", "b")
            .connect("a", "inner_join")
            .connect("b", "inner_join")
            .connect("inner_join", "outer_join")
            .connect("c", "outer_join")
            .connect("outer_join", "e");
        let index = FlowGraphIndex::build(&graph).unwrap();

        assert_eq!(
            index.opening_parallel(&NodeId::new("inner_join")),
            Some(NodeId::new("inner"))
        );
        assert_eq!(
            index.opening_parallel(&NodeId::new("outer_join")),
            Some(NodeId::new("outer"))
        );
        assert_eq!(index.opening_parallel(&NodeId::new("e")), Some(NodeId::new("outer")));

        let linear = FlowGraphIndex::build(&linear()).unwrap();
        assert_eq!(linear.opening_parallel(&NodeId::new("end")), None);
    }

    #[test]
    fn test_rejects_structural_errors() {
        let dup = linear().node(FlowNode::end("end"));
        assert!(matches!(FlowGraphIndex::build(&dup), Err(FlowError::Validation(_))));

        let dangling = linear().connect("review", "ghost");
        assert!(matches!(FlowGraphIndex::build(&dangling), Err(FlowError::Validation(_))));

        let no_start = FlowGraph::new().node(FlowNode::end("end"));
        assert!(matches!(FlowGraphIndex::build(&no_start), Err(FlowError::Validation(_))));

        let two_starts = linear().node(FlowNode::start("start2"));
        assert!(matches!(FlowGraphIndex::build(&two_starts), Err(FlowError::Validation(_))));
    }

    #[test]
    fn test_validate_definition_requires_configs_and_end() {
        let def = FlowDefinition::draft("c", "C", linear(), UserId::new("u"));
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("review"));

        let def = def.with_node_config("review", NodeConfig::new(AssigneeRule::InitiatorLeader));
        assert!(validate_definition(&def).is_ok());

        let no_end = FlowGraph::new()
            .node(FlowNode::start("s"))
            .node(FlowNode::join("j"))
            .connect("s", "j");
        let def = FlowDefinition::draft("c", "C", no_end, UserId::new("u"));
        assert!(validate_definition(&def).is_err());

        let isolated_start = FlowGraph::new()
            .node(FlowNode::start("s"))
            .node(FlowNode::end("e"));
        let def = FlowDefinition::draft("c", "C", isolated_start, UserId::new("u"));
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_cache_reuses_index() {
        let cache = GraphCache::new();
        let def = FlowDefinition::draft("c", "C", linear(), UserId::new("u"));
        let a = cache.get_or_build(&def).unwrap();
        let b = cache.get_or_build(&def).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        cache.invalidate(&def.id);
        assert!(cache.is_empty());
    }
}
