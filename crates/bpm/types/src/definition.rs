//! Flow definitions: versioned approval-process templates
//!
//! A definition is identified by a stable business `code` and a version
//! that increases per code. Drafts may be edited freely; once published
//! the graph and node configuration are frozen, and changes go into a new
//! version. At most one row per code is the main version new instances
//! start from.

use crate::{ConditionExpr, FlowDefinitionId, FlowError, FlowResult, NodeConfig, NodeId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ── Definition ───────────────────────────────────────────────────────

/// Publication state of a definition row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefinitionStatus {
    Draft,
    Published,
    Disabled,
}

/// One version of an approval-flow template
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: FlowDefinitionId,
    /// Stable business key shared by every version
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub version: u32,
    pub status: DefinitionStatus,
    pub is_main: bool,
    pub graph: FlowGraph,
    #[serde(default)]
    pub form_schema: Vec<FormField>,
    #[serde(default)]
    pub node_configs: HashMap<NodeId, NodeConfig>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl FlowDefinition {
    /// Create a new draft at version 1
    pub fn draft(
        code: impl Into<String>,
        name: impl Into<String>,
        graph: FlowGraph,
        created_by: UserId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: FlowDefinitionId::generate(),
            code: code.into(),
            name: name.into(),
            description: String::new(),
            category: None,
            version: 1,
            status: DefinitionStatus::Draft,
            is_main: false,
            graph,
            form_schema: Vec::new(),
            node_configs: HashMap::new(),
            created_by,
            created_at: now,
            updated_at: now,
            published_at: None,
        }
    }

    pub fn with_form_field(mut self, field: FormField) -> Self {
        self.form_schema.push(field);
        self
    }

    pub fn with_node_config(mut self, node_id: impl Into<String>, config: NodeConfig) -> Self {
        self.node_configs.insert(NodeId::new(node_id), config);
        self
    }

    pub fn is_published(&self) -> bool {
        self.status == DefinitionStatus::Published
    }

    pub fn is_editable(&self) -> bool {
        self.status == DefinitionStatus::Draft
    }

    pub fn node_config(&self, node_id: &NodeId) -> Option<&NodeConfig> {
        self.node_configs.get(node_id)
    }

    /// Check submitted form data against the form schema's required fields
    pub fn validate_form(&self, form: &Value) -> FlowResult<()> {
        let missing: Vec<&str> = self
            .form_schema
            .iter()
            .filter(|f| f.required)
            .filter(|f| match form.get(&f.name) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(Value::Array(items)) => items.is_empty(),
                Some(_) => false,
            })
            .map(|f| f.name.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Validation(format!(
                "missing required form field(s): {}",
                missing.join(", ")
            )))
        }
    }
}

// ── Graph ────────────────────────────────────────────────────────────

/// Nodes plus directed edges. Edge order is significant: condition
/// branches are tried in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: FlowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Connect two nodes with an unconditional edge
    pub fn connect(self, source: &str, target: &str) -> Self {
        self.edge(FlowEdge::new(source, target))
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

/// A graph vertex
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    pub kind: NodeKind,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(id),
            name: name.into(),
            kind,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, "Start", NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, "End", NodeKind::End)
    }

    pub fn approval(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, NodeKind::Approval)
    }

    pub fn condition(id: impl Into<String>) -> Self {
        Self::new(id, "Condition", NodeKind::Condition)
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, "Parallel", NodeKind::Parallel)
    }

    pub fn join(id: impl Into<String>) -> Self {
        Self::new(id, "Join", NodeKind::Join)
    }

    /// Name for logs and remarks; falls back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }
}

/// The declared kind of a node, which selects its handler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Start,
    End,
    Approval,
    Condition,
    Parallel,
    Join,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "START",
            Self::End => "END",
            Self::Approval => "APPROVAL",
            Self::Condition => "CONDITION",
            Self::Parallel => "PARALLEL",
            Self::Join => "JOIN",
        };
        f.write_str(s)
    }
}

/// A directed edge, optionally guarded by a branch condition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    /// Only consulted when leaving a CONDITION node; `None` marks the
    /// default branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionExpr>,
}

impl FlowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: NodeId::new(source),
            target: NodeId::new(target),
            label: String::new(),
            condition: None,
        }
    }

    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: ConditionExpr,
    ) -> Self {
        Self {
            condition: Some(condition),
            ..Self::new(source, target)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

// ── Form schema ──────────────────────────────────────────────────────

/// One field of the submission form
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub field_type: FormFieldType,
    #[serde(default)]
    pub required: bool,
}

impl FormField {
    pub fn new(name: impl Into<String>, field_type: FormFieldType) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            field_type,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormFieldType {
    #[default]
    Text,
    Textarea,
    Number,
    Date,
    Select,
    MultiSelect,
    User,
    Attachment,
}
