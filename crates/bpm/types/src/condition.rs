//! Branch condition expressions
//!
//! A condition is either a single comparison against a (dot-path) form
//! field, or a group combining child conditions with `and` / `or`. The
//! expressions are plain data; evaluation lives in the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A boolean predicate over submitted form data
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionExpr {
    /// `{logic, conditions}`
    Group(ConditionGroup),
    /// `{field, operator, value}`
    Single(SingleCondition),
}

impl ConditionExpr {
    /// Build a single comparison
    pub fn single(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self::Single(SingleCondition {
            field: Some(field.into()),
            operator: Some(operator.as_str().to_string()),
            value,
        })
    }

    /// All children must hold
    pub fn all(conditions: Vec<ConditionExpr>) -> Self {
        Self::Group(ConditionGroup {
            logic: Logic::And,
            conditions,
        })
    }

    /// At least one child must hold
    pub fn any(conditions: Vec<ConditionExpr>) -> Self {
        Self::Group(ConditionGroup {
            logic: Logic::Or,
            conditions,
        })
    }
}

/// A single comparison. `field` and `operator` are optional on the wire;
/// a condition missing either one is treated as satisfied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SingleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Kept as the raw operator string so unknown operators survive a
    /// round trip and can be reported at evaluation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default)]
    pub value: Value,
}

impl SingleCondition {
    /// The parsed operator, if it is one the evaluator understands
    pub fn parsed_operator(&self) -> Option<ConditionOperator> {
        self.operator.as_deref().and_then(ConditionOperator::parse)
    }
}

/// A group of child conditions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub logic: Logic,
    #[serde(default)]
    pub conditions: Vec<ConditionExpr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    And,
    Or,
}

/// Comparison operators understood by the evaluator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
}

impl ConditionOperator {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "in" => Some(Self::In),
            "contains" => Some(Self::Contains),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Contains => "contains",
        }
    }
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
