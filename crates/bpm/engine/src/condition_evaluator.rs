//! Condition evaluator: decides which branch a CONDITION node takes
//!
//! Evaluates a [`ConditionExpr`] against submitted form data. It has no
//! side effects beyond a warning for unknown operators.
//!
//! Semantics:
//! - `eq` / `ne`: strict equality; numbers compare by value (`1 == 1.0`),
//!   values of different JSON types are never equal, a missing field
//!   equals nothing
//! - `gt` / `gte` / `lt` / `lte`: both sides coerced to numbers; anything
//!   that does not coerce becomes NaN and every comparison fails
//! - `in`: the condition value must be an array containing the field value
//! - `contains`: both operands must be strings; substring test
//! - a single condition without `field` or `operator`, and a group with no
//!   children, evaluate to `true`

use bpm_types::{ConditionExpr, ConditionGroup, ConditionOperator, Logic, SingleCondition};
use serde_json::Value;

/// Pure evaluator for branch conditions
#[derive(Clone, Copy, Debug, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate an expression against form data
    pub fn evaluate(&self, expr: &ConditionExpr, form: &Value) -> bool {
        match expr {
            ConditionExpr::Single(single) => self.evaluate_single(single, form),
            ConditionExpr::Group(group) => self.evaluate_group(group, form),
        }
    }

    fn evaluate_group(&self, group: &ConditionGroup, form: &Value) -> bool {
        if group.conditions.is_empty() {
            return true;
        }
        match group.logic {
            Logic::And => group.conditions.iter().all(|c| self.evaluate(c, form)),
            Logic::Or => group.conditions.iter().any(|c| self.evaluate(c, form)),
        }
    }

    fn evaluate_single(&self, cond: &SingleCondition, form: &Value) -> bool {
        let (Some(field), Some(raw_op)) = (cond.field.as_deref(), cond.operator.as_deref()) else {
            return true;
        };
        if field.is_empty() || raw_op.is_empty() {
            return true;
        }

        let Some(op) = ConditionOperator::parse(raw_op) else {
            tracing::warn!(operator = %raw_op, field = %field, "Unknown condition operator");
            return false;
        };

        let actual = lookup_path(form, field);
        let expected = &cond.value;

        match op {
            ConditionOperator::Eq => strict_eq(actual, expected),
            ConditionOperator::Ne => !strict_eq(actual, expected),
            ConditionOperator::Gt => to_number(actual) > to_number(Some(expected)),
            ConditionOperator::Gte => to_number(actual) >= to_number(Some(expected)),
            ConditionOperator::Lt => to_number(actual) < to_number(Some(expected)),
            ConditionOperator::Lte => to_number(actual) <= to_number(Some(expected)),
            ConditionOperator::In => match expected {
                Value::Array(items) => items.iter().any(|item| strict_eq(actual, item)),
                _ => false,
            },
            ConditionOperator::Contains => match (actual, expected) {
                (Some(Value::String(haystack)), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                _ => false,
            },
        }
    }
}

/// Convenience wrapper around [`ConditionEvaluator::evaluate`]
pub fn evaluate(expr: &ConditionExpr, form: &Value) -> bool {
    ConditionEvaluator.evaluate(expr, form)
}

/// Resolve a dot-separated path. Array segments accept numeric indices.
pub fn lookup_path<'a>(form: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(form, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn strict_eq(actual: Option<&Value>, expected: &Value) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (a, b) => a == b,
    }
}

fn to_number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Some(Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::Null) => 0.0,
        Some(Value::Array(_)) | Some(Value::Object(_)) | None => f64::NAN,
    }
}
