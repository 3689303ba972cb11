//! Usage and access policy model.
//!
//! A [`Policy`] is a set of permissions and prohibitions, each guarded by
//! constraints. Evaluation against a participant lives in the policy engine;
//! this module only defines the shapes and the operator semantics shared by
//! policy constraints and asset selectors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator used in constraints and asset selector criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[serde(alias = "=")]
    Eq,
    #[serde(alias = "!=")]
    Neq,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Geq,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Leq,
    In,
}

impl Operator {
    /// Apply this operator with `left` as the observed value and `right` as the
    /// constraint operand.
    ///
    /// Ordering operators compare numerically and are false when either side
    /// is not a number. `In` expects `right` to be an array.
    pub fn apply(self, left: &str, right: &Value) -> bool {
        match self {
            Operator::Eq => value_as_string(right).is_some_and(|r| r == left),
            Operator::Neq => value_as_string(right).is_some_and(|r| r != left),
            Operator::In => match right {
                Value::Array(items) => items
                    .iter()
                    .filter_map(value_as_string)
                    .any(|item| item == left),
                other => value_as_string(other).is_some_and(|r| r == left),
            },
            Operator::Gt | Operator::Geq | Operator::Lt | Operator::Leq => {
                let (Ok(l), Some(r)) = (left.parse::<f64>(), value_as_f64(right)) else {
                    return false;
                };
                match self {
                    Operator::Gt => l > r,
                    Operator::Geq => l >= r,
                    Operator::Lt => l < r,
                    _ => l <= r,
                }
            }
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Gt => ">",
            Operator::Geq => ">=",
            Operator::Lt => "<",
            Operator::Leq => "<=",
            Operator::In => "in",
        }
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A constraint guarding a permission or prohibition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// `left operator right`, where `left` names a registered constraint function.
    Atomic {
        left: String,
        operator: Operator,
        right: Value,
    },
    /// All nested constraints hold.
    And { constraints: Vec<Constraint> },
    /// At least one nested constraint holds.
    Or { constraints: Vec<Constraint> },
    /// Exactly one nested constraint holds.
    Xone { constraints: Vec<Constraint> },
}

impl Constraint {
    pub fn atomic(left: impl Into<String>, operator: Operator, right: impl Into<Value>) -> Self {
        Constraint::Atomic {
            left: left.into(),
            operator,
            right: right.into(),
        }
    }

    /// Human-readable rendering used in evaluation problems.
    pub fn describe(&self) -> String {
        match self {
            Constraint::Atomic {
                left,
                operator,
                right,
            } => format!("{} {} {}", left, operator.symbol(), right),
            Constraint::And { constraints } => join_described("and", constraints),
            Constraint::Or { constraints } => join_described("or", constraints),
            Constraint::Xone { constraints } => join_described("xone", constraints),
        }
    }
}

fn join_described(op: &str, constraints: &[Constraint]) -> String {
    let parts: Vec<String> = constraints.iter().map(Constraint::describe).collect();
    format!("{}({})", op, parts.join(", "))
}

/// A permitted action, granted only when all of its constraints hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// A prohibited action, violated when all of its constraints hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prohibition {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// An access or usage policy.
///
/// The empty policy (no permissions, no prohibitions) permits everyone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub prohibitions: Vec<Prohibition>,
}

impl Policy {
    pub fn permit_all() -> Self {
        Self::default()
    }

    /// A policy with a single permission guarded by `constraints`.
    pub fn permission(action: Option<&str>, constraints: Vec<Constraint>) -> Self {
        Self {
            permissions: vec![Permission {
                action: action.map(str::to_string),
                constraints,
            }],
            prohibitions: vec![],
        }
    }
}
