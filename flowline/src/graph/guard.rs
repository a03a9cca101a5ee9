//! Declarative guards evaluated over the JSON view of context data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison operators available to guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// Equal (numbers compare by value).
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Substring, array element or object key membership.
    Contains,
    /// The path resolves to a non-null value; the operand is ignored.
    Exists,
}

/// A boolean predicate attached to a transition out of a condition node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Guard {
    /// Compares the value at a dot-separated `path` with `value`.
    Compare {
        /// Dot-separated path into the data (`order.items.0.sku`).
        path: String,
        /// The operator.
        op: CompareOp,
        /// The operand.
        #[serde(default)]
        value: Value,
    },
    /// All nested guards hold.
    All {
        /// Nested guards.
        guards: Vec<Guard>,
    },
    /// At least one nested guard holds.
    Any {
        /// Nested guards.
        guards: Vec<Guard>,
    },
    /// The nested guard does not hold.
    Not {
        /// Nested guard.
        guard: Box<Guard>,
    },
}

impl Guard {
    /// Creates a comparison guard.
    #[must_use]
    pub fn compare(path: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    /// `path == value`.
    #[must_use]
    pub fn equals(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Eq, value)
    }

    /// `path != value`.
    #[must_use]
    pub fn not_equals(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Ne, value)
    }

    /// `path > value`.
    #[must_use]
    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Gt, value)
    }

    /// `path < value`.
    #[must_use]
    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Lt, value)
    }

    /// The path resolves to a non-null value.
    #[must_use]
    pub fn exists(path: impl Into<String>) -> Self {
        Self::compare(path, CompareOp::Exists, Value::Null)
    }

    /// Conjunction.
    #[must_use]
    pub fn all(guards: Vec<Self>) -> Self {
        Self::All { guards }
    }

    /// Disjunction.
    #[must_use]
    pub fn any(guards: Vec<Self>) -> Self {
        Self::Any { guards }
    }

    /// Negation.
    #[must_use]
    pub fn negate(guard: Self) -> Self {
        Self::Not {
            guard: Box::new(guard),
        }
    }

    /// Evaluates the guard. Missing paths make comparisons false.
    #[must_use]
    pub fn evaluate(&self, data: &Value) -> bool {
        match self {
            Self::Compare { path, op, value } => {
                let Some(actual) = lookup(data, path) else {
                    return false;
                };
                compare(actual, *op, value)
            }
            Self::All { guards } => guards.iter().all(|g| g.evaluate(data)),
            Self::Any { guards } => guards.iter().any(|g| g.evaluate(data)),
            Self::Not { guard } => !guard.evaluate(data),
        }
    }
}

/// Resolves a dot-separated path; numeric segments index arrays.
fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(data);
    }
    path.split('.').try_fold(data, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Exists => !actual.is_null(),
        CompareOp::Eq => values_equal(actual, expected),
        CompareOp::Ne => !values_equal(actual, expected),
        CompareOp::Gt => order(actual, expected) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(
            order(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => order(actual, expected) == Some(Ordering::Less),
        CompareOp::Le => matches!(order(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Contains => match (actual, expected) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
