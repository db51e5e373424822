use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Comparison operator of a leaf condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Regex,
    Exists,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub const ALL: [Operator; 15] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::Contains,
        Operator::StartsWith,
        Operator::EndsWith,
        Operator::In,
        Operator::NotIn,
        Operator::Regex,
        Operator::Exists,
        Operator::IsNull,
        Operator::IsNotNull,
    ];

    /// Canonical wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Regex => "regex",
            Operator::Exists => "exists",
            Operator::IsNull => "is_null",
            Operator::IsNotNull => "is_not_null",
        }
    }

    /// Case-insensitive lookup accepting both `startswith` and `starts_with`
    pub fn parse(name: &str) -> Option<Self> {
        let op = match name.to_ascii_lowercase().as_str() {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "contains" => Operator::Contains,
            "startswith" | "starts_with" => Operator::StartsWith,
            "endswith" | "ends_with" => Operator::EndsWith,
            "in" => Operator::In,
            "notin" | "not_in" => Operator::NotIn,
            "regex" => Operator::Regex,
            "exists" => Operator::Exists,
            "isnull" | "is_null" => Operator::IsNull,
            "isnotnull" | "is_not_null" => Operator::IsNotNull,
            _ => return None,
        };
        Some(op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Regex compiled from a leaf's pattern, shared by every clone of the leaf.
/// Equality is carried by the pattern text in `Condition::value`.
#[derive(Clone)]
struct CompiledPattern(Arc<Regex>);

impl PartialEq for CompiledPattern {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl fmt::Debug for CompiledPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompiledPattern")
    }
}

/// `field <operator> value`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
    pattern: Option<CompiledPattern>,
}

impl Condition {
    /// Build a leaf. A `Regex` leaf with an invalid pattern matches nothing.
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        let pattern = match (operator, &value) {
            (Operator::Regex, Value::String(p)) => {
                Regex::new(p).ok().map(|re| CompiledPattern(Arc::new(re)))
            }
            _ => None,
        };
        Self {
            field: field.into(),
            operator,
            value,
            pattern,
        }
    }

    /// `Regex` leaf from an already compiled pattern
    pub(crate) fn regex(field: impl Into<String>, pattern: Regex) -> Self {
        Self {
            field: field.into(),
            operator: Operator::Regex,
            value: Value::String(pattern.as_str().to_string()),
            pattern: Some(CompiledPattern(Arc::new(pattern))),
        }
    }

    /// Compiled pattern of a `Regex` leaf
    pub fn pattern(&self) -> Option<&Regex> {
        self.pattern.as_ref().map(|p| p.0.as_ref())
    }

    /// Evaluate against a record. Dotted field names reach into nested objects.
    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        let actual = lookup(record, &self.field);
        match self.operator {
            Operator::Eq => actual.is_some_and(|v| values_equal(v, &self.value)),
            Operator::Ne => !actual.is_some_and(|v| values_equal(v, &self.value)),
            Operator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Contains => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => {
                    items.iter().any(|item| values_equal(item, needle))
                }
                _ => false,
            },
            Operator::StartsWith => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            Operator::EndsWith => match (actual, &self.value) {
                (Some(Value::String(s)), Value::String(suffix)) => s.ends_with(suffix.as_str()),
                _ => false,
            },
            Operator::In => match (actual, &self.value) {
                (Some(v), Value::Array(options)) => options.iter().any(|o| values_equal(v, o)),
                _ => false,
            },
            Operator::NotIn => match (actual, &self.value) {
                (Some(v), Value::Array(options)) => !options.iter().any(|o| values_equal(v, o)),
                _ => true,
            },
            Operator::Regex => match (actual, self.pattern()) {
                (Some(Value::String(s)), Some(re)) => re.is_match(s),
                _ => false,
            },
            Operator::Exists => {
                let wanted = self.value.as_bool().unwrap_or(true);
                actual.is_some() == wanted
            }
            Operator::IsNull => actual.is_none_or(Value::is_null),
            Operator::IsNotNull => actual.is_some_and(|v| !v.is_null()),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "field": self.field,
            "operator": self.operator.as_str(),
            "value": self.value,
        })
    }
}

fn lookup<'a>(record: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    if let Some(v) = record.get(field) {
        return Some(v);
    }
    let mut parts = field.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Equality that treats `1` and `1.0` as the same number
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

pub(crate) fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Node of a compiled condition tree. An empty `And` matches everything,
/// an empty `Or` matches nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionNode {
    Leaf(Condition),
    And(Vec<ConditionNode>),
    Or(Vec<ConditionNode>),
}

impl ConditionNode {
    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        match self {
            ConditionNode::Leaf(c) => c.matches(record),
            ConditionNode::And(children) => children.iter().all(|c| c.matches(record)),
            ConditionNode::Or(children) => children.iter().any(|c| c.matches(record)),
        }
    }

    /// Explicit wire form; compiling it again yields the same node
    pub fn to_json(&self) -> Value {
        match self {
            ConditionNode::Leaf(c) => c.to_json(),
            ConditionNode::And(children) => json!({
                "operator": "and",
                "conditions": children.iter().map(ConditionNode::to_json).collect::<Vec<_>>(),
            }),
            ConditionNode::Or(children) => json!({
                "operator": "or",
                "conditions": children.iter().map(ConditionNode::to_json).collect::<Vec<_>>(),
            }),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            ConditionNode::Leaf(_) => 1,
            ConditionNode::And(children) | ConditionNode::Or(children) => {
                1 + children.iter().map(ConditionNode::depth).max().unwrap_or(0)
            }
        }
    }
}

/// Canonical compiled query. The root is always a group node.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTree {
    root: ConditionNode,
}

impl CompiledTree {
    pub(crate) fn new(root: ConditionNode) -> Self {
        let root = match root {
            leaf @ ConditionNode::Leaf(_) => ConditionNode::And(vec![leaf]),
            group => group,
        };
        Self { root }
    }

    /// Tree that matches every record (full scan)
    pub fn match_all() -> Self {
        Self {
            root: ConditionNode::And(Vec::new()),
        }
    }

    /// Match a single record by its `id`
    pub fn by_id(id: Value) -> Self {
        Self::new(ConditionNode::Leaf(Condition::new("id", Operator::Eq, id)))
    }

    pub fn root(&self) -> &ConditionNode {
        &self.root
    }

    pub fn is_match_all(&self) -> bool {
        matches!(&self.root, ConditionNode::And(children) if children.is_empty())
    }

    pub fn matches(&self, record: &Map<String, Value>) -> bool {
        self.root.matches(record)
    }

    pub fn to_json(&self) -> Value {
        self.root.to_json()
    }
}

impl Serialize for CompiledTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
