//! Document-store filter rendering
//!
//! `$`-operator filter documents as understood by document databases.

use serde_json::{Map, Value, json};

use super::condition::{CompiledTree, Condition, ConditionNode, Operator};

/// Render a tree as a filter document
pub fn render_filter(tree: &CompiledTree) -> Value {
    node(tree.root())
}

fn node(n: &ConditionNode) -> Value {
    match n {
        ConditionNode::Leaf(c) => leaf(c),
        ConditionNode::And(children) => match children.as_slice() {
            [] => json!({}),
            [only] => node(only),
            many => json!({"$and": many.iter().map(node).collect::<Vec<_>>()}),
        },
        ConditionNode::Or(children) => match children.as_slice() {
            [] => json!({"$nor": [{}]}),
            [only] => node(only),
            many => json!({"$or": many.iter().map(node).collect::<Vec<_>>()}),
        },
    }
}

fn leaf(c: &Condition) -> Value {
    let predicate = match c.operator {
        Operator::Eq => json!({"$eq": c.value}),
        Operator::Ne => json!({"$ne": c.value}),
        Operator::Gt => json!({"$gt": c.value}),
        Operator::Gte => json!({"$gte": c.value}),
        Operator::Lt => json!({"$lt": c.value}),
        Operator::Lte => json!({"$lte": c.value}),
        Operator::Contains => match &c.value {
            Value::String(s) => json!({"$regex": regex::escape(s)}),
            // Array membership on a document field is plain equality
            other => json!({"$eq": other}),
        },
        Operator::StartsWith => json!({"$regex": format!("^{}", escaped(&c.value))}),
        Operator::EndsWith => json!({"$regex": format!("{}$", escaped(&c.value))}),
        Operator::In => json!({"$in": c.value}),
        Operator::NotIn => json!({"$nin": c.value}),
        Operator::Regex => json!({"$regex": c.value}),
        Operator::Exists => json!({"$exists": c.value.as_bool().unwrap_or(true)}),
        Operator::IsNull => json!({"$eq": null}),
        Operator::IsNotNull => json!({"$ne": null}),
    };
    let mut filter = Map::new();
    filter.insert(c.field.clone(), predicate);
    Value::Object(filter)
}

fn escaped(value: &Value) -> String {
    value.as_str().map(regex::escape).unwrap_or_default()
}
