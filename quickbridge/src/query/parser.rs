//! Normalizing condition parser
//!
//! Accepted surface syntaxes:
//! - single leaf: `{"field": "age", "operator": "gt", "value": 18}`
//! - flat array of nodes (AND): `[{..}, {..}]`
//! - key-value shorthand (AND of Eq): `{"name": "alice", "age": {"gte": 18}}`
//! - explicit group: `{"operator": "and" | "or", "conditions": [..]}`
//!
//! The flat syntaxes are order-insensitive, so their children are sorted by
//! canonical encoding. Explicit groups keep the caller's order and nesting.

use serde_json::{Map, Value};

use super::condition::{CompiledTree, Condition, ConditionNode, Operator};
use super::fingerprint::{CacheKeyFragment, canonical_json};
use crate::core::CompileError;

/// Compile a raw condition into its canonical tree and key fragment
pub fn compile(raw: &Value) -> Result<(CompiledTree, CacheKeyFragment), CompileError> {
    let tree = compile_tree(raw)?;
    let fragment = CacheKeyFragment::of_tree(&tree);
    Ok((tree, fragment))
}

/// Compile a serialized condition
pub fn compile_str(raw: &str) -> Result<(CompiledTree, CacheKeyFragment), CompileError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| CompileError::Malformed(format!("unparseable condition: {}", e)))?;
    compile(&value)
}

/// Compile without computing the fragment
pub fn compile_tree(raw: &Value) -> Result<CompiledTree, CompileError> {
    match raw {
        Value::Null => Ok(CompiledTree::match_all()),
        other => parse_node(other).map(CompiledTree::new),
    }
}

fn parse_node(value: &Value) -> Result<ConditionNode, CompileError> {
    match value {
        Value::Array(items) => {
            let children = items
                .iter()
                .map(parse_node)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ConditionNode::And(sorted(children)))
        }
        Value::Object(map) => {
            if is_group(map) {
                return parse_group(map);
            }
            if is_leaf(map) {
                return parse_leaf(map).map(ConditionNode::Leaf);
            }
            let mut leaves = parse_shorthand(map)?;
            if leaves.len() == 1 {
                if let Some(leaf) = leaves.pop() {
                    return Ok(ConditionNode::Leaf(leaf));
                }
            }
            Ok(ConditionNode::And(sorted(
                leaves.into_iter().map(ConditionNode::Leaf).collect(),
            )))
        }
        other => Err(CompileError::Malformed(format!(
            "condition must be an object or array, got {}",
            type_name(other)
        ))),
    }
}

fn is_group(map: &Map<String, Value>) -> bool {
    map.len() == 2
        && map.get("operator").is_some_and(Value::is_string)
        && map.get("conditions").is_some_and(Value::is_array)
}

fn is_leaf(map: &Map<String, Value>) -> bool {
    map.get("field").is_some_and(Value::is_string)
        && map.get("operator").is_some_and(Value::is_string)
        && map
            .keys()
            .all(|k| matches!(k.as_str(), "field" | "operator" | "value"))
}

fn parse_group(map: &Map<String, Value>) -> Result<ConditionNode, CompileError> {
    let operator = map.get("operator").and_then(Value::as_str).unwrap_or_default();
    let items = match map.get("conditions") {
        Some(Value::Array(items)) => items,
        _ => return Err(CompileError::Malformed("conditions must be an array".into())),
    };
    let children = items
        .iter()
        .map(parse_node)
        .collect::<Result<Vec<_>, _>>()?;

    match operator.to_ascii_lowercase().as_str() {
        "and" => Ok(ConditionNode::And(children)),
        "or" => Ok(ConditionNode::Or(children)),
        other => Err(CompileError::UnknownOperator(other.to_string())),
    }
}

fn parse_leaf(map: &Map<String, Value>) -> Result<Condition, CompileError> {
    let field = map.get("field").and_then(Value::as_str).unwrap_or_default();
    let operator = map.get("operator").and_then(Value::as_str).unwrap_or_default();
    let value = map.get("value").cloned().unwrap_or(Value::Null);
    build_leaf(field, operator, value)
}

/// `{"name": "alice", "age": {"gte": 18, "lt": 65}}`
fn parse_shorthand(map: &Map<String, Value>) -> Result<Vec<Condition>, CompileError> {
    let mut leaves = Vec::with_capacity(map.len());
    for (field, value) in map {
        match value {
            Value::Object(ops)
                if !ops.is_empty() && ops.keys().all(|k| Operator::parse(k).is_some()) =>
            {
                for (op, operand) in ops {
                    leaves.push(build_leaf(field, op, operand.clone())?);
                }
            }
            other => leaves.push(build_leaf(field, "eq", other.clone())?),
        }
    }
    Ok(leaves)
}

fn build_leaf(field: &str, operator: &str, value: Value) -> Result<Condition, CompileError> {
    if field.is_empty() {
        return Err(CompileError::Malformed("field name must not be empty".into()));
    }
    let op =
        Operator::parse(operator).ok_or_else(|| CompileError::UnknownOperator(operator.into()))?;

    let mismatch = |value: &Value| CompileError::TypeMismatch {
        field: field.to_string(),
        operator: format!("{:?}", op),
        found: type_name(value).to_string(),
    };

    let value = match op {
        Operator::Eq | Operator::Ne => value,
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => match value {
            Value::Number(_) | Value::String(_) => value,
            other => return Err(mismatch(&other)),
        },
        Operator::Contains => match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => value,
            other => return Err(mismatch(&other)),
        },
        Operator::StartsWith | Operator::EndsWith => match value {
            Value::String(_) => value,
            other => return Err(mismatch(&other)),
        },
        Operator::Regex => match value {
            Value::String(ref pattern) => {
                let compiled = regex::Regex::new(pattern).map_err(|e| CompileError::InvalidRegex {
                    field: field.to_string(),
                    reason: e.to_string(),
                })?;
                return Ok(Condition::regex(field, compiled));
            }
            other => return Err(mismatch(&other)),
        },
        Operator::In | Operator::NotIn => match value {
            Value::Array(_) => value,
            other => return Err(mismatch(&other)),
        },
        Operator::Exists => match value {
            Value::Null => Value::Bool(true),
            Value::Bool(_) => value,
            other => return Err(mismatch(&other)),
        },
        // The operand carries no meaning; normalize so keys agree
        Operator::IsNull | Operator::IsNotNull => Value::Null,
    };

    Ok(Condition::new(field, op, value))
}

fn sorted(mut children: Vec<ConditionNode>) -> Vec<ConditionNode> {
    children.sort_by_cached_key(|node| canonical_json(&node.to_json()));
    children
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_three_syntaxes_agree() {
        let single = json!({"field": "name", "operator": "Eq", "value": "alice"});
        let array = json!([{"field": "name", "operator": "eq", "value": "alice"}]);
        let shorthand = json!({"name": "alice"});

        let (t1, k1) = compile(&single).unwrap();
        let (t2, k2) = compile(&array).unwrap();
        let (t3, k3) = compile(&shorthand).unwrap();
        assert_eq!(t1, t2);
        assert_eq!(t2, t3);
        assert_eq!(k1, k2);
        assert_eq!(k2, k3);
    }

    #[test]
    fn test_multi_field_and_agrees_regardless_of_order() {
        let array = json!([
            {"field": "status", "operator": "eq", "value": "active"},
            {"field": "age", "operator": "eq", "value": 30}
        ]);
        let shorthand = json!({"age": 30, "status": "active"});
        let explicit_sorted = json!({"operator": "and", "conditions": [
            {"field": "age", "operator": "eq", "value": 30},
            {"field": "status", "operator": "eq", "value": "active"}
        ]});

        let (a, ka) = compile(&array).unwrap();
        let (b, kb) = compile(&shorthand).unwrap();
        let (c, kc) = compile(&explicit_sorted).unwrap();
        assert_eq!(a, b);
        assert_eq!(ka, kb);
        assert_eq!(b, c);
        assert_eq!(kb, kc);
    }

    #[test]
    fn test_operator_object_shorthand() {
        let (tree, _) = compile(&json!({"age": {"gte": 18, "lt": 65}})).unwrap();
        match tree.root() {
            ConditionNode::And(children) => assert_eq!(children.len(), 2),
            other => panic!("unexpected root {:?}", other),
        }
    }

    #[test]
    fn test_object_value_equality() {
        let (tree, _) = compile(&json!({"meta": {"color": "red"}})).unwrap();
        let expected = CompiledTree::new(ConditionNode::Leaf(Condition::new(
            "meta",
            Operator::Eq,
            json!({"color": "red"}),
        )));
        assert_eq!(tree, expected);
    }

    #[test]
    fn test_empty_inputs_match_all() {
        for raw in [json!([]), json!({}), Value::Null] {
            let (tree, _) = compile(&raw).unwrap();
            assert!(tree.is_match_all(), "{} should match all", raw);
        }
    }

    #[test]
    fn test_nested_groups_preserved() {
        let raw = json!({"operator": "or", "conditions": [
            {"operator": "and", "conditions": [
                {"field": "a", "operator": "eq", "value": 1},
                {"operator": "or", "conditions": [
                    {"field": "b", "operator": "gt", "value": 2},
                    {"field": "c", "operator": "lt", "value": 3}
                ]}
            ]},
            {"field": "d", "operator": "is_null", "value": null}
        ]});
        let (tree, _) = compile(&raw).unwrap();
        assert!(matches!(tree.root(), ConditionNode::Or(children) if children.len() == 2));
        assert_eq!(tree.root().depth(), 4);
    }

    #[test]
    fn test_round_trip() {
        let raws = [
            json!({"name": "alice", "age": {"gt": 3}}),
            json!({"operator": "or", "conditions": [
                {"field": "x", "operator": "in", "value": [1, 2]},
                {"operator": "and", "conditions": []}
            ]}),
            json!({"field": "tags", "operator": "contains", "value": "rust"}),
            json!([]),
        ];
        for raw in raws {
            let (tree, key) = compile(&raw).unwrap();
            let (again, key_again) = compile(&tree.to_json()).unwrap();
            assert_eq!(tree, again);
            assert_eq!(key, key_again);
        }
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            compile_str("{not json"),
            Err(CompileError::Malformed(_))
        ));
        assert!(matches!(
            compile(&json!({"field": "a", "operator": "like", "value": 1})),
            Err(CompileError::UnknownOperator(op)) if op == "like"
        ));
        assert!(matches!(
            compile(&json!({"operator": "xor", "conditions": []})),
            Err(CompileError::UnknownOperator(_))
        ));
        assert!(matches!(
            compile(&json!({"field": "tags", "operator": "contains", "value": null})),
            Err(CompileError::TypeMismatch { .. })
        ));
        assert!(matches!(
            compile(&json!({"field": "age", "operator": "in", "value": 3})),
            Err(CompileError::TypeMismatch { .. })
        ));
        assert!(matches!(
            compile(&json!({"field": "name", "operator": "regex", "value": "(unclosed"})),
            Err(CompileError::InvalidRegex { .. })
        ));
        assert!(matches!(compile(&json!(42)), Err(CompileError::Malformed(_))));
    }

    #[test]
    fn test_null_operand_normalized() {
        let (a, ka) = compile(&json!({"field": "d", "operator": "is_null", "value": true})).unwrap();
        let (b, kb) = compile(&json!({"field": "d", "operator": "isnull"})).unwrap();
        assert_eq!(a, b);
        assert_eq!(ka, kb);
    }
}
