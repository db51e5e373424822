//! SQL rendering of a compiled tree
//!
//! Produces a parameterised `WHERE` body plus bound values. Values are never
//! inlined into the clause text.

use serde::Serialize;
use serde_json::Value;

use super::condition::{CompiledTree, Condition, ConditionNode, Operator};
use crate::core::{BackendKind, QueryOptions, SortDirection};

/// Placeholder and quoting flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Sqlite,
    Postgres,
    Mysql,
}

impl SqlDialect {
    pub fn for_kind(kind: BackendKind) -> Option<Self> {
        match kind {
            BackendKind::Sqlite => Some(SqlDialect::Sqlite),
            BackendKind::Postgresql => Some(SqlDialect::Postgres),
            BackendKind::Mysql => Some(SqlDialect::Mysql),
            BackendKind::Mongodb => None,
        }
    }

    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            SqlDialect::Mysql => format!("`{}`", ident.replace('`', "``")),
            SqlDialect::Sqlite | SqlDialect::Postgres => {
                format!("\"{}\"", ident.replace('"', "\"\""))
            }
        }
    }

    fn placeholder(&self, position: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", position),
            SqlDialect::Sqlite | SqlDialect::Mysql => "?".to_string(),
        }
    }

    fn regex_operator(&self) -> &'static str {
        match self {
            SqlDialect::Postgres => "~",
            SqlDialect::Sqlite | SqlDialect::Mysql => "REGEXP",
        }
    }
}

/// Clause text with its bound parameters, in placeholder order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlFragment {
    pub clause: String,
    pub params: Vec<Value>,
}

struct Renderer {
    dialect: SqlDialect,
    params: Vec<Value>,
}

impl Renderer {
    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    fn node(&mut self, node: &ConditionNode) -> String {
        match node {
            ConditionNode::Leaf(c) => self.leaf(c),
            ConditionNode::And(children) => self.group(children, " AND ", "1=1"),
            ConditionNode::Or(children) => self.group(children, " OR ", "1=0"),
        }
    }

    fn group(&mut self, children: &[ConditionNode], joiner: &str, empty: &str) -> String {
        match children {
            [] => empty.to_string(),
            [only] => self.node(only),
            many => {
                let parts: Vec<String> = many.iter().map(|c| self.node(c)).collect();
                format!("({})", parts.join(joiner))
            }
        }
    }

    /// `LIKE` against literal text; wildcards in the operand are escaped
    fn like(&mut self, column: &str, before: &str, value: &Value, after: &str) -> String {
        let pattern = format!("{}{}{}", before, escape_like(&like_text(value)), after);
        let p = self.bind(Value::String(pattern));
        format!("{} LIKE {} ESCAPE '{}'", column, p, LIKE_ESCAPE)
    }

    fn leaf(&mut self, c: &Condition) -> String {
        let column = self.dialect.quote_ident(&c.field);
        match c.operator {
            Operator::Eq if c.value.is_null() => format!("{} IS NULL", column),
            Operator::Ne if c.value.is_null() => format!("{} IS NOT NULL", column),
            Operator::Eq => format!("{} = {}", column, self.bind(c.value.clone())),
            Operator::Ne => format!("{} <> {}", column, self.bind(c.value.clone())),
            Operator::Gt => format!("{} > {}", column, self.bind(c.value.clone())),
            Operator::Gte => format!("{} >= {}", column, self.bind(c.value.clone())),
            Operator::Lt => format!("{} < {}", column, self.bind(c.value.clone())),
            Operator::Lte => format!("{} <= {}", column, self.bind(c.value.clone())),
            Operator::Contains => self.like(&column, "%", &c.value, "%"),
            Operator::StartsWith => self.like(&column, "", &c.value, "%"),
            Operator::EndsWith => self.like(&column, "%", &c.value, ""),
            Operator::In | Operator::NotIn => {
                let items = c.value.as_array().cloned().unwrap_or_default();
                let negate = c.operator == Operator::NotIn;
                if items.is_empty() {
                    let constant = if negate { "1=1" } else { "1=0" };
                    return constant.to_string();
                }
                let placeholders: Vec<String> = items.into_iter().map(|v| self.bind(v)).collect();
                let keyword = if negate { "NOT IN" } else { "IN" };
                format!("{} {} ({})", column, keyword, placeholders.join(", "))
            }
            Operator::Regex => {
                let p = self.bind(c.value.clone());
                format!("{} {} {}", column, self.dialect.regex_operator(), p)
            }
            Operator::Exists if c.value.as_bool().unwrap_or(true) => {
                format!("{} IS NOT NULL", column)
            }
            Operator::Exists | Operator::IsNull => format!("{} IS NULL", column),
            Operator::IsNotNull => format!("{} IS NOT NULL", column),
        }
    }
}

/// Escape character for `LIKE`. Not a backslash, which MySQL string
/// literals would consume.
const LIKE_ESCAPE: char = '!';

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | LIKE_ESCAPE) {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

fn like_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render the `WHERE` body of a tree
pub fn render_where(tree: &CompiledTree, dialect: SqlDialect) -> SqlFragment {
    let mut renderer = Renderer {
        dialect,
        params: Vec::new(),
    };
    let clause = renderer.node(tree.root());
    SqlFragment {
        clause,
        params: renderer.params,
    }
}

/// Full `SELECT` for a find, including projection, ordering and paging
pub fn render_select(
    table: &str,
    tree: &CompiledTree,
    options: &QueryOptions,
    dialect: SqlDialect,
) -> SqlFragment {
    let where_ = render_where(tree, dialect);
    let projection = if options.fields.is_empty() {
        "*".to_string()
    } else {
        options
            .fields
            .iter()
            .map(|f| dialect.quote_ident(f))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut clause = format!(
        "SELECT {} FROM {} WHERE {}",
        projection,
        dialect.quote_ident(table),
        where_.clause
    );

    if !options.sort.is_empty() {
        let order: Vec<String> = options
            .sort
            .iter()
            .map(|s| {
                let dir = match s.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                format!("{} {}", dialect.quote_ident(&s.field), dir)
            })
            .collect();
        clause.push_str(" ORDER BY ");
        clause.push_str(&order.join(", "));
    }

    if let Some(page) = options.pagination {
        clause.push_str(&format!(" LIMIT {} OFFSET {}", page.limit, page.skip));
    }

    SqlFragment {
        clause,
        params: where_.params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PaginationConfig, SortConfig};
    use crate::query::parser::compile_tree;
    use serde_json::json;

    #[test]
    fn test_placeholders_per_dialect() {
        let tree = compile_tree(&json!({"age": {"gte": 18}, "name": "alice"})).unwrap();

        let pg = render_where(&tree, SqlDialect::Postgres);
        assert_eq!(pg.clause, r#"("age" >= $1 AND "name" = $2)"#);
        assert_eq!(pg.params, vec![json!(18), json!("alice")]);

        let my = render_where(&tree, SqlDialect::Mysql);
        assert_eq!(my.clause, "(`age` >= ? AND `name` = ?)");
    }

    #[test]
    fn test_nested_groups_keep_parentheses() {
        let tree = compile_tree(&json!({"operator": "or", "conditions": [
            {"field": "a", "operator": "eq", "value": 1},
            {"operator": "and", "conditions": [
                {"field": "b", "operator": "in", "value": [1, 2]},
                {"field": "c", "operator": "contains", "value": "x"}
            ]}
        ]}))
        .unwrap();
        let sql = render_where(&tree, SqlDialect::Sqlite);
        assert_eq!(sql.clause, r#"("a" = ? OR ("b" IN (?, ?) AND "c" LIKE ? ESCAPE '!'))"#);
        assert_eq!(sql.params[3], json!("%x%"));
    }

    #[test]
    fn test_like_wildcards_are_literal() {
        let tree = compile_tree(&json!({"field": "code", "operator": "contains", "value": "5_%"})).unwrap();
        for dialect in [SqlDialect::Sqlite, SqlDialect::Postgres, SqlDialect::Mysql] {
            let sql = render_where(&tree, dialect);
            assert!(sql.clause.ends_with(" ESCAPE '!'"), "{}", sql.clause);
            assert_eq!(sql.params, vec![json!("%5!_!%%")]);
        }
        // Same answer as in-process evaluation
        let record = json!({"code": "a5x9b"});
        assert!(!tree.matches(record.as_object().unwrap()));

        let prefix = compile_tree(&json!({"field": "n", "operator": "starts_with", "value": "a!b"})).unwrap();
        assert_eq!(render_where(&prefix, SqlDialect::Sqlite).params, vec![json!("a!!b%")]);
        let suffix = compile_tree(&json!({"field": "n", "operator": "ends_with", "value": "_x"})).unwrap();
        assert_eq!(render_where(&suffix, SqlDialect::Mysql).params, vec![json!("%!_x")]);
    }

    #[test]
    fn test_edge_renderings() {
        let all = render_where(&CompiledTree::match_all(), SqlDialect::Sqlite);
        assert_eq!(all.clause, "1=1");

        let none = compile_tree(&json!({"operator": "or", "conditions": []})).unwrap();
        assert_eq!(render_where(&none, SqlDialect::Sqlite).clause, "1=0");

        let empty_in = compile_tree(&json!({"field": "a", "operator": "in", "value": []})).unwrap();
        assert_eq!(render_where(&empty_in, SqlDialect::Sqlite).clause, "1=0");

        let null_eq = compile_tree(&json!({"deleted_at": null})).unwrap();
        let sql = render_where(&null_eq, SqlDialect::Postgres);
        assert_eq!(sql.clause, r#""deleted_at" IS NULL"#);
        assert!(sql.params.is_empty());

        let re = compile_tree(&json!({"field": "n", "operator": "regex", "value": "^a"})).unwrap();
        assert_eq!(render_where(&re, SqlDialect::Postgres).clause, r#""n" ~ $1"#);
    }

    #[test]
    fn test_select_with_options() {
        let tree = CompiledTree::by_id(json!(3));
        let options = QueryOptions {
            sort: vec![SortConfig {
                field: "age".into(),
                direction: SortDirection::Desc,
            }],
            pagination: Some(PaginationConfig { skip: 20, limit: 10 }),
            fields: vec!["id".into(), "age".into()],
        };
        let sql = render_select("users", &tree, &options, SqlDialect::Postgres);
        assert_eq!(
            sql.clause,
            r#"SELECT "id", "age" FROM "users" WHERE "id" = $1 ORDER BY "age" DESC LIMIT 10 OFFSET 20"#
        );
    }
}
