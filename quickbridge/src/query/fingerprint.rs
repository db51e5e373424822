//! Stable cache keys
//!
//! Keys must be identical across processes because the L2 tier outlives a
//! run, so they are built from a canonical JSON encoding (object keys sorted,
//! no whitespace) hashed with SHA-256.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use super::condition::CompiledTree;
use crate::core::{OperationKind, QueryOptions};

/// Separator between key segments
pub const KEY_SEPARATOR: char = ':';

/// Canonical JSON text: sorted object keys, compact
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Hash of a compiled condition (plus optional query options)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKeyFragment(String);

impl CacheKeyFragment {
    pub fn of_tree(tree: &CompiledTree) -> Self {
        Self(digest(&["tree", &canonical_json(&tree.to_json())]))
    }

    pub fn of_id(id: &Value) -> Self {
        Self(digest(&["id", &canonical_json(id)]))
    }

    /// Fold query options into the fragment. Default options leave it as is,
    /// so `find` without options and with `{}` share a key.
    pub fn with_options(self, options: &QueryOptions) -> Self {
        if options.is_default() {
            return self;
        }
        let encoded = serde_json::to_value(options)
            .map(|v| canonical_json(&v))
            .unwrap_or_default();
        Self(digest(&[&self.0, "options", &encoded]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKeyFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully scoped cache key: `alias:table:operation:fragment`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    alias: String,
    table: String,
    operation: &'static str,
    fragment: String,
}

impl CacheKey {
    pub fn new(
        alias: &str,
        table: &str,
        operation: OperationKind,
        fragment: &CacheKeyFragment,
    ) -> Self {
        Self {
            alias: alias.to_string(),
            table: table.to_string(),
            operation: operation.as_str(),
            fragment: fragment.as_str().to_string(),
        }
    }

    /// Prefix shared by every key of one table under one alias
    pub fn table_prefix(alias: &str, table: &str) -> String {
        format!("{alias}{KEY_SEPARATOR}{table}{KEY_SEPARATOR}")
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// This key's table prefix
    pub fn scope(&self) -> String {
        Self::table_prefix(&self.alias, &self.table)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            Self::table_prefix(&self.alias, &self.table),
            self.operation,
            KEY_SEPARATOR,
            self.fragment
        )
    }
}
