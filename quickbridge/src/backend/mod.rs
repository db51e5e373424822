//! Backend Adapter Module
//!
//! Every store sits behind [`BackendAdapter`]. The bridge hands it a
//! [`BackendCommand`] carrying the compiled condition tree plus its rendering
//! for the store's query language, and expects a JSON result whose shape
//! depends on the operation:
//!
//! | operation | result |
//! |---|---|
//! | `create` | created record |
//! | `find` | array of records |
//! | `find_by_id` | record or `null` |
//! | `count` | number |
//! | `exists` | bool |
//! | `update`, `delete` | number of affected records |
//! | `update_by_id`, `delete_by_id` | bool |
//! | `create_table`, `drop_table`, `register_model` | bool |

pub mod memory;

pub use memory::{MemoryBackend, MemoryConnector};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::core::{BackendError, BackendKind, ModelMeta, OperationKind, QueryOptions};
use crate::query::{
    CompiledTree, SqlDialect, SqlFragment, render_filter, render_select, render_where,
};

/// A compiled tree rendered for one backend kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "language", rename_all = "lowercase")]
pub enum RenderedQuery {
    Sql(SqlFragment),
    Document { filter: Value },
}

/// Condition handed to an adapter: the canonical tree for adapters that
/// evaluate it directly, and its rendering for drivers that ship it as text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub tree: CompiledTree,
    pub rendered: RenderedQuery,
}

impl CompiledQuery {
    /// Render `tree` for `kind`. SQL finds get a full `SELECT`, every other
    /// SQL operation only the `WHERE` body.
    pub fn for_kind(
        kind: BackendKind,
        table: &str,
        operation: OperationKind,
        tree: CompiledTree,
        options: &QueryOptions,
    ) -> Self {
        let rendered = match SqlDialect::for_kind(kind) {
            Some(dialect) if operation == OperationKind::Find => {
                RenderedQuery::Sql(render_select(table, &tree, options, dialect))
            }
            Some(dialect) => RenderedQuery::Sql(render_where(&tree, dialect)),
            None => RenderedQuery::Document {
                filter: render_filter(&tree),
            },
        };
        Self { tree, rendered }
    }
}

/// One operation against one table
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCommand {
    pub operation: OperationKind,
    pub table: String,
    pub query: Option<CompiledQuery>,
    pub id: Option<Value>,
    pub data: Option<Value>,
    pub options: QueryOptions,
    /// Field metadata for `create_table` and `register_model`
    pub model: Option<ModelMeta>,
}

impl BackendCommand {
    pub fn new(operation: OperationKind, table: impl Into<String>) -> Self {
        Self {
            operation,
            table: table.into(),
            query: None,
            id: None,
            data: None,
            options: QueryOptions::default(),
            model: None,
        }
    }

    pub fn with_query(mut self, query: CompiledQuery) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_id(mut self, id: Value) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_model(mut self, model: ModelMeta) -> Self {
        self.model = Some(model);
        self
    }

    /// Condition tree, or match-all when the command carries none
    pub fn tree(&self) -> CompiledTree {
        self.query
            .as_ref()
            .map(|q| q.tree.clone())
            .unwrap_or_else(CompiledTree::match_all)
    }
}

/// Connection to one store. Owns its pool and timeouts.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn execute(&self, command: &BackendCommand) -> Result<Value, BackendError>;

    async fn health_check(&self) -> Result<(), BackendError>;

    async fn close(&self) -> Result<(), BackendError>;
}

/// Opens adapters for alias configurations
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        config: &DatabaseConfig,
    ) -> Result<Arc<dyn BackendAdapter>, BackendError>;
}
