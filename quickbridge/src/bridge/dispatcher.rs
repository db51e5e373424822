//! Request dispatcher
//!
//! Each request runs parse → resolve alias → compile condition →
//! cache lookup or bypass → backend execute → cache populate/invalidate →
//! serialize. Reads on a cached alias consult the cache first; writes always
//! reach the backend first and invalidate their table only once it succeeded.

use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use super::registry::{AliasEntry, Registry};
use crate::backend::{BackendCommand, CompiledQuery};
use crate::config::DatabaseConfig;
use crate::core::{BridgeError, ModelMeta, OperationKind, Result};
use crate::protocol::{Request, Response};
use crate::query::{CacheKey, CacheKeyFragment, compile};

/// Routes request envelopes to the registry and backends
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one serialized request and return the serialized response
    pub async fn handle(&self, raw: &str) -> String {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                let err = BridgeError::InvalidRequest(format!("unparseable envelope: {}", e));
                return Response::error(&err).to_line();
            }
        };
        let request_id = value
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let response = match serde_json::from_value::<Request>(value) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => Response::error(&BridgeError::InvalidRequest(e.to_string())),
        };
        response.with_request_id(request_id).to_line()
    }

    /// Run a request, folding failures into an error envelope
    pub async fn dispatch(&self, request: Request) -> Response {
        let request_id = request.request_id.clone();
        let response = match self.execute(&request).await {
            Ok(data) => Response::success(data),
            Err(e) => {
                match &e {
                    BridgeError::Backend(_) | BridgeError::Timeout(_) => {
                        warn!("{} on '{}' failed: {}", request.operation, alias_label(&request), e)
                    }
                    _ => debug!("{} rejected: {}", request.operation, e),
                }
                Response::error(&e)
            }
        };
        response.with_request_id(request_id)
    }

    /// Run a request and return its result value
    pub async fn execute(&self, request: &Request) -> Result<Value> {
        let operation: OperationKind = request.operation.parse()?;

        match operation {
            OperationKind::AddDatabase => return self.add_database(request).await,
            OperationKind::RemoveDatabase => {
                let alias = required_alias(request)?;
                self.registry.remove(alias).await?;
                return Ok(json!(true));
            }
            OperationKind::ListAliases => return Ok(json!(self.registry.aliases())),
            OperationKind::HealthCheck => return self.health_check(request).await,
            _ => {}
        }

        let entry = self.registry.resolve(request.alias.as_deref())?;

        match operation {
            OperationKind::CacheStats => {
                return Ok(match &entry.cache {
                    Some(cache) => serde_json::to_value(cache.stats())?,
                    None => Value::Null,
                });
            }
            OperationKind::ClearCache => {
                let removed = match (&entry.cache, request.table.as_deref()) {
                    (Some(cache), Some(table)) => cache.invalidate_table(table),
                    (Some(cache), None) => cache.clear(),
                    (None, _) => 0,
                };
                return Ok(json!(removed));
            }
            _ => {}
        }

        let table = required_table(request)?;
        let (command, fragment) = build_command(&entry, operation, table, request)?;

        if operation.is_cacheable_read() {
            return self.read(&entry, command, fragment, request.ttl).await;
        }

        let result = entry.adapter.execute(&command).await?;
        if operation.invalidates_table() {
            if let Some(cache) = &entry.cache {
                let removed = cache.invalidate_table(table);
                debug!(
                    "{} on '{}.{}' invalidated {} cache entries",
                    operation,
                    entry.alias(),
                    table,
                    removed
                );
            }
        }
        Ok(result)
    }

    async fn read(
        &self,
        entry: &AliasEntry,
        command: BackendCommand,
        fragment: CacheKeyFragment,
        ttl: Option<u64>,
    ) -> Result<Value> {
        let Some(cache) = &entry.cache else {
            return Ok(entry.adapter.execute(&command).await?);
        };

        let key = CacheKey::new(entry.alias(), &command.table, command.operation, &fragment);
        let adapter = entry.adapter.clone();
        let (value, outcome) = cache
            .get_or_fetch(&key, ttl, || async move { adapter.execute(&command).await })
            .await?;
        debug!("{} served as {:?}", key, outcome);
        Ok(value)
    }

    async fn add_database(&self, request: &Request) -> Result<Value> {
        let mut raw = request
            .config
            .clone()
            .ok_or_else(|| BridgeError::InvalidRequest("add_database requires config".into()))?;

        if let Some(obj) = raw.as_object_mut() {
            let has_kind = ["kind", "type", "db_type"].iter().any(|k| obj.contains_key(*k));
            if !has_kind {
                if let Some(kind) = obj.get("connection").and_then(|c| c.get("type")).cloned() {
                    obj.insert("kind".to_string(), kind);
                }
            }
        }

        let mut config: DatabaseConfig = serde_json::from_value(raw)
            .map_err(|e| BridgeError::InvalidRequest(format!("invalid database config: {}", e)))?;
        if let Some(alias) = &request.alias {
            config.alias = alias.clone();
        }

        let alias = config.alias.clone();
        let cached = config.active_cache().is_some();
        self.registry.add(config).await?;
        Ok(json!({"alias": alias, "cache_enabled": cached}))
    }

    async fn health_check(&self, request: &Request) -> Result<Value> {
        if let Some(alias) = &request.alias {
            self.registry.health_check(alias).await?;
            return Ok(json!(true));
        }
        let mut report = serde_json::Map::new();
        for alias in self.registry.aliases() {
            let healthy = self.registry.health_check(&alias).await.is_ok();
            report.insert(alias, json!(healthy));
        }
        Ok(Value::Object(report))
    }
}

fn alias_label(request: &Request) -> &str {
    request.alias.as_deref().unwrap_or("<default>")
}

fn required_alias(request: &Request) -> Result<&str> {
    request
        .alias
        .as_deref()
        .ok_or_else(|| BridgeError::InvalidRequest(format!("{} requires an alias", request.operation)))
}

fn required_table(request: &Request) -> Result<&str> {
    let table = request
        .table
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            BridgeError::InvalidRequest(format!("{} requires a table", request.operation))
        })?;
    if table.contains(':') {
        return Err(BridgeError::InvalidRequest(format!(
            "table name '{}' must not contain ':'",
            table
        )));
    }
    Ok(table)
}

fn required<'a>(value: &'a Option<Value>, what: &str, operation: OperationKind) -> Result<&'a Value> {
    value
        .as_ref()
        .filter(|v| !v.is_null())
        .ok_or_else(|| BridgeError::InvalidRequest(format!("{} requires {}", operation, what)))
}

/// Compile the request into a backend command plus the fragment that keys
/// its cached result
fn build_command(
    entry: &AliasEntry,
    operation: OperationKind,
    table: &str,
    request: &Request,
) -> Result<(BackendCommand, CacheKeyFragment)> {
    let options = request.options.clone().unwrap_or_default();
    let mut command = BackendCommand::new(operation, table);

    let fragment = match operation {
        OperationKind::FindById | OperationKind::UpdateById | OperationKind::DeleteById => {
            let id = required(&request.id, "an id", operation)?;
            command = command.with_id(id.clone());
            CacheKeyFragment::of_id(id)
        }
        OperationKind::Find
        | OperationKind::Count
        | OperationKind::Exists
        | OperationKind::Update
        | OperationKind::Delete => {
            let raw = request.conditions.clone().unwrap_or(Value::Null);
            let (tree, fragment) = compile(&raw)?;
            let query = CompiledQuery::for_kind(entry.config.kind, table, operation, tree, &options);
            command = command.with_query(query);
            fragment
        }
        OperationKind::CreateTable => {
            if let Some(schema) = &request.fields_schema {
                let model = ModelMeta::from_fields_schema(table, schema).map_err(|e| {
                    BridgeError::InvalidRequest(format!("invalid fields_schema: {}", e))
                })?;
                command = command.with_model(model);
            }
            CacheKeyFragment::of_id(&Value::Null)
        }
        OperationKind::RegisterModel => {
            let payload = match (&request.data, &request.fields_schema) {
                (Some(data), _) => data.clone(),
                (None, Some(schema)) => json!({"fields": schema}),
                (None, None) => {
                    return Err(BridgeError::InvalidRequest(
                        "register_model requires data or fields_schema".into(),
                    ));
                }
            };
            let model = ModelMeta::from_payload(table, &payload)
                .map_err(|e| BridgeError::InvalidRequest(format!("invalid model: {}", e)))?;
            command = command.with_model(model);
            CacheKeyFragment::of_id(&Value::Null)
        }
        _ => CacheKeyFragment::of_id(&Value::Null),
    };

    if matches!(
        operation,
        OperationKind::Create | OperationKind::Update | OperationKind::UpdateById
    ) {
        let data = required(&request.data, "data", operation)?;
        if !data.is_object() {
            return Err(BridgeError::InvalidRequest(format!(
                "{} data must be an object",
                operation
            )));
        }
        command = command.with_data(data.clone());
    }

    let fragment = match operation {
        OperationKind::Find | OperationKind::FindById => fragment.with_options(&options),
        _ => fragment,
    };
    Ok((command.with_options(options), fragment))
}
