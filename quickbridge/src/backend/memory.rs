//! In-process reference adapter
//!
//! Evaluates compiled trees directly against rows held in memory. Serves any
//! [`BackendKind`] so the bridge can be exercised without a running store.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tracing::debug;

use super::{BackendAdapter, BackendCommand, BackendConnector};
use crate::config::DatabaseConfig;
use crate::core::{
    BackendError, BackendKind, IdStrategy, ModelMeta, OperationKind, QueryOptions, SortDirection,
};
use crate::query::condition::{compare, values_equal};

type Record = Map<String, Value>;

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Record>,
    next_id: u64,
    model: Option<ModelMeta>,
}

/// Tables of one store, shared by every adapter connected to it
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryStore {
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.rows.len())
    }
}

/// Reference [`BackendAdapter`]
pub struct MemoryBackend {
    kind: BackendKind,
    id_strategy: IdStrategy,
    latency: Duration,
    store: Arc<MemoryStore>,
    calls: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new(kind: BackendKind, id_strategy: IdStrategy) -> Self {
        Self {
            kind,
            id_strategy,
            latency: Duration::ZERO,
            store: Arc::new(MemoryStore::default()),
            calls: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Sleep this long inside every `execute`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn with_store(mut self, store: Arc<MemoryStore>, calls: Arc<AtomicU64>) -> Self {
        self.store = store;
        self.calls = calls;
        self
    }

    /// Number of `execute` calls that reached this adapter
    pub fn calls(&self) -> u64 {
        self.calls.load(AtomicOrdering::Relaxed)
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    fn next_id(&self, table: &mut Table) -> Value {
        match self.id_strategy {
            IdStrategy::AutoIncrement => {
                table.next_id += 1;
                json!(table.next_id)
            }
            IdStrategy::Uuid => json!(uuid::Uuid::new_v4().to_string()),
            IdStrategy::ObjectId => {
                let secs = chrono::Utc::now().timestamp() as u32;
                let random = uuid::Uuid::new_v4().simple().to_string();
                json!(format!("{:08x}{}", secs, &random[..16]))
            }
        }
    }

    fn create(&self, command: &BackendCommand) -> Result<Value, BackendError> {
        let mut record = payload_object(command)?.clone();
        let mut tables = self.store.tables.write();
        let table = tables.entry(command.table.clone()).or_default();

        match record.get("id") {
            None | Some(Value::Null) => {
                let id = self.next_id(table);
                record.insert("id".to_string(), id);
            }
            Some(Value::Number(n)) => {
                if let Some(n) = n.as_u64() {
                    table.next_id = table.next_id.max(n);
                }
            }
            Some(_) => {}
        }

        if let Some(model) = &table.model {
            model.validate_record(&record, false)?;
        }
        check_unique(table, &record, None)?;

        table.rows.push(record.clone());
        debug!("Created record in {}", command.table);
        Ok(Value::Object(record))
    }

    fn find(&self, command: &BackendCommand) -> Value {
        let tree = command.tree();
        let tables = self.store.tables.read();
        let Some(table) = tables.get(&command.table) else {
            return Value::Array(Vec::new());
        };
        let mut rows: Vec<&Record> = table.rows.iter().filter(|r| tree.matches(r)).collect();
        apply_sort(&mut rows, &command.options);

        let rows = rows.into_iter();
        let rows: Vec<Value> = match command.options.pagination {
            Some(page) => rows
                .skip(page.skip as usize)
                .take(page.limit as usize)
                .map(|r| project(r, &command.options))
                .collect(),
            None => rows.map(|r| project(r, &command.options)).collect(),
        };
        Value::Array(rows)
    }

    fn find_by_id(&self, command: &BackendCommand) -> Result<Value, BackendError> {
        let id = required_id(command)?;
        let tables = self.store.tables.read();
        Ok(tables
            .get(&command.table)
            .and_then(|t| position_of(t, id).map(|pos| &t.rows[pos]))
            .map(|r| project(r, &command.options))
            .unwrap_or(Value::Null))
    }

    fn count(&self, command: &BackendCommand) -> usize {
        let tree = command.tree();
        let tables = self.store.tables.read();
        tables
            .get(&command.table)
            .map_or(0, |t| t.rows.iter().filter(|r| tree.matches(r)).count())
    }

    fn update(&self, command: &BackendCommand) -> Result<Value, BackendError> {
        let patch = payload_object(command)?;
        let by_id = command.operation == OperationKind::UpdateById;
        let mut tables = self.store.tables.write();
        let Some(table) = tables.get_mut(&command.table) else {
            return Ok(if by_id { json!(false) } else { json!(0) });
        };

        let targets: Vec<usize> = if by_id {
            position_of(table, required_id(command)?).into_iter().collect()
        } else {
            let tree = command.tree();
            (0..table.rows.len())
                .filter(|&i| tree.matches(&table.rows[i]))
                .collect()
        };

        if let Some(model) = &table.model {
            model.validate_record(patch, true)?;
        }

        // Build every updated row first so a constraint failure leaves the
        // table untouched.
        let mut updated = Vec::with_capacity(targets.len());
        for &pos in &targets {
            let mut row = table.rows[pos].clone();
            for (field, value) in patch {
                if field == "id" && row.get("id").is_some_and(|id| !values_equal(id, value)) {
                    return Err(BackendError::Constraint(
                        "field 'id': cannot be changed".to_string(),
                    ));
                }
                row.insert(field.clone(), value.clone());
            }
            check_unique(table, &row, Some(pos))?;
            updated.push((pos, row));
        }

        let count = updated.len();
        for (pos, row) in updated {
            table.rows[pos] = row;
        }
        Ok(if by_id { json!(count > 0) } else { json!(count) })
    }

    fn delete(&self, command: &BackendCommand) -> Result<Value, BackendError> {
        let mut tables = self.store.tables.write();
        let by_id = command.operation == OperationKind::DeleteById;
        let Some(table) = tables.get_mut(&command.table) else {
            return Ok(if by_id { json!(false) } else { json!(0) });
        };

        if by_id {
            let removed = match position_of(table, required_id(command)?) {
                Some(pos) => {
                    table.rows.remove(pos);
                    true
                }
                None => false,
            };
            return Ok(json!(removed));
        }

        let tree = command.tree();
        let before = table.rows.len();
        table.rows.retain(|r| !tree.matches(r));
        Ok(json!(before - table.rows.len()))
    }

    fn define_table(&self, command: &BackendCommand) -> Value {
        let mut tables = self.store.tables.write();
        let table = tables.entry(command.table.clone()).or_default();
        if let Some(model) = &command.model {
            table.model = Some(model.clone());
        }
        json!(true)
    }

    fn drop_table(&self, command: &BackendCommand) -> Value {
        json!(self.store.tables.write().remove(&command.table).is_some())
    }
}

#[async_trait]
impl BackendAdapter for MemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn execute(&self, command: &BackendCommand) -> Result<Value, BackendError> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(BackendError::Connection("adapter is closed".to_string()));
        }
        self.calls.fetch_add(1, AtomicOrdering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match command.operation {
            OperationKind::Create => self.create(command),
            OperationKind::Find => Ok(self.find(command)),
            OperationKind::FindById => self.find_by_id(command),
            OperationKind::Count => Ok(json!(self.count(command))),
            OperationKind::Exists => Ok(json!(self.count(command) > 0)),
            OperationKind::Update | OperationKind::UpdateById => self.update(command),
            OperationKind::Delete | OperationKind::DeleteById => self.delete(command),
            OperationKind::CreateTable | OperationKind::RegisterModel => {
                Ok(self.define_table(command))
            }
            OperationKind::DropTable => Ok(self.drop_table(command)),
            other => Err(BackendError::Unsupported(other.as_str().to_string())),
        }
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(BackendError::Connection("adapter is closed".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, AtomicOrdering::Release);
        Ok(())
    }
}

fn payload_object(command: &BackendCommand) -> Result<&Record, BackendError> {
    command.data.as_ref().and_then(Value::as_object).ok_or_else(|| {
        BackendError::Other(format!("{} requires an object payload", command.operation))
    })
}

fn required_id(command: &BackendCommand) -> Result<&Value, BackendError> {
    command
        .id
        .as_ref()
        .ok_or_else(|| BackendError::Other(format!("{} requires an id", command.operation)))
}

fn position_of(table: &Table, id: &Value) -> Option<usize> {
    table
        .rows
        .iter()
        .position(|r| r.get("id").is_some_and(|v| values_equal(v, id)))
}

/// Reject `record` if it collides with another row on `id` or a unique key
fn check_unique(table: &Table, record: &Record, skip: Option<usize>) -> Result<(), BackendError> {
    let mut keys = vec![vec!["id".to_string()]];
    if let Some(model) = &table.model {
        keys.extend(model.unique_keys());
    }

    for key in &keys {
        let values: Option<Vec<&Value>> = key
            .iter()
            .map(|f| record.get(f).filter(|v| !v.is_null()))
            .collect();
        let Some(values) = values else {
            continue;
        };
        let clash = table.rows.iter().enumerate().any(|(i, row)| {
            Some(i) != skip
                && key
                    .iter()
                    .zip(&values)
                    .all(|(f, v)| row.get(f).is_some_and(|existing| values_equal(existing, v)))
        });
        if clash {
            return Err(BackendError::Constraint(format!(
                "duplicate value for unique key ({})",
                key.join(", ")
            )));
        }
    }
    Ok(())
}

fn apply_sort(rows: &mut [&Record], options: &QueryOptions) {
    if options.sort.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for sort in &options.sort {
            let ordering = match (a.get(&sort.field), b.get(&sort.field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => compare(Some(x), y).unwrap_or(Ordering::Equal),
            };
            let ordering = match sort.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn project(record: &Record, options: &QueryOptions) -> Value {
    if options.fields.is_empty() {
        return Value::Object(record.clone());
    }
    let projected: Record = options
        .fields
        .iter()
        .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
        .collect();
    Value::Object(projected)
}

/// Connector handing out [`MemoryBackend`]s. Aliases whose connection
/// settings point at the same target share one store.
#[derive(Default)]
pub struct MemoryConnector {
    latency: Duration,
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
    calls: Arc<AtomicU64>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every adapter produced sleeps `latency` per call
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Total `execute` calls across all adapters produced
    pub fn calls(&self) -> u64 {
        self.calls.load(AtomicOrdering::Relaxed)
    }

    /// Store behind a connection identity, if anything connected to it
    pub fn store(&self, identity: &str) -> Option<Arc<MemoryStore>> {
        self.stores.lock().get(identity).cloned()
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(
        &self,
        config: &DatabaseConfig,
    ) -> Result<Arc<dyn BackendAdapter>, BackendError> {
        let identity = config.connection.identity();
        let store = self.stores.lock().entry(identity.clone()).or_default().clone();
        debug!("Memory backend connected for '{}' ({})", config.alias, identity);

        let backend = MemoryBackend::new(config.kind, config.id_strategy)
            .with_latency(self.latency)
            .with_store(store, self.calls.clone());
        Ok(Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CompiledQuery;
    use crate::core::{PaginationConfig, SortConfig};
    use crate::query::compile;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(BackendKind::Sqlite, IdStrategy::AutoIncrement)
    }

    fn query(kind: BackendKind, op: OperationKind, raw: Value) -> CompiledQuery {
        let (tree, _) = compile(&raw).unwrap();
        CompiledQuery::for_kind(kind, "users", op, tree, &QueryOptions::default())
    }

    async fn seed(b: &MemoryBackend) {
        for (name, age) in [("Ann", 31), ("Bob", 17), ("Cid", 45)] {
            let cmd = BackendCommand::new(OperationKind::Create, "users")
                .with_data(json!({"name": name, "age": age}));
            b.execute(&cmd).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_assigns_sequential_ids() {
        let b = backend();
        seed(&b).await;
        let found = b
            .execute(&BackendCommand::new(OperationKind::FindById, "users").with_id(json!(2)))
            .await
            .unwrap();
        assert_eq!(found["name"], "Bob");
        assert_eq!(b.calls(), 4);
    }

    #[tokio::test]
    async fn test_find_with_conditions_and_options() {
        let b = backend();
        seed(&b).await;
        let cmd = BackendCommand::new(OperationKind::Find, "users")
            .with_query(query(
                BackendKind::Sqlite,
                OperationKind::Find,
                json!({"age": {"gte": 18}}),
            ))
            .with_options(QueryOptions {
                sort: vec![SortConfig {
                    field: "age".into(),
                    direction: SortDirection::Desc,
                }],
                pagination: Some(PaginationConfig { skip: 0, limit: 1 }),
                fields: vec!["name".into()],
            });
        let rows = b.execute(&cmd).await.unwrap();
        assert_eq!(rows, json!([{"name": "Cid"}]));
    }

    #[tokio::test]
    async fn test_count_exists_update_delete() {
        let b = backend();
        seed(&b).await;
        let adults = query(BackendKind::Sqlite, OperationKind::Count, json!({"age": {"gt": 18}}));

        let count = BackendCommand::new(OperationKind::Count, "users").with_query(adults.clone());
        assert_eq!(b.execute(&count).await.unwrap(), json!(2));

        let update = BackendCommand::new(OperationKind::Update, "users")
            .with_query(adults.clone())
            .with_data(json!({"adult": true}));
        assert_eq!(b.execute(&update).await.unwrap(), json!(2));

        let exists = BackendCommand::new(OperationKind::Exists, "users")
            .with_query(query(BackendKind::Sqlite, OperationKind::Exists, json!({"adult": true})));
        assert_eq!(b.execute(&exists).await.unwrap(), json!(true));

        let delete = BackendCommand::new(OperationKind::Delete, "users").with_query(adults);
        assert_eq!(b.execute(&delete).await.unwrap(), json!(2));

        let by_id = BackendCommand::new(OperationKind::DeleteById, "users").with_id(json!(2));
        assert_eq!(b.execute(&by_id).await.unwrap(), json!(true));
        assert_eq!(b.execute(&by_id).await.unwrap(), json!(false));
        assert_eq!(b.store().row_count("users"), 0);
    }

    #[tokio::test]
    async fn test_model_validation_and_unique_keys() {
        let b = backend();
        let model = ModelMeta::from_payload(
            "users",
            &json!({"fields": {"email": {"type": "string", "required": true, "unique": true}}}),
        )
        .unwrap();
        let register = BackendCommand::new(OperationKind::RegisterModel, "users").with_model(model);
        assert_eq!(b.execute(&register).await.unwrap(), json!(true));

        let create = |data: Value| BackendCommand::new(OperationKind::Create, "users").with_data(data);
        b.execute(&create(json!({"email": "a@x.io"}))).await.unwrap();

        let err = b.execute(&create(json!({"email": "a@x.io"}))).await.unwrap_err();
        assert!(matches!(err, BackendError::Constraint(_)));
        let err = b.execute(&create(json!({"name": "no email"}))).await.unwrap_err();
        assert!(matches!(err, BackendError::Constraint(_)));
        let err = b.execute(&create(json!({"id": 1, "email": "b@x.io"}))).await.unwrap_err();
        assert!(matches!(err, BackendError::Constraint(_)));

        let update = BackendCommand::new(OperationKind::UpdateById, "users")
            .with_id(json!(1))
            .with_data(json!({"email": 5}));
        assert!(b.execute(&update).await.is_err());
        assert_eq!(b.store().row_count("users"), 1);
    }

    #[tokio::test]
    async fn test_id_strategies() {
        let b = MemoryBackend::new(BackendKind::Mongodb, IdStrategy::ObjectId);
        let created = b
            .execute(&BackendCommand::new(OperationKind::Create, "docs").with_data(json!({})))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let b = MemoryBackend::new(BackendKind::Postgresql, IdStrategy::Uuid);
        let created = b
            .execute(&BackendCommand::new(OperationKind::Create, "docs").with_data(json!({})))
            .await
            .unwrap();
        assert!(uuid::Uuid::parse_str(created["id"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_closed_adapter_rejects_calls() {
        let b = backend();
        b.close().await.unwrap();
        assert!(b.health_check().await.is_err());
        let err = b
            .execute(&BackendCommand::new(OperationKind::Find, "users"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connector_shares_store_per_identity() {
        let connector = MemoryConnector::new();
        let a = connector
            .connect(&DatabaseConfig::sqlite("a", "/data/app.db"))
            .await
            .unwrap();
        let b = connector
            .connect(&DatabaseConfig::sqlite("b", "/data/app.db"))
            .await
            .unwrap();
        let c = connector
            .connect(&DatabaseConfig::sqlite("c", "/data/other.db"))
            .await
            .unwrap();

        let create = BackendCommand::new(OperationKind::Create, "t").with_data(json!({"v": 1}));
        a.execute(&create).await.unwrap();

        let count = BackendCommand::new(OperationKind::Count, "t");
        assert_eq!(b.execute(&count).await.unwrap(), json!(1));
        assert_eq!(c.execute(&count).await.unwrap(), json!(0));
        assert_eq!(connector.calls(), 3);
        assert!(connector.store("sqlite:/data/app.db").is_some());
    }
}
