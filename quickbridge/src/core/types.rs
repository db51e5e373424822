use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::BridgeError;

/// Storage backend family behind an alias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// File-based SQL engine
    #[serde(alias = "sqlite3")]
    Sqlite,
    /// Client-server SQL engine with `$n` placeholders
    #[serde(alias = "postgres", alias = "pg")]
    Postgresql,
    /// Client-server SQL engine with `?` placeholders
    Mysql,
    /// Document store
    #[serde(alias = "mongo")]
    Mongodb,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Postgresql => "postgresql",
            BackendKind::Mysql => "mysql",
            BackendKind::Mongodb => "mongodb",
        }
    }

    /// Whether the backend speaks SQL
    pub fn is_sql(&self) -> bool {
        !matches!(self, BackendKind::Mongodb)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(BackendKind::Sqlite),
            "postgresql" | "postgres" | "pg" => Ok(BackendKind::Postgresql),
            "mysql" => Ok(BackendKind::Mysql),
            "mongodb" | "mongo" => Ok(BackendKind::Mongodb),
            other => Err(BridgeError::InvalidRequest(format!(
                "unsupported backend kind: {}",
                other
            ))),
        }
    }
}

/// Operation named in a request envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Find,
    FindById,
    Count,
    Exists,
    Update,
    UpdateById,
    Delete,
    DeleteById,
    CreateTable,
    DropTable,
    RegisterModel,
    AddDatabase,
    RemoveDatabase,
    ListAliases,
    HealthCheck,
    CacheStats,
    ClearCache,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Find => "find",
            OperationKind::FindById => "find_by_id",
            OperationKind::Count => "count",
            OperationKind::Exists => "exists",
            OperationKind::Update => "update",
            OperationKind::UpdateById => "update_by_id",
            OperationKind::Delete => "delete",
            OperationKind::DeleteById => "delete_by_id",
            OperationKind::CreateTable => "create_table",
            OperationKind::DropTable => "drop_table",
            OperationKind::RegisterModel => "register_model",
            OperationKind::AddDatabase => "add_database",
            OperationKind::RemoveDatabase => "remove_database",
            OperationKind::ListAliases => "list_aliases",
            OperationKind::HealthCheck => "health_check",
            OperationKind::CacheStats => "cache_stats",
            OperationKind::ClearCache => "clear_cache",
        }
    }

    /// Reads served through the cache when one is configured
    pub fn is_cacheable_read(&self) -> bool {
        matches!(
            self,
            OperationKind::Find
                | OperationKind::FindById
                | OperationKind::Count
                | OperationKind::Exists
        )
    }

    /// Operations that mutate a table and must invalidate its cache scope
    pub fn invalidates_table(&self) -> bool {
        matches!(
            self,
            OperationKind::Create
                | OperationKind::Update
                | OperationKind::UpdateById
                | OperationKind::Delete
                | OperationKind::DeleteById
                | OperationKind::CreateTable
                | OperationKind::DropTable
        )
    }

    /// Operations handled by the registry rather than a backend
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            OperationKind::AddDatabase
                | OperationKind::RemoveDatabase
                | OperationKind::ListAliases
                | OperationKind::HealthCheck
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "create" => OperationKind::Create,
            "find" => OperationKind::Find,
            "find_by_id" => OperationKind::FindById,
            "count" => OperationKind::Count,
            "exists" => OperationKind::Exists,
            "update" => OperationKind::Update,
            "update_by_id" => OperationKind::UpdateById,
            "delete" => OperationKind::Delete,
            "delete_by_id" => OperationKind::DeleteById,
            "create_table" => OperationKind::CreateTable,
            "drop_table" => OperationKind::DropTable,
            "register_model" => OperationKind::RegisterModel,
            "add_database" => OperationKind::AddDatabase,
            "remove_database" => OperationKind::RemoveDatabase,
            "list_aliases" => OperationKind::ListAliases,
            "health_check" => OperationKind::HealthCheck,
            "cache_stats" => OperationKind::CacheStats,
            "clear_cache" => OperationKind::ClearCache,
            other => {
                return Err(BridgeError::InvalidRequest(format!(
                    "unknown operation: {}",
                    other
                )));
            }
        };
        Ok(op)
    }
}

/// How adapters assign ids to created records that lack one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Sequential integers per table
    #[default]
    AutoIncrement,
    /// Random UUID v4 strings
    Uuid,
    /// 24 hex characters, timestamp first
    ObjectId,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    #[serde(alias = "ASC", alias = "Asc")]
    Asc,
    #[serde(alias = "DESC", alias = "Desc")]
    Desc,
}

/// Sort on one field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortConfig {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Skip/limit window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaginationConfig {
    #[serde(default)]
    pub skip: u64,
    pub limit: u64,
}

/// Options accompanying a `find`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub sort: Vec<SortConfig>,
    pub pagination: Option<PaginationConfig>,
    /// Projection; empty selects every field
    pub fields: Vec<String>,
}

impl QueryOptions {
    pub fn is_default(&self) -> bool {
        self.sort.is_empty() && self.pagination.is_none() && self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_aliases() {
        assert_eq!("postgres".parse::<BackendKind>().unwrap(), BackendKind::Postgresql);
        assert_eq!("Mongo".parse::<BackendKind>().unwrap(), BackendKind::Mongodb);
        assert!("oracle".parse::<BackendKind>().is_err());

        let kind: BackendKind = serde_json::from_str("\"pg\"").unwrap();
        assert_eq!(kind, BackendKind::Postgresql);
    }

    #[test]
    fn test_operation_classification() {
        for op in ["find", "find_by_id", "count", "exists"] {
            let op: OperationKind = op.parse().unwrap();
            assert!(op.is_cacheable_read());
            assert!(!op.invalidates_table());
        }
        for op in ["create", "update", "delete", "drop_table", "create_table"] {
            let op: OperationKind = op.parse().unwrap();
            assert!(op.invalidates_table());
        }
        assert!(!OperationKind::RegisterModel.invalidates_table());
        assert!("truncate".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_operation_round_trip_names() {
        let op: OperationKind = "update_by_id".parse().unwrap();
        assert_eq!(op.as_str(), "update_by_id");
    }

    #[test]
    fn test_id_strategy_names() {
        let s: IdStrategy = serde_json::from_str("\"object_id\"").unwrap();
        assert_eq!(s, IdStrategy::ObjectId);
        assert_eq!(IdStrategy::default(), IdStrategy::AutoIncrement);
    }

    #[test]
    fn test_query_options_defaults() {
        let opts: QueryOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.is_default());

        let opts: QueryOptions = serde_json::from_str(
            r#"{"sort":[{"field":"age","direction":"desc"}],"pagination":{"limit":10}}"#,
        )
        .unwrap();
        assert_eq!(opts.sort[0].direction, SortDirection::Desc);
        assert_eq!(opts.pagination.unwrap().skip, 0);
    }
}
