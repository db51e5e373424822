use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{BridgeError, QueryOptions};

/// Request envelope, one per operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Request {
    /// Operation name (e.g., "find", "create", "add_database")
    pub operation: String,
    /// Target alias; the registry default when absent
    pub alias: Option<String>,
    #[serde(alias = "collection")]
    pub table: Option<String>,
    pub conditions: Option<Value>,
    pub id: Option<Value>,
    pub data: Option<Value>,
    pub fields_schema: Option<Value>,
    pub options: Option<QueryOptions>,
    /// Database configuration for `add_database`
    pub config: Option<Value>,
    /// Per-request cache TTL override in seconds
    pub ttl: Option<u64>,
    /// Echoed back on the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Request {
    /// Create a new request
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn conditions(mut self, conditions: Value) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn id(mut self, id: Value) -> Self {
        self.id = Some(id);
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }
}

/// Response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Whether the operation succeeded
    pub success: bool,
    /// Operation result (if successful)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message (if failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error kind code (if failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Matching request identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Response {
    /// Create a successful response
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
            request_id: None,
        }
    }

    /// Create an error response
    pub fn error(err: &BridgeError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            message: Some(err.kind().to_string()),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Serialize to one line of JSON
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"success":false,"error":"response serialization failed: {}","message":"serialization"}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }
}
