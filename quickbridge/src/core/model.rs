//! Model and field metadata
//!
//! Registered per table through `register_model` / `create_table`. The core
//! only routes it; adapters consume it to pick a storage layout for
//! array/object fields and to validate records.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::error::BackendError;
use super::types::BackendKind;

/// Declared field type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Datetime,
    Uuid,
    Json,
    Array,
    List,
    Dict,
    Reference,
}

/// How an adapter should lay a field out in its store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageHint {
    /// Scalar column or document field
    Scalar,
    /// Native array column or embedded array
    NativeArray,
    /// Dedicated JSON column type
    JsonColumn,
    /// JSON serialized into a text column
    JsonText,
    /// Embedded document
    Document,
}

impl FieldType {
    pub fn storage_hint(&self, kind: BackendKind) -> StorageHint {
        let shaped = matches!(
            self,
            FieldType::Json | FieldType::Array | FieldType::List | FieldType::Dict
        );
        if !shaped {
            return StorageHint::Scalar;
        }
        let is_sequence = matches!(self, FieldType::Array | FieldType::List);
        match kind {
            BackendKind::Mongodb if is_sequence => StorageHint::NativeArray,
            BackendKind::Mongodb => StorageHint::Document,
            BackendKind::Postgresql if is_sequence => StorageHint::NativeArray,
            BackendKind::Postgresql | BackendKind::Mysql => StorageHint::JsonColumn,
            BackendKind::Sqlite => StorageHint::JsonText,
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String | FieldType::Reference => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Datetime => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
            FieldType::Uuid => value
                .as_str()
                .is_some_and(|s| uuid::Uuid::parse_str(s).is_ok()),
            FieldType::Json => true,
            FieldType::Array | FieldType::List => value.is_array(),
            FieldType::Dict => value.is_object(),
        }
    }
}

/// One field of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    /// Element type for array/list fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<FieldType>,
    /// Target collection for reference fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl FieldDefinition {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            unique: false,
            indexed: false,
            max_length: None,
            min_length: None,
            min_value: None,
            max_value: None,
            item_type: None,
            target: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Validate a single value against this definition
    pub fn validate(&self, name: &str, value: &Value) -> Result<(), BackendError> {
        if value.is_null() {
            if self.required {
                return Err(violation(name, "required field is null"));
            }
            return Ok(());
        }

        if !self.field_type.accepts(value) {
            return Err(violation(
                name,
                format!("expected {:?} value", self.field_type).to_lowercase(),
            ));
        }

        let length = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let Some(len) = length {
            if self.max_length.is_some_and(|max| len > max) {
                return Err(violation(name, format!("length {} exceeds max_length", len)));
            }
            if self.min_length.is_some_and(|min| len < min) {
                return Err(violation(name, format!("length {} below min_length", len)));
            }
        }

        if let Some(n) = value.as_f64() {
            if self.max_value.is_some_and(|max| n > max) {
                return Err(violation(name, format!("{} exceeds max_value", n)));
            }
            if self.min_value.is_some_and(|min| n < min) {
                return Err(violation(name, format!("{} below min_value", n)));
            }
        }

        if let (Some(item_type), Value::Array(items)) = (self.item_type, value) {
            if let Some(pos) = items.iter().position(|item| !item_type.accepts(item)) {
                return Err(violation(
                    name,
                    format!("item {} is not of type {:?}", pos, item_type).to_lowercase(),
                ));
            }
        }

        Ok(())
    }
}

fn violation(field: &str, reason: impl Into<String>) -> BackendError {
    BackendError::Constraint(format!("field '{}': {}", field, reason.into()))
}

/// Index declared on a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// Registered model for one table/collection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelMeta {
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
}

impl ModelMeta {
    /// Parse a `register_model` payload (`{fields, indexes}`)
    pub fn from_payload(collection: &str, payload: &Value) -> Result<Self, serde_json::Error> {
        let mut meta: ModelMeta = serde_json::from_value(payload.clone())?;
        meta.collection = collection.to_string();
        Ok(meta)
    }

    /// Build from a bare `fields_schema` map as sent with `create_table`
    pub fn from_fields_schema(
        collection: &str,
        schema: &Value,
    ) -> Result<Self, serde_json::Error> {
        let fields: BTreeMap<String, FieldDefinition> = serde_json::from_value(schema.clone())?;
        Ok(Self {
            collection: collection.to_string(),
            fields,
            indexes: Vec::new(),
        })
    }

    /// Field sets that must be unique across the table
    pub fn unique_keys(&self) -> Vec<Vec<String>> {
        let mut keys: Vec<Vec<String>> = self
            .fields
            .iter()
            .filter(|(_, def)| def.unique)
            .map(|(name, _)| vec![name.clone()])
            .collect();
        for index in self.indexes.iter().filter(|i| i.unique) {
            if !keys.contains(&index.fields) {
                keys.push(index.fields.clone());
            }
        }
        keys
    }

    /// Validate a record. `partial` skips required checks for absent fields
    /// (used for updates).
    pub fn validate_record(
        &self,
        record: &Map<String, Value>,
        partial: bool,
    ) -> Result<(), BackendError> {
        for (name, def) in &self.fields {
            match record.get(name) {
                Some(value) => def.validate(name, value)?,
                None if partial => {}
                None => def.validate(name, &Value::Null)?,
            }
        }
        Ok(())
    }
}
