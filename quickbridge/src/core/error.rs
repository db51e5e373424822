use thiserror::Error;

/// Failure to turn a caller-supplied condition into a compiled tree
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("Malformed condition: {0}")]
    Malformed(String),

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Operator {operator} cannot be applied to {found} value on field '{field}'")]
    TypeMismatch {
        field: String,
        operator: String,
        found: String,
    },

    #[error("Invalid regex on field '{field}': {reason}")]
    InvalidRegex { field: String, reason: String },
}

/// Alias registry failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("Unknown database alias: {0}")]
    UnknownAlias(String),

    #[error("Database alias already registered: {0}")]
    DuplicateAlias(String),

    #[error("No alias given and no default alias configured")]
    NoDefaultAlias,
}

/// Failure reported by a backend adapter
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend I/O error: {0}")]
    Io(String),

    #[error("Unsupported by backend: {0}")]
    Unsupported(String),

    #[error("Backend error: {0}")]
    Other(String),
}

/// L2 cache tier failures. Always recoverable: the engine degrades to L1-only.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache data corrupted: {0}")]
    Corrupted(String),

    #[error("Cache serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

/// Invalid configuration object
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Invalid configuration for '{field}': {reason}")]
pub struct ConfigError {
    pub field: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Stable short code used as the envelope `message` on failure
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Compile(_) => "compile",
            Self::Registry(_) => "registry",
            Self::Backend(_) => "backend",
            Self::Cache(_) => "cache",
            Self::Config(_) => "config",
            Self::Timeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        let err: BridgeError = RegistryError::UnknownAlias("db1".into()).into();
        assert_eq!(err.kind(), "registry");
        assert_eq!(err.to_string(), "Unknown database alias: db1");

        let err: BridgeError = CompileError::UnknownOperator("like".into()).into();
        assert_eq!(err.kind(), "compile");

        let err = BridgeError::Timeout("connect".into());
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_type_mismatch_message() {
        let err = CompileError::TypeMismatch {
            field: "tags".into(),
            operator: "Contains".into(),
            found: "null".into(),
        };
        assert_eq!(
            err.to_string(),
            "Operator Contains cannot be applied to null value on field 'tags'"
        );
    }
}
