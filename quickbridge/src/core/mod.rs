pub mod error;
pub mod model;
pub mod types;

pub use error::{
    BackendError, BridgeError, CacheError, CompileError, ConfigError, RegistryError, Result,
};
pub use model::{FieldDefinition, FieldType, IndexDefinition, ModelMeta, StorageHint};
pub use types::{
    BackendKind, IdStrategy, OperationKind, PaginationConfig, QueryOptions, SortConfig, SortDirection,
};
