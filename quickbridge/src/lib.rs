pub mod backend;
pub mod bridge;
pub mod cache;
pub mod compression;
pub mod config;
pub mod core;
pub mod logging;
pub mod protocol;
pub mod query;

// Re-export commonly used types
pub use backend::{
    BackendAdapter, BackendCommand, BackendConnector, CompiledQuery, MemoryBackend,
    MemoryConnector, RenderedQuery,
};
pub use bridge::{AliasEntry, Dispatcher, Registry};
pub use cache::{CacheConfig, CacheEngine, CacheOutcome, CacheStats};
pub use compression::{CompressionAlgorithm, CompressionConfig, Compressor};
pub use config::{BridgeConfig, ConnectionConfig, DatabaseConfig, PoolConfig, TlsConfig};
pub use core::{
    BackendError, BackendKind, BridgeError, CacheError, CompileError, ConfigError, IdStrategy,
    OperationKind, QueryOptions, RegistryError, Result,
};
pub use protocol::{Request, Response};
pub use query::{CacheKey, CacheKeyFragment, CompiledTree, ConditionNode, Operator, compile};
