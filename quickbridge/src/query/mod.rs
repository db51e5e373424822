pub mod condition;
pub mod document;
pub mod fingerprint;
pub mod parser;
pub mod sql;

pub use condition::{CompiledTree, Condition, ConditionNode, Operator};
pub use document::render_filter;
pub use fingerprint::{CacheKey, CacheKeyFragment, canonical_json};
pub use parser::{compile, compile_str, compile_tree};
pub use sql::{SqlDialect, SqlFragment, render_select, render_where};
