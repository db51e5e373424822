//! Command bridge: alias registry plus request dispatcher

pub mod dispatcher;
pub mod registry;

pub use dispatcher::Dispatcher;
pub use registry::{AliasEntry, Registry};
