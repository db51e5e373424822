pub mod envelope;

pub use envelope::{Request, Response};
