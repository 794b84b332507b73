//! Infrastructure layer: shared store, admission control, job tracking and execution.

pub mod config;
pub mod context;
pub mod jobs;
pub mod kv;
pub mod rate_limit;


pub use config::{ConfigError, ScanSettings};
pub use context::{ContextError, ScanContext};
