//! Syncwright - bidirectional commerce data sync
//!
//! Keeps products, orders, customers and inventory consistent between a
//! local canonical store and external platforms: scheduled and manual sync
//! jobs, duplicate collapsing, rule-driven conflict handling and a durable
//! work queue with retry and backoff.

pub mod config;
pub mod context;
pub mod dedup;
pub mod error;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::SyncwrightConfig;
pub use context::AppContext;
pub use error::{Result, SyncwrightError};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
