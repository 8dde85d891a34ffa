//! Sync subsystem
//!
//! Configurations describe what to sync with which adapter and how often.
//! The scheduler turns due configurations into jobs, the queue hands them
//! to workers, and the engine executes them.

pub mod adapter;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod job;
pub mod scheduler;

pub use adapter::{
    Adapter, AdapterRegistry, Capabilities, EntityCapability, FetchOptions, FetchPage,
    JsonDirAdapter, MemoryAdapter,
};
pub use config::{
    ConflictRule, CreateConfigurationInput, SyncConfiguration, SyncDirection, SyncFrequency,
    UpdateConfigurationInput,
};
pub use conflict::{ConflictResolver, ConflictType, ResolutionAction, SyncConflict};
pub use engine::{JobResult, SyncEngine};
pub use job::{CancelOutcome, JobCounters, JobPriority, JobStatus, JobType, SyncError, SyncJob};
pub use scheduler::{SyncScheduler, TickReport};
