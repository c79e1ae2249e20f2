//! Application wiring for KeepSync.
//!
//! Loads the application configuration and assembles the store, prober,
//! retry queue, task pool and archive engine into one [`AppContext`] that
//! lives for the duration of the process.

pub mod config;
pub mod context;
pub mod webhook;

pub use config::{
    AppConfig, BackupSection, PoolSection, ProberSection, QueueSection, SyncModeSetting,
    SyncSection,
};
pub use context::{AppContext, BackgroundTasks};
pub use webhook::WebhookAdapter;
