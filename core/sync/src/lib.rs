//! KeepSync Sync Engine
//!
//! This module keeps locally-originated mutations consistent with a remote
//! backend despite intermittent connectivity:
//! - Durable retry queue persisted in the shared key-value store
//! - Exponential backoff between attempts of a failing operation
//! - Connectivity prober with a debounced online/offline state machine
//! - Scheduler that drains the queue on reconnect and on a timer

pub mod adapter;
pub mod connectivity;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use adapter::{SyncAdapter, SyncResponse};
pub use connectivity::{
    ConnectivityProber, ConnectivityState, HttpProbe, Probe, ProberConfig, Subscription,
};
pub use queue::{
    ProcessOutcome, ProcessSummary, QueueConfig, QueuePause, RetryQueue, SkipReason, QUEUE_KEY,
};
pub use retry::BackoffPolicy;
pub use scheduler::{SyncMode, SyncScheduler, SyncSchedulerHandle};
pub use state::{NewOperation, OperationStatus, QueueStatus, SyncOperation};
