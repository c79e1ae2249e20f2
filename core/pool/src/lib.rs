//! Fixed-size pool of isolated worker threads.
//!
//! Each worker is an OS thread that runs one task at a time and talks to the
//! pool's supervisor exclusively through channels. A worker that panics is
//! never restarted in place: the supervisor discards it, rejects the task it
//! was running and spawns a fresh replacement.

pub mod pool;
pub mod worker;

pub use pool::{PoolStats, TaskPool, TaskTicket};
pub use worker::{ProgressReporter, TaskHandler};
