//! Persisted key-value store for KeepSync.
//!
//! Every durable structure (the sync queue, backup history) lives as a JSON
//! value under its own key in a single shared store. Components own disjoint
//! key namespaces and never share a key.
//!
//! # Design Principles
//! - Synchronous API: a read-modify-write never yields between read and write
//! - Whole-document persistence: every `set` leaves a complete file on disk
//! - Backend isolation: callers only see the [`KeyValueStore`] trait

pub mod store;
pub mod memory;
pub mod file;

pub use store::{Entries, KeyValueStore};
pub use memory::MemoryStore;
pub use file::FileStore;
