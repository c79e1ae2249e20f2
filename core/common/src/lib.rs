//! Common utilities and types shared across KeepSync modules.
//!
//! This module provides the error taxonomy, identifier types and the
//! notification collaborator used by the queue and backup engines.

pub mod error;
pub mod notify;
pub mod types;

pub use error::{Error, Result};
pub use notify::{notify_best_effort, LogNotifier, Notification, Notifier, NoopNotifier, Urgency};
pub use types::{BackupId, OperationId};
