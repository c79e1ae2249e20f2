//! User-facing notification collaborator.
//!
//! The reliability core never renders anything itself; it hands a
//! [`Notification`] to whatever [`Notifier`] the host application injected.
//! Delivery is fire-and-forget.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, info, warn};

use crate::Result;

/// How prominently a notification should be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    Critical,
}

/// A user-facing alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub urgency: Urgency,
}

impl Notification {
    /// Create a notification with normal urgency.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            urgency: Urgency::Normal,
        }
    }

    /// Set urgency.
    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }
}

/// Presents notifications to the user.
pub trait Notifier: Send + Sync {
    /// Show a notification.
    fn show(&self, notification: &Notification) -> Result<()>;
}

/// Show a notification, logging and swallowing any failure or panic.
pub fn notify_best_effort(notifier: &dyn Notifier, notification: Notification) {
    match catch_unwind(AssertUnwindSafe(|| notifier.show(&notification))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to show notification '{}': {}", notification.title, e),
        Err(_) => error!("Notifier panicked while showing '{}'", notification.title),
    }
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show(&self, notification: &Notification) -> Result<()> {
        match notification.urgency {
            Urgency::Critical => warn!("{}: {}", notification.title, notification.body),
            _ => info!("{}: {}", notification.title, notification.body),
        }
        Ok(())
    }
}

/// Notifier that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn show(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}
