//! Queued operation model and queue status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keepsync_common::{OperationId, Result};

use crate::retry::BackoffPolicy;

/// Lifecycle status of a queued operation.
///
/// `Synced` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting for a (re)try.
    Pending,
    /// Accepted by the adapter.
    Synced,
    /// Gave up after reaching the retry ceiling.
    Failed,
}

/// A mutation submitted by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOperation {
    /// Kind of mutation (e.g., "create", "update", "delete").
    pub op_type: String,
    /// Entity the mutation applies to.
    pub entity: String,
    /// Opaque payload interpreted by the adapter.
    pub data: Vec<u8>,
}

impl NewOperation {
    /// Create a new operation with a raw payload.
    pub fn new(op_type: impl Into<String>, entity: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            op_type: op_type.into(),
            entity: entity.into(),
            data: data.into(),
        }
    }

    /// Create a new operation whose payload is `value` encoded as JSON.
    pub fn json<T: Serialize>(
        op_type: impl Into<String>,
        entity: impl Into<String>,
        value: &T,
    ) -> Result<Self> {
        Ok(Self::new(op_type, entity, serde_json::to_vec(value)?))
    }
}

/// A mutation tracked by the retry queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub op_type: String,
    pub entity: String,
    #[serde(with = "payload")]
    pub data: Vec<u8>,
    pub status: OperationStatus,
    /// Number of processing attempts so far.
    pub retries: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
    /// Last error message if an attempt failed.
    pub error: Option<String>,
}

impl SyncOperation {
    /// Create a pending operation with a fresh id.
    pub fn new(operation: NewOperation, now: DateTime<Utc>) -> Self {
        Self {
            id: OperationId::generate(),
            op_type: operation.op_type,
            entity: operation.entity,
            data: operation.data,
            status: OperationStatus::Pending,
            retries: 0,
            enqueued_at: now,
            last_attempt_at: None,
            synced_at: None,
            error: None,
        }
    }

    /// Record the start of a processing attempt.
    pub fn mark_attempt(&mut self, now: DateTime<Utc>) {
        self.last_attempt_at = Some(now);
        self.retries += 1;
    }

    /// Mark as synced successfully.
    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Synced;
        self.synced_at = Some(now);
        self.error = None;
    }

    /// Record a failed attempt.
    ///
    /// The operation stays pending unless the retry ceiling was reached.
    pub fn mark_error(&mut self, error: impl Into<String>, max_retries: u32) {
        self.error = Some(error.into());
        if self.retries >= max_retries {
            self.status = OperationStatus::Failed;
        }
    }

    /// Mark as permanently failed.
    pub fn mark_failed(&mut self) {
        self.status = OperationStatus::Failed;
    }

    /// Put a failed operation back in the queue with a clean retry budget.
    pub fn reset(&mut self) {
        self.status = OperationStatus::Pending;
        self.retries = 0;
        self.last_attempt_at = None;
        self.error = None;
    }

    /// Check if the operation has exhausted its retries.
    pub fn retries_exhausted(&self, max_retries: u32) -> bool {
        self.retries >= max_retries
    }

    /// Check if the operation may be attempted at `now`.
    pub fn is_due(&self, policy: &BackoffPolicy, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Pending
            && policy.is_elapsed(self.last_attempt_at, self.retries, now)
    }

    /// Check if a synced operation is older than the retention window.
    pub fn is_expired(&self, retention: chrono::Duration, now: DateTime<Utc>) -> bool {
        match (self.status, self.synced_at) {
            (OperationStatus::Synced, Some(synced_at)) => now - synced_at > retention,
            _ => false,
        }
    }
}

/// Snapshot of the queue for status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub total: usize,
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
    pub is_processing: bool,
    pub online: bool,
    pub adapter_configured: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl QueueStatus {
    /// Count operations by status.
    pub fn count<'a>(operations: impl IntoIterator<Item = &'a SyncOperation>) -> Self {
        let mut status = Self::default();
        for op in operations {
            status.total += 1;
            match op.status {
                OperationStatus::Pending => status.pending += 1,
                OperationStatus::Synced => status.synced += 1,
                OperationStatus::Failed => status.failed += 1,
            }
        }
        status
    }
}

/// Payloads are opaque bytes, persisted as base64 strings.
mod payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
