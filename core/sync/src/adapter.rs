//! Remote synchronization capability injected into the retry queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use keepsync_common::Result;

use crate::state::SyncOperation;

/// Outcome of a single adapter call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    /// Identifier assigned by the backend, if any.
    pub remote_id: Option<String>,
    pub error: Option<String>,
}

impl SyncResponse {
    /// A successful response.
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// A failed response carrying `error`.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            remote_id: None,
            error: Some(error.into()),
        }
    }

    /// Attach the backend-assigned id.
    pub fn with_remote_id(mut self, id: impl Into<String>) -> Self {
        self.remote_id = Some(id.into());
        self
    }
}

/// Performs the actual remote call for one operation.
///
/// Implementations must not retry or back off on their own; the queue owns
/// that policy. Both `Err(_)` and a response with `success == false` count
/// as a failed attempt.
#[async_trait]
pub trait SyncAdapter: Send + Sync {
    /// Push one operation to the backend.
    async fn sync(&self, operation: &SyncOperation) -> Result<SyncResponse>;
}
