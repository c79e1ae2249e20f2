//! HTTP webhook sync adapter.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use keepsync_common::{Error, Result};
use keepsync_sync::{SyncAdapter, SyncOperation, SyncResponse};

/// Optional body of a successful webhook reply.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookReply {
    #[serde(alias = "id")]
    remote_id: Option<String>,
}

/// Adapter that POSTs each operation as JSON to a fixed URL.
///
/// Any 2xx status is a success; the reply may carry `{"id": "..."}` or
/// `{"remoteId": "..."}`. Other statuses are failed attempts and transport
/// errors are `Network` errors, both retried by the queue.
pub struct WebhookAdapter {
    http: reqwest::Client,
    url: String,
}

impl WebhookAdapter {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("KeepSync/0.1")
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SyncAdapter for WebhookAdapter {
    async fn sync(&self, operation: &SyncOperation) -> Result<SyncResponse> {
        let response = self
            .http
            .post(&self.url)
            .json(operation)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            debug!("Webhook rejected operation {}: {}", operation.id, status);
            return Ok(SyncResponse::failed(format!("Webhook answered {}", status)));
        }

        let reply: WebhookReply = response.json().await.unwrap_or_default();
        let mut result = SyncResponse::ok();
        if let Some(remote_id) = reply.remote_id {
            result = result.with_remote_id(remote_id);
        }
        Ok(result)
    }
}
