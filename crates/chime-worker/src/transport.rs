use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use chime_core::{CallbackStatus, JobId};

use crate::error::{Result, WorkerError};

/// Delivers a fired job to the outside world.
///
/// Infallible by contract: delivery failures are *outcomes*, encoded in the
/// returned [`CallbackStatus`], never raised as errors. A dead endpoint must
/// not stall the processor loop.
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    async fn invoke(&self, id: &JobId) -> CallbackStatus;
}

/// HTTP transport: `POST { "callbackId": "<job id>" }` to a fixed endpoint.
pub struct HttpCallbackTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCallbackTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl CallbackTransport for HttpCallbackTransport {
    async fn invoke(&self, id: &JobId) -> CallbackStatus {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "callbackId": id }))
            .send()
            .await;
        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(job_id = %id, status, "callback delivered");
                CallbackStatus::ok(status)
            }
            Err(e) => {
                debug!(job_id = %id, "callback failed: {e}");
                CallbackStatus::failed(e.to_string())
            }
        }
    }
}
