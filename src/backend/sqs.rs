//! SQS delayed requeue backend

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_sqs::Client as SqsClient;
use chrono::Utc;
use std::time::Duration;

use super::RequeueQueue;

/// Longest delay SQS supports for a single message
const MAX_DELAY: Duration = Duration::from_secs(900);

/// Requeue scheduler over an SQS queue with per-message delay
pub struct SqsRequeueQueue {
    client: SqsClient,
    queue_url: String,
}

impl SqsRequeueQueue {
    pub fn new(config: &aws_config::SdkConfig, queue_url: impl Into<String>) -> Self {
        Self {
            client: SqsClient::new(config),
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl RequeueQueue for SqsRequeueQueue {
    async fn schedule(&self, cluster: &str, delay: Duration) -> Result<()> {
        let delay = delay.min(MAX_DELAY);
        let scheduled_for = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let body = serde_json::json!({
            "clusterName": cluster,
            "scheduledFor": scheduled_for.to_rfc3339(),
        });

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body.to_string())
            .delay_seconds(delay.as_secs() as i32)
            .send()
            .await
            .map(|_| ())
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to schedule requeue for '{}'", cluster))
    }
}
