use crate::config::NotifyConfig;
use crate::error::DispatchError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Delivery of one message to one subscriber. Transport is opaque to callers.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subscriber_id: &str, title: &str, body: &str) -> Result<(), DispatchError>;
}

pub fn from_config(config: &NotifyConfig) -> Result<Arc<dyn Notifier>, reqwest::Error> {
    Ok(match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    })
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subscriber_id: &str, title: &str, body: &str) -> Result<(), DispatchError> {
        info!(subscriber = subscriber_id, title, "notification\n{}", body);
        Ok(())
    }
}

/// Posts `{subscriber, title, body}` as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    hook_url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(hook_url: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { hook_url, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subscriber_id: &str, title: &str, body: &str) -> Result<(), DispatchError> {
        let payload = serde_json::json!({
            "subscriber": subscriber_id,
            "title": title,
            "body": body,
        });
        let resp = self
            .client
            .post(&self.hook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|source| DispatchError::Transport {
                subscriber: subscriber_id.to_string(),
                source,
            })?;

        let status = resp.status();
        if status.is_success() {
            info!(status = status.as_u16(), subscriber = subscriber_id, "Posted notification to webhook");
            Ok(())
        } else {
            error!(status = status.as_u16(), subscriber = subscriber_id, "Webhook rejected notification");
            Err(DispatchError::Rejected {
                subscriber: subscriber_id.to_string(),
                reason: format!("HTTP {}", status),
            })
        }
    }
}
