//! Chat webhook notifications.

use std::time::Duration;

use async_trait::async_trait;
use backlog_core::Notifier;
use backlog_http::{HttpClient, HttpError, HttpRequest};
use serde_json::{json, Value};
use tracing::{debug, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts plain-text messages to an incoming chat webhook.
pub struct WebhookNotifier {
    url: String,
    http: HttpClient,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        Ok(Self {
            url: url.into(),
            http: HttpClient::with_tls(WEBHOOK_TIMEOUT)?,
        })
    }

    /// Text message body understood by the webhook.
    pub fn payload(message: &str) -> Value {
        json!({
            "msg_type": "text",
            "content": { "text": message },
        })
    }

    async fn post(&self, message: &str) -> Result<(), HttpError> {
        let req = HttpRequest::post(&self.url)?.json(&Self::payload(message))?;
        let resp = self.http.send(req).await?;
        if !resp.is_success() {
            warn!(status = %resp.status, body = %resp.text(), "webhook refused notification");
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) {
        match self.post(message).await {
            Ok(()) => debug!(notification = message, "notification sent"),
            Err(e) => warn!(error = %e, "failed to send notification"),
        }
    }
}
