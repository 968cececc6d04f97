//! User notifications. Fire-and-forget: failures are logged, never propagated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::ledger::UserId;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Transport(String),

    #[error("notification endpoint returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &UserId, event_type: &str, payload: &Value) -> Result<(), NotifyError>;
}

/// Send a notification on a spawned task.
pub fn dispatch(notifier: Arc<dyn Notifier>, user_id: UserId, event_type: &'static str, payload: Value) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&user_id, event_type, &payload).await {
            tracing::warn!(user = %user_id, event = event_type, "Notification failed: {}", e);
        }
    });
}

/// Writes notifications to the log. Default when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &UserId, event_type: &str, payload: &Value) -> Result<(), NotifyError> {
        tracing::info!(user = %user_id, event = event_type, payload = %payload, "Notify");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    user_id: &'a str,
    event_type: &'a str,
    payload: &'a Value,
}

/// POSTs `{user_id, event_type, payload}` as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl WebhookNotifier {
    pub fn new(endpoint: url::Url) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, user_id: &UserId, event_type: &str, payload: &Value) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&WebhookBody {
                user_id: user_id.as_str(),
                event_type,
                payload,
            })
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records notifications; optionally fails every call.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) sent: Mutex<Vec<(UserId, String)>>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, user_id: &UserId, event_type: &str, _payload: &Value) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((user_id.clone(), event_type.to_string()));
            if self.fail {
                return Err(NotifyError::Status(503));
            }
            Ok(())
        }
    }
}
