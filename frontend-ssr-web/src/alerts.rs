//! Operational alerting over named webhook channels (§6, §7 taxonomy kind
//! 6: "send an alert via the webhook channel").
//!
//! Alerts are dispatched fire-and-forget from the caller's perspective —
//! nothing in the request path blocks on delivery — but the dispatcher
//! tracks outstanding deliveries so shutdown can wait up to its
//! `pending_alerts_timeout` for them to drain instead of dropping them on
//! the floor.

use std::sync::Arc;

use tokio::sync::Mutex;

/// Posts a small JSON payload to one of the configured webhook channels.
#[derive(Clone)]
pub struct AlertDispatcher {
    client: reqwest::Client,
    channels: Arc<std::collections::HashMap<String, String>>,
    in_flight: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl AlertDispatcher {
    pub fn new(channels: Vec<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            channels: Arc::new(channels.into_iter().collect()),
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Dispatch `message` to `channel` if it's configured. Unknown channels
    /// are logged and dropped rather than treated as fatal — an alert
    /// failing to send must never cascade into a second incident.
    pub async fn send(&self, channel: &str, message: impl Into<String>) {
        let Some(url) = self.channels.get(channel).cloned() else {
            tracing::warn!(channel, "no webhook configured for alert channel");
            return;
        };
        let message = message.into();
        let client = self.client.clone();
        let handle = tokio::spawn(async move {
            let body = serde_json::json!({ "text": message });
            if let Err(err) = client.post(&url).json(&body).send().await {
                tracing::warn!(error = %err, "alert webhook delivery failed");
            }
        });
        self.in_flight.lock().await.push(handle);
    }

    /// Wait for every outstanding delivery spawned so far. Used as the
    /// `pending_alerts` future passed to
    /// [`ssr_core::lifecycle::ShutdownCoordinator::shutdown`].
    pub async fn drain(&self) {
        let handles = std::mem::take(&mut *self.in_flight.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sending_to_an_unconfigured_channel_is_a_noop() {
        let dispatcher = AlertDispatcher::new(vec![]);
        dispatcher.send("ready", "hello").await;
        dispatcher.drain().await;
    }
}
