//! Telegram notifications for operator-visible failures.

use std::sync::Arc;
use std::time::Duration;

use hedgerow_config::TelegramConfig;
use hedgerow_engine::ShutdownSignal;
use reqwest::Client;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Thin client over the Bot API `sendMessage` endpoint. Disabled instances
/// swallow every call, so call sites never branch.
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    enabled: bool,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        let enabled = config.enabled
            && config.bot_token.as_deref().is_some_and(|token| !token.is_empty())
            && config.chat_id.as_deref().is_some_and(|chat| !chat.is_empty());
        if config.enabled && !enabled {
            warn!("telegram enabled but bot_token/chat_id missing; notifications off");
        }
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            enabled,
            bot_token: config.bot_token.clone().unwrap_or_default(),
            chat_id: config.chat_id.clone().unwrap_or_default(),
        }
    }

    pub async fn send(&self, text: &str) {
        if !self.enabled {
            debug!(%text, "telegram disabled; message dropped");
            return;
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = json!({ "chat_id": self.chat_id, "text": text });
        match self.client.post(&url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "telegram rejected message");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "telegram send failed"),
        }
    }

    /// Periodic liveness message. Returns `None` when the heartbeat is off.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        every: Duration,
        shutdown: ShutdownSignal,
    ) -> Option<JoinHandle<()>> {
        if !self.enabled || every.is_zero() {
            return None;
        }
        let notifier = self.clone();
        Some(tokio::spawn(async move {
            while shutdown.sleep(every).await {
                notifier.send("hedgerow heartbeat: engine running").await;
            }
        }))
    }
}
