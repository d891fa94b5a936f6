//! Outbound notifications
//!
//! Best-effort Telegram messages on position lifecycle transitions. Sends
//! are fire-and-forget: a failed delivery is logged and dropped, it never
//! blocks or fails a trading operation. Without credentials the notifier
//! degrades to log-only.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::TelegramConfig;

#[derive(Clone)]
enum Sink {
    /// Log-only, used when no credentials are configured
    Log,
    /// Telegram bot API
    Telegram {
        client: reqwest::Client,
        token: String,
        chat_id: String,
    },
    /// In-memory capture for tests
    Memory(Arc<Mutex<Vec<String>>>),
}

/// Best-effort outbound notifier
#[derive(Clone)]
pub struct Notifier {
    sink: Sink,
}

impl Notifier {
    /// Telegram-backed when configured, log-only otherwise
    pub fn new(config: Option<&TelegramConfig>) -> Self {
        let sink = match config {
            Some(cfg) if !cfg.token.is_empty() => Sink::Telegram {
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .expect("Failed to build HTTP client"),
                token: cfg.token.clone(),
                chat_id: cfg.chat_id.clone(),
            },
            _ => Sink::Log,
        };
        Notifier { sink }
    }

    /// Log-only notifier
    pub fn disabled() -> Self {
        Notifier { sink: Sink::Log }
    }

    /// Capturing notifier plus a handle to the captured messages
    pub fn memory() -> (Self, Arc<Mutex<Vec<String>>>) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        (
            Notifier {
                sink: Sink::Memory(messages.clone()),
            },
            messages,
        )
    }

    /// Send a routine notification; failures are swallowed
    pub fn notify(&self, text: impl Into<String>) {
        let text = text.into();
        info!("📣 {}", text);

        match &self.sink {
            Sink::Log => {}
            Sink::Memory(messages) => messages.lock().unwrap().push(text),
            Sink::Telegram {
                client,
                token,
                chat_id,
            } => {
                let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
                let body = serde_json::json!({ "chat_id": chat_id, "text": text });
                let client = client.clone();

                tokio::spawn(async move {
                    match client.post(&url).json(&body).send().await {
                        Ok(response) if !response.status().is_success() => {
                            warn!("Telegram send failed: HTTP {}", response.status());
                        }
                        Err(e) => warn!("Telegram send failed: {}", e),
                        _ => {}
                    }
                });
            }
        }
    }

    /// Urgent notification for the money-moved-but-state-unknown class of
    /// failures; logged at error level and prefixed so it stands out in the
    /// channel.
    pub fn notify_urgent(&self, text: impl Into<String>) {
        let text = text.into();
        error!("URGENT: {}", text);
        self.notify(format!("🚨 URGENT: {}", text));
    }
}
