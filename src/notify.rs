//! User-facing notifications
//!
//! Background operations report their outcome here instead of returning
//! errors to a caller that has long since moved on. Delivery is
//! fire-and-forget: a notifier never blocks the operation that raised it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub header: String,
    pub message: String,
}

impl Notification {
    fn new(level: Level, header: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            header: header.into(),
            message: message.into(),
        }
    }

    pub fn info(header: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Level::Info, header, message)
    }

    pub fn error(header: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Level::Error, header, message)
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Writes notifications to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        match n.level {
            Level::Info => info!(header = %n.header, "{}", n.message),
            Level::Error => error!(header = %n.header, "{}", n.message),
        }
    }
}

/// Logs locally and POSTs every notification as JSON to a webhook
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
    local: LogNotifier,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            local: LogNotifier,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        self.local.notify(notification.clone());

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(url = %self.url, "No async runtime, webhook notification dropped");
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        handle.spawn(async move {
            match client.post(&url).json(&notification).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(id = %notification.id, url = %url, "Notification delivered");
                }
                Ok(resp) => {
                    warn!(id = %notification.id, url = %url, status = %resp.status(), "Webhook rejected notification");
                }
                Err(e) => {
                    warn!(id = %notification.id, url = %url, error = %e, "Webhook notification failed");
                }
            }
        });
    }
}

/// Pick the notifier for the configured webhook, if any
pub fn from_settings(webhook_url: Option<&str>) -> SharedNotifier {
    match webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => Arc::new(LogNotifier),
    }
}
