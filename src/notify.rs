//! Fire-and-forget task lifecycle notifications.
//!
//! Events are posted to a single outbound webhook on a spawned task;
//! delivery failures are logged and swallowed, never affecting task state.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lifecycle event names carried in `event_type`.
pub mod events {
    pub const TASK_SUBMITTED: &str = "task_submitted";
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const TASK_PARTIAL_COMPLETED: &str = "task_partial_completed";
    pub const TASK_FAILED: &str = "task_failed";
}

/// One outbound notification payload.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event_type: String,
    pub task_id: String,
    pub task_name: String,
    pub submitter: String,
    pub details: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        event_type: &str,
        task_id: impl Into<String>,
        task_name: impl Into<String>,
        submitter: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            task_id: task_id.into(),
            task_name: task_name.into(),
            submitter: submitter.into(),
            details: Map::new(),
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Posts notifications to a webhook without blocking callers.
pub struct Notifier {
    webhook_url: Option<String>,
    http: Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            webhook_url,
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
        })
    }

    /// A notifier that logs events instead of delivering them.
    pub fn disabled() -> Arc<Self> {
        Self::new(None)
    }

    /// Sends a notification on a background task. Best-effort: no retries,
    /// errors become a log line.
    pub fn send(&self, notification: Notification) {
        let Some(url) = self.webhook_url.clone() else {
            debug!(
                event_type = %notification.event_type,
                task_id = %notification.task_id,
                "notification sink disabled, dropping event"
            );
            return;
        };

        let http = self.http.clone();
        tokio::spawn(async move {
            let event_type = notification.event_type.clone();
            let task_id = notification.task_id.clone();
            match http.post(&url).json(&notification).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(event_type = %event_type, task_id = %task_id, "notification delivered");
                }
                Ok(response) => {
                    warn!(
                        event_type = %event_type,
                        task_id = %task_id,
                        status = %response.status(),
                        "notification rejected by sink"
                    );
                }
                Err(err) => {
                    warn!(
                        event_type = %event_type,
                        task_id = %task_id,
                        error = %err,
                        "notification delivery failed"
                    );
                }
            }
        });
    }
}
