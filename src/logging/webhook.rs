use crate::logging::LogEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Body POSTed to the external log collector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub timestamp: String,
    pub level: String,
    pub channel: String,
    pub message: String,
    pub context: Value,
    pub server: String,
    pub environment: String,
}

impl WebhookPayload {
    pub fn from_entry(entry: &LogEntry, server: &str, environment: &str) -> Self {
        Self {
            timestamp: entry.timestamp.to_rfc3339(),
            level: entry.level.as_str().to_string(),
            channel: entry.channel.as_str().to_string(),
            message: entry.message.clone(),
            context: entry.context.clone(),
            server: server.to_string(),
            environment: environment.to_string(),
        }
    }
}

/// Fire-and-forget delivery to an HTTP log collector
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    server: String,
    environment: String,
}

impl WebhookSink {
    pub fn new(url: &str, server: &str, environment: &str) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .user_agent(concat!("school-guard-logger/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: url.to_string(),
            server: server.to_string(),
            environment: environment.to_string(),
        })
    }

    pub fn payload(&self, entry: &LogEntry) -> WebhookPayload {
        WebhookPayload::from_entry(entry, &self.server, &self.environment)
    }

    /// Send on a background task; the caller never waits on the collector
    pub fn dispatch(&self, entry: &LogEntry) {
        let payload = self.payload(entry);
        let request = self.client.post(&self.url).json(&payload);

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    debug!("Log webhook answered {}", response.status());
                }
                Ok(_) => {}
                Err(e) => debug!("Log webhook failed: {}", e),
            }
        });
    }
}
