//! Notification sinks alert events are delivered to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::alert::{AlertError, AlertEvent};
use crate::config::duration_str;
use crate::detect::Severity;

/// A named delivery target from `[[channels]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: ChannelKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelKind {
    Log,
    Webhook {
        url: String,
        #[serde(
            default,
            with = "duration_str::option",
            skip_serializing_if = "Option::is_none"
        )]
        timeout: Option<Duration>,
    },
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError>;
}

pub fn build_sink(config: &ChannelConfig) -> Result<Arc<dyn AlertSink>, AlertError> {
    Ok(match &config.kind {
        ChannelKind::Log => Arc::new(LogSink),
        ChannelKind::Webhook { url, timeout } => Arc::new(WebhookSink::new(
            config.name.clone(),
            url.clone(),
            timeout.unwrap_or(Duration::from_secs(10)),
        )?),
    })
}

/// Writes alerts to the process log.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError> {
        match event.severity {
            Severity::Error | Severity::Critical => tracing::error!(
                rule = %event.rule_id,
                entity = %event.entity,
                severity = %event.severity,
                "ALERT {}",
                event.message
            ),
            _ => warn!(
                rule = %event.rule_id,
                entity = %event.entity,
                severity = %event.severity,
                "ALERT {}",
                event.message
            ),
        }
        Ok(())
    }
}

/// POSTs the alert as JSON.
pub struct WebhookSink {
    channel: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(channel: String, url: String, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Delivery {
                channel: channel.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            channel,
            url,
            client,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError> {
        let failed = |reason: String| AlertError::Delivery {
            channel: self.channel.clone(),
            reason,
        };
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("webhook returned {}", response.status())));
        }
        Ok(())
    }
}

/// Forwards alerts into an in-process channel.
pub struct ChannelSink {
    tx: mpsc::Sender<AlertEvent>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<AlertEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelSink {
    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| AlertError::Delivery {
                channel: "mpsc".into(),
                reason: "receiver dropped".into(),
            })
    }
}
