//! Fire-and-forget error reporting
//!
//! A single bounded queue is shared by the whole process. Producers never
//! wait on it: when the queue is full the event is dropped. One drain task
//! forwards events to an HTTP endpoint, or just logs them when none is
//! configured.

use serde::Serialize;
use tokio::sync::mpsc;

use dh_protocol::AGENT_VERSION;

/// Queue depth of the process-wide sink
pub const TELEMETRY_QUEUE_CAPACITY: usize = 64;

/// One diagnostic report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryEvent {
    pub message: String,
    pub error: String,
    /// Free-form context, such as the tail of a crashed process's log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    pub agent_version: String,
}

impl TelemetryEvent {
    pub fn new(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: error.into(),
            extra: None,
            agent_version: AGENT_VERSION.to_string(),
        }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }
}

/// Producer side of the telemetry queue
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl TelemetrySink {
    /// Create a sink and its receiving end without starting a drain task
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Create the process-wide sink and spawn its drain task
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(http: reqwest::Client, endpoint: Option<String>) -> Self {
        let (sink, rx) = Self::channel(TELEMETRY_QUEUE_CAPACITY);
        tokio::spawn(drain(rx, http, endpoint));
        sink
    }

    /// Queue an event; returns false if it was dropped
    pub fn send(&self, event: TelemetryEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!("Telemetry queue full, dropping report: {}", event.message);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a report built from a message, an error and optional context
    pub fn report(&self, message: &str, error: &dyn std::fmt::Display, extra: Option<String>) -> bool {
        let mut event = TelemetryEvent::new(message, error.to_string());
        event.extra = extra;
        self.send(event)
    }
}

async fn drain(
    mut rx: mpsc::Receiver<TelemetryEvent>,
    http: reqwest::Client,
    endpoint: Option<String>,
) {
    while let Some(event) = rx.recv().await {
        let Some(url) = endpoint.as_deref() else {
            tracing::debug!("Telemetry: {}: {}", event.message, event.error);
            continue;
        };

        match http.post(url).json(&event).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::debug!("Telemetry endpoint answered {}", response.status());
            }
            Err(e) => tracing::debug!("Failed to deliver telemetry: {}", e),
        }
    }
}
