//! Endpoint discovery from tunnel log lines and reporting upstream

use tokio::sync::mpsc;

use dh_protocol::TunnelPatch;

use crate::backoff::RetryPolicy;
use crate::client::{ClientError, ControlPlaneClient};
use crate::state::SharedConfig;

/// Substring identifying the line that announces the public endpoint
pub const TUNNEL_MARKER: &str = "Tunnel established at";

/// Input of the endpoint tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A new tunnel subprocess was started; its log lines start a new session
    Started { pid: u32 },
    /// A line from the tunnel log
    Line(String),
}

/// Public endpoint announced by a marker line
pub fn parse_endpoint(line: &str) -> Option<&str> {
    if !line.contains(TUNNEL_MARKER) {
        return None;
    }
    line.split_whitespace().last()
}

/// State of the current tunnel subprocess
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelSession {
    pub pid: Option<u32>,
    /// First endpoint announced in this session
    pub endpoint: Option<String>,
}

/// Decides which discovered endpoints must be reported
///
/// Within a session only the first marker line counts. A restarted tunnel
/// reports its endpoint again even if an earlier session announced it.
#[derive(Debug, Default)]
pub struct EndpointTracker {
    session: TunnelSession,
}

impl EndpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> &TunnelSession {
        &self.session
    }

    /// Feed one event; returns an endpoint that has to be reported
    pub fn observe(&mut self, event: &TunnelEvent) -> Option<String> {
        match event {
            TunnelEvent::Started { pid } => {
                self.session = TunnelSession {
                    pid: Some(*pid),
                    endpoint: None,
                };
                None
            }
            TunnelEvent::Line(line) => {
                let endpoint = parse_endpoint(line)?;
                if let Some(current) = &self.session.endpoint {
                    if current != endpoint {
                        tracing::debug!("Ignoring endpoint {} within session of {}", endpoint, current);
                    }
                    return None;
                }
                tracing::info!("Found new tunnel: {}", endpoint);
                self.session.endpoint = Some(endpoint.to_string());
                Some(endpoint.to_string())
            }
        }
    }
}

/// Consume tunnel events and PATCH newly discovered endpoints
///
/// Failures are logged and never end the loop.
pub async fn run_reporter(
    mut events: mpsc::Receiver<TunnelEvent>,
    client: ControlPlaneClient,
    config: SharedConfig,
    retry: RetryPolicy,
) {
    let mut tracker = EndpointTracker::new();
    while let Some(event) = events.recv().await {
        let Some(endpoint) = tracker.observe(&event) else {
            continue;
        };

        tracing::info!("Patching tunnel address {} to the control plane", endpoint);
        let uuid = config.snapshot().tutum_uuid;
        let patch = TunnelPatch::new(endpoint);
        let client = &client;
        let result = retry
            .run(
                "Tunnel PATCH",
                || client.patch_node(&uuid, &patch),
                ClientError::is_identity_rejection,
            )
            .await;
        match result {
            Ok(_) => tracing::info!("Patching tunnel address is finished"),
            Err(e) => tracing::warn!("Control plane refused tunnel address: {}", e),
        }
    }
}
