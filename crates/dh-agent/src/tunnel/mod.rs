//! NAT tunnel for nodes that are not publicly reachable
//!
//! Once the daemon listens, the manager probes the daemon port from the
//! outside address. If the probe fails it keeps a tunnel subprocess
//! running, follows its log and reports the announced public endpoint to
//! the control plane. Nothing here is ever fatal to the agent.

mod follow;
mod probe;
mod report;

pub use follow::LogFollower;
pub use probe::{is_publicly_reachable, wait_until_listening};
pub use report::{parse_endpoint, run_reporter, EndpointTracker, TunnelEvent, TunnelSession, TUNNEL_MARKER};

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::backoff::RetryPolicy;
use crate::client::{ClientError, ControlPlaneClient};
use crate::state::SharedConfig;

/// Capacity of the channel between the supervising task and the reporter
const TUNNEL_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where the tunnel binary lives and what it should expose
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub binary: PathBuf,
    pub log_path: PathBuf,
    /// Config file written for the private tunnel service
    pub config_path: PathBuf,
    /// Address the control plane observed; falls back to the common name
    pub public_ip: String,
    pub common_name: String,
    /// Daemon port to expose
    pub port: u16,
    /// Token for the public tunnel service; the private service is used
    /// when absent
    pub auth_token: Option<String>,
}

impl TunnelConfig {
    fn probe_host(&self) -> &str {
        if self.public_ip.is_empty() {
            &self.common_name
        } else {
            &self.public_ip
        }
    }
}

/// Contents of the private tunnel-service config file
pub fn render_service_config(server_addr: &str) -> String {
    format!("server_addr: {}\ntrust_host_root_certs: false\n", server_addr)
}

/// Arguments for the tunnel subprocess
pub fn tunnel_args(auth_token: Option<&str>, config_path: &Path, port: u16) -> Vec<String> {
    let mut args = vec!["-log".to_string(), "stdout".to_string()];
    match auth_token {
        Some(token) => args.extend(["-authtoken".to_string(), token.to_string()]),
        None => args.extend(["-config".to_string(), config_path.to_string_lossy().into_owned()]),
    }
    args.extend(["-proto".to_string(), "tcp".to_string(), port.to_string()]);
    args
}

/// Runs the tunnel side channel
pub struct TunnelManager {
    client: ControlPlaneClient,
    config: SharedConfig,
    retry: RetryPolicy,
    server_addr: Option<String>,
    port_poll_interval: Duration,
    probe_timeout: Duration,
    restart_delay: Duration,
}

impl TunnelManager {
    pub fn new(client: ControlPlaneClient, config: SharedConfig, retry: RetryPolicy) -> Self {
        Self {
            client,
            config,
            retry,
            server_addr: None,
            port_poll_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_secs(1),
        }
    }

    pub fn with_intervals(mut self, port_poll: Duration, probe_timeout: Duration, restart_delay: Duration) -> Self {
        self.port_poll_interval = port_poll;
        self.probe_timeout = probe_timeout;
        self.restart_delay = restart_delay;
        self
    }

    /// Pre-seed the tunnel service address
    pub fn with_server_addr(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = Some(addr.into());
        self
    }

    /// Probe reachability and, if needed, keep a tunnel running forever
    ///
    /// Returns only when no tunnel is needed or it cannot be set up.
    pub async fn run(mut self, tunnel: TunnelConfig) {
        if !tunnel.binary.exists() {
            tracing::info!("Cannot find tunnel binary ({:?}), skipping NAT tunnel", tunnel.binary);
            return;
        }

        wait_until_listening(tunnel.port, self.port_poll_interval).await;

        tracing::info!("Testing if port {} is publicly reachable...", tunnel.port);
        if is_publicly_reachable(tunnel.probe_host(), tunnel.port, self.probe_timeout).await {
            tracing::info!("Port {} is publicly reachable, NAT tunnel is not needed", tunnel.port);
            return;
        }
        tracing::info!("Port {} is not publicly reachable, NAT tunnel is needed", tunnel.port);

        match tunnel.auth_token.as_deref() {
            Some(_) => tracing::info!("About to tunnel to public tunnel service"),
            None => {
                tracing::info!("About to tunnel to private tunnel service");
                let Some(addr) = self.resolve_server_addr().await else {
                    tracing::warn!("No tunnel service address assigned, skipping NAT tunnel");
                    return;
                };
                if let Err(e) = write_service_config(&tunnel.config_path, &addr) {
                    tracing::warn!("Cannot write {:?}: {}, skipping NAT tunnel", tunnel.config_path, e);
                    return;
                }
            }
        }

        let args = tunnel_args(tunnel.auth_token.as_deref(), &tunnel.config_path, tunnel.port);
        let (events_tx, events_rx) = mpsc::channel(TUNNEL_EVENT_CHANNEL_CAPACITY);
        tokio::spawn(run_reporter(
            events_rx,
            self.client.clone(),
            self.config.clone(),
            self.retry,
        ));

        tracing::info!("Starting monitoring tunnel log {:?}", tunnel.log_path);
        let follower = LogFollower::new(&tunnel.log_path, self.port_poll_interval.min(Duration::from_millis(500)));
        supervise(&tunnel, &args, follower, events_tx, self.restart_delay).await;
    }

    /// Address of the private tunnel service, queried once and cached
    pub async fn resolve_server_addr(&mut self) -> Option<String> {
        if let Some(addr) = &self.server_addr {
            return Some(addr.clone());
        }

        let uuid = self.config.snapshot().tutum_uuid;
        let client = &self.client;
        let status = self
            .retry
            .run(
                "Tunnel service lookup",
                || client.get_node(&uuid),
                ClientError::is_identity_rejection,
            )
            .await;

        match status {
            Ok(status) if !status.ngrok_server_addr.is_empty() => {
                self.server_addr = Some(status.ngrok_server_addr.clone());
                Some(status.ngrok_server_addr)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Cannot look up tunnel service: {}", e);
                None
            }
        }
    }
}

fn write_service_config(path: &Path, server_addr: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_service_config(server_addr))
}

/// Restart the tunnel subprocess whenever it exits
///
/// Log lines are read on this task, so every line reaches the reporter
/// after the `Started` event of the session that wrote it and before the
/// next one.
async fn supervise(
    tunnel: &TunnelConfig,
    args: &[String],
    mut follower: LogFollower,
    events: mpsc::Sender<TunnelEvent>,
    restart_delay: Duration,
) {
    loop {
        tracing::info!("Starting NAT tunnel: {:?} {:?}", tunnel.binary, args);
        match spawn_tunnel(tunnel, args) {
            Ok(mut child) => {
                follower.reset();
                if let Some(pid) = child.id() {
                    // The reporter is gone only if the runtime is shutting down
                    let _ = events.send(TunnelEvent::Started { pid }).await;
                }

                let exited = child.wait();
                tokio::pin!(exited);
                let status = loop {
                    tokio::select! {
                        status = &mut exited => break status,
                        line = follower.next_line() => {
                            let _ = events.send(TunnelEvent::Line(line)).await;
                        }
                    }
                };
                for line in follower.drain().await {
                    let _ = events.send(TunnelEvent::Line(line)).await;
                }
                match status {
                    Ok(status) => tracing::info!("NAT tunnel exited: {}", status),
                    Err(e) => tracing::warn!("Cannot wait for NAT tunnel: {}", e),
                }
            }
            Err(e) => tracing::warn!("Cannot start NAT tunnel: {}", e),
        }
        tokio::time::sleep(restart_delay).await;
        tracing::info!("Restarting NAT tunnel");
    }
}

/// Start one tunnel session writing to a freshly created log file
fn spawn_tunnel(tunnel: &TunnelConfig, args: &[String]) -> io::Result<tokio::process::Child> {
    match std::fs::remove_file(&tunnel.log_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let log = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&tunnel.log_path)?;
    let log_err = log.try_clone()?;
    tokio::process::Command::new(&tunnel.binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
}
