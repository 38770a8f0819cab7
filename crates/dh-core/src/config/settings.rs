//! Runtime tunables
//!
//! These are not persisted; the defaults are the production values and
//! tests shrink them to keep timing-sensitive checks fast.

use std::time::Duration;

/// Exponential backoff configuration
///
/// The delay starts at `initial` and doubles after every failure. Once the
/// doubled delay would exceed `cap` it wraps back to `initial` rather than
/// sticking at the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Initial delay
    pub initial: Duration,

    /// Largest delay before the sequence restarts
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(200),
        }
    }
}

/// Timing parameters shared by the agent's loops
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Period of the maintenance loop
    pub heartbeat_interval: Duration,

    /// Retry policy for control-plane and download calls
    pub backoff: BackoffConfig,

    /// How long a graceful daemon stop may take before giving up
    pub stop_deadline: Duration,

    /// Poll period while waiting for the daemon to exit
    pub stop_poll_interval: Duration,

    /// Delay before the single re-check of a node that is not yet deployed
    pub verify_retry_interval: Duration,

    /// Period of the descendant priority scan
    pub priority_scan_interval: Duration,

    /// Poll period while waiting for the daemon port to accept connections
    pub port_poll_interval: Duration,

    /// Timeout for the public reachability probe
    pub probe_timeout: Duration,

    /// Delay before a crashed tunnel subprocess is restarted
    pub tunnel_restart_delay: Duration,

    /// Number of daemon log lines attached to crash reports
    pub crash_log_lines: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            stop_deadline: Duration::from_secs(60),
            stop_poll_interval: Duration::from_millis(500),
            verify_retry_interval: Duration::from_secs(300),
            priority_scan_interval: Duration::from_secs(5),
            port_poll_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(10),
            tunnel_restart_delay: Duration::from_secs(1),
            crash_log_lines: 50,
        }
    }
}
