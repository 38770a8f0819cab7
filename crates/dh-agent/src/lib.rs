//! dh-agent: Node agent for a remotely managed container engine
//!
//! The agent registers the node with the control plane, provisions its TLS
//! identity, downloads and supervises the container-engine daemon, applies
//! signed binary updates, and opens a NAT tunnel when the node is not
//! publicly reachable.

pub mod backoff;
pub mod client;
pub mod credentials;
pub mod distributor;
pub mod lifecycle;
pub mod logging;
pub mod registration;
pub mod state;
pub mod supervisor;
pub mod telemetry;
pub mod tunnel;

pub use state::{DaemonHandle, SharedConfig, SupervisedProcess, TerminationState};
