//! dh-core: Core configuration and shared types for the Dockhand agent
//!
//! This crate provides the persisted agent configuration, the on-disk
//! layout the agent relies on, runtime tunables, and the PID file helpers.

pub mod config;
pub mod error;
pub mod pidfile;

pub use config::{AgentConfig, AgentPaths, AgentSettings, BackoffConfig};
pub use error::ConfigError;
