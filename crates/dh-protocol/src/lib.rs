//! dh-protocol: Control-plane wire types for the Dockhand agent
//!
//! This crate defines the JSON documents exchanged between the node agent
//! and the remote control plane, plus the update manifest that describes a
//! downloadable binary artifact.

pub mod error;
pub mod manifest;
pub mod message;

pub use error::ProtocolError;
pub use manifest::UpdateManifest;
pub use message::{
    CertificatePatch, NodeRecord, NodeStatus, RegistrationRequest, TunnelPatch, AGENT_VERSION,
    DEPLOYED_STATE, TOKEN_SCHEME,
};
