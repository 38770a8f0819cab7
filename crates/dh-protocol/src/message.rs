//! Message types for the control-plane node API
//!
//! The agent talks to a single REST resource, `api/agent/node/`:
//!
//! 1. `POST api/agent/node/` with a [`RegistrationRequest`] allocates a node
//!    and returns a [`NodeRecord`]
//! 2. `PATCH api/agent/node/{uuid}/` with a [`CertificatePatch`] uploads the
//!    node's public certificate and returns the same [`NodeRecord`] shape
//! 3. `GET api/agent/node/{uuid}/` returns a [`NodeStatus`]
//! 4. `PATCH api/agent/node/{uuid}/` with a [`TunnelPatch`] reports the
//!    public tunnel endpoint
//!
//! Every request carries `Authorization: TutumAgentToken {token}`.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Agent version reported to the control plane
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Authorization scheme prefix for the agent token
pub const TOKEN_SCHEME: &str = "TutumAgentToken";

/// Node state the control plane reports once the node is fully provisioned
pub const DEPLOYED_STATE: &str = "Deployed";

/// Body of the enrollment POST
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub agent_version: String,
}

impl RegistrationRequest {
    pub fn new() -> Self {
        Self {
            agent_version: AGENT_VERSION.to_string(),
        }
    }
}

impl Default for RegistrationRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of the confirmation PATCH carrying the node certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificatePatch {
    /// PEM-encoded public certificate
    pub public_cert: String,
    pub agent_version: String,
}

impl CertificatePatch {
    pub fn new(public_cert: impl Into<String>) -> Self {
        Self {
            public_cert: public_cert.into(),
            agent_version: AGENT_VERSION.to_string(),
        }
    }
}

/// Body of the PATCH reporting a discovered tunnel endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelPatch {
    /// Public endpoint, e.g. `tcp://ngrok.example.com:41234`
    pub tunnel: String,
    pub agent_version: String,
}

impl TunnelPatch {
    pub fn new(tunnel: impl Into<String>) -> Self {
        Self {
            tunnel: tunnel.into(),
            agent_version: AGENT_VERSION.to_string(),
        }
    }
}

/// Node record returned by the enrollment POST and confirmation PATCH
///
/// All fields are optional on the wire; absent fields decode as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRecord {
    /// PEM bundle of the user CA the daemon should trust
    pub user_ca_cert: String,
    /// Node UUID allocated by the control plane
    pub uuid: String,
    /// Externally visible FQDN, used as the certificate common name
    pub external_fqdn: String,
    /// Manifest URL for the container-engine binary
    pub docker_url: String,
    /// Manifest URL for the tunnel binary
    pub ngrok_url: String,
    /// Public IP address the control plane observed for this node
    pub public_ip: String,
}

impl NodeRecord {
    /// Decode a node record from a response body
    pub fn from_slice(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Node status returned by the verification GET
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStatus {
    pub state: String,
    /// Address of the private tunnel service assigned to this node
    pub ngrok_server_addr: String,
}

impl NodeStatus {
    /// Decode a node status from a response body
    pub fn from_slice(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Whether the control plane considers the node deployed
    pub fn is_deployed(&self) -> bool {
        self.state == DEPLOYED_STATE
    }
}
