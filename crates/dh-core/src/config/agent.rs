//! Agent configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Docker API bind address used when none is configured
pub const DEFAULT_DOCKER_HOST: &str = "tcp://0.0.0.0:2375";

/// Control-plane base URL used when none is configured
pub const DEFAULT_TUTUM_HOST: &str = "https://dashboard.tutum.co/";

/// Persisted configuration of the node agent
///
/// This file doubles as the node's identity record: `tutum_uuid` and
/// `cert_common_name` are only ever changed from a successful registration
/// response, and the file is rewritten right after such a change.
///
/// The on-disk representation uses PascalCase keys so existing config
/// files keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentConfig {
    /// Common name for the node's TLS certificate (the node's FQDN)
    pub cert_common_name: String,

    /// Address the container engine binds its TLS API to
    pub docker_host: String,

    /// Control-plane base URL
    pub tutum_host: String,

    /// Agent token used to authenticate against the control plane
    pub tutum_token: String,

    /// Node UUID allocated by the control plane (empty when unregistered)
    #[serde(rename = "TutumUUID")]
    pub tutum_uuid: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cert_common_name: String::new(),
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            tutum_host: DEFAULT_TUTUM_HOST.to_string(),
            tutum_token: String::new(),
            tutum_uuid: String::new(),
        }
    }
}

impl AgentConfig {
    /// Fill empty host settings with their defaults
    pub fn with_defaults(mut self) -> Self {
        if self.docker_host.is_empty() {
            self.docker_host = DEFAULT_DOCKER_HOST.to_string();
        }
        if self.tutum_host.is_empty() {
            self.tutum_host = DEFAULT_TUTUM_HOST.to_string();
        }
        self
    }

    /// Whether the node has been allocated a UUID
    pub fn is_registered(&self) -> bool {
        !self.tutum_uuid.is_empty()
    }

    /// Apply a `KEY=VALUE` assignment as accepted by `dockhand-agent set`
    ///
    /// Keys are matched case-insensitively and surrounding quotes are
    /// stripped from the value.
    pub fn set_item(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            ConfigError::Invalid(format!("expected KEY=VALUE, got \"{}\"", assignment))
        })?;
        let key = key.trim();
        let value = value
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .to_string();

        match key.to_ascii_lowercase().as_str() {
            "certcommonname" => self.cert_common_name = value,
            "dockerhost" => self.docker_host = value,
            "tutumhost" => self.tutum_host = value,
            "tutumtoken" => self.tutum_token = value,
            "tutumuuid" => self.tutum_uuid = value,
            _ => return Err(ConfigError::UnknownItem(key.to_string())),
        }
        Ok(())
    }

    /// Port the container engine exposes on its TCP host address
    ///
    /// Falls back to the standard TLS port when the address carries none.
    pub fn docker_port(&self) -> u16 {
        self.docker_host
            .rsplit_once(':')
            .and_then(|(_, port)| port.trim_end_matches('/').parse().ok())
            .unwrap_or(2375)
    }
}
