//! Configuration management for Dockhand

mod agent;
mod layout;
mod settings;

pub use agent::{AgentConfig, DEFAULT_DOCKER_HOST, DEFAULT_TUTUM_HOST};
pub use layout::AgentPaths;
pub use settings::{AgentSettings, BackoffConfig};

use crate::error::ConfigError;
use std::path::Path;

/// Load configuration from a JSON file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = serde_json::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a JSON file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let mut content = serde_json::to_string(config)?;
    content.push('\n');

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}
