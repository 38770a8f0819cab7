//! Update manifest describing a downloadable binary artifact

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Versioned download manifest
///
/// Fetched fresh on every download attempt and never persisted. A manifest
/// is only usable when all four fields are present and non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateManifest {
    pub version: String,
    pub download_url: String,
    pub checksum_md5_url: String,
    pub checksum_sha256_url: String,
}

impl UpdateManifest {
    /// Decode and validate a manifest document
    pub fn from_slice(body: &[u8]) -> Result<Self, ProtocolError> {
        let manifest: Self = serde_json::from_slice(body)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check that every field is populated
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let fields = [
            ("version", &self.version),
            ("download_url", &self.download_url),
            ("checksum_md5_url", &self.checksum_md5_url),
            ("checksum_sha256_url", &self.checksum_sha256_url),
        ];
        match fields.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(ProtocolError::IncompleteManifest(name)),
            None => Ok(()),
        }
    }
}
