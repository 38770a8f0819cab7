//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding control-plane documents
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Manifest is missing one of its required fields
    #[error("Incomplete update manifest: missing {0}")]
    IncompleteManifest(&'static str),

    /// Body could not be decoded as the expected JSON document
    #[error("Malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
}
