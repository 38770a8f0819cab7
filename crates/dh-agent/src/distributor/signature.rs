//! Detached signature checks for staged binaries

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;

/// Decides whether a staged binary may replace the running one
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, binary: &Path, signature: &Path) -> bool;
}

/// Runs `gpg --verify <signature> <binary>`; exit status zero means valid
#[derive(Debug, Clone)]
pub struct GpgVerifier {
    program: PathBuf,
}

impl GpgVerifier {
    pub fn new() -> Self {
        Self::with_program("gpg")
    }

    /// Use another program with the same command line and exit-code contract
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for GpgVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignatureVerifier for GpgVerifier {
    async fn verify(&self, binary: &Path, signature: &Path) -> bool {
        let status = tokio::process::Command::new(&self.program)
            .arg("--verify")
            .arg(signature)
            .arg(binary)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                tracing::warn!("Signature check of {:?} failed: {}", binary, status);
                false
            }
            Err(e) => {
                tracing::warn!("Cannot run {:?}: {}", self.program, e);
                false
            }
        }
    }
}
