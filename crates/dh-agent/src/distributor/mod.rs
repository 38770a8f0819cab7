//! Download and update of agent-managed binaries
//!
//! A binary is described by an [`UpdateManifest`]. The artifact is only
//! written to disk after its MD5 and SHA-256 digests both appear in the
//! checksum documents the manifest points to.

mod signature;
mod update;

pub use signature::{GpgVerifier, SignatureVerifier};
pub use update::{UpdateOutcome, UpdatePaths};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use md5::Md5;
use sha2::{Digest, Sha256};
use thiserror::Error;

use dh_protocol::{ProtocolError, UpdateManifest};

use crate::backoff::RetryPolicy;
use crate::client::{self, ClientError};

/// Errors of a single download attempt
///
/// None of these reach the caller of [`BinaryDistributor::ensure_present`];
/// each one restarts the attempt after a backoff delay.
#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("download failed: {0}")]
    Fetch(#[from] ClientError),

    #[error("invalid manifest: {0}")]
    Manifest(#[from] ProtocolError),

    #[error("failed to pass {algorithm} checksum test (digest {digest})")]
    ChecksumMismatch {
        algorithm: &'static str,
        digest: String,
    },

    #[error("{path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A downloaded binary whose digests matched both checksum documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub bytes: Bytes,
    pub md5: String,
    pub sha256: String,
}

/// Fetches, verifies and installs binaries
#[derive(Clone)]
pub struct BinaryDistributor {
    http: reqwest::Client,
    retry: RetryPolicy,
    verifier: Arc<dyn SignatureVerifier>,
}

impl BinaryDistributor {
    pub fn new(http: reqwest::Client, retry: RetryPolicy, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            http,
            retry,
            verifier,
        }
    }

    /// Download the binary described at `manifest_url` unless `dest` exists
    ///
    /// Retries until the binary is installed. When `symlink` is given it is
    /// repointed at `dest` afterwards. Returns whether a download happened.
    pub async fn ensure_present(&self, manifest_url: &str, dest: &Path, symlink: Option<&Path>) -> bool {
        if dest.exists() {
            tracing::info!("Found {:?} locally, skip downloading", dest);
            return false;
        }
        tracing::info!("No binary found at {:?}. Starting to download...", dest);

        let artifact = self
            .retry
            .run_forever("Download", || async move {
                let manifest = self.fetch_manifest(manifest_url).await;
                tracing::info!("Downloading binary from {}", manifest.download_url);
                self.fetch_artifact(&manifest).await
            })
            .await;
        tracing::info!("Successfully downloaded {} bytes", artifact.bytes.len());

        self.install(&artifact, dest).await;
        if let Some(link) = symlink {
            if let Err(e) = replace_symlink(dest, link) {
                tracing::warn!("Cannot point {:?} at {:?}: {}", link, dest, e);
            }
        }
        true
    }

    /// Fetch and validate the manifest, retrying until it is usable
    pub async fn fetch_manifest(&self, url: &str) -> UpdateManifest {
        tracing::info!("Downloading definition from {}", url);
        self.retry
            .run_forever("Definition download", || async move {
                let body = client::fetch(&self.http, url).await?;
                Ok::<_, DistributionError>(UpdateManifest::from_slice(&body)?)
            })
            .await
    }

    /// Download the artifact and check it against both checksum documents
    pub async fn fetch_artifact(&self, manifest: &UpdateManifest) -> Result<StagedArtifact, DistributionError> {
        let bytes = client::fetch(&self.http, &manifest.download_url).await?;

        let md5 = hex::encode(Md5::digest(&bytes));
        tracing::info!("Checksum of the downloaded binary, md5: {}", md5);
        self.require_digest(&manifest.checksum_md5_url, "md5", &md5).await?;

        let sha256 = hex::encode(Sha256::digest(&bytes));
        tracing::info!("Checksum of the downloaded binary, sha256: {}", sha256);
        self.require_digest(&manifest.checksum_sha256_url, "sha256", &sha256)
            .await?;

        Ok(StagedArtifact { bytes, md5, sha256 })
    }

    async fn require_digest(
        &self,
        url: &str,
        algorithm: &'static str,
        digest: &str,
    ) -> Result<(), DistributionError> {
        let document = client::fetch(&self.http, url).await?;
        if !String::from_utf8_lossy(&document).contains(digest) {
            return Err(DistributionError::ChecksumMismatch {
                algorithm,
                digest: digest.to_string(),
            });
        }
        tracing::info!("Binary passed {} checksum check", algorithm);
        Ok(())
    }

    /// Write the artifact as an executable, retrying until it succeeds
    pub async fn install(&self, artifact: &StagedArtifact, dest: &Path) {
        tracing::info!("Writing binary to {:?}", dest);
        self.retry
            .run_forever("Saving binary", || async move {
                write_executable(dest, &artifact.bytes).await
            })
            .await;
    }

    pub fn verifier(&self) -> &dyn SignatureVerifier {
        self.verifier.as_ref()
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

async fn write_executable(dest: &Path, bytes: &[u8]) -> Result<(), DistributionError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DistributionError::Io { path, source }
    };

    let tmp = sibling(dest, ".part");
    tokio::fs::write(&tmp, bytes).await.map_err(io_err(&tmp))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(io_err(&tmp))?;
    }
    tokio::fs::rename(&tmp, dest).await.map_err(io_err(dest))
}

/// Atomically point `link` at `target`
#[cfg(unix)]
pub fn replace_symlink(target: &Path, link: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = sibling(link, ".new");
    match std::fs::remove_file(&tmp) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    std::os::unix::fs::symlink(target, &tmp)?;
    std::fs::rename(&tmp, link)?;
    tracing::info!("Linked {:?} to {:?}", link, target);
    Ok(())
}
