//! Over-the-air replacement of the daemon binary
//!
//! An external channel drops a new binary and its detached signature next
//! to the active one. The maintenance loop picks them up here.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dh_core::AgentPaths;

use super::{replace_symlink, BinaryDistributor};
use crate::supervisor::Supervisor;

/// Files involved in a binary swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePaths {
    pub staged_binary: PathBuf,
    pub staged_signature: PathBuf,
    pub current_binary: PathBuf,
    pub symlink: PathBuf,
}

impl UpdatePaths {
    pub fn from_layout(paths: &AgentPaths) -> Self {
        Self {
            staged_binary: paths.docker_new_binary(),
            staged_signature: paths.docker_new_signature(),
            current_binary: paths.docker_binary(),
            symlink: paths.docker_symlink().to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing staged
    NoUpdate,
    /// The staged binary replaced the active one and the daemon restarted
    Applied,
    /// The signature did not verify; the staged files were deleted
    Rejected,
}

fn remove_logged(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!("Removed {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Cannot remove {:?}: {}", path, e),
    }
}

impl BinaryDistributor {
    /// Apply a staged binary if one is present and correctly signed
    ///
    /// The whole stop, swap and restart sequence runs under a planned stop
    /// so the respawn check never races it. A rejected update leaves the
    /// running daemon untouched.
    pub async fn check_for_update(
        &self,
        paths: &UpdatePaths,
        supervisor: &Supervisor,
        stop_deadline: Duration,
    ) -> UpdateOutcome {
        if !paths.staged_binary.exists() {
            return UpdateOutcome::NoUpdate;
        }
        tracing::info!("New docker binary ({:?}) found", paths.staged_binary);

        if !self
            .verifier()
            .verify(&paths.staged_binary, &paths.staged_signature)
            .await
        {
            tracing::warn!("New docker binary signature cannot be verified. Update is rejected!");
            remove_logged(&paths.staged_binary);
            remove_logged(&paths.staged_signature);
            return UpdateOutcome::Rejected;
        }

        let _planned = supervisor.planned_stop();

        if !supervisor.stop_gracefully(stop_deadline).await {
            supervisor.kill();
            if !supervisor.wait_for_exit(stop_deadline).await {
                tracing::error!("Docker daemon survived SIGKILL, swapping binary anyway");
            }
        }

        remove_logged(&paths.current_binary);
        if let Err(e) = std::fs::rename(&paths.staged_binary, &paths.current_binary) {
            tracing::error!("Cannot rename docker binary: {}", e);
        }
        remove_logged(&paths.staged_signature);
        if let Err(e) = replace_symlink(&paths.current_binary, &paths.symlink) {
            tracing::warn!("Cannot repoint {:?}: {}", paths.symlink, e);
        }

        if let Err(e) = supervisor.start() {
            tracing::error!("Cannot restart docker daemon after update: {}", e);
        }
        UpdateOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_from_layout() {
        let paths = UpdatePaths::from_layout(&AgentPaths::default());
        assert_eq!(paths.staged_binary, PathBuf::from("/usr/lib/tutum/docker.new"));
        assert_eq!(paths.staged_signature, PathBuf::from("/usr/lib/tutum/docker.new.sig"));
        assert_eq!(paths.current_binary, PathBuf::from("/usr/lib/tutum/docker"));
        assert_eq!(paths.symlink, PathBuf::from("/usr/bin/docker"));
    }
}
