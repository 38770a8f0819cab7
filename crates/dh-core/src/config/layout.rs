//! On-disk layout of the agent
//!
//! Every path the agent touches is derived from three directories under a
//! filesystem root. The root is `/` in production; tests point it at a
//! temporary directory.

use std::io;
use std::path::{Path, PathBuf};

const HOME_DIR: &str = "etc/tutum/agent";
const LIB_DIR: &str = "usr/lib/tutum";
const LOG_DIR: &str = "var/log/tutum";
const DOCKER_SYMLINK: &str = "usr/bin/docker";

/// Resolved filesystem locations used by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    home: PathBuf,
    lib: PathBuf,
    log: PathBuf,
    docker_symlink: PathBuf,
}

impl AgentPaths {
    /// Build the layout under the given filesystem root
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            home: root.join(HOME_DIR),
            lib: root.join(LIB_DIR),
            log: root.join(LOG_DIR),
            docker_symlink: root.join(DOCKER_SYMLINK),
        }
    }

    /// Create the home, binary and log directories
    pub fn create_dirs(&self) -> io::Result<()> {
        for dir in [&self.home, &self.lib, &self.log] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn home_dir(&self) -> &Path {
        &self.home
    }

    pub fn log_dir(&self) -> &Path {
        &self.log
    }

    pub fn config_file(&self) -> PathBuf {
        self.home.join("tutum-agent.conf")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home.join("tutum-agent.pid")
    }

    pub fn key_file(&self) -> PathBuf {
        self.home.join("key.pem")
    }

    pub fn cert_file(&self) -> PathBuf {
        self.home.join("cert.pem")
    }

    pub fn ca_file(&self) -> PathBuf {
        self.home.join("ca.pem")
    }

    pub fn ngrok_config(&self) -> PathBuf {
        self.home.join("ngrok.conf")
    }

    pub fn docker_binary(&self) -> PathBuf {
        self.lib.join("docker")
    }

    /// Staged replacement binary dropped in by the update channel
    pub fn docker_new_binary(&self) -> PathBuf {
        self.lib.join("docker.new")
    }

    /// Detached signature of the staged replacement binary
    pub fn docker_new_signature(&self) -> PathBuf {
        self.lib.join("docker.new.sig")
    }

    pub fn ngrok_binary(&self) -> PathBuf {
        self.lib.join("ngrok")
    }

    /// Stable symlink pointing at the active docker binary
    pub fn docker_symlink(&self) -> &Path {
        &self.docker_symlink
    }

    pub fn agent_log(&self) -> PathBuf {
        self.log.join("agent.log")
    }

    pub fn docker_log(&self) -> PathBuf {
        self.log.join("docker.log")
    }

    pub fn ngrok_log(&self) -> PathBuf {
        self.log.join("ngrok.log")
    }
}

impl Default for AgentPaths {
    fn default() -> Self {
        Self::under("/")
    }
}
