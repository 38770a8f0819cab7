//! Argument vectors for the supervised daemon
//!
//! Arguments are assembled as a list and handed to the OS directly; nothing
//! is ever interpolated into a shell command line.

use std::path::{Path, PathBuf};

/// Local control socket the daemon always listens on
pub const DOCKER_DEFAULT_HOST: &str = "unix:///var/run/docker.sock";

/// A program and its arguments, ready to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Builder for the container-engine daemon command line
#[derive(Debug, Clone)]
pub struct DaemonCommand {
    binary: PathBuf,
    host: String,
    cert: PathBuf,
    key: PathBuf,
    ca: PathBuf,
    debug: bool,
    extra: Vec<String>,
}

impl DaemonCommand {
    pub fn new(binary: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            host: host.into(),
            cert: PathBuf::new(),
            key: PathBuf::new(),
            ca: PathBuf::new(),
            debug: false,
            extra: Vec::new(),
        }
    }

    /// TLS material the daemon serves and verifies clients with
    pub fn tls(mut self, cert: &Path, key: &Path, ca: &Path) -> Self {
        self.cert = cert.to_path_buf();
        self.key = key.to_path_buf();
        self.ca = ca.to_path_buf();
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Raw daemon options, split on whitespace
    pub fn extra_options(mut self, options: &str) -> Self {
        self.extra
            .extend(options.split_whitespace().map(String::from));
        self
    }

    pub fn build(self) -> ProcessSpec {
        let mut spec = ProcessSpec::new(self.binary)
            .arg("-d")
            .args(["-H", self.host.as_str()])
            .args(["-H", DOCKER_DEFAULT_HOST]);
        if self.debug {
            spec = spec.arg("-D");
        }
        spec.arg("--tlscert")
            .arg(self.cert.to_string_lossy())
            .arg("--tlskey")
            .arg(self.key.to_string_lossy())
            .arg("--tlscacert")
            .arg(self.ca.to_string_lossy())
            .arg("--tlsverify")
            .args(self.extra)
    }
}
