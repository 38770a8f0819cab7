//! Node registration with the control plane
//!
//! Enrollment allocates a UUID (`POST`), confirmation uploads the node
//! certificate (`PATCH`), and verification polls the node state (`GET`)
//! once the agent is running. A rejected identity during confirmation
//! triggers one full re-enrollment before the agent gives up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use dh_core::config::save_config;
use dh_core::{AgentConfig, AgentPaths, ConfigError};
use dh_protocol::{CertificatePatch, NodeRecord, RegistrationRequest};

use crate::backoff::RetryPolicy;
use crate::client::{ClientError, ControlPlaneClient};
use crate::credentials::{self, CredentialError};
use crate::state::SharedConfig;
use crate::telemetry::TelemetrySink;

/// Manifest of the container-engine binary used until the control plane
/// names another one
pub const DEFAULT_DOCKER_BINARY_URL: &str = "https://files.tutum.co/packages/docker/latest.json";

/// Registration failures that reach the caller
///
/// Every variant is fatal for the agent except `InvalidIdentity`, which
/// [`RegistrationEngine::register`] recovers from by re-enrolling once.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("agent token is not set; run `dockhand-agent set TutumToken=<token>` and restart")]
    MissingToken,

    #[error("control plane rejected the agent token (401); run `dockhand-agent set TutumToken=<token>` and restart")]
    Unauthorized,

    #[error("node UUID {uuid:?} was rejected: {source}")]
    InvalidIdentity {
        uuid: String,
        #[source]
        source: ClientError,
    },

    #[error("re-enrollment of node {uuid:?} failed: {source}")]
    ReEnrollmentFailed {
        uuid: String,
        #[source]
        source: ClientError,
    },

    #[error("registration request failed: {0}")]
    Request(#[source] ClientError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// Durable storage for the agent configuration
pub trait IdentityStore: Send + Sync {
    fn save(&self, config: &AgentConfig) -> Result<(), ConfigError>;
}

/// Stores the configuration as the agent's JSON config file
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityStore for FileIdentityStore {
    fn save(&self, config: &AgentConfig) -> Result<(), ConfigError> {
        save_config(&self.path, config)
    }
}

/// Download locations and addresses learned from the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoints {
    pub docker_binary_url: String,
    /// Empty when the control plane offers no tunnel
    pub ngrok_binary_url: String,
    pub public_ip: String,
}

impl Default for NodeEndpoints {
    fn default() -> Self {
        Self {
            docker_binary_url: DEFAULT_DOCKER_BINARY_URL.to_string(),
            ngrok_binary_url: String::new(),
            public_ip: String::new(),
        }
    }
}

impl NodeEndpoints {
    fn merge(&mut self, record: &NodeRecord) {
        for (field, value) in [
            (&mut self.docker_binary_url, &record.docker_url),
            (&mut self.ngrok_binary_url, &record.ngrok_url),
            (&mut self.public_ip, &record.public_ip),
        ] {
            if !value.is_empty() {
                field.clone_from(value);
            }
        }
    }
}

/// Result of the background registration check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    TimedOut,
}

/// Drives enrollment, confirmation and verification
pub struct RegistrationEngine {
    client: ControlPlaneClient,
    config: SharedConfig,
    store: Arc<dyn IdentityStore>,
    paths: AgentPaths,
    retry: RetryPolicy,
    endpoints: NodeEndpoints,
    verify_retry_interval: Duration,
    telemetry: Option<TelemetrySink>,
}

impl RegistrationEngine {
    pub fn new(
        client: ControlPlaneClient,
        config: SharedConfig,
        store: Arc<dyn IdentityStore>,
        paths: AgentPaths,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            config,
            store,
            paths,
            retry,
            endpoints: NodeEndpoints::default(),
            verify_retry_interval: Duration::from_secs(300),
            telemetry: None,
        }
    }

    /// Delay before the second and last verification attempt
    pub fn with_verify_retry_interval(mut self, interval: Duration) -> Self {
        self.verify_retry_interval = interval;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn endpoints(&self) -> &NodeEndpoints {
        &self.endpoints
    }

    /// Register the node: enroll if needed, create certificates, confirm
    ///
    /// A rejected UUID during confirmation clears the identity and runs the
    /// whole sequence once more. Any error returned from here is fatal.
    pub async fn register(&mut self) -> Result<(), RegistrationError> {
        self.require_token()?;

        if !self.config.snapshot().is_registered() {
            credentials::remove_credentials(&self.paths)?;
            self.enroll().await?;
        }
        self.ensure_certificates()?;

        match self.confirm().await {
            Ok(()) => Ok(()),
            Err(RegistrationError::InvalidIdentity { uuid, source }) => {
                tracing::warn!(
                    "Node UUID ({}) is invalid ({}), trying to allocate a new one...",
                    uuid,
                    source
                );
                self.re_enroll().await
            }
            Err(e) => Err(e),
        }
    }

    async fn re_enroll(&mut self) -> Result<(), RegistrationError> {
        self.config.update(|c| c.tutum_uuid.clear());
        self.persist().await;
        credentials::remove_credentials(&self.paths)?;

        self.enroll().await?;
        self.ensure_certificates()?;

        match self.confirm().await {
            Ok(()) => Ok(()),
            Err(RegistrationError::InvalidIdentity { uuid, source }) => {
                if let Some(telemetry) = &self.telemetry {
                    telemetry.report("Registration HTTP error", &source, None);
                }
                Err(RegistrationError::ReEnrollmentFailed { uuid, source })
            }
            Err(e) => Err(e),
        }
    }

    fn require_token(&self) -> Result<(), RegistrationError> {
        if self.config.snapshot().tutum_token.is_empty() {
            return Err(RegistrationError::MissingToken);
        }
        Ok(())
    }

    fn ensure_certificates(&self) -> Result<(), RegistrationError> {
        let common_name = self.config.snapshot().cert_common_name;
        credentials::ensure_certificates(
            &self.paths.key_file(),
            &self.paths.cert_file(),
            &common_name,
        )?;
        Ok(())
    }

    /// Allocate a node with `POST`
    ///
    /// 401 is fatal; every other failure is retried indefinitely.
    pub async fn enroll(&mut self) -> Result<(), RegistrationError> {
        self.require_token()?;
        tracing::info!("Registering via POST: {}", self.client.node_url(""));

        let client = &self.client;
        let request = RegistrationRequest::new();
        let record = self
            .retry
            .run(
                "Registration POST",
                || client.create_node(&request),
                |e| matches!(e, ClientError::Unauthorized),
            )
            .await
            .map_err(|e| match e {
                ClientError::Unauthorized => RegistrationError::Unauthorized,
                other => RegistrationError::Request(other),
            })?;

        self.apply_record(&record).await;
        Ok(())
    }

    /// Upload the node certificate with `PATCH`
    ///
    /// 401 and 404 come back as [`RegistrationError::InvalidIdentity`].
    pub async fn confirm(&mut self) -> Result<(), RegistrationError> {
        self.require_token()?;
        let uuid = self.config.snapshot().tutum_uuid;
        tracing::info!("Registering via PATCH: {}", self.client.node_url(&uuid));

        let cert = credentials::read_certificate(&self.paths.cert_file())?;
        let patch = CertificatePatch::new(cert);
        let client = &self.client;
        let record = self
            .retry
            .run(
                "Registration PATCH",
                || client.update_node(&uuid, &patch),
                ClientError::is_identity_rejection,
            )
            .await
            .map_err(|source| RegistrationError::InvalidIdentity {
                uuid: uuid.clone(),
                source,
            })?;

        self.apply_record(&record).await;
        Ok(())
    }

    /// Merge a node record into the identity
    ///
    /// The CA bundle is always rewritten. The config is persisted only when
    /// the UUID or the common name changed; returns whether it was.
    pub async fn apply_record(&mut self, record: &NodeRecord) -> bool {
        let ca_file = self.paths.ca_file();
        if let Err(e) = credentials::write_ca(&ca_file, &record.user_ca_cert) {
            tracing::warn!("Failed to save {:?}: {}", ca_file, e);
        }

        let modified = self.config.update(|config| {
            let mut modified = false;
            if config.cert_common_name != record.external_fqdn {
                tracing::info!(
                    "Cert CommonName has been changed from {} to {}",
                    config.cert_common_name,
                    record.external_fqdn
                );
                config.cert_common_name.clone_from(&record.external_fqdn);
                modified = true;
            }
            if config.tutum_uuid != record.uuid {
                tracing::info!(
                    "Node UUID has been changed from {} to {}",
                    config.tutum_uuid,
                    record.uuid
                );
                config.tutum_uuid.clone_from(&record.uuid);
                modified = true;
            }
            modified
        });

        self.endpoints.merge(record);

        if modified {
            tracing::info!("Updating configuration file...");
            self.persist().await;
        }
        modified
    }

    /// Write the current configuration, retrying until the store accepts it
    async fn persist(&self) {
        let snapshot = self.config.snapshot();
        let (store, snapshot) = (&self.store, &snapshot);
        self.retry
            .run_forever("Saving configuration", || async move { store.save(snapshot) })
            .await
    }

    /// Check the node state in the background
    ///
    /// The outcome is only logged; a node that never reaches the deployed
    /// state does not affect the rest of the agent.
    pub fn spawn_verification(&self) -> JoinHandle<VerificationOutcome> {
        let client = self.client.clone();
        let uuid = self.config.snapshot().tutum_uuid;
        let interval = self.verify_retry_interval;
        tokio::spawn(async move { verify(&client, &uuid, interval).await })
    }
}

/// Query the node state, retrying exactly once after `interval`
pub async fn verify(client: &ControlPlaneClient, uuid: &str, interval: Duration) -> VerificationOutcome {
    tracing::info!("Verifying the registration...");
    for attempt in 0..2 {
        if attempt > 0 {
            tokio::time::sleep(interval).await;
        }
        match client.get_node(uuid).await {
            Ok(status) if status.is_deployed() => {
                tracing::info!("Node {} is verified as deployed", uuid);
                return VerificationOutcome::Verified;
            }
            Ok(status) => {
                tracing::info!("Node {} is in state {:?}, not yet deployed", uuid, status.state);
            }
            Err(e) => tracing::warn!("Verification request failed: {}", e),
        }
    }
    tracing::warn!("Cannot verify the registration of node {}", uuid);
    VerificationOutcome::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingStore {
        saved: Mutex<Vec<AgentConfig>>,
    }

    impl IdentityStore for CountingStore {
        fn save(&self, config: &AgentConfig) -> Result<(), ConfigError> {
            self.saved.lock().unwrap().push(config.clone());
            Ok(())
        }
    }

    /// Refuses the first `failures` saves like a full disk would
    struct FlakyStore {
        failures: AtomicUsize,
        attempts: AtomicUsize,
        saved: Mutex<Option<AgentConfig>>,
    }

    impl IdentityStore for FlakyStore {
        fn save(&self, config: &AgentConfig) -> Result<(), ConfigError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ConfigError::Invalid("No space left on device".into()));
            }
            *self.saved.lock().unwrap() = Some(config.clone());
            Ok(())
        }
    }

    fn engine(dir: &TempDir, store: Arc<dyn IdentityStore>) -> RegistrationEngine {
        let paths = AgentPaths::under(dir.path());
        paths.create_dirs().unwrap();
        let config = SharedConfig::new(AgentConfig {
            tutum_token: "token".into(),
            docker_host: String::new(),
            ..AgentConfig::default()
        });
        let client = ControlPlaneClient::new(reqwest::Client::new(), "http://127.0.0.1:1/", "token");
        RegistrationEngine::new(client, config, store, paths, RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_apply_record_fresh_node() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CountingStore::default());
        let mut engine = engine(&dir, store.clone());

        let record = NodeRecord {
            uuid: "abc".into(),
            external_fqdn: "host.example.com".into(),
            docker_url: "https://x/def.json".into(),
            ..NodeRecord::default()
        };
        assert!(engine.apply_record(&record).await);

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].tutum_uuid, "abc");
        assert_eq!(saved[0].cert_common_name, "host.example.com");
        assert_eq!(engine.endpoints().docker_binary_url, "https://x/def.json");
    }

    #[tokio::test]
    async fn test_apply_record_twice_persists_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CountingStore::default());
        let mut engine = engine(&dir, store.clone());

        let record = NodeRecord {
            uuid: "abc".into(),
            external_fqdn: "host.example.com".into(),
            user_ca_cert: "CA".into(),
            ..NodeRecord::default()
        };
        assert!(engine.apply_record(&record).await);
        assert!(!engine.apply_record(&record).await);
        assert_eq!(store.saved.lock().unwrap().len(), 1);
        assert_eq!(
            std::fs::read_to_string(engine.paths.ca_file()).unwrap(),
            "CA"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_is_retried() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FlakyStore {
            failures: AtomicUsize::new(2),
            attempts: AtomicUsize::new(0),
            saved: Mutex::new(None),
        });
        let mut engine = engine(&dir, store.clone());

        let record = NodeRecord {
            uuid: "abc".into(),
            external_fqdn: "host.example.com".into(),
            ..NodeRecord::default()
        };
        assert!(engine.apply_record(&record).await);

        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.as_ref().map(|c| c.tutum_uuid.as_str()), Some("abc"));
    }

    #[test]
    fn test_empty_urls_keep_previous_values() {
        let mut endpoints = NodeEndpoints::default();
        endpoints.merge(&NodeRecord {
            ngrok_url: "https://x/ngrok.json".into(),
            ..NodeRecord::default()
        });
        assert_eq!(endpoints.docker_binary_url, DEFAULT_DOCKER_BINARY_URL);
        assert_eq!(endpoints.ngrok_binary_url, "https://x/ngrok.json");
    }

    #[tokio::test]
    async fn test_missing_token_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CountingStore::default());
        let mut engine = engine(&dir, store);
        engine.config.update(|c| c.tutum_token.clear());

        assert!(matches!(
            engine.register().await,
            Err(RegistrationError::MissingToken)
        ));
    }
}
