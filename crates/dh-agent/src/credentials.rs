//! TLS identity of the node
//!
//! The same self-signed key pair secures the container engine's API and is
//! uploaded to the control plane as the node's certificate.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;

use dh_core::AgentPaths;

/// Organization placed in the certificate subject
pub const CERT_ORGANIZATION: &str = "Dockhand Self-Signed";

/// Certificate lifetime in days
pub const CERT_VALIDITY_DAYS: i64 = 3650;

/// Errors raised while creating or reading TLS material
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("certificate common name is empty")]
    MissingCommonName,

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CredentialError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Whether both the key and the certificate exist
pub fn certificates_exist(key_file: &Path, cert_file: &Path) -> bool {
    key_file.is_file() && cert_file.is_file()
}

/// Subject alternative names for a comma-separated common name
pub fn subject_alt_names(common_name: &str) -> Vec<String> {
    common_name
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

/// PEM-encoded certificate and private key
#[derive(Debug, Clone)]
pub struct GeneratedIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Create a self-signed CA-capable server certificate for `common_name`
pub fn generate_identity(common_name: &str) -> Result<GeneratedIdentity, CredentialError> {
    let names = subject_alt_names(common_name);
    let Some(primary) = names.first().cloned() else {
        return Err(CredentialError::MissingCommonName);
    };

    let mut params = CertificateParams::new(names)?;

    let mut subject = DistinguishedName::new();
    subject.push(
        DnType::OrganizationName,
        DnValue::Utf8String(CERT_ORGANIZATION.to_string()),
    );
    subject.push(DnType::CommonName, DnValue::Utf8String(primary));
    params.distinguished_name = subject;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(GeneratedIdentity {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Generate the key and certificate unless both already exist
///
/// Returns true when new material was written.
pub fn ensure_certificates(
    key_file: &Path,
    cert_file: &Path,
    common_name: &str,
) -> Result<bool, CredentialError> {
    if certificates_exist(key_file, cert_file) {
        tracing::info!("TLS certificate exists, skipping");
        return Ok(false);
    }

    tracing::info!("Generating TLS certificate for {}", common_name);
    let identity = generate_identity(common_name)?;
    write_private(key_file, identity.key_pem.as_bytes())?;
    write_file(cert_file, identity.cert_pem.as_bytes())?;
    Ok(true)
}

/// Read the PEM certificate uploaded to the control plane
pub fn read_certificate(cert_file: &Path) -> Result<String, CredentialError> {
    fs::read_to_string(cert_file).map_err(|e| CredentialError::io(cert_file, e))
}

/// Delete the key, certificate and CA bundle
///
/// Missing files are not an error.
pub fn remove_credentials(paths: &AgentPaths) -> Result<(), CredentialError> {
    for path in [paths.key_file(), paths.cert_file(), paths.ca_file()] {
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed {:?}", path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CredentialError::io(&path, e)),
        }
    }
    Ok(())
}

/// Write the CA bundle the daemon uses to verify clients
pub fn write_ca(ca_file: &Path, pem: &str) -> Result<(), CredentialError> {
    write_file(ca_file, pem.as_bytes())
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), CredentialError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CredentialError::io(parent, e))?;
    }
    fs::write(path, contents).map_err(|e| CredentialError::io(path, e))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<(), CredentialError> {
    use std::os::unix::fs::OpenOptionsExt;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CredentialError::io(parent, e))?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| CredentialError::io(path, e))?;
    file.write_all(contents)
        .map_err(|e| CredentialError::io(path, e))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<(), CredentialError> {
    write_file(path, contents)
}
