//! CA Key Manager - root certificate authority for interception
//!
//! The root is either generated at startup or loaded from a secret backend.
//! The private key is only ever held inside the rcgen certificate or a
//! `SecretString`, and never appears in logs or Debug output.

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Validity of a generated root
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Errors that can occur during startup when loading CA
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("CA key missing or inaccessible: {0}")]
    CaKeyMissing(String),

    #[error("CA certificate invalid: {0}")]
    CaCertInvalid(String),

    #[error("Secret backend error: {0}")]
    BackendError(String),

    #[error("CA key format error: {0}")]
    KeyFormatError(String),

    #[error("CA generation failed: {0}")]
    GenerationFailed(String),
}

/// Trait for places the root CA material can be loaded from
#[async_trait::async_trait]
pub trait SecretBackend: Send + Sync {
    /// Load CA private key (PEM)
    async fn load_ca_key(&self) -> Result<SecretString, StartupError>;

    /// Load CA certificate (PEM)
    async fn load_ca_cert(&self) -> Result<String, StartupError>;

    /// Health check for backend reachability
    async fn health_check(&self) -> Result<(), StartupError> {
        Ok(())
    }

    /// Short description for logs
    fn describe(&self) -> String;
}

/// PEM files on local disk
#[derive(Debug, Clone)]
pub struct FileBackend {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl FileBackend {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

#[async_trait::async_trait]
impl SecretBackend for FileBackend {
    async fn load_ca_key(&self) -> Result<SecretString, StartupError> {
        info!(path = ?self.key_path, "Loading CA key from file");

        let key_pem = tokio::fs::read_to_string(&self.key_path)
            .await
            .map_err(|e| {
                StartupError::CaKeyMissing(format!("{}: {}", self.key_path.display(), e))
            })?;

        Ok(SecretString::new(key_pem))
    }

    async fn load_ca_cert(&self) -> Result<String, StartupError> {
        info!(path = ?self.cert_path, "Loading CA certificate from file");

        tokio::fs::read_to_string(&self.cert_path)
            .await
            .map_err(|e| {
                StartupError::CaCertInvalid(format!("{}: {}", self.cert_path.display(), e))
            })
    }

    async fn health_check(&self) -> Result<(), StartupError> {
        for path in [&self.cert_path, &self.key_path] {
            if !path.is_file() {
                return Err(StartupError::BackendError(format!(
                    "{} is not a readable file",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.cert_path.display())
    }
}

/// PEM material already in memory (embedding, tests)
pub struct PemBackend {
    cert_pem: String,
    key_pem: SecretString,
}

impl PemBackend {
    pub fn new(cert_pem: String, key_pem: SecretString) -> Self {
        Self { cert_pem, key_pem }
    }
}

#[async_trait::async_trait]
impl SecretBackend for PemBackend {
    async fn load_ca_key(&self) -> Result<SecretString, StartupError> {
        Ok(SecretString::new(self.key_pem.expose_secret().clone()))
    }

    async fn load_ca_cert(&self) -> Result<String, StartupError> {
        Ok(self.cert_pem.clone())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Where the root came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaSource {
    Generated,
    Backend(String),
}

/// CA Key Manager - owns the root certificate and its signing key
pub struct CaKeyManager {
    /// Signing certificate; holds the CA key pair (never logged)
    certificate: Arc<Certificate>,

    /// Root exactly as clients must trust it
    cert_pem: String,
    cert_der: CertificateDer<'static>,

    source: CaSource,
}

impl CaKeyManager {
    /// Generate a fresh ECDSA P-256 root
    pub fn generate(common_name: &str) -> Result<Self, StartupError> {
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name.to_string());
        distinguished_name.push(DnType::OrganizationName, common_name.to_string());

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after =
            time::OffsetDateTime::now_utc() + time::Duration::days(ROOT_VALIDITY_DAYS);
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.key_pair = Some(
            KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
                .map_err(|e| StartupError::GenerationFailed(e.to_string()))?,
        );

        let certificate = Certificate::from_params(params)
            .map_err(|e| StartupError::GenerationFailed(e.to_string()))?;

        // rcgen re-signs on every serialization; pin one encoding
        let cert_pem = certificate
            .serialize_pem()
            .map_err(|e| StartupError::GenerationFailed(e.to_string()))?;
        let cert_der = pem_to_der(&cert_pem)?;

        info!(common_name = %common_name, "Generated ephemeral root CA");

        Ok(Self {
            certificate: Arc::new(certificate),
            cert_pem,
            cert_der,
            source: CaSource::Generated,
        })
    }

    /// Load CA from backend or fail fast
    ///
    /// If the CA key is missing or invalid, the proxy must not start.
    pub async fn load_or_fail(backend: Arc<dyn SecretBackend>) -> Result<Self, StartupError> {
        let source = backend.describe();
        info!(backend = %source, "Loading CA from backend");

        backend.health_check().await.map_err(|e| {
            StartupError::BackendError(format!("Backend health check failed: {}", e))
        })?;

        let key_pem = backend.load_ca_key().await?;
        let cert_pem = backend.load_ca_cert().await?;

        Self::validate_ca_certificate(&cert_pem)?;

        let key_pair = KeyPair::from_pem(key_pem.expose_secret())
            .map_err(|e| StartupError::KeyFormatError(e.to_string()))?;

        let cert_params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| StartupError::CaCertInvalid(e.to_string()))?;

        let certificate = Certificate::from_params(cert_params)
            .map_err(|e| StartupError::CaCertInvalid(e.to_string()))?;

        let cert_der = pem_to_der(&cert_pem)?;

        info!(backend = %source, "CA key loaded and validated successfully");

        Ok(Self {
            certificate: Arc::new(certificate),
            cert_pem,
            cert_der,
            source: CaSource::Backend(source),
        })
    }

    /// Signing certificate for leaf issuance
    pub fn certificate(&self) -> Arc<Certificate> {
        Arc::clone(&self.certificate)
    }

    /// Root certificate in DER, as sent at the end of leaf chains
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn source(&self) -> &CaSource {
        &self.source
    }

    /// Export CA certificate in PEM format (for trust distribution)
    ///
    /// The private key is never exported.
    pub fn export_ca_certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Export CA certificate to file
    ///
    /// This is the certificate that should be installed on client systems.
    pub fn export_ca_certificate_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), &self.cert_pem)
            .with_context(|| format!("Failed to write CA certificate to {:?}", path.as_ref()))?;

        info!(path = ?path.as_ref(), "CA certificate exported");

        Ok(())
    }

    /// Validate CA certificate properties
    pub fn validate_ca_certificate(cert_pem: &str) -> Result<(), StartupError> {
        use x509_parser::prelude::*;

        let (_, pem_data) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| StartupError::CaCertInvalid(format!("PEM parse failed: {}", e)))?;

        let (_, cert) = X509Certificate::from_der(&pem_data.contents)
            .map_err(|e| StartupError::CaCertInvalid(format!("X.509 parse failed: {}", e)))?;

        // 1. basicConstraints
        if let Some(basic_constraints) = cert.basic_constraints().map_err(|e| {
            StartupError::CaCertInvalid(format!("Failed to read basicConstraints: {}", e))
        })? {
            if !basic_constraints.value.ca {
                return Err(StartupError::CaCertInvalid(
                    "Certificate is not a CA (basicConstraints.ca = false)".to_string(),
                ));
            }
        } else {
            warn!("CA certificate missing basicConstraints extension");
        }

        // 2. keyUsage
        if let Some(key_usage) = cert
            .key_usage()
            .map_err(|e| StartupError::CaCertInvalid(format!("Failed to read keyUsage: {}", e)))?
        {
            if !key_usage.value.key_cert_sign() {
                return Err(StartupError::CaCertInvalid(
                    "Certificate missing keyCertSign usage (required for CA)".to_string(),
                ));
            }
        } else {
            warn!("CA certificate missing keyUsage extension");
        }

        // 3. validity window
        let current = chrono::Utc::now().timestamp();

        if current < cert.validity().not_before.timestamp() {
            return Err(StartupError::CaCertInvalid(format!(
                "Certificate not yet valid (notBefore: {})",
                cert.validity().not_before
            )));
        }

        if current > cert.validity().not_after.timestamp() {
            return Err(StartupError::CaCertInvalid(format!(
                "Certificate expired (notAfter: {})",
                cert.validity().not_after
            )));
        }

        info!(
            subject = %cert.subject(),
            not_after = %cert.validity().not_after,
            "CA certificate validated"
        );

        Ok(())
    }
}

fn pem_to_der(cert_pem: &str) -> Result<CertificateDer<'static>, StartupError> {
    rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .next()
        .ok_or_else(|| StartupError::CaCertInvalid("no certificate in PEM".to_string()))?
        .map_err(|e| StartupError::CaCertInvalid(format!("PEM decode failed: {}", e)))
}

// Ensure the key never leaks through Debug output
impl std::fmt::Debug for CaKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaKeyManager")
            .field("source", &self.source)
            .field("key_pair", &"<REDACTED>")
            .field("certificate", &"<present>")
            .finish()
    }
}
