//! TLS Configuration for interception
//!
//! This module provides TLS configurations for:
//! - Client-facing TLS (proxy ← client) with per-host leaf certificates
//! - Upstream TLS (proxy → origin) with real verification
//!
//! Both sides speak TLS 1.2/1.3 and advertise `http/1.1` only, since the
//! framing layer is HTTP/1.x.

use crate::mitm::certificate_authority::IssuedCertificate;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&TLS12, &TLS13];

const ALPN_HTTP11: &[u8] = b"http/1.1";

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// Client-facing TLS config (proxy acts as server with a forged leaf)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsConfigError> {
        let mut config = ServerConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Server config presenting `cert` chained to its root
    pub fn from_issued(cert: &IssuedCertificate) -> Result<Self, TlsConfigError> {
        debug!(host = %cert.host(), "Building client-facing TLS config");
        Self::new(cert.cert_chain(), cert.private_key())
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS config (proxy acts as client with real verification)
#[derive(Clone)]
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Build client config trusting the Mozilla root bundle
    pub fn new() -> Result<Self, TlsConfigError> {
        Self::with_extra_roots(Vec::new())
    }

    /// Mozilla roots plus additional trust anchors (private PKI, tests)
    pub fn with_extra_roots(
        extra_roots: Vec<CertificateDer<'static>>,
    ) -> Result<Self, TlsConfigError> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

        for root in extra_roots {
            root_store
                .add(root)
                .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;
        }

        let mut config = ClientConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
            .with_root_certificates(root_store)
            .with_no_client_auth();

        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// SNI (Server Name Indication) utilities
pub struct SniUtils;

impl SniUtils {
    /// Parse hostname into ServerName for SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>, TlsConfigError> {
        let unbracketed = hostname
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(hostname);

        ServerName::try_from(unbracketed.to_owned())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}: {}", hostname, e)))
    }

    /// Validate hostname format
    pub fn validate_hostname(hostname: &str) -> bool {
        !hostname.is_empty()
            && !hostname.starts_with('.')
            && !hostname.ends_with('.')
            && hostname.len() <= 253
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::ca_key_manager::CaKeyManager;
    use crate::mitm::certificate_authority::CertificateAuthority;

    #[test]
    fn test_sni_validate_hostname() {
        assert!(SniUtils::validate_hostname("example.com"));
        assert!(SniUtils::validate_hostname("a.b.c.example.com"));

        assert!(!SniUtils::validate_hostname(""));
        assert!(!SniUtils::validate_hostname(".example.com"));
        assert!(!SniUtils::validate_hostname("example.com."));
    }

    #[test]
    fn test_sni_parse_server_name() {
        assert!(SniUtils::parse_server_name("example.com").is_ok());
        assert!(SniUtils::parse_server_name("192.168.1.1").is_ok());
        assert!(SniUtils::parse_server_name("[::1]").is_ok());
        assert!(SniUtils::parse_server_name("").is_err());
    }

    #[test]
    fn test_upstream_tls_config_creation() {
        let config = UpstreamTlsConfig::new().unwrap();
        assert_eq!(
            config.client_config().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_extra_root_is_accepted() {
        let ca = CaKeyManager::generate("Extra Root").unwrap();
        assert!(UpstreamTlsConfig::with_extra_roots(vec![ca.certificate_der().clone()]).is_ok());
    }

    #[tokio::test]
    async fn test_client_config_from_issued_leaf() {
        let ca = CertificateAuthority::new(Arc::new(CaKeyManager::generate("Root").unwrap()), 4);
        let leaf = ca.certificate_for("example.com").await.unwrap();

        let config = ClientTlsConfig::from_issued(&leaf).unwrap();
        assert_eq!(
            config.server_config().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }
}
