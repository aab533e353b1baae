//! Certificate Authority - per-host leaf certificates for interception
//!
//! Leaves are signed by the root held in `CaKeyManager`, cached per host
//! (LRU with TTL) and reused. DNS and IP SANs are supported.

use crate::mitm::ca_key_manager::CaKeyManager;
use lru::LruCache;
use rcgen::{
    Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose,
    SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_CACHE_SIZE: usize = 1000;
const DEFAULT_CERT_TTL: Duration = Duration::from_secs(86400);
const LEAF_VALIDITY_DAYS: i64 = 90;

/// Host identifier for certificate generation
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com)
    Domain(String),

    /// Wildcard domain (e.g., *.example.com)
    Wildcard(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    /// Parse from hostname string
    ///
    /// Accepts bracketed IPv6 literals and a trailing root dot; domains are
    /// lowercased so case variants share one certificate.
    pub fn from_hostname(hostname: &str) -> Result<Self, MitmError> {
        let trimmed = hostname.trim();
        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(trimmed);

        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return Ok(Self::IpAddress(ip));
        }

        let domain = trimmed.trim_end_matches('.').to_lowercase();
        if domain.is_empty()
            || domain
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '/' | ':' | '@' | '[' | ']'))
        {
            return Err(MitmError::InvalidHostname(hostname.to_string()));
        }

        if domain.starts_with("*.") {
            return Ok(Self::Wildcard(domain));
        }

        Ok(Self::Domain(domain))
    }
}

impl fmt::Display for HostIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(name) | Self::Wildcard(name) => f.write_str(name),
            Self::IpAddress(ip) => write!(f, "{}", ip),
        }
    }
}

/// Leaf certificate plus key, ready for a rustls server config
pub struct IssuedCertificate {
    host: HostIdentifier,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
    root_der: CertificateDer<'static>,
}

impl IssuedCertificate {
    pub fn host(&self) -> &HostIdentifier {
        &self.host
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Leaf followed by the root that signed it
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone(), self.root_der.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("host", &self.host)
            .field("cert_der_len", &self.cert_der.len())
            .field("private_key", &"<REDACTED>")
            .finish()
    }
}

/// Cached certificate with TTL
#[derive(Clone)]
struct CachedCertificate {
    cert: Arc<IssuedCertificate>,

    /// When this certificate was created/cached
    created_at: Instant,
}

impl CachedCertificate {
    fn new(cert: Arc<IssuedCertificate>) -> Self {
        Self {
            cert,
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// MITM-specific errors
#[derive(Debug, Error)]
pub enum MitmError {
    #[error("Certificate generation failed: {0}")]
    CertGenerationFailed(String),

    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),
}

/// Certificate Authority - generates and caches certificates
pub struct CertificateAuthority {
    ca_manager: Arc<CaKeyManager>,

    /// LRU cache for generated certificates (host -> cert)
    cache: Arc<Mutex<LruCache<HostIdentifier, CachedCertificate>>>,

    max_cache_size: usize,

    cert_ttl: Duration,
}

impl CertificateAuthority {
    /// Create new Certificate Authority with default TTL (24 hours)
    pub fn new(ca_manager: Arc<CaKeyManager>, max_cache_size: usize) -> Self {
        Self::with_ttl(ca_manager, max_cache_size, DEFAULT_CERT_TTL)
    }

    /// Create new Certificate Authority with custom TTL
    pub fn with_ttl(
        ca_manager: Arc<CaKeyManager>,
        max_cache_size: usize,
        cert_ttl: Duration,
    ) -> Self {
        let cache_size = NonZeroUsize::new(max_cache_size)
            .or(NonZeroUsize::new(DEFAULT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            ca_manager,
            cache: Arc::new(Mutex::new(LruCache::new(cache_size))),
            max_cache_size: cache_size.get(),
            cert_ttl,
        }
    }

    pub fn ca_manager(&self) -> &Arc<CaKeyManager> {
        &self.ca_manager
    }

    /// Get or generate certificate for host
    ///
    /// The cache lock is held while generating, so concurrent handshakes for
    /// one host always end up with the same certificate.
    pub async fn get_or_generate(
        &self,
        host: HostIdentifier,
    ) -> Result<Arc<IssuedCertificate>, MitmError> {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.get(&host) {
            if cached.is_expired(self.cert_ttl) {
                debug!(host = %host, "Certificate cache hit but expired, regenerating");
                cache.pop(&host);
            } else {
                debug!(host = %host, "Certificate cache hit");
                return Ok(Arc::clone(&cached.cert));
            }
        }

        debug!(host = %host, "Generating new certificate");
        let cert = Arc::new(self.generate_certificate(&host)?);
        cache.put(host, CachedCertificate::new(Arc::clone(&cert)));

        Ok(cert)
    }

    /// Convenience wrapper over `get_or_generate` for a raw hostname
    pub async fn certificate_for(&self, hostname: &str) -> Result<Arc<IssuedCertificate>, MitmError> {
        self.get_or_generate(HostIdentifier::from_hostname(hostname)?)
            .await
    }

    fn generate_certificate(&self, host: &HostIdentifier) -> Result<IssuedCertificate, MitmError> {
        let mut params = CertificateParams::default();

        match host {
            HostIdentifier::Domain(name) | HostIdentifier::Wildcard(name) => {
                params
                    .distinguished_name
                    .push(DnType::CommonName, name.clone());
                params.subject_alt_names = vec![SanType::DnsName(name.clone())];
            }
            HostIdentifier::IpAddress(ip) => {
                params
                    .distinguished_name
                    .push(DnType::CommonName, ip.to_string());
                params.subject_alt_names = vec![SanType::IpAddress(*ip)];
            }
        }

        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after =
            time::OffsetDateTime::now_utc() + time::Duration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(generate_serial_number().into());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.key_pair = Some(
            KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
                .map_err(|e| MitmError::CertGenerationFailed(e.to_string()))?,
        );

        let leaf = Certificate::from_params(params)
            .map_err(|e| MitmError::CertGenerationFailed(e.to_string()))?;

        let ca_cert = self.ca_manager.certificate();
        let cert_der = leaf
            .serialize_der_with_signer(&ca_cert)
            .map_err(|e| MitmError::CertGenerationFailed(e.to_string()))?;

        Ok(IssuedCertificate {
            host: host.clone(),
            cert_der: CertificateDer::from(cert_der),
            key_der: PrivatePkcs8KeyDer::from(leaf.serialize_private_key_der()),
            root_der: self.ca_manager.certificate_der().clone(),
        })
    }

    /// Get cache statistics: (entries, capacity)
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.lock().await;
        (cache.len(), self.max_cache_size)
    }

    /// Clear cache (for testing or rotation)
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.lock().await;
        cache.clear();
    }
}

/// Unique serial number: timestamp in the high half, crypto RNG in the low
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;

    ((timestamp_part as u64) << 32) | (random_part as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> CertificateAuthority {
        let ca = CaKeyManager::generate("Unit Test Root").unwrap();
        CertificateAuthority::new(Arc::new(ca), 8)
    }

    #[test]
    fn test_host_identifier_parsing() {
        assert_eq!(
            HostIdentifier::from_hostname("Example.COM.").unwrap(),
            HostIdentifier::Domain("example.com".to_string())
        );
        assert!(matches!(
            HostIdentifier::from_hostname("192.168.1.1").unwrap(),
            HostIdentifier::IpAddress(_)
        ));
        assert!(matches!(
            HostIdentifier::from_hostname("[::1]").unwrap(),
            HostIdentifier::IpAddress(_)
        ));
        assert!(matches!(
            HostIdentifier::from_hostname("*.example.com").unwrap(),
            HostIdentifier::Wildcard(_)
        ));
        // Loopback is intercepted like any other host
        assert!(matches!(
            HostIdentifier::from_hostname("localhost").unwrap(),
            HostIdentifier::Domain(_)
        ));
    }

    #[test]
    fn test_invalid_hostnames_are_rejected() {
        for bad in ["", "  ", "a b.test", "host:443", "a/b"] {
            assert!(
                matches!(
                    HostIdentifier::from_hostname(bad),
                    Err(MitmError::InvalidHostname(_))
                ),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn test_serial_numbers_differ() {
        let a = generate_serial_number();
        let b = generate_serial_number();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_cache_hit_returns_same_certificate() {
        let ca = authority();

        let first = ca.certificate_for("example.com").await.unwrap();
        let second = ca.certificate_for("EXAMPLE.com").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ca.cache_stats().await, (1, 8));
    }

    #[tokio::test]
    async fn test_distinct_hosts_get_distinct_certificates() {
        let ca = authority();

        let a = ca.certificate_for("a.test").await.unwrap();
        let b = ca.certificate_for("10.0.0.1").await.unwrap();

        assert_ne!(a.cert_der(), b.cert_der());
        assert_eq!(a.cert_chain().len(), 2);
        assert_eq!(&a.cert_chain()[1], ca.ca_manager().certificate_der());
    }

    #[tokio::test]
    async fn test_expired_entry_is_regenerated() {
        let ca = CertificateAuthority::with_ttl(
            Arc::new(CaKeyManager::generate("Root").unwrap()),
            4,
            Duration::from_millis(0),
        );

        let first = ca.certificate_for("ttl.test").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = ca.certificate_for("ttl.test").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let ca = authority();
        ca.certificate_for("example.com").await.unwrap();
        ca.clear_cache().await;
        assert_eq!(ca.cache_stats().await.0, 0);
    }

    #[test]
    fn test_zero_capacity_falls_back_to_default() {
        let ca = CertificateAuthority::new(Arc::new(CaKeyManager::generate("Root").unwrap()), 0);
        assert_eq!(ca.max_cache_size, DEFAULT_CACHE_SIZE);
    }
}
