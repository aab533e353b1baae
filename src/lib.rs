//! mitm-whitelist - Whitelisting HTTP(S) Intercepting Proxy
//!
//! A forward proxy that terminates TLS with per-host certificates signed by
//! its own root CA, checks every request target against a whitelist of
//! substrings, and either relays the exchange byte for byte or answers it
//! locally with an empty `200 OK`.
//!
//! ## Features
//!
//! - **Plain HTTP, CONNECT and transparent TLS** on a single listener
//! - **MITM/SSL Interception**: leaf certificates minted on demand and cached
//! - **Whitelist filtering**: case-insensitive substring match on the full target
//! - **Request logging**: one line per request, `[BLOCKED]` marked
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mitm_whitelist::{CaKeyManager, CertificateAuthority, Config, ProxyServer, TracingLogger, Whitelist};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::new(Whitelist::from_csv("example.com,api.internal"));
//!
//!     let root = Arc::new(CaKeyManager::generate("Example Root CA")?);
//!     let ca = Arc::new(CertificateAuthority::new(root, config.cert_cache_size));
//!
//!     let server = ProxyServer::from_config(&config, ca, Arc::new(TracingLogger))?;
//!     let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
//!     server.serve(listener).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `whitelist` - substring whitelist and the allow/block decision
//! - `filter` - per-request filters and the canned block response
//! - `logger` - request/response log lines
//! - `mitm` - CA, leaf issuance, TLS termination, HTTP/1.x framing
//! - `http_client` - upstream connections
//! - `server` - accept loop and per-connection sessions

// Core proxy modules
pub mod config;
pub mod http_client;
pub mod logger;
pub mod server;

// Policy
pub mod filter;
pub mod whitelist;

// MITM
pub mod mitm;

// Re-export commonly used types

/// Configuration types
pub use config::{Config, LogFormat};

/// Policy
pub use filter::{ClientVerdict, Filter, FilterChain, Scheme, BLOCK_RESPONSE};
pub use whitelist::{FilterDecision, Whitelist};

/// Logging hooks
pub use logger::{LogEvent, LogRecorder, LoggerHook, TracingLogger};

/// Upstream connections
pub use http_client::{UpstreamConnector, UpstreamError, UpstreamTarget};

/// Server
pub use server::{ProxyServer, SessionError, SessionTimeouts};

/// MITM types and functionality
pub use mitm::{
    // CA management
    CaKeyManager,
    CaSource,
    // Certificate generation
    CertificateAuthority,
    ClientTlsConfig,
    FileBackend,
    HostIdentifier,
    // Interception
    InterceptionError,
    IssuedCertificate,
    MitmError,
    MitmInterceptor,
    PemBackend,
    SecretBackend,
    StartupError,
    // TLS configuration
    TlsConfigError,
    UpstreamTlsConfig,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "mitm-whitelist");
    }
}
