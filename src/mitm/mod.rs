//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides TLS interception for the whitelisting proxy.
//! It includes:
//! - Root CA management (generated at startup or loaded from files)
//! - Dynamic leaf certificate generation for intercepted hosts
//! - TLS handshake handling (client and upstream)
//! - Streaming HTTP/1.x framing shared by both legs

pub mod ca_key_manager;
pub mod certificate_authority;
pub mod http_parser;
pub mod interceptor;
pub mod tls_config;

// Re-export main types
pub use ca_key_manager::{
    CaKeyManager, CaSource, FileBackend, PemBackend, SecretBackend, StartupError,
};
pub use certificate_authority::{
    CertificateAuthority, HostIdentifier, IssuedCertificate, MitmError,
};
pub use http_parser::{
    parse_request_head, parse_response_head, BodyKind, BodyObject, ClientObject, HttpObject,
    HttpVersion, MessageHead, MessageStream, ObjectKind, ParseError as HttpParseError,
    RequestHead, ResponseHead, ServerObject,
};
pub use interceptor::{Intercepted, InterceptionError, MitmInterceptor, PrefixedStream};
pub use tls_config::{ClientTlsConfig, SniUtils, TlsConfigError, UpstreamTlsConfig};
