//! Upstream connections
//!
//! Opens the proxy → origin leg: DNS lookup, TCP connect across every
//! resolved address with a timeout, then a verified TLS handshake for https
//! origins. Request and response bytes are relayed by the session; nothing
//! here rewrites them.

use crate::filter::Scheme;
use crate::mitm::http_parser::RequestHead;
use crate::mitm::tls_config::{SniUtils, TlsConfigError, UpstreamTlsConfig};
use http::Uri;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Invalid authority '{0}'")]
    InvalidAuthority(String),

    #[error("DNS lookup for {host} failed: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("No address for {0}")]
    NoAddress(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connect to {addr} failed: {source}")]
    ConnectFailed { addr: SocketAddr, source: io::Error },

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error(transparent)]
    TlsConfig(#[from] TlsConfigError),
}

/// Split `host:port`, accepting bracketed IPv6 and a missing port
pub fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16), String> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    // [v6] or [v6]:port
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("Unterminated IPv6 literal in '{}'", authority))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => default_port,
            None => return Err(format!("Unexpected characters after IPv6 literal: '{}'", tail)),
        };
        return Ok((format!("[{}]", host), port));
    }

    match authority.rsplit_once(':') {
        // Bare IPv6 without brackets has several colons; treat it as host only
        Some((host, _)) if host.contains(':') => Ok((authority.to_string(), default_port)),
        Some((host, port)) => {
            if host.is_empty() {
                return Err("Host cannot be empty".to_string());
            }
            Ok((host.to_string(), parse_port(port)?))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

fn parse_port(port: &str) -> Result<u16, String> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!(
            "Invalid port '{}': must be a number between 1 and 65535",
            port
        )),
        Ok(port) => Ok(port),
    }
}

/// Where a request is sent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Resolve the origin of a request
    ///
    /// Absolute-form URIs name their own origin. Otherwise the session
    /// authority (CONNECT target or SNI) is used, then the `Host` header.
    pub fn for_request(
        head: &RequestHead,
        scheme: Scheme,
        session_authority: Option<&str>,
    ) -> Result<Self, UpstreamError> {
        if let Ok(uri) = head.uri.parse::<Uri>() {
            if let (Some(uri_scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) {
                let scheme = match uri_scheme {
                    s if s.eq_ignore_ascii_case("https") => Scheme::Https,
                    s if s.eq_ignore_ascii_case("http") => Scheme::Http,
                    other => return Err(UpstreamError::InvalidAuthority(other.to_string())),
                };
                let (host, port) = parse_authority(authority.as_str(), scheme.default_port())
                    .map_err(UpstreamError::InvalidAuthority)?;
                return Ok(Self::new(scheme, host, port));
            }
        }

        let authority = session_authority
            .or_else(|| head.host())
            .ok_or_else(|| UpstreamError::InvalidAuthority("<missing>".to_string()))?;
        let (host, port) = parse_authority(authority, scheme.default_port())
            .map_err(UpstreamError::InvalidAuthority)?;

        Ok(Self::new(scheme, host, port))
    }

    /// Host without IPv6 brackets, for DNS and SNI
    pub fn bare_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host)
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Plain or TLS connection to an origin
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens origin connections
#[derive(Clone)]
pub struct UpstreamConnector {
    tls: UpstreamTlsConfig,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(tls: UpstreamTlsConfig, connect_timeout: Duration) -> Self {
        Self {
            tls,
            connect_timeout,
        }
    }

    /// Connect (and for https, handshake) within the connect timeout
    pub async fn connect(&self, target: &UpstreamTarget) -> Result<UpstreamStream, UpstreamError> {
        timeout(self.connect_timeout, self.connect_inner(target))
            .await
            .map_err(|_| UpstreamError::ConnectionTimeout)?
    }

    async fn connect_inner(&self, target: &UpstreamTarget) -> Result<UpstreamStream, UpstreamError> {
        let stream = self.connect_tcp(target).await?;

        match target.scheme {
            Scheme::Http => Ok(UpstreamStream::Plain(stream)),
            Scheme::Https => {
                let server_name = SniUtils::parse_server_name(target.bare_host())?;
                let connector = TlsConnector::from(self.tls.client_config());

                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| UpstreamError::TlsError(e.to_string()))?;

                Ok(UpstreamStream::Tls(Box::new(tls_stream)))
            }
        }
    }

    /// Try each resolved address until one accepts
    async fn connect_tcp(&self, target: &UpstreamTarget) -> Result<TcpStream, UpstreamError> {
        let host = target.bare_host();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, target.port))
            .await
            .map_err(|source| UpstreamError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();

        let mut last_error = None;

        for (idx, addr) in addrs.iter().enumerate() {
            debug!(upstream = %target, addr = %addr, attempt = idx + 1, "Connecting upstream");

            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(source) => {
                    warn!(upstream = %target, addr = %addr, error = %source, "Upstream address failed");
                    last_error = Some(UpstreamError::ConnectFailed {
                        addr: *addr,
                        source,
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| UpstreamError::NoAddress(target.host.clone())))
    }
}
