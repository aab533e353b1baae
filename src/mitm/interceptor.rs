//! MITM Interceptor - client-facing TLS termination
//!
//! The interception flow:
//! 1. Read the ClientHello without committing to a certificate
//! 2. Pick the host from SNI (or the CONNECT target when SNI is absent)
//! 3. Issue or reuse a leaf for that host and finish the handshake
//!
//! The decrypted stream is handed back to the session, which frames and
//! filters it like plaintext HTTP.

use crate::mitm::certificate_authority::{CertificateAuthority, MitmError};
use crate::mitm::tls_config::{ClientTlsConfig, TlsConfigError};
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

/// First byte of a TLS handshake record
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Interception errors
#[derive(Debug, Error)]
pub enum InterceptionError {
    #[error("MITM error: {0}")]
    MitmError(#[from] MitmError),

    #[error("TLS config error: {0}")]
    TlsConfig(#[from] TlsConfigError),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("ClientHello carries no SNI and no fallback host is known")]
    MissingServerName,

    #[error("TLS handshake timed out")]
    HandshakeTimeout,
}

/// A terminated client connection
pub struct Intercepted<IO> {
    pub stream: TlsStream<IO>,

    /// Host the leaf certificate was issued for
    pub server_name: String,

    /// Whether `server_name` came from SNI rather than the fallback
    pub from_sni: bool,
}

/// MITM Interceptor
pub struct MitmInterceptor {
    /// Certificate authority for issuing leaves
    ca: Arc<CertificateAuthority>,

    handshake_timeout: Option<Duration>,
}

impl MitmInterceptor {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            handshake_timeout: None,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = Some(handshake_timeout);
        self
    }

    pub fn certificate_authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Terminate TLS on `io`
    ///
    /// `fallback_host` is used when the ClientHello has no SNI (CONNECT to an
    /// IP address, for example). Any failure leaves the client without a
    /// completed handshake; there is no plaintext fallback.
    pub async fn accept<IO>(
        &self,
        io: IO,
        fallback_host: Option<&str>,
    ) -> Result<Intercepted<IO>, InterceptionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = self.handshake(io, fallback_host);

        match self.handshake_timeout {
            Some(limit) => timeout(limit, handshake)
                .await
                .map_err(|_| InterceptionError::HandshakeTimeout)?,
            None => handshake.await,
        }
    }

    async fn handshake<IO>(
        &self,
        io: IO,
        fallback_host: Option<&str>,
    ) -> Result<Intercepted<IO>, InterceptionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), io)
            .await
            .map_err(|e| InterceptionError::TlsHandshakeFailed(e.to_string()))?;

        let sni = start.client_hello().server_name().map(str::to_string);
        let from_sni = sni.is_some();
        let server_name = sni
            .or_else(|| fallback_host.map(str::to_string))
            .ok_or(InterceptionError::MissingServerName)?;

        debug!(server_name = %server_name, from_sni = from_sni, "ClientHello received");

        let cert = self.ca.certificate_for(&server_name).await?;
        let config = ClientTlsConfig::from_issued(&cert)?;

        let stream = start
            .into_stream(config.server_config())
            .await
            .map_err(|e| {
                warn!(server_name = %server_name, error = %e, "Client TLS handshake failed");
                InterceptionError::TlsHandshakeFailed(e.to_string())
            })?;

        Ok(Intercepted {
            stream,
            server_name,
            from_sni,
        })
    }
}

/// Stream that replays already-read bytes before reading from `inner`
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: BytesMut,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: BytesMut, inner: S) -> Self {
        Self { prefix, inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::ca_key_manager::CaKeyManager;
    use crate::mitm::tls_config::{SniUtils, UpstreamTlsConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    fn interceptor() -> (MitmInterceptor, UpstreamTlsConfig) {
        let root = Arc::new(CaKeyManager::generate("Interceptor Test Root").unwrap());
        let trust = UpstreamTlsConfig::with_extra_roots(vec![root.certificate_der().clone()])
            .unwrap();
        let ca = Arc::new(CertificateAuthority::new(root, 16));
        (
            MitmInterceptor::new(ca).with_handshake_timeout(Duration::from_secs(5)),
            trust,
        )
    }

    #[tokio::test]
    async fn test_prefixed_stream_replays_prefix() {
        let inner: &[u8] = b" world";
        let mut stream = PrefixedStream::new(BytesMut::from(&b"hello"[..]), inner);

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_accept_uses_sni() {
        let (interceptor, trust) = interceptor();
        let (client_io, proxy_io) = tokio::io::duplex(16 * 1024);

        let client = tokio::spawn(async move {
            let connector = TlsConnector::from(trust.client_config());
            let name = SniUtils::parse_server_name("intercepted.test").unwrap();
            let mut tls = connector.connect(name, client_io).await.unwrap();
            tls.write_all(b"ping").await.unwrap();
            tls.flush().await.unwrap();
            tls
        });

        let mut intercepted = interceptor.accept(proxy_io, Some("fallback.test")).await.unwrap();
        assert_eq!(intercepted.server_name, "intercepted.test");
        assert!(intercepted.from_sni);

        let mut buf = [0u8; 4];
        intercepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_accept_falls_back_without_sni() {
        let (interceptor, trust) = interceptor();
        let (client_io, proxy_io) = tokio::io::duplex(16 * 1024);

        // IP server names are never sent as SNI
        let client = tokio::spawn(async move {
            let connector = TlsConnector::from(trust.client_config());
            let name = SniUtils::parse_server_name("127.0.0.1").unwrap();
            connector.connect(name, client_io).await.map(|_| ())
        });

        let intercepted = interceptor.accept(proxy_io, Some("127.0.0.1")).await.unwrap();
        assert_eq!(intercepted.server_name, "127.0.0.1");
        assert!(!intercepted.from_sni);

        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_sni_without_fallback_fails() {
        let (interceptor, trust) = interceptor();
        let (client_io, proxy_io) = tokio::io::duplex(16 * 1024);

        let client = tokio::spawn(async move {
            let connector = TlsConnector::from(trust.client_config());
            let name = SniUtils::parse_server_name("10.1.2.3").unwrap();
            connector.connect(name, client_io).await.is_err()
        });

        let result = interceptor.accept(proxy_io, None).await;
        assert!(matches!(result, Err(InterceptionError::MissingServerName)));

        drop(result);
        assert!(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_non_tls_bytes_fail_handshake() {
        let (interceptor, _) = interceptor();
        let (mut client_io, proxy_io) = tokio::io::duplex(1024);

        client_io
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let result = interceptor.accept(proxy_io, Some("x")).await;
        assert!(matches!(
            result,
            Err(InterceptionError::TlsHandshakeFailed(_))
        ));
    }
}
