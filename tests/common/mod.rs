//! Shared fixtures: an in-process proxy and scripted origin servers

#![allow(dead_code)]

use mitm_whitelist::{
    CaKeyManager, CertificateAuthority, FilterChain, LogRecorder, LoggerHook, MitmInterceptor,
    ProxyServer, SessionTimeouts, UpstreamConnector, UpstreamTlsConfig, Whitelist,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A proxy listening on an ephemeral port
pub struct TestProxy {
    pub addr: SocketAddr,
    pub recorder: Arc<LogRecorder>,
    pub root: Arc<CaKeyManager>,
}

impl TestProxy {
    pub async fn start(whitelist: &[&str]) -> Self {
        Self::start_with_upstream_tls(whitelist, UpstreamTlsConfig::new().unwrap()).await
    }

    pub async fn start_with_upstream_tls(whitelist: &[&str], upstream_tls: UpstreamTlsConfig) -> Self {
        let root = Arc::new(CaKeyManager::generate("Proxy Test Root").unwrap());
        let ca = Arc::new(CertificateAuthority::new(Arc::clone(&root), 64));

        let recorder = Arc::new(LogRecorder::new());
        let logger: Arc<dyn LoggerHook> = recorder.clone();

        let server = ProxyServer::new(
            FilterChain::new(Arc::new(Whitelist::new(whitelist.iter().copied())), logger),
            MitmInterceptor::new(ca).with_handshake_timeout(TEST_TIMEOUT),
            UpstreamConnector::new(upstream_tls, TEST_TIMEOUT),
            SessionTimeouts {
                read: Some(TEST_TIMEOUT),
                idle: Some(TEST_TIMEOUT),
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            addr,
            recorder,
            root,
        }
    }

    /// Client TLS config trusting this proxy's root
    pub fn client_tls(&self) -> UpstreamTlsConfig {
        UpstreamTlsConfig::with_extra_roots(vec![self.root.certificate_der().clone()]).unwrap()
    }
}

/// Origin that answers every connection with one scripted response
pub struct TestOrigin {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub requests: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl TestOrigin {
    pub async fn plain(response: &'static [u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let (tx, requests) = mpsc::unbounded_channel();

        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                tokio::spawn(async move {
                    serve_one(stream, response, tx).await;
                });
            }
        });

        Self {
            addr,
            connections,
            requests,
        }
    }

    /// Origin whose connections are handled by `handler`
    ///
    /// The handler gets the raw socket and the sender behind `next_request`.
    pub async fn custom<F, Fut>(handler: F) -> Self
    where
        F: Fn(TcpStream, mpsc::UnboundedSender<Vec<u8>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let (tx, requests) = mpsc::unbounded_channel();

        let counter = Arc::clone(&connections);
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handler(stream, tx.clone()));
            }
        });

        Self {
            addr,
            connections,
            requests,
        }
    }

    /// TLS origin for `localhost` with a certificate from its own root
    ///
    /// Returns the origin and the root the proxy must trust to reach it.
    pub async fn tls(response: &'static [u8]) -> (Self, UpstreamTlsConfig) {
        let origin_root = Arc::new(CaKeyManager::generate("Origin Test Root").unwrap());
        let trust =
            UpstreamTlsConfig::with_extra_roots(vec![origin_root.certificate_der().clone()])
                .unwrap();
        let issuer = CertificateAuthority::new(origin_root, 4);
        let leaf = issuer.certificate_for("localhost").await.unwrap();
        let acceptor = TlsAcceptor::from(
            mitm_whitelist::ClientTlsConfig::from_issued(&leaf)
                .unwrap()
                .server_config(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let (tx, requests) = mpsc::unbounded_channel();

        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(tls) = acceptor.accept(stream).await {
                        serve_one(tls, response, tx).await;
                    }
                });
            }
        });

        (
            Self {
                addr,
                connections,
                requests,
            },
            trust,
        )
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn next_request(&mut self) -> Vec<u8> {
        tokio::time::timeout(TEST_TIMEOUT, self.requests.recv())
            .await
            .expect("origin saw no request")
            .expect("origin closed")
    }
}

async fn serve_one<S>(mut stream: S, response: &'static [u8], tx: mpsc::UnboundedSender<Vec<u8>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(request) = read_message(&mut stream).await {
        let _ = tx.send(request);
        let _ = stream.write_all(response).await;
        let _ = stream.flush().await;
        let _ = stream.shutdown().await;
    }
}

/// Read one request: head plus a Content-Length or chunked body
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok());
    let chunked = head.contains("transfer-encoding: chunked");

    loop {
        let complete = match (content_length, chunked) {
            (_, true) => buf[head_end..].ends_with(b"0\r\n\r\n"),
            (Some(len), false) => buf.len() >= head_end + len,
            (None, false) => true,
        };
        if complete {
            return Some(buf);
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return Some(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read until EOF with the test timeout
pub async fn read_to_end<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut out))
        .await
        .expect("timed out waiting for EOF")
        .expect("read failed");
    out
}
