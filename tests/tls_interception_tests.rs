//! TLS Interception Tests
//!
//! CONNECT tunnels and transparent TLS through a running proxy. Clients
//! trust the proxy's root; the proxy trusts the test origin's root.

mod common;

use common::{TestOrigin, TestProxy, TEST_TIMEOUT};
use mitm_whitelist::mitm::SniUtils;
use mitm_whitelist::BLOCK_RESPONSE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use x509_parser::extensions::GeneralName;

const CONNECT_OK: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

const ORIGIN_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecret";

async fn read_exactly<S: AsyncRead + Unpin>(stream: &mut S, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out")
        .expect("read failed");
    buf
}

/// Open a CONNECT tunnel and complete TLS inside it
async fn connect_tunnel(proxy: &TestProxy, authority: &str, sni: &str) -> TlsStream<TcpStream> {
    let mut tcp = TcpStream::connect(proxy.addr).await.unwrap();
    let connect = format!("CONNECT {a} HTTP/1.1\r\nHost: {a}\r\n\r\n", a = authority);
    tcp.write_all(connect.as_bytes()).await.unwrap();
    assert_eq!(read_exactly(&mut tcp, CONNECT_OK.len()).await, CONNECT_OK);

    tls_handshake(proxy, tcp, sni).await
}

async fn tls_handshake<IO>(proxy: &TestProxy, io: IO, sni: &str) -> TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let connector = TlsConnector::from(proxy.client_tls().client_config());
    tokio::time::timeout(
        TEST_TIMEOUT,
        connector.connect(SniUtils::parse_server_name(sni).unwrap(), io),
    )
    .await
    .expect("handshake timed out")
    .expect("client should trust the proxy root")
}

// ============================================================================
// Blocked HTTPS
// ============================================================================

#[tokio::test]
async fn test_connect_tunnel_blocked_request_gets_canned_response() {
    let proxy = TestProxy::start(&["allowed.example"]).await;

    let mut tls = connect_tunnel(&proxy, "denied.example:443", "denied.example").await;
    tls.write_all(b"GET /account HTTP/1.1\r\nHost: denied.example\r\n\r\n")
        .await
        .unwrap();
    tls.flush().await.unwrap();

    assert_eq!(read_exactly(&mut tls, BLOCK_RESPONSE.len()).await, BLOCK_RESPONSE);

    let lines = proxy.recorder.request_lines();
    assert_eq!(lines.len(), 1);
    assert!(
        lines[0].starts_with("[BLOCKED] GET->https://denied.example/account HEADERS->"),
        "{}",
        lines[0]
    );
}

#[tokio::test]
async fn test_leaf_certificate_matches_requested_host() {
    let proxy = TestProxy::start(&[]).await;

    let tls = connect_tunnel(&proxy, "shop.example:443", "shop.example").await;
    let (_, session) = tls.get_ref();
    let chain = session.peer_certificates().expect("server sent certificates");

    let (_, leaf) = x509_parser::parse_x509_certificate(chain[0].as_ref()).unwrap();
    let (_, root) = x509_parser::parse_x509_certificate(proxy.root.certificate_der().as_ref())
        .unwrap();
    assert_eq!(leaf.issuer().to_string(), root.subject().to_string());

    let san = leaf
        .subject_alternative_name()
        .unwrap()
        .expect("leaf carries a SAN");
    let names: Vec<&str> = san
        .value
        .general_names
        .iter()
        .filter_map(|n| match n {
            GeneralName::DNSName(name) => Some(*name),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["shop.example"]);
}

#[tokio::test]
async fn test_transparent_tls_uses_sni_host() {
    let proxy = TestProxy::start(&["allowed.example"]).await;

    // No CONNECT: the first byte on the wire is the TLS handshake
    let tcp = TcpStream::connect(proxy.addr).await.unwrap();
    let mut tls = tls_handshake(&proxy, tcp, "transparent.example").await;

    tls.write_all(b"GET /path HTTP/1.1\r\nHost: transparent.example\r\n\r\n")
        .await
        .unwrap();
    tls.flush().await.unwrap();

    assert_eq!(read_exactly(&mut tls, BLOCK_RESPONSE.len()).await, BLOCK_RESPONSE);
    assert!(proxy.recorder.request_lines()[0]
        .starts_with("[BLOCKED] GET->https://transparent.example/path"));
}

#[tokio::test]
async fn test_repeat_hosts_reuse_cached_leaf() {
    let proxy = TestProxy::start(&[]).await;

    let first = connect_tunnel(&proxy, "cached.example:443", "cached.example").await;
    let second = connect_tunnel(&proxy, "cached.example:443", "cached.example").await;

    let leaf = |tls: &TlsStream<TcpStream>| {
        tls.get_ref().1.peer_certificates().unwrap()[0]
            .as_ref()
            .to_vec()
    };
    assert_eq!(leaf(&first), leaf(&second));
}

// ============================================================================
// Allowed HTTPS
// ============================================================================

#[tokio::test]
async fn test_allowed_https_request_reaches_origin() {
    let (mut origin, origin_trust) = TestOrigin::tls(ORIGIN_RESPONSE).await;
    let proxy = TestProxy::start_with_upstream_tls(&["localhost"], origin_trust).await;

    let authority = format!("localhost:{}", origin.addr.port());
    let mut tls = connect_tunnel(&proxy, &authority, "localhost").await;

    let request = format!(
        "GET /vault HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        authority
    );
    tls.write_all(request.as_bytes()).await.unwrap();
    tls.flush().await.unwrap();

    assert_eq!(read_exactly(&mut tls, ORIGIN_RESPONSE.len()).await, ORIGIN_RESPONSE);
    assert_eq!(origin.next_request().await, request.as_bytes());

    let lines = proxy.recorder.request_lines();
    assert!(
        lines[0].starts_with(&format!("GET->https://{}/vault", authority)),
        "{}",
        lines[0]
    );
}

#[tokio::test]
async fn test_untrusted_origin_closes_client() {
    // Proxy trusts only the public roots, so the test origin fails verification
    let (origin, _) = TestOrigin::tls(ORIGIN_RESPONSE).await;
    let proxy = TestProxy::start(&["localhost"]).await;

    let authority = format!("localhost:{}", origin.addr.port());
    let mut tls = connect_tunnel(&proxy, &authority, "localhost").await;

    tls.write_all(format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", authority).as_bytes())
        .await
        .unwrap();
    tls.flush().await.unwrap();

    // Clean or abrupt EOF are both fine; a response is not
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(TEST_TIMEOUT, tls.read_to_end(&mut buf))
        .await
        .expect("proxy should hang up");
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_plaintext_inside_connect_is_filtered() {
    let proxy = TestProxy::start(&["allowed.example"]).await;

    let mut tcp = TcpStream::connect(proxy.addr).await.unwrap();
    tcp.write_all(b"CONNECT plain.example:80 HTTP/1.1\r\nHost: plain.example:80\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_exactly(&mut tcp, CONNECT_OK.len()).await, CONNECT_OK);

    tcp.write_all(b"GET /x HTTP/1.1\r\nHost: plain.example\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_exactly(&mut tcp, BLOCK_RESPONSE.len()).await, BLOCK_RESPONSE);
    assert!(proxy.recorder.request_lines()[0].starts_with("[BLOCKED] GET->http://plain.example/x"));
}

#[tokio::test]
async fn test_nested_connect_closes_tunnel() {
    let proxy = TestProxy::start(&["example"]).await;

    let mut tcp = TcpStream::connect(proxy.addr).await.unwrap();
    tcp.write_all(b"CONNECT plain.example:80 HTTP/1.1\r\nHost: plain.example:80\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_exactly(&mut tcp, CONNECT_OK.len()).await, CONNECT_OK);

    tcp.write_all(b"CONNECT inner.example:443 HTTP/1.1\r\nHost: inner.example:443\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let _ = tokio::time::timeout(TEST_TIMEOUT, tcp.read_to_end(&mut buf))
        .await
        .expect("proxy should hang up");
    assert!(buf.is_empty());
    assert!(proxy.recorder.events().is_empty());
}
