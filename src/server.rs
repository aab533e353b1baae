//! Proxy server: accept loop and per-connection sessions
//!
//! One task per client connection. The first byte decides how the
//! connection is served:
//! - `0x16` (TLS handshake): transparent HTTPS, terminated with a leaf for
//!   the SNI host
//! - anything else: plaintext HTTP; a `CONNECT` request turns the connection
//!   into a tunnel that is itself intercepted when it carries TLS
//!
//! Every request then runs through the filter chain exactly once and is
//! either relayed byte for byte or answered with the canned response.

use crate::config::Config;
use crate::filter::{ClientVerdict, Filter, FilterChain, Scheme};
use crate::http_client::{
    parse_authority, UpstreamConnector, UpstreamError, UpstreamStream, UpstreamTarget,
};
use crate::logger::LoggerHook;
use crate::mitm::certificate_authority::CertificateAuthority;
use crate::mitm::http_parser::{
    BodyKind, ClientObject, MessageHead, MessageStream, ParseError, RequestHead, ResponseHead,
    ServerObject,
};
use crate::mitm::interceptor::{
    InterceptionError, MitmInterceptor, PrefixedStream, TLS_HANDSHAKE_RECORD,
};
use crate::mitm::tls_config::{TlsConfigError, UpstreamTlsConfig};
use crate::whitelist::Whitelist;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Reply sent once a CONNECT tunnel is accepted
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// How long to wait for `100 Continue` before sending the body anyway
const EXPECT_CONTINUE_WAIT: Duration = Duration::from_secs(1);

/// Session errors; each one ends only its own connection
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Malformed client request: {0}")]
    ClientParse(#[from] ParseError),

    #[error("Malformed upstream response: {0}")]
    UpstreamParse(ParseError),

    #[error("Request has no resolvable authority")]
    MissingAuthority,

    #[error("Invalid CONNECT target: {0}")]
    InvalidConnect(String),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Interception failed: {0}")]
    Interception(#[from] InterceptionError),

    #[error("Timed out waiting for client")]
    ClientTimeout,

    #[error("Client closed the connection before the response completed")]
    ClientClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Timeouts applied to every session
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionTimeouts {
    /// Bound on each read inside a message, both legs
    pub read: Option<Duration>,

    /// Wait for the next request head on a kept-alive client connection
    pub idle: Option<Duration>,
}

impl SessionTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read: Some(config.read_timeout),
            idle: Some(config.idle_timeout),
        }
    }
}

struct ServerState {
    filters: FilterChain,
    interceptor: MitmInterceptor,
    connector: UpstreamConnector,
    timeouts: SessionTimeouts,
}

/// Whitelisting intercepting proxy
#[derive(Clone)]
pub struct ProxyServer {
    state: Arc<ServerState>,
}

impl ProxyServer {
    pub fn new(
        filters: FilterChain,
        interceptor: MitmInterceptor,
        connector: UpstreamConnector,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                filters,
                interceptor,
                connector,
                timeouts,
            }),
        }
    }

    /// Wire up all components from configuration
    pub fn from_config(
        config: &Config,
        ca: Arc<CertificateAuthority>,
        logger: Arc<dyn LoggerHook>,
    ) -> Result<Self, TlsConfigError> {
        let filters = FilterChain::new(Arc::new(config.whitelist.clone()), logger);
        let interceptor =
            MitmInterceptor::new(ca).with_handshake_timeout(config.read_timeout);
        let connector = UpstreamConnector::new(UpstreamTlsConfig::new()?, config.connect_timeout);

        Ok(Self::new(
            filters,
            interceptor,
            connector,
            SessionTimeouts::from_config(config),
        ))
    }

    pub fn whitelist(&self) -> &Whitelist {
        self.state.filters.whitelist()
    }

    /// Accept connections until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(addr = ?listener.local_addr().ok(), "Proxy listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Back off on fd exhaustion instead of spinning
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    /// Serve one client connection to completion
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        debug!(peer = %peer, "Connection accepted");

        match self.run_session(stream).await {
            Ok(()) => debug!(peer = %peer, "Connection closed"),
            Err(SessionError::ClientTimeout) => debug!(peer = %peer, "Client idle, closing"),
            Err(SessionError::ClientClosed) => {
                debug!(peer = %peer, "Client went away mid-response, upstream dropped")
            }
            Err(SessionError::Upstream(e)) => {
                warn!(peer = %peer, error = %e, "Upstream failed, closing client connection")
            }
            Err(e) => warn!(peer = %peer, error = %e, "Session ended with error"),
        }
    }

    async fn run_session(&self, stream: TcpStream) -> Result<(), SessionError> {
        let Some(first) = self.peek_first_byte(&stream).await? else {
            return Ok(());
        };

        if first == TLS_HANDSHAKE_RECORD {
            debug!("Transparent TLS connection");
            let intercepted = self.state.interceptor.accept(stream, None).await?;
            let authority = format!("{}:{}", intercepted.server_name, Scheme::Https.default_port());
            let mut client = self.client_stream(intercepted.stream);
            return self
                .exchange_loop(&mut client, Scheme::Https, Some(&authority))
                .await
                .map(|_| ());
        }

        let mut client = self.client_stream(stream);
        match self.exchange_loop(&mut client, Scheme::Http, None).await? {
            LoopEnd::Closed => Ok(()),
            LoopEnd::Connect(head) => self.handle_connect(client, head).await,
        }
    }

    fn client_stream<IO>(&self, io: IO) -> MessageStream<IO> {
        MessageStream::new(io).with_timeouts(self.state.timeouts.read, self.state.timeouts.idle)
    }

    async fn peek_first_byte(&self, stream: &TcpStream) -> Result<Option<u8>, SessionError> {
        let mut byte = [0u8; 1];
        let peek = stream.peek(&mut byte);

        let n = match self.state.timeouts.idle {
            Some(limit) => timeout(limit, peek)
                .await
                .map_err(|_| SessionError::ClientTimeout)??,
            None => peek.await?,
        };

        Ok((n > 0).then_some(byte[0]))
    }

    /// Accept a CONNECT tunnel and serve whatever flows through it
    ///
    /// CONNECT itself is not matched against the whitelist; every request
    /// inside the tunnel is.
    async fn handle_connect(
        &self,
        client: MessageStream<TcpStream>,
        head: RequestHead,
    ) -> Result<(), SessionError> {
        let (host, port) = parse_authority(&head.uri, Scheme::Https.default_port())
            .map_err(SessionError::InvalidConnect)?;
        let authority = format!("{}:{}", host, port);

        info!(authority = %authority, "CONNECT accepted");

        let (mut tcp, leftover) = client.into_parts();
        tcp.write_all(CONNECT_ESTABLISHED).await?;
        tcp.flush().await?;

        let first = match leftover.first() {
            Some(byte) => Some(*byte),
            None => self.peek_first_byte(&tcp).await?,
        };
        let Some(first) = first else {
            return Ok(());
        };

        let io = PrefixedStream::new(leftover, tcp);

        if first == TLS_HANDSHAKE_RECORD {
            let fallback = host.trim_start_matches('[').trim_end_matches(']');
            let intercepted = self.state.interceptor.accept(io, Some(fallback)).await?;
            debug!(
                authority = %authority,
                server_name = %intercepted.server_name,
                "Tunnel intercepted"
            );
            let mut client = self.client_stream(intercepted.stream);
            self.exchange_loop(&mut client, Scheme::Https, Some(&authority))
                .await?;
        } else {
            debug!(authority = %authority, "Plaintext tunnel");
            let mut client = self.client_stream(io);
            self.exchange_loop(&mut client, Scheme::Http, Some(&authority))
                .await?;
        }

        Ok(())
    }

    /// Serve requests on `client` until it closes
    ///
    /// On a plain proxy connection (`session_authority` unset) a CONNECT
    /// ends the loop and is handed back to the caller.
    async fn exchange_loop<IO>(
        &self,
        client: &mut MessageStream<IO>,
        scheme: Scheme,
        session_authority: Option<&str>,
    ) -> Result<LoopEnd, SessionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut upstream: Option<(UpstreamTarget, MessageStream<UpstreamStream>)> = None;

        loop {
            let head = match client.read_request_head().await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(LoopEnd::Closed),
                Err(ParseError::Timeout) if !client.buffered().is_empty() => {
                    return Err(ParseError::Timeout.into());
                }
                Err(ParseError::Timeout) => return Err(SessionError::ClientTimeout),
                Err(e) => return Err(e.into()),
            };

            if head.is_connect() && session_authority.is_some() {
                return Err(SessionError::InvalidConnect(format!(
                    "nested CONNECT {} inside a tunnel",
                    head.uri
                )));
            }

            if head.is_connect() && session_authority.is_none() && scheme == Scheme::Http {
                return Ok(LoopEnd::Connect(head));
            }

            let outcome = self
                .exchange(client, &mut upstream, head, scheme, session_authority)
                .await?;

            match outcome {
                ExchangeEnd::KeepAlive => continue,
                ExchangeEnd::Close => return Ok(LoopEnd::Closed),
            }
        }
    }

    /// One request/response exchange
    async fn exchange<IO>(
        &self,
        client: &mut MessageStream<IO>,
        upstream: &mut Option<(UpstreamTarget, MessageStream<UpstreamStream>)>,
        head: RequestHead,
        scheme: Scheme,
        session_authority: Option<&str>,
    ) -> Result<ExchangeEnd, SessionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let target = crate::filter::request_target(&head, scheme, session_authority)
            .ok_or(SessionError::MissingAuthority)?;
        let body_kind = head.body_kind()?;
        let client_keep_alive = head.is_keep_alive();
        let expects_continue = head.has_header_token("expect", "100-continue");
        let method = head.method.clone();

        let filter = self.state.filters.filter_request(&head, &target);

        let destination = match filter.decision().is_allowed() {
            true => Some(UpstreamTarget::for_request(&head, scheme, session_authority)?),
            false => None,
        };

        let verdict = filter.client_request(&ClientObject::Head(head.clone()));

        match (verdict, destination) {
            (ClientVerdict::ShortCircuit(response), _) => {
                self.answer_blocked(client, &filter, body_kind, expects_continue, response)
                    .await?;

                if expects_continue && body_kind != BodyKind::Empty {
                    // Body may still be in flight; the connection is unusable
                    return Ok(ExchangeEnd::Close);
                }
                Ok(if client_keep_alive {
                    ExchangeEnd::KeepAlive
                } else {
                    ExchangeEnd::Close
                })
            }
            (ClientVerdict::PassThrough, Some(destination)) => {
                let end = self
                    .forward(
                        client,
                        upstream,
                        &filter,
                        &head,
                        destination,
                        body_kind,
                        expects_continue,
                        &method,
                    )
                    .await?;

                Ok(match end {
                    ResponseEnd::KeepAlive if client_keep_alive => ExchangeEnd::KeepAlive,
                    _ => ExchangeEnd::Close,
                })
            }
            (ClientVerdict::PassThrough, None) => Err(SessionError::MissingAuthority),
        }
    }

    /// Drain the blocked request and write the canned response once
    async fn answer_blocked<IO>(
        &self,
        client: &mut MessageStream<IO>,
        filter: &Filter,
        body_kind: BodyKind,
        expects_continue: bool,
        response: &'static [u8],
    ) -> Result<(), SessionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        client.begin_body(body_kind);

        // A client waiting for 100 Continue gets the final answer right away
        if !(expects_continue && body_kind != BodyKind::Empty) {
            while let Some(body) = client.read_body_object().await? {
                let obj: ClientObject = body.into();
                filter.client_request(&obj);
            }
        }

        client.write_all(response).await?;
        client.flush().await?;

        debug!(target_url = %filter.target(), "Blocked request answered locally");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward<IO>(
        &self,
        client: &mut MessageStream<IO>,
        upstream_slot: &mut Option<(UpstreamTarget, MessageStream<UpstreamStream>)>,
        filter: &Filter,
        head: &RequestHead,
        destination: UpstreamTarget,
        body_kind: BodyKind,
        expects_continue: bool,
        method: &str,
    ) -> Result<ResponseEnd, SessionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !matches!(upstream_slot.as_ref(), Some((current, _)) if *current == destination) {
            debug!(upstream = %destination, "Opening upstream connection");
            let stream = self.state.connector.connect(&destination).await?;
            let stream = MessageStream::new(stream).with_timeouts(self.state.timeouts.read, None);
            *upstream_slot = Some((destination, stream));
        }

        let Some((_, upstream)) = upstream_slot.as_mut() else {
            return Err(SessionError::MissingAuthority);
        };

        upstream.write_all(&head.raw).await?;
        client.begin_body(body_kind);

        if expects_continue && body_kind != BodyKind::Empty {
            upstream.flush().await?;
            match timeout(EXPECT_CONTINUE_WAIT, upstream.read_response_head()).await {
                Ok(Ok(response)) if response.status == 100 => {
                    send_to_client(filter, client, ServerObject::Head(response)).await?;
                    client.flush().await?;
                }
                Ok(Ok(response)) => {
                    // Origin refused the body; relay its answer and hang up
                    relay_response(filter, client, upstream, method, Some(response)).await?;
                    *upstream_slot = None;
                    return Ok(ResponseEnd::Close);
                }
                Ok(Err(e)) => return Err(SessionError::UpstreamParse(e)),
                Err(_) => debug!("No 100 Continue from origin, sending body"),
            }
        }

        while let Some(body) = client.read_body_object().await? {
            let obj: ClientObject = body.into();
            filter.client_request(&obj);
            upstream.write_all(obj.as_bytes()).await?;
        }
        upstream.flush().await?;

        let end = relay_response(filter, client, upstream, method, None).await?;

        match end {
            ResponseEnd::Upgrade => {
                if let Some((_, upstream)) = upstream_slot.take() {
                    tunnel(client, upstream).await?;
                }
                Ok(ResponseEnd::Close)
            }
            ResponseEnd::Close => {
                *upstream_slot = None;
                Ok(ResponseEnd::Close)
            }
            ResponseEnd::KeepAlive => Ok(ResponseEnd::KeepAlive),
        }
    }
}

enum LoopEnd {
    Closed,
    Connect(RequestHead),
}

enum ExchangeEnd {
    KeepAlive,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseEnd {
    KeepAlive,
    Close,
    Upgrade,
}

async fn send_to_client<IO>(
    filter: &Filter,
    client: &mut MessageStream<IO>,
    obj: ServerObject,
) -> io::Result<()>
where
    IO: AsyncWrite + Unpin,
{
    if let Some(obj) = filter.server_response(obj) {
        client.write_all(obj.as_bytes()).await?;
    }
    Ok(())
}

/// Relay interim responses and one final response to the client
async fn relay_response<IO>(
    filter: &Filter,
    client: &mut MessageStream<IO>,
    upstream: &mut MessageStream<UpstreamStream>,
    method: &str,
    mut pending: Option<ResponseHead>,
) -> Result<ResponseEnd, SessionError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let head = match pending.take() {
            Some(head) => head,
            None => tokio::select! {
                head = upstream.read_response_head() => head.map_err(SessionError::UpstreamParse)?,
                _ = client.closed() => return Err(SessionError::ClientClosed),
            },
        };

        let interim = head.is_interim();
        let upgrade = head.is_switching_protocols();
        let keep_alive = head.is_keep_alive();
        let kind = head.body_kind(method).map_err(SessionError::UpstreamParse)?;

        send_to_client(filter, client, ServerObject::Head(head)).await?;

        if upgrade {
            client.flush().await?;
            return Ok(ResponseEnd::Upgrade);
        }

        if interim {
            client.flush().await?;
            continue;
        }

        upstream.begin_body(kind);
        loop {
            let body = tokio::select! {
                body = upstream.read_body_object() => body.map_err(SessionError::UpstreamParse)?,
                _ = client.closed() => return Err(SessionError::ClientClosed),
            };
            let Some(body) = body else {
                break;
            };
            send_to_client(filter, client, body.into()).await?;
        }
        client.flush().await?;

        return Ok(if keep_alive && kind != BodyKind::CloseDelimited {
            ResponseEnd::KeepAlive
        } else {
            ResponseEnd::Close
        });
    }
}

/// Raw bidirectional relay after `101 Switching Protocols`
async fn tunnel<IO>(
    client: &mut MessageStream<IO>,
    upstream: MessageStream<UpstreamStream>,
) -> Result<(), SessionError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (mut upstream_io, upstream_pending) = upstream.into_parts();
    let client_pending = Bytes::copy_from_slice(client.buffered());

    if !upstream_pending.is_empty() {
        client.write_all(&upstream_pending).await?;
        client.flush().await?;
    }
    if !client_pending.is_empty() {
        upstream_io.write_all(&client_pending).await?;
        upstream_io.flush().await?;
    }

    let (to_upstream, to_client) =
        tokio::io::copy_bidirectional(client.get_mut(), &mut upstream_io).await?;

    debug!(
        client_to_upstream = to_upstream + client_pending.len() as u64,
        upstream_to_client = to_client + upstream_pending.len() as u64,
        "Upgraded connection closed"
    );

    Ok(())
}
