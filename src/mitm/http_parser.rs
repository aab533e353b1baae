//! HTTP/1.x framing for interception
//!
//! Splits a byte stream into tagged message objects (head, body chunk,
//! trailer) without rewriting anything. Every object keeps the exact bytes it
//! was parsed from, so relaying the objects in order reproduces the original
//! stream byte for byte, chunked encoding included.

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 4096;
const READ_BUFFER_SIZE: usize = 8192;

/// HTTP parsing errors
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid HTTP format: {0}")]
    InvalidFormat(String),

    #[error("Message head exceeds 64KB")]
    HeadTooLarge,

    #[error("Header parse error: {0}")]
    InvalidHeader(String),

    #[error("Invalid Content-Length: {0}")]
    InvalidContentLength(String),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Connection closed mid-message")]
    UnexpectedEof,

    #[error("Read timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        match e {
            httparse::Error::HeaderName | httparse::Error::HeaderValue => {
                ParseError::InvalidHeader(e.to_string())
            }
            httparse::Error::TooManyHeaders => ParseError::HeadTooLarge,
            _ => ParseError::InvalidFormat(e.to_string()),
        }
    }
}

/// HTTP/1.x minor version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    fn from_minor(minor: Option<u8>) -> Result<Self, ParseError> {
        match minor {
            Some(0) => Ok(Self::Http10),
            Some(1) => Ok(Self::Http11),
            other => Err(ParseError::InvalidFormat(format!(
                "unsupported HTTP version 1.{:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http10 => write!(f, "HTTP/1.0"),
            Self::Http11 => write!(f, "HTTP/1.1"),
        }
    }
}

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the sender closes the connection (responses only)
    CloseDelimited,
}

/// Kind tag of a framed object, used where only the type is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    RequestHead,
    ResponseHead,
    BodyChunk,
    Trailer,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RequestHead => "RequestHead",
            Self::ResponseHead => "ResponseHead",
            Self::BodyChunk => "BodyChunk",
            Self::Trailer => "Trailer",
        };
        f.write_str(name)
    }
}

/// Common view of request and response heads
pub trait MessageHead {
    const KIND: ObjectKind;

    /// Exact bytes of the head, including the terminating blank line
    fn raw(&self) -> &Bytes;

    fn headers(&self) -> &[(String, String)];

    /// First value of a header (case-insensitive name)
    fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether any comma-separated token of the named header equals `token`
    fn has_header_token(&self, name: &str, token: &str) -> bool {
        self.headers()
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

/// Parsed HTTP request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// HTTP method (GET, POST, CONNECT, ...)
    pub method: String,

    /// Request target as sent (origin-form, absolute-form or authority-form)
    pub uri: String,

    pub version: HttpVersion,

    /// Headers in wire order, duplicates preserved
    pub headers: Vec<(String, String)>,

    pub raw: Bytes,
}

/// Parsed HTTP response head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub raw: Bytes,
}

impl MessageHead for RequestHead {
    const KIND: ObjectKind = ObjectKind::RequestHead;

    fn raw(&self) -> &Bytes {
        &self.raw
    }

    fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

impl MessageHead for ResponseHead {
    const KIND: ObjectKind = ObjectKind::ResponseHead;

    fn raw(&self) -> &Bytes {
        &self.raw
    }

    fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Whether the client wants the connection kept open after this exchange
    pub fn is_keep_alive(&self) -> bool {
        keep_alive(self.version, self)
    }

    /// Body framing per RFC 7230 section 3.3.3
    ///
    /// A request carrying both Transfer-Encoding and Content-Length is
    /// rejected: the origin could frame it differently and read a second,
    /// unfiltered request out of the body.
    pub fn body_kind(&self) -> Result<BodyKind, ParseError> {
        if let Some(chunked) = transfer_encoding_chunked(self) {
            if self.header("content-length").is_some() {
                return Err(ParseError::InvalidFormat(
                    "request carries both Transfer-Encoding and Content-Length".to_string(),
                ));
            }
            if !chunked {
                return Err(ParseError::InvalidFormat(
                    "request Transfer-Encoding must end with chunked".to_string(),
                ));
            }
            return Ok(BodyKind::Chunked);
        }

        match content_length(self)? {
            Some(0) | None => Ok(BodyKind::Empty),
            Some(len) => Ok(BodyKind::Length(len)),
        }
    }
}

impl ResponseHead {
    /// 1xx other than 101: another head follows on the same exchange
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn is_switching_protocols(&self) -> bool {
        self.status == 101
    }

    pub fn is_keep_alive(&self) -> bool {
        keep_alive(self.version, self)
    }

    /// Body framing; depends on the method of the request being answered
    pub fn body_kind(&self, request_method: &str) -> Result<BodyKind, ParseError> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyKind::Empty);
        }

        if request_method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&self.status) {
            return Ok(BodyKind::Empty);
        }

        if let Some(chunked) = transfer_encoding_chunked(self) {
            return Ok(if chunked {
                BodyKind::Chunked
            } else {
                BodyKind::CloseDelimited
            });
        }

        match content_length(self)? {
            Some(0) => Ok(BodyKind::Empty),
            Some(len) => Ok(BodyKind::Length(len)),
            None => Ok(BodyKind::CloseDelimited),
        }
    }
}

fn keep_alive<H: MessageHead>(version: HttpVersion, head: &H) -> bool {
    match version {
        HttpVersion::Http11 => !head.has_header_token("connection", "close"),
        HttpVersion::Http10 => head.has_header_token("connection", "keep-alive"),
    }
}

/// `Some(true)` if the final transfer coding is chunked, `None` without the header
fn transfer_encoding_chunked<H: MessageHead>(head: &H) -> Option<bool> {
    let codings: Vec<&str> = head
        .headers()
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
        .flat_map(|(_, v)| v.split(','))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();

    codings
        .last()
        .map(|last| last.eq_ignore_ascii_case("chunked"))
}

/// Content-Length; repeated headers must agree
fn content_length<H: MessageHead>(head: &H) -> Result<Option<u64>, ParseError> {
    let mut length = None;

    for (_, value) in head
        .headers()
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("content-length"))
    {
        for part in value.split(',') {
            let parsed: u64 = part
                .trim()
                .parse()
                .map_err(|_| ParseError::InvalidContentLength(value.clone()))?;

            match length {
                Some(existing) if existing != parsed => {
                    return Err(ParseError::InvalidContentLength(value.clone()));
                }
                _ => length = Some(parsed),
            }
        }
    }

    Ok(length)
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

/// Parse a request head from the start of `data`
///
/// Returns `Ok(None)` while the head is still incomplete.
pub fn parse_request_head(data: &[u8]) -> Result<Option<RequestHead>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let len = match request.parse(data)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            if data.len() > MAX_HEAD_SIZE {
                return Err(ParseError::HeadTooLarge);
            }
            return Ok(None);
        }
    };

    let method = request
        .method
        .ok_or_else(|| ParseError::InvalidFormat("missing method".to_string()))?;
    let uri = request
        .path
        .ok_or_else(|| ParseError::InvalidFormat("missing request target".to_string()))?;

    Ok(Some(RequestHead {
        method: method.to_string(),
        uri: uri.to_string(),
        version: HttpVersion::from_minor(request.version)?,
        headers: owned_headers(request.headers),
        raw: Bytes::copy_from_slice(&data[..len]),
    }))
}

/// Parse a response head from the start of `data`
pub fn parse_response_head(data: &[u8]) -> Result<Option<ResponseHead>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let len = match response.parse(data)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            if data.len() > MAX_HEAD_SIZE {
                return Err(ParseError::HeadTooLarge);
            }
            return Ok(None);
        }
    };

    let status = response
        .code
        .ok_or_else(|| ParseError::InvalidFormat("missing status code".to_string()))?;

    Ok(Some(ResponseHead {
        version: HttpVersion::from_minor(response.version)?,
        status,
        reason: response.reason.unwrap_or_default().to_string(),
        headers: owned_headers(response.headers),
        raw: Bytes::copy_from_slice(&data[..len]),
    }))
}

/// Body piece read from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyObject {
    /// Raw body bytes; for chunked bodies this includes size lines and CRLFs
    Chunk(Bytes),

    /// Terminating `0` chunk plus trailer fields and the final blank line
    Trailer(Bytes),
}

/// One framed piece of an HTTP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpObject<H> {
    Head(H),
    Chunk(Bytes),
    Trailer(Bytes),
}

pub type ClientObject = HttpObject<RequestHead>;
pub type ServerObject = HttpObject<ResponseHead>;

impl<H: MessageHead> HttpObject<H> {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Head(_) => H::KIND,
            Self::Chunk(_) => ObjectKind::BodyChunk,
            Self::Trailer(_) => ObjectKind::Trailer,
        }
    }

    /// Bytes to put on the wire for this object
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Head(head) => head.raw(),
            Self::Chunk(bytes) | Self::Trailer(bytes) => bytes,
        }
    }
}

impl<H> From<BodyObject> for HttpObject<H> {
    fn from(obj: BodyObject) -> Self {
        match obj {
            BodyObject::Chunk(bytes) => Self::Chunk(bytes),
            BodyObject::Trailer(bytes) => Self::Trailer(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Idle,
    Length(u64),
    CloseDelimited,
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
}

enum Step {
    Emit(BodyObject),
    NeedMore,
    Done,
}

/// Buffered HTTP/1.x reader over a byte stream, with pass-through writes
pub struct MessageStream<S> {
    io: S,
    buf: BytesMut,
    body: BodyState,
    trailer: BytesMut,
    read_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
}

impl<S> MessageStream<S> {
    pub fn new(io: S) -> Self {
        Self::with_buffer(io, BytesMut::new())
    }

    /// Start with bytes already read from `io`
    pub fn with_buffer(io: S, buf: BytesMut) -> Self {
        Self {
            io,
            buf,
            body: BodyState::Idle,
            trailer: BytesMut::new(),
            read_timeout: None,
            idle_timeout: None,
        }
    }

    /// `read` bounds every read inside a message, `idle` the wait for a new head
    pub fn with_timeouts(mut self, read: Option<Duration>, idle: Option<Duration>) -> Self {
        self.read_timeout = read;
        self.idle_timeout = idle;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }

    /// Bytes read from the stream but not yet consumed
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// True while a message body is still being read
    pub fn in_body(&self) -> bool {
        self.body != BodyState::Idle
    }

    /// Release the stream together with any unconsumed bytes
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.io, self.buf)
    }

    /// Prepare to read a body of the given kind
    pub fn begin_body(&mut self, kind: BodyKind) {
        self.trailer.clear();
        self.body = match kind {
            BodyKind::Empty | BodyKind::Length(0) => BodyState::Idle,
            BodyKind::Length(len) => BodyState::Length(len),
            BodyKind::Chunked => BodyState::ChunkSize,
            BodyKind::CloseDelimited => BodyState::CloseDelimited,
        };
    }

    fn ensure_idle(&self) -> Result<(), ParseError> {
        if self.in_body() {
            return Err(ParseError::InvalidFormat(
                "previous message body not consumed".to_string(),
            ));
        }
        Ok(())
    }

    /// Consume buffered body bytes as far as possible without reading
    fn step(&mut self) -> Result<Step, ParseError> {
        let mut out = BytesMut::new();

        loop {
            match self.body {
                BodyState::Idle => {
                    return Ok(if out.is_empty() {
                        Step::Done
                    } else {
                        Step::Emit(BodyObject::Chunk(out.freeze()))
                    });
                }
                BodyState::Length(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(pending(out));
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    out.extend_from_slice(&self.buf.split_to(take));
                    let left = remaining - take as u64;
                    self.body = if left == 0 {
                        BodyState::Idle
                    } else {
                        BodyState::Length(left)
                    };
                }
                BodyState::CloseDelimited => {
                    if self.buf.is_empty() {
                        return Ok(pending(out));
                    }
                    out.extend_from_slice(&self.buf.split());
                }
                BodyState::ChunkSize => {
                    let Some(line_end) = find_crlf(&self.buf) else {
                        if self.buf.len() > MAX_CHUNK_LINE {
                            return Err(ParseError::InvalidChunk(
                                "chunk size line too long".to_string(),
                            ));
                        }
                        return Ok(pending(out));
                    };

                    let size = parse_chunk_size(&self.buf[..line_end])?;
                    let line = self.buf.split_to(line_end + 2);

                    if size == 0 {
                        self.trailer.extend_from_slice(&line);
                        self.body = BodyState::Trailers;
                    } else {
                        out.extend_from_slice(&line);
                        self.body = BodyState::ChunkData(size);
                    }
                }
                BodyState::ChunkData(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(pending(out));
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    out.extend_from_slice(&self.buf.split_to(take));
                    let left = remaining - take as u64;
                    self.body = if left == 0 {
                        BodyState::ChunkDataEnd
                    } else {
                        BodyState::ChunkData(left)
                    };
                }
                BodyState::ChunkDataEnd => {
                    if self.buf.len() < 2 {
                        return Ok(pending(out));
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunk(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    out.extend_from_slice(&self.buf.split_to(2));
                    self.body = BodyState::ChunkSize;
                }
                BodyState::Trailers => {
                    // Flush data first so the trailer stays a separate object
                    if !out.is_empty() {
                        return Ok(Step::Emit(BodyObject::Chunk(out.freeze())));
                    }

                    let Some(line_end) = find_crlf(&self.buf) else {
                        if self.trailer.len() + self.buf.len() > MAX_HEAD_SIZE {
                            return Err(ParseError::HeadTooLarge);
                        }
                        return Ok(Step::NeedMore);
                    };

                    let line = self.buf.split_to(line_end + 2);
                    self.trailer.extend_from_slice(&line);

                    if line_end == 0 {
                        self.body = BodyState::Idle;
                        let raw = self.trailer.split().freeze();
                        return Ok(Step::Emit(BodyObject::Trailer(raw)));
                    }
                }
            }
        }
    }
}

fn pending(out: BytesMut) -> Step {
    if out.is_empty() {
        Step::NeedMore
    } else {
        Step::Emit(BodyObject::Chunk(out.freeze()))
    }
}

impl<S: AsyncRead + Unpin> MessageStream<S> {
    async fn fill(&mut self, limit: Option<Duration>) -> Result<usize, ParseError> {
        self.buf.reserve(READ_BUFFER_SIZE);

        let read = self.io.read_buf(&mut self.buf);
        let n = match limit {
            Some(limit) => timeout(limit, read)
                .await
                .map_err(|_| ParseError::Timeout)??,
            None => read.await?,
        };

        Ok(n)
    }

    /// Resolve once the peer closes the connection or it fails
    ///
    /// Bytes arriving meanwhile (a pipelined request) stay buffered for the
    /// next read. Watching stops, without resolving, once a full head's worth
    /// is buffered.
    pub async fn closed(&mut self) {
        loop {
            if self.buf.len() >= MAX_HEAD_SIZE {
                std::future::pending::<()>().await;
            }
            match self.fill(None).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }

    /// Read the next request head
    ///
    /// Returns `Ok(None)` when the peer closes cleanly between messages.
    pub async fn read_request_head(&mut self) -> Result<Option<RequestHead>, ParseError> {
        self.ensure_idle()?;

        loop {
            if !self.buf.is_empty() {
                if let Some(head) = parse_request_head(&self.buf)? {
                    self.buf.advance(head.raw.len());
                    return Ok(Some(head));
                }
            }

            let limit = if self.buf.is_empty() {
                self.idle_timeout
            } else {
                self.read_timeout
            };

            if self.fill(limit).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ParseError::UnexpectedEof);
            }
        }
    }

    /// Read the next response head
    pub async fn read_response_head(&mut self) -> Result<ResponseHead, ParseError> {
        self.ensure_idle()?;

        loop {
            if !self.buf.is_empty() {
                if let Some(head) = parse_response_head(&self.buf)? {
                    self.buf.advance(head.raw.len());
                    return Ok(head);
                }
            }

            if self.fill(self.read_timeout).await? == 0 {
                return Err(ParseError::UnexpectedEof);
            }
        }
    }

    /// Read the next piece of the current body; `Ok(None)` once it is complete
    pub async fn read_body_object(&mut self) -> Result<Option<BodyObject>, ParseError> {
        loop {
            match self.step()? {
                Step::Emit(obj) => return Ok(Some(obj)),
                Step::Done => return Ok(None),
                Step::NeedMore => {
                    if self.fill(self.read_timeout).await? == 0 {
                        if self.body == BodyState::CloseDelimited {
                            self.body = BodyState::Idle;
                            return Ok(None);
                        }
                        return Err(ParseError::UnexpectedEof);
                    }
                }
            }
        }
    }

    /// Read and discard the rest of the current body, returning its size on the wire
    pub async fn discard_body(&mut self) -> Result<u64, ParseError> {
        let mut discarded = 0u64;
        while let Some(obj) = self.read_body_object().await? {
            discarded += match obj {
                BodyObject::Chunk(bytes) | BodyObject::Trailer(bytes) => bytes.len() as u64,
            };
        }
        Ok(discarded)
    }
}

impl<S: AsyncWrite + Unpin> MessageStream<S> {
    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.io.write_all(data).await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.io.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.io.shutdown().await
    }
}

/// Find CRLF position in buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parse a chunk size line, ignoring chunk extensions
fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ParseError::InvalidChunk("non-ASCII chunk size".to_string()))?;

    let size = line.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
        return Err(ParseError::InvalidChunk("empty chunk size".to_string()));
    }

    u64::from_str_radix(size, 16)
        .map_err(|_| ParseError::InvalidChunk(format!("invalid chunk size: {}", size)))
}
