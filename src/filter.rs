//! Per-request filter chain
//!
//! Each request head is checked against the whitelist once. The resulting
//! strategy handles every remaining object of that exchange: `Forwarding`
//! relays everything untouched, `Blocking` answers with a canned response
//! and swallows anything the origin might send.

use crate::logger::LoggerHook;
use crate::mitm::http_parser::{ClientObject, RequestHead, ServerObject};
use crate::whitelist::{FilterDecision, Whitelist};
use http::Uri;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Canned answer for blocked requests
pub static BLOCK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

/// Scheme of the session a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the absolute URL a request is matched against
///
/// Absolute-form URIs are used as sent. Origin-form URIs are joined with the
/// session scheme and authority; `session_authority` (CONNECT target or SNI
/// host) wins over the `Host` header. Returns `None` when no authority is
/// known, or when the URI is in authority form (`host:port`), which only
/// CONNECT may use and which is never filtered as a request.
pub fn request_target(
    head: &RequestHead,
    scheme: Scheme,
    session_authority: Option<&str>,
) -> Option<String> {
    if let Ok(uri) = head.uri.parse::<Uri>() {
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Some(head.uri.clone());
        }
    }

    if head.uri != "*" && !head.uri.starts_with('/') {
        return None;
    }

    let authority = session_authority
        .or_else(|| head.host())
        .map(str::trim)
        .filter(|a| !a.is_empty())?;
    let authority = strip_default_port(authority, scheme);

    let path = if head.uri == "*" { "" } else { head.uri.as_str() };

    Some(format!("{}://{}{}", scheme, authority, path))
}

fn strip_default_port(authority: &str, scheme: Scheme) -> &str {
    let default_suffix = format!(":{}", scheme.default_port());
    match authority.strip_suffix(default_suffix.as_str()) {
        // Keep bare IPv6 literals intact ("::443" style tails)
        Some(host) if !host.is_empty() && (!host.contains(':') || host.ends_with(']')) => host,
        _ => authority,
    }
}

/// What the session does with a client object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVerdict {
    /// Relay the object upstream unchanged
    PassThrough,

    /// Answer the client with these bytes; nothing goes upstream
    ShortCircuit(&'static [u8]),
}

/// Strategy for a whitelisted request
pub struct ForwardingFilter {
    target: String,
    logger: Arc<dyn LoggerHook>,
}

impl ForwardingFilter {
    pub fn client_request(&self, obj: &ClientObject) -> ClientVerdict {
        match obj {
            ClientObject::Head(head) => {
                self.logger
                    .client_request(head, &self.target, FilterDecision::Allow);
            }
            other => self
                .logger
                .client_content(other.kind(), FilterDecision::Allow),
        }
        ClientVerdict::PassThrough
    }

    pub fn server_response(&self, obj: ServerObject) -> Option<ServerObject> {
        self.logger.server_response(obj.kind());
        Some(obj)
    }
}

/// Strategy for every request that misses the whitelist
pub struct BlockingFilter {
    target: String,
    logger: Arc<dyn LoggerHook>,
}

impl BlockingFilter {
    pub fn client_request(&self, obj: &ClientObject) -> ClientVerdict {
        if let ClientObject::Head(head) = obj {
            self.logger
                .client_request(head, &self.target, FilterDecision::Block);
        }
        ClientVerdict::ShortCircuit(BLOCK_RESPONSE)
    }

    pub fn server_response(&self, _obj: ServerObject) -> Option<ServerObject> {
        None
    }
}

/// Strategy selected for one exchange
pub enum Filter {
    Forwarding(ForwardingFilter),
    Blocking(BlockingFilter),
}

impl Filter {
    pub fn decision(&self) -> FilterDecision {
        match self {
            Self::Forwarding(_) => FilterDecision::Allow,
            Self::Blocking(_) => FilterDecision::Block,
        }
    }

    /// Target the decision was made on
    pub fn target(&self) -> &str {
        match self {
            Self::Forwarding(f) => &f.target,
            Self::Blocking(f) => &f.target,
        }
    }

    pub fn client_request(&self, obj: &ClientObject) -> ClientVerdict {
        match self {
            Self::Forwarding(f) => f.client_request(obj),
            Self::Blocking(f) => f.client_request(obj),
        }
    }

    pub fn server_response(&self, obj: ServerObject) -> Option<ServerObject> {
        match self {
            Self::Forwarding(f) => f.server_response(obj),
            Self::Blocking(f) => f.server_response(obj),
        }
    }
}

/// Chooses a strategy per request
#[derive(Clone)]
pub struct FilterChain {
    whitelist: Arc<Whitelist>,
    logger: Arc<dyn LoggerHook>,
}

impl FilterChain {
    pub fn new(whitelist: Arc<Whitelist>, logger: Arc<dyn LoggerHook>) -> Self {
        Self { whitelist, logger }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Consult the whitelist for one request
    pub fn filter_request(&self, head: &RequestHead, target: &str) -> Filter {
        let target = target.to_string();
        let logger = Arc::clone(&self.logger);

        match self.whitelist.matching_entry(&target) {
            Some(entry) => {
                debug!(target_url = %target, entry = %entry, method = %head.method, "Whitelist hit");
                Filter::Forwarding(ForwardingFilter { target, logger })
            }
            None => {
                debug!(target_url = %target, method = %head.method, "No whitelist entry matched");
                Filter::Blocking(BlockingFilter { target, logger })
            }
        }
    }
}
