//! Virtual hosts, application handlers and per-host policies.
//!
//! The server core treats routing, body admission and response framing
//! policy as pluggable collaborators: it resolves a [`VirtualHost`] once
//! per TLS handshake (by SNI name) and once per parsed request (by Host
//! header) and defers to its handler and policies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio_rustls::rustls::ServerConfig;
use uuid::Uuid;

use crate::http::generator::ResponseWriter;
use crate::http::request::Request;
use crate::http::response::StatusCode;

/// Opaque, random identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Immutable facts about one connection, fixed at accept time.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub secure: bool,
    pub created: Instant,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// Everything a handler sees for one request.
pub struct RequestContext {
    pub connection: ConnectionInfo,
    pub request: Request,
    /// Framing policy of the resolved host. Handlers apply its compression
    /// verdict when building the response; the core never transforms bodies.
    pub response_policy: Arc<dyn ResponsePolicy>,
}

/// Application request handler. Runs on a dispatcher worker thread; must
/// commit exactly one response through the writer.
pub trait Handler: Send + Sync {
    fn handle(&self, ctx: &RequestContext, writer: ResponseWriter);
}

impl<F> Handler for F
where
    F: Fn(&RequestContext, ResponseWriter) + Send + Sync,
{
    fn handle(&self, ctx: &RequestContext, writer: ResponseWriter) {
        self(ctx, writer)
    }
}

/// Verdict on an incoming request body, made from the headers alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDecision {
    /// Read the body, optionally capped; a declared Content-Length above
    /// the cap is answered with 413.
    Accept { limit: Option<usize> },
    /// Refuse before any body byte is read.
    Reject(StatusCode),
}

/// Decides whether to accept a request body, consulted after the headers
/// are parsed and before any body byte is consumed.
pub trait UploadPolicy: Send + Sync {
    fn review(&self, head: &Request) -> UploadDecision;
}

/// Default: accept everything up to a fixed ceiling.
pub struct DefaultUploadPolicy {
    pub max_body_bytes: usize,
}

impl UploadPolicy for DefaultUploadPolicy {
    fn review(&self, _head: &Request) -> UploadDecision {
        UploadDecision::Accept {
            limit: Some(self.max_body_bytes),
        }
    }
}

/// Response framing policy, consulted once per request.
pub trait ResponsePolicy: Send + Sync {
    /// Whether the connection may stay open after this response.
    fn keep_alive(&self, request: &Request) -> bool;

    /// Whether a body of the given MIME type is worth compressing. The core
    /// does not transform bodies; handlers read this verdict off the
    /// [`RequestContext`] when they frame the response.
    fn compress(&self, mime: &str) -> bool;
}

/// Default: follow the client's keep-alive preference, compress text-like
/// types.
pub struct DefaultResponsePolicy;

impl ResponsePolicy for DefaultResponsePolicy {
    fn keep_alive(&self, request: &Request) -> bool {
        request.keep_alive()
    }

    fn compress(&self, mime: &str) -> bool {
        mime.starts_with("text/")
            || mime == "application/json"
            || mime == "application/javascript"
            || mime == "image/svg+xml"
    }
}

/// One virtual host: a handler plus its TLS context and policies.
pub struct VirtualHost {
    name: String,
    handler: Arc<dyn Handler>,
    tls: Option<Arc<ServerConfig>>,
    upload: Arc<dyn UploadPolicy>,
    response: Arc<dyn ResponsePolicy>,
}

impl VirtualHost {
    pub fn new(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            handler,
            tls: None,
            upload: Arc::new(DefaultUploadPolicy {
                max_body_bytes: 8 * 1024 * 1024,
            }),
            response: Arc::new(DefaultResponsePolicy),
        }
    }

    pub fn with_tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn with_upload_policy(mut self, policy: Arc<dyn UploadPolicy>) -> Self {
        self.upload = policy;
        self
    }

    pub fn with_response_policy(mut self, policy: Arc<dyn ResponsePolicy>) -> Self {
        self.response = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.handler)
    }

    pub fn tls_context(&self) -> Option<Arc<ServerConfig>> {
        self.tls.clone()
    }

    pub fn upload_policy(&self) -> &dyn UploadPolicy {
        &*self.upload
    }

    pub fn response_policy(&self) -> Arc<dyn ResponsePolicy> {
        Arc::clone(&self.response)
    }
}

/// Read-mostly registry of virtual hosts. Hosts may be added while the
/// server is running; lookups take a read lock only.
pub struct VirtualHosts {
    hosts: RwLock<HashMap<String, Arc<VirtualHost>>>,
    default: RwLock<Option<Arc<VirtualHost>>>,
}

impl VirtualHosts {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            default: RwLock::new(None),
        }
    }

    /// Registers a host. The first registered host also becomes the default
    /// unless one was set explicitly.
    pub fn add(&self, host: VirtualHost) {
        let host = Arc::new(host);
        let mut default = self.default.write().unwrap();
        if default.is_none() {
            *default = Some(Arc::clone(&host));
        }
        drop(default);
        self.hosts
            .write()
            .unwrap()
            .insert(host.name().to_string(), host);
    }

    pub fn set_default(&self, host: VirtualHost) {
        let host = Arc::new(host);
        self.hosts
            .write()
            .unwrap()
            .insert(host.name().to_string(), Arc::clone(&host));
        *self.default.write().unwrap() = Some(host);
    }

    /// Looks up a host by SNI name or Host header value (already stripped
    /// of any port). `None` or an unknown name falls back to the default
    /// host when one exists.
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<VirtualHost>> {
        if let Some(name) = name {
            let hosts = self.hosts.read().unwrap();
            if let Some(host) = hosts.get(&name.to_ascii_lowercase()) {
                return Some(Arc::clone(host));
            }
        }
        self.default.read().unwrap().clone()
    }

    /// TLS context for an SNI name; consulted once per handshake. Absence
    /// is fatal for the connection.
    pub fn tls_context(&self, name: Option<&str>) -> Option<Arc<ServerConfig>> {
        self.resolve(name).and_then(|host| host.tls_context())
    }
}

impl Default for VirtualHosts {
    fn default() -> Self {
        Self::new()
    }
}
