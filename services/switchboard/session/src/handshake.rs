//! Handshake requests, authorization and OPEN parameters.

use crate::error::SessionError;
use crate::session::{EngineConfig, SessionId};
use crate::transport::TransportKind;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use url::form_urlencoded;

/// What the client sent on the connect path
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Requested transport
    pub transport: TransportKind,
    /// Client can only handle text frames
    pub b64: bool,
    /// Existing session to attach to (upgrade)
    pub sid: Option<SessionId>,
    /// Query parameters, decoded
    pub query: HashMap<String, String>,
    /// Request headers, lower-cased names
    pub headers: HashMap<String, String>,
    /// Peer address, when known
    pub remote_addr: Option<SocketAddr>,
}

impl HandshakeRequest {
    /// Parse a `transport=websocket&b64=1&sid=...` query string
    pub fn from_query(query: &str) -> Result<Self, SessionError> {
        let query: HashMap<String, String> = form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
            .into_owned()
            .collect();

        let transport = match query.get("transport") {
            Some(name) => TransportKind::from_name(name)
                .ok_or_else(|| SessionError::BadRequest(format!("unknown transport {:?}", name)))?,
            None => TransportKind::Polling,
        };
        let b64 = matches!(query.get("b64").map(String::as_str), Some("1") | Some("true"));
        let sid = match query.get("sid") {
            Some(sid) => Some(
                sid.parse()
                    .map_err(|_| SessionError::BadRequest(format!("invalid sid {:?}", sid)))?,
            ),
            None => None,
        };

        Ok(Self {
            transport,
            b64,
            sid,
            query,
            ..Default::default()
        })
    }

    /// Set the peer address
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Add a header
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Query parameter by name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Header by (case-insensitive) name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Decides whether a handshake may open a session
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `true` to accept
    async fn authorize(&self, request: &HandshakeRequest) -> bool;
}

/// Accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _request: &HandshakeRequest) -> bool {
        true
    }
}

/// Body of the OPEN packet
pub fn open_params(sid: SessionId, config: &EngineConfig) -> Value {
    json!({
        "sid": sid.to_string(),
        "upgrades": config.upgrades,
        "pingInterval": config.ping_interval.as_millis() as u64,
        "pingTimeout": config.ping_timeout.as_millis() as u64,
    })
}
