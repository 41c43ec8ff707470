//! Per-session state.
//!
//! A [`Session`] owns its transports, its pending binary packet and its
//! namespace memberships. It is only ever touched under the arena lock held
//! by [`crate::SessionManager`]; the transition helpers here do no locking
//! and no I/O beyond handing frames to a transport.

use crate::error::{SessionError, TransportError};
use crate::handshake::HandshakeRequest;
use crate::keepalive::HeartbeatMode;
use crate::transport::{Transport, TransportId};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use switchboard_scheduler::WheelConfig;
use switchboard_storage::SessionStore;
use switchboard_wire::{Decoder, Frame, PayloadStyle, DEFAULT_MAX_FRAME_SIZE};
use uuid::Uuid;

/// Opaque session identifier, rendered as a simple-form v4 UUID
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the authorizer
    PendingHandshake,
    /// Handshake done, traffic flows on the active transport
    Open,
    /// A candidate transport asked to take over; waiting for the old one to drain
    Upgrading,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether outbound traffic may be written
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Open | SessionState::Upgrading)
    }
}

/// Why a session closed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent DISCONNECT on the root namespace
    ClientDisconnect,
    /// Client sent a CLOSE packet
    ClosePacket,
    /// No PING/PONG within the liveness window
    PingTimeout,
    /// The active transport went away
    TransportClosed,
    /// Inbound data could not be decoded
    DecodeError,
    /// Server-side disconnect
    ServerDisconnect,
    /// Server is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::ClientDisconnect => "client disconnect",
            CloseReason::ClosePacket => "close packet",
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::TransportClosed => "transport closed",
            CloseReason::DecodeError => "decode error",
            CloseReason::ServerDisconnect => "server disconnect",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Protocol engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Interval the client is told to ping at (or the server pings at)
    pub ping_interval: Duration,
    /// Grace period after `ping_interval` before the session is dead
    pub ping_timeout: Duration,
    /// Time the old transport gets to drain during an upgrade
    pub upgrade_timeout: Duration,
    /// Time the handshake may take, authorization included
    pub first_data_timeout: Duration,
    /// Default deadline for acks requested by the server; `None` waits forever
    pub ack_timeout: Option<Duration>,
    /// Largest accepted frame
    pub max_frame_size: usize,
    /// Transports a session may upgrade to
    pub upgrades: Vec<String>,
    /// Which side sends PING
    pub heartbeat: HeartbeatMode,
    /// Layout of long-polling bodies
    pub payload_style: PayloadStyle,
    /// Deadline wheel geometry
    pub wheel: WheelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(60),
            upgrade_timeout: Duration::from_secs(10),
            first_data_timeout: Duration::from_secs(5),
            ack_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            upgrades: vec!["websocket".to_string()],
            heartbeat: HeartbeatMode::default(),
            payload_style: PayloadStyle::default(),
            wheel: WheelConfig::default(),
        }
    }
}

/// Which of a session's transports a frame came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Current active transport
    Active,
    /// Upgrade candidate
    Candidate,
}

/// One client session
pub struct Session {
    id: SessionId,
    pub(crate) state: SessionState,
    pub(crate) request: HandshakeRequest,
    pub(crate) active: Arc<dyn Transport>,
    pub(crate) candidate: Option<Arc<dyn Transport>>,
    pub(crate) decoder: Decoder,
    pub(crate) namespaces: HashSet<String>,
    pub(crate) store: Option<Arc<dyn SessionStore>>,
}

impl Session {
    /// New session waiting for its handshake
    pub fn new(id: SessionId, request: HandshakeRequest, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            state: SessionState::PendingHandshake,
            request,
            active: transport,
            candidate: None,
            decoder: Decoder::new(),
            namespaces: HashSet::new(),
            store: None,
        }
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The handshake request that created the session
    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    /// Transport carrying traffic
    pub fn active(&self) -> &Arc<dyn Transport> {
        &self.active
    }

    /// Namespaces the session has connected to
    pub fn namespaces(&self) -> &HashSet<String> {
        &self.namespaces
    }

    /// Which transport `id` is, if it belongs to this session
    pub fn origin(&self, id: TransportId) -> Option<Origin> {
        if self.active.id() == id {
            Some(Origin::Active)
        } else if self.candidate.as_ref().map(|c| c.id()) == Some(id) {
            Some(Origin::Candidate)
        } else {
            None
        }
    }

    /// Transport for `origin`
    pub(crate) fn transport(&self, origin: Origin) -> Option<&Arc<dyn Transport>> {
        match origin {
            Origin::Active => Some(&self.active),
            Origin::Candidate => self.candidate.as_ref(),
        }
    }

    /// Write on the active transport
    pub fn send(&self, frames: Vec<Frame>) -> Result<(), TransportError> {
        self.active.write(frames)
    }

    pub(crate) fn open(&mut self, store: Arc<dyn SessionStore>) -> Result<(), SessionError> {
        if self.state != SessionState::PendingHandshake {
            return Err(SessionError::Closed(self.id));
        }
        self.store = Some(store);
        self.state = SessionState::Open;
        Ok(())
    }

    pub(crate) fn attach_candidate(&mut self, transport: Arc<dyn Transport>) -> Result<(), SessionError> {
        if self.state != SessionState::Open {
            return Err(SessionError::Upgrade("session is not open"));
        }
        if self.candidate.is_some() {
            return Err(SessionError::Upgrade("upgrade already in progress"));
        }
        if transport.kind() == self.active.kind() {
            return Err(SessionError::Upgrade("already on this transport"));
        }
        self.candidate = Some(transport);
        Ok(())
    }

    pub(crate) fn begin_upgrade(&mut self) -> Result<(), SessionError> {
        if self.candidate.is_none() {
            return Err(SessionError::Upgrade("no candidate transport"));
        }
        if self.state != SessionState::Open {
            return Err(SessionError::Upgrade("session is not open"));
        }
        self.state = SessionState::Upgrading;
        Ok(())
    }

    /// Swap the candidate in. Returns the retired transport.
    pub(crate) fn complete_upgrade(&mut self) -> Option<Arc<dyn Transport>> {
        if self.state != SessionState::Upgrading {
            return None;
        }
        let candidate = self.candidate.take()?;
        self.state = SessionState::Open;
        Some(std::mem::replace(&mut self.active, candidate))
    }

    /// Drop the candidate, staying on the active transport. Returns it.
    pub(crate) fn abort_upgrade(&mut self) -> Option<Arc<dyn Transport>> {
        let candidate = self.candidate.take()?;
        if self.state == SessionState::Upgrading {
            self.state = SessionState::Open;
        }
        Some(candidate)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("active", &self.active)
            .field("candidate", &self.candidate)
            .field("namespaces", &self.namespaces)
            .field("pending_binary", &self.decoder.has_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PollingTransport, SocketTransport};
    use switchboard_storage::MemoryStore;

    fn polling_session() -> Session {
        let transport = PollingTransport::new(false);
        Session::new(SessionId::new(), HandshakeRequest::default(), transport)
    }

    #[test]
    fn test_session_id_text_form() {
        let sid = SessionId::new();
        let text = sid.to_string();
        assert_eq!(text.len(), 32);
        assert!(!text.contains('-'));
        assert_eq!(text.parse::<SessionId>().unwrap(), sid);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }

    #[tokio::test]
    async fn test_open_only_from_pending() {
        let mut session = polling_session();
        session.open(Arc::new(MemoryStore::new())).unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert!(session.open(Arc::new(MemoryStore::new())).is_err());
    }

    #[tokio::test]
    async fn test_upgrade_transitions() {
        let mut session = polling_session();
        session.open(Arc::new(MemoryStore::new())).unwrap();
        let old_id = session.active().id();

        assert!(session.begin_upgrade().is_err());

        let (socket, _rx) = SocketTransport::new(false);
        let socket_id = socket.id();
        session.attach_candidate(socket.clone()).unwrap();
        assert_eq!(session.origin(socket_id), Some(Origin::Candidate));
        assert_eq!(session.origin(old_id), Some(Origin::Active));

        let (another, _rx2) = SocketTransport::new(false);
        assert!(session.attach_candidate(another).is_err());

        session.begin_upgrade().unwrap();
        assert_eq!(session.state(), SessionState::Upgrading);

        let retired = session.complete_upgrade().unwrap();
        assert_eq!(retired.id(), old_id);
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.origin(socket_id), Some(Origin::Active));
        assert_eq!(session.origin(old_id), None);
    }

    #[tokio::test]
    async fn test_abort_upgrade_keeps_active() {
        let mut session = polling_session();
        session.open(Arc::new(MemoryStore::new())).unwrap();
        let old_id = session.active().id();

        let (socket, _rx) = SocketTransport::new(false);
        session.attach_candidate(socket).unwrap();
        session.begin_upgrade().unwrap();

        assert!(session.abort_upgrade().is_some());
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.active().id(), old_id);
        assert!(session.complete_upgrade().is_none());
    }
}
