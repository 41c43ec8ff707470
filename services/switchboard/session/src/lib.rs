//! Session state machine, handshake, upgrade, keepalive, acks and namespaces
//! for switchboard.
//!
//! This crate applies protocol semantics on top of the wire codec: it opens
//! sessions after an authorized handshake, keeps them alive with PING/PONG
//! deadlines, moves them between transports, multiplexes namespaces and
//! rooms, and correlates acknowledgments.
//!
//! ## Features
//!
//! - **Handshake**: async authorization bounded by a first-data deadline
//! - **Keepalive**: client- or server-initiated PING with a liveness window
//! - **Upgrade**: probe, drain and swap from long-polling to a socket
//! - **Namespaces and rooms**: concurrent rosters with best-effort broadcast
//! - **Acks**: per-session ids, typed replies, timeouts
//! - **Cluster**: connect, disconnect, room and dispatch events over pub/sub
//!
//! ## Example
//!
//! ```rust,no_run
//! use switchboard_session::{EngineConfig, HandshakeRequest, SessionManager, SocketTransport};
//! use switchboard_storage::NodeId;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
//! manager.start().await?;
//!
//! let (transport, mut outbound) = SocketTransport::new(false);
//! let request = HandshakeRequest::from_query("transport=websocket")?;
//! let sid = manager.connect(request, transport).await?;
//!
//! manager.emit(sid, "", "welcome", vec![serde_json::json!("hi")])?;
//! while let Some(frame) = outbound.recv().await {
//!     println!("to client: {:?}", frame);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
pub mod deadline;
pub mod error;
pub mod handshake;
mod inbound;
pub mod keepalive;
pub mod manager;
pub mod namespace;
pub mod session;
pub mod transport;

// Re-export main types
pub use ack::{AckCorrelator, AckOutcome};
pub use deadline::{DeadlineKind, SessionKey};
pub use error::{SessionError, TransportError};
pub use handshake::{open_params, AllowAll, Authorizer, HandshakeRequest};
pub use keepalive::{liveness_window, HeartbeatMode, PROBE};
pub use manager::{SessionManager, SessionManagerBuilder};
pub use namespace::{InboundEvent, Namespace, NamespaceListener, NamespaceRegistry};
pub use session::{CloseReason, EngineConfig, Origin, Session, SessionId, SessionState};
pub use transport::{PollingTransport, SocketTransport, Transport, TransportId, TransportKind};
