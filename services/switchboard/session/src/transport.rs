//! Long-polling and persistent socket transports.
//!
//! A transport is the session's outbound half: frames written to it are
//! either buffered for the next poll or pushed to a writer task. Inbound
//! frames never pass through here; the frontend hands them to
//! [`crate::SessionManager::receive`] tagged with the transport id.

use crate::error::TransportError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use switchboard_scheduler::{Affinity, SerialExecutor};
use switchboard_wire::{encode_payload, to_text_frame, Frame, PayloadStyle};
use tokio::sync::{mpsc, Notify};
use tracing::trace;
use uuid::Uuid;

/// Transport instance identifier
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct TransportId(Uuid);

impl TransportId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Kind of transport
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum TransportKind {
    /// HTTP long-polling
    #[default]
    Polling,
    /// Persistent full-duplex socket
    Socket,
}

impl TransportKind {
    /// Name used in handshake queries and the OPEN `upgrades` list
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::Socket => "websocket",
        }
    }

    /// Parse a handshake `transport` value
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "polling" => Some(TransportKind::Polling),
            "websocket" | "socket" => Some(TransportKind::Socket),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound side of a physical connection
pub trait Transport: Send + Sync + fmt::Debug {
    /// Instance id
    fn id(&self) -> TransportId;

    /// Transport kind
    fn kind(&self) -> TransportKind;

    /// Queue frames for the peer
    fn write(&self, frames: Vec<Frame>) -> Result<(), TransportError>;

    /// Ask the transport to flush what it holds. Returns `true` once nothing
    /// is left to deliver.
    fn drain(&self) -> bool;

    /// Close; later writes fail
    fn close(&self);

    /// Whether [`Transport::close`] was called
    fn is_closed(&self) -> bool;

    /// Context the session's timers run on while this transport is active
    fn affinity(&self) -> Arc<dyn Affinity>;
}

/// Long-polling transport: frames wait in a buffer until the next poll
pub struct PollingTransport {
    id: TransportId,
    b64: bool,
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
    closed: AtomicBool,
    affinity: Mutex<Arc<dyn Affinity>>,
}

impl PollingTransport {
    /// Create a transport. `b64` marks a text-only client. Must be called
    /// within a Tokio runtime.
    pub fn new(b64: bool) -> Arc<Self> {
        let id = TransportId::new();
        let executor: Arc<dyn Affinity> = SerialExecutor::spawn(format!("polling-{}", id));
        Arc::new(Self {
            id,
            b64,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            affinity: Mutex::new(executor),
        })
    }

    /// Take everything buffered as one response body
    pub fn take_payload(&self, style: PayloadStyle) -> Bytes {
        let frames: Vec<Frame> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        let frames: Vec<Frame> = if self.b64 {
            frames.iter().map(to_text_frame).collect()
        } else {
            frames
        };
        trace!(transport = %self.id, frames = frames.len(), "poll payload taken");
        encode_payload(&frames, style)
    }

    /// Number of buffered frames
    pub fn buffered(&self) -> usize {
        self.queue.lock().len()
    }

    /// Wait until there is something to send or the transport closed
    pub async fn wait_for_frames(&self) {
        loop {
            if self.is_closed() || !self.queue.lock().is_empty() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Bind the context of the request currently serving this transport
    pub fn set_affinity(&self, affinity: Arc<dyn Affinity>) {
        *self.affinity.lock() = affinity;
    }
}

impl Transport for PollingTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn write(&self, frames: Vec<Frame>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.queue.lock().extend(frames);
        self.notify.notify_one();
        Ok(())
    }

    fn drain(&self) -> bool {
        self.notify.notify_one();
        self.queue.lock().is_empty()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
            trace!(transport = %self.id, "polling transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn affinity(&self) -> Arc<dyn Affinity> {
        self.affinity.lock().clone()
    }
}

impl fmt::Debug for PollingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingTransport")
            .field("id", &self.id)
            .field("b64", &self.b64)
            .field("buffered", &self.buffered())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Persistent socket transport: frames go straight to a writer task
pub struct SocketTransport {
    id: TransportId,
    b64: bool,
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    executor: Arc<SerialExecutor>,
}

impl SocketTransport {
    /// Create a transport and the receiver its writer task drains. Must be
    /// called within a Tokio runtime.
    pub fn new(b64: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let id = TransportId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            id,
            b64,
            tx: Mutex::new(Some(tx)),
            executor: SerialExecutor::spawn(format!("socket-{}", id)),
        });
        (transport, rx)
    }
}

impl Transport for SocketTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn write(&self, frames: Vec<Frame>) -> Result<(), TransportError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        for frame in frames {
            let frame = if self.b64 { to_text_frame(&frame) } else { frame };
            tx.send(frame).map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    fn drain(&self) -> bool {
        true
    }

    fn close(&self) {
        if self.tx.lock().take().is_some() {
            trace!(transport = %self.id, "socket transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map(|tx| tx.is_closed()).unwrap_or(true)
    }

    fn affinity(&self) -> Arc<dyn Affinity> {
        self.executor.clone()
    }
}

impl fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketTransport")
            .field("id", &self.id)
            .field("b64", &self.b64)
            .field("executor", &self.executor.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_polling_payload_and_drain() {
        let transport = PollingTransport::new(false);
        assert!(transport.drain());

        transport.write(vec![Frame::text("2"), Frame::text("40")]).unwrap();
        assert!(!transport.drain());
        assert_eq!(
            transport.take_payload(PayloadStyle::LengthPrefixed),
            Bytes::from_static(b"1:22:40")
        );
        assert!(transport.drain());
        assert_eq!(transport.take_payload(PayloadStyle::LengthPrefixed), Bytes::new());
    }

    #[tokio::test]
    async fn test_polling_b64_client_gets_text() {
        let transport = PollingTransport::new(true);
        transport
            .write(vec![Frame::binary(Bytes::from_static(&[4, 1, 2, 3]))])
            .unwrap();
        assert_eq!(
            transport.take_payload(PayloadStyle::RecordSeparated),
            Bytes::from_static(b"b4AQID")
        );
    }

    #[test]
    fn test_text_frame_reencoding_for_b64_clients() {
        let frame = to_text_frame(&Frame::binary(Bytes::from_static(&[4, 0xff])));
        assert_eq!(frame, Frame::text("b4/w=="));
        assert_eq!(to_text_frame(&Frame::text("42")), Frame::text("42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_wait_wakes_on_write() {
        let transport = PollingTransport::new(false);
        let waiter = transport.clone();
        let poll = tokio::spawn(async move {
            waiter.wait_for_frames().await;
            waiter.buffered()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.write(vec![Frame::text("6")]).unwrap();
        assert_eq!(poll.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_polling_write_after_close() {
        let transport = PollingTransport::new(false);
        transport.close();
        assert!(transport.is_closed());
        assert_eq!(transport.write(vec![Frame::text("6")]), Err(TransportError::Closed));
        transport.wait_for_frames().await;
    }

    #[tokio::test]
    async fn test_socket_forwards_frames() {
        let (transport, mut rx) = SocketTransport::new(false);
        transport.write(vec![Frame::text("3probe")]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Frame::text("3probe"));
        assert!(transport.drain());

        transport.close();
        assert!(transport.is_closed());
        assert!(transport.write(vec![Frame::text("6")]).is_err());
        assert!(rx.recv().await.is_none());
    }
}
