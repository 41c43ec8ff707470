//! Session manager.
//!
//! The manager owns the session arena and every collaborator a session
//! needs: the deadline scheduler, the ack correlator, the namespace registry
//! and the storage delegates. All entry points (frontend I/O, timer
//! callbacks, application calls, cluster relays) go through
//! [`SessionManager::with_session`], which holds the session's lock for the
//! duration of one transition and runs listener callbacks after releasing
//! it.

use crate::ack::{AckCorrelator, AckOutcome};
use crate::deadline::{DeadlineKind, SessionKey};
use crate::error::SessionError;
use crate::handshake::{open_params, AllowAll, Authorizer, HandshakeRequest};
use crate::keepalive::{liveness_window, HeartbeatMode};
use crate::namespace::{InboundEvent, Namespace, NamespaceListener, NamespaceRegistry};
use crate::session::{CloseReason, EngineConfig, Origin, Session, SessionId, SessionState};
use crate::transport::{PollingTransport, Transport, TransportId};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use switchboard_scheduler::{Affinity, DeadlineScheduler};
use switchboard_storage::{
    ClusterFrame, ClusterKind, ClusterListener, ClusterMessage, NodeId, SessionStore, Storage,
};
use switchboard_wire::{
    encode_packet_with, ArgSpec, EventTypeRegistry, Frame, FrameKind, JsonSupport, Packet,
    SerdeJsonSupport, ROOT_NAMESPACE,
};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Listener callback collected under the session lock, run after it
pub(crate) enum Delivery {
    Connect(Arc<dyn NamespaceListener>, String),
    Disconnect(Arc<dyn NamespaceListener>, String),
    Event(Arc<dyn NamespaceListener>, InboundEvent),
}

pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) node_id: NodeId,
    pub(crate) sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    pub(crate) scheduler: DeadlineScheduler<SessionKey>,
    pub(crate) acks: AckCorrelator,
    pub(crate) namespaces: NamespaceRegistry,
    pub(crate) events: Arc<EventTypeRegistry>,
    pub(crate) json: Arc<dyn JsonSupport>,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) storage: Storage,
    pub(crate) runtime: Handle,
}

/// Builder for [`SessionManager`]
pub struct SessionManagerBuilder {
    config: EngineConfig,
    node_id: NodeId,
    storage: Option<Storage>,
    authorizer: Arc<dyn Authorizer>,
    json: Arc<dyn JsonSupport>,
    events: EventTypeRegistry,
}

impl SessionManagerBuilder {
    /// Storage collaborators; in-memory when unset
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Handshake authorizer; [`AllowAll`] when unset
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// JSON delegate; `serde_json` when unset
    pub fn json(mut self, json: Arc<dyn JsonSupport>) -> Self {
        self.json = json;
        self
    }

    /// Argument types of inbound events
    pub fn events(mut self, events: EventTypeRegistry) -> Self {
        self.events = events;
        self
    }

    /// Build the manager. Must be called within a Tokio runtime.
    pub fn build(self) -> SessionManager {
        let scheduler = DeadlineScheduler::new(self.config.wheel.clone());
        let storage = self
            .storage
            .unwrap_or_else(|| Storage::in_memory(self.node_id));

        SessionManager {
            shared: Arc::new(Shared {
                acks: AckCorrelator::new(scheduler.clone()),
                scheduler,
                config: self.config,
                node_id: self.node_id,
                sessions: DashMap::new(),
                namespaces: NamespaceRegistry::new(),
                events: Arc::new(self.events),
                json: self.json,
                authorizer: self.authorizer,
                storage,
                runtime: Handle::current(),
            }),
        }
    }
}

/// Coordinates every session of one server node
#[derive(Clone)]
pub struct SessionManager {
    pub(crate) shared: Arc<Shared>,
}

impl SessionManager {
    /// Start building a manager for node `node_id`
    pub fn builder(config: EngineConfig, node_id: NodeId) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            node_id,
            storage: None,
            authorizer: Arc::new(AllowAll),
            json: Arc::new(SerdeJsonSupport),
            events: EventTypeRegistry::new(),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Local node id
    pub fn node_id(&self) -> NodeId {
        self.shared.node_id
    }

    /// Start the deadline driver and subscribe to cluster topics
    pub async fn start(&self) -> Result<(), SessionError> {
        self.shared.scheduler.start();

        let relay: Arc<dyn ClusterListener> = Arc::new(ClusterRelay {
            shared: Arc::downgrade(&self.shared),
        });
        for kind in ClusterKind::all() {
            self.shared
                .storage
                .pubsub
                .subscribe(kind.topic(), relay.clone())
                .await?;
        }
        info!(node = %self.shared.node_id, "session manager started");
        Ok(())
    }

    /// Close every session, leave the cluster and stop the driver
    pub async fn shutdown(&self) {
        for kind in ClusterKind::all() {
            if let Err(e) = self.shared.storage.pubsub.unsubscribe(kind.topic()).await {
                warn!(topic = kind.topic(), error = %e, "unsubscribe failed");
            }
        }

        let sids: Vec<SessionId> = self.shared.sessions.iter().map(|entry| *entry.key()).collect();
        let closing = sids.len();
        for sid in sids {
            let _ = self.with_session(sid, |session, deliveries| {
                self.close_locked(session, CloseReason::Shutdown, deliveries)
            });
        }
        self.shared.scheduler.shutdown();
        info!(node = %self.shared.node_id, closed = closing, "session manager stopped");
    }

    /// Register (or replace) a namespace
    pub fn register_namespace(
        &self,
        name: impl Into<String>,
        listener: Option<Arc<dyn NamespaceListener>>,
    ) -> Arc<Namespace> {
        self.shared.namespaces.register(name, listener)
    }

    /// Namespace by name
    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.shared.namespaces.get(name)
    }

    /// Number of sessions in the arena
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// State of a session; `None` once it is gone
    pub fn state(&self, sid: SessionId) -> Option<SessionState> {
        self.session(sid).ok().map(|session| session.lock().state())
    }

    /// Namespaces a session has connected to
    pub fn namespaces_of(&self, sid: SessionId) -> Vec<String> {
        self.session(sid)
            .map(|session| session.lock().namespaces().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Scratch store of a session
    pub fn store(&self, sid: SessionId) -> Option<Arc<dyn SessionStore>> {
        self.session(sid).ok().and_then(|session| session.lock().store.clone())
    }

    /// Run the handshake for a new connection and open a session on it.
    ///
    /// The authorizer must answer before the first-data deadline. On
    /// rejection or timeout no session remains and `transport` is closed.
    pub async fn connect(
        &self,
        request: HandshakeRequest,
        transport: Arc<dyn Transport>,
    ) -> Result<SessionId, SessionError> {
        let shared = &self.shared;
        let sid = SessionId::new();
        shared.sessions.insert(
            sid,
            Arc::new(Mutex::new(Session::new(sid, request.clone(), transport.clone()))),
        );
        shared.scheduler.rebind_affinity(sid, transport.affinity());

        let (expired_tx, expired_rx) = oneshot::channel::<()>();
        shared.scheduler.schedule(
            SessionKey::new(DeadlineKind::FirstData, sid),
            shared.config.first_data_timeout,
            move || {
                let _ = expired_tx.send(());
            },
        );
        debug!(%sid, transport = %request.transport, "handshake started");

        let authorized = tokio::select! {
            authorized = shared.authorizer.authorize(&request) => Some(authorized),
            _ = expired_rx => None,
        };
        match authorized {
            Some(true) => {}
            Some(false) => {
                self.abandon(sid, &transport);
                warn!(%sid, remote = ?request.remote_addr, "handshake rejected");
                return Err(SessionError::Unauthorized);
            }
            None => {
                self.abandon(sid, &transport);
                warn!(%sid, remote = ?request.remote_addr, "handshake timed out");
                return Err(SessionError::HandshakeTimeout);
            }
        }
        shared.scheduler.cancel(&SessionKey::new(DeadlineKind::FirstData, sid));

        let store = match shared.storage.stores.create(&sid.to_string()).await {
            Ok(store) => store,
            Err(e) => {
                self.abandon(sid, &transport);
                return Err(e.into());
            }
        };

        let opened = self
            .with_session(sid, |session, _| -> Result<Option<Arc<dyn NamespaceListener>>, SessionError> {
                session.open(store)?;
                self.write_packet(&session.active, &Packet::open(open_params(sid, &shared.config)))?;

                self.touch(sid);
                if shared.config.heartbeat == HeartbeatMode::ServerInitiated {
                    self.arm(sid, DeadlineKind::Ping, shared.config.ping_interval, on_ping);
                }

                session.namespaces.insert(ROOT_NAMESPACE.to_string());
                let root = shared.namespaces.join(ROOT_NAMESPACE, sid);
                Ok(root.and_then(|ns| ns.listener().cloned()))
            })
            .and_then(|opened| opened);

        let root_listener = match opened {
            Ok(listener) => listener,
            Err(e) => {
                self.abandon(sid, &transport);
                self.destroy_store(sid);
                return Err(e);
            }
        };

        self.publish(ClusterMessage::new(shared.node_id, ClusterKind::Connect, ROOT_NAMESPACE).with_session(sid.to_string()));
        if let Some(listener) = root_listener {
            listener.on_connect(self, sid, ROOT_NAMESPACE);
        }
        info!(%sid, transport = %transport.kind(), "session opened");
        Ok(sid)
    }

    /// Register `transport` as the upgrade candidate of an open session
    pub fn attach(&self, sid: SessionId, transport: Arc<dyn Transport>) -> Result<(), SessionError> {
        let kind = transport.kind();
        if !self.shared.config.upgrades.iter().any(|name| name == kind.as_str()) {
            return Err(SessionError::Upgrade("transport not allowed"));
        }

        self.with_session(sid, |session, _| -> Result<(), SessionError> {
            session.attach_candidate(transport)?;
            self.arm(sid, DeadlineKind::UpgradeTimeout, self.shared.config.upgrade_timeout, on_upgrade_timeout);
            debug!(%sid, transport = %kind, "upgrade candidate attached");
            Ok(())
        })?
    }

    /// Serve one poll: take the buffered payload and bind the session's
    /// timers to the context serving this request.
    ///
    /// Call [`PollingTransport::wait_for_frames`] first to hold the poll open.
    pub fn poll(
        &self,
        sid: SessionId,
        transport: &PollingTransport,
        affinity: Option<Arc<dyn Affinity>>,
    ) -> Result<Bytes, SessionError> {
        self.with_session(sid, |session, _| -> Result<Bytes, SessionError> {
            let origin = session
                .origin(transport.id())
                .ok_or_else(|| SessionError::BadRequest("poll on a transport the session does not own".to_string()))?;
            if let Some(affinity) = affinity {
                transport.set_affinity(affinity.clone());
                if origin == Origin::Active {
                    self.shared.scheduler.rebind_affinity(sid, affinity);
                }
            }

            let payload = transport.take_payload(self.shared.config.payload_style);
            if origin == Origin::Active && session.state == SessionState::Upgrading && transport.drain() {
                self.complete_upgrade_locked(session);
            }
            Ok(payload)
        })?
    }

    /// The frontend lost the connection behind `transport`
    pub fn transport_closed(&self, sid: SessionId, transport: TransportId) -> Result<(), SessionError> {
        self.with_session(sid, |session, deliveries| match session.origin(transport) {
            Some(Origin::Active) => self.close_locked(session, CloseReason::TransportClosed, deliveries),
            Some(Origin::Candidate) => {
                if session.abort_upgrade().is_some() {
                    self.shared
                        .scheduler
                        .cancel(&SessionKey::new(DeadlineKind::UpgradeTimeout, sid));
                    debug!(%sid, "upgrade candidate went away");
                }
            }
            None => trace!(%sid, %transport, "close of a retired transport"),
        })
    }

    /// Send an EVENT on a namespace the session has joined
    pub fn emit(&self, sid: SessionId, namespace: &str, name: &str, args: Vec<Value>) -> Result<(), SessionError> {
        self.send_packet(sid, Packet::event(namespace, name, args))
    }

    /// Send an EVENT requesting an ack. The receiver yields the reply, the
    /// configured timeout, or the session closing, whichever comes first.
    pub fn emit_with_ack(
        &self,
        sid: SessionId,
        namespace: &str,
        name: &str,
        args: Vec<Value>,
        reply: ArgSpec,
    ) -> Result<oneshot::Receiver<AckOutcome>, SessionError> {
        self.session(sid)?;
        let (ack_id, outcome) = self.shared.acks.register(sid, reply, self.shared.config.ack_timeout);

        let packet = Packet::event(namespace, name, args).with_ack_id(ack_id);
        if let Err(e) = self.send_packet(sid, packet) {
            match e {
                SessionError::NotFound(_) | SessionError::Closed(_) => {
                    self.shared.acks.release_session(sid);
                }
                _ => {
                    self.shared.acks.complete(sid, ack_id, AckOutcome::SessionClosed);
                }
            }
            return Err(e);
        }
        Ok(outcome)
    }

    /// Answer an ack the client requested
    pub fn send_ack(&self, sid: SessionId, namespace: &str, ack_id: u64, args: Vec<Value>) -> Result<(), SessionError> {
        self.send_packet(sid, Packet::ack(namespace, ack_id, args))
    }

    /// Write any packet to a session. Messages must target a joined namespace.
    pub fn send_packet(&self, sid: SessionId, packet: Packet) -> Result<(), SessionError> {
        self.with_session(sid, |session, _| -> Result<(), SessionError> {
            if !session.state.is_live() {
                return Err(SessionError::Closed(sid));
            }
            if packet.message_type.is_some() && !session.namespaces.contains(&packet.namespace) {
                return Err(SessionError::UnknownNamespace(packet.namespace.clone()));
            }
            self.write_packet(&session.active, &packet)
        })?
    }

    /// Send `packet` to every member of `namespace` (or of one of its rooms),
    /// here and on other nodes. Returns the number of local deliveries.
    pub fn broadcast(
        &self,
        namespace: &str,
        room: Option<&str>,
        mut packet: Packet,
        except: Option<SessionId>,
    ) -> Result<usize, SessionError> {
        namespace.clone_into(&mut packet.namespace);
        let frames = encode_packet_with(&packet, self.shared.json.as_ref())?;
        let delivered = self.deliver_local(namespace, room, &frames, except);

        let mut message = ClusterMessage::new(self.shared.node_id, ClusterKind::Dispatch, namespace)
            .with_frames(frames.iter().map(cluster_frame).collect());
        if let Some(room) = room {
            message = message.with_room(room);
        }
        self.publish(message);

        debug!(nsp = %namespace, room = ?room, delivered, "broadcast");
        Ok(delivered)
    }

    /// Add a session to a room of a namespace it has joined
    pub fn join_room(&self, sid: SessionId, namespace: &str, room: &str) -> Result<bool, SessionError> {
        self.with_session(sid, |session, _| -> Result<bool, SessionError> {
            if !session.namespaces.contains(namespace) {
                return Err(SessionError::UnknownNamespace(namespace.to_string()));
            }
            let joined = self.shared.namespaces.join_room(namespace, room, sid);
            if joined {
                self.publish(
                    ClusterMessage::new(self.shared.node_id, ClusterKind::Join, namespace)
                        .with_room(room)
                        .with_session(sid.to_string()),
                );
            }
            Ok(joined)
        })?
    }

    /// Remove a session from a room
    pub fn leave_room(&self, sid: SessionId, namespace: &str, room: &str) -> Result<bool, SessionError> {
        self.with_session(sid, |_, _| {
            let left = self.shared.namespaces.leave_room(namespace, room, sid);
            if left {
                self.publish(
                    ClusterMessage::new(self.shared.node_id, ClusterKind::Leave, namespace)
                        .with_room(room)
                        .with_session(sid.to_string()),
                );
            }
            left
        })
    }

    /// Server-side disconnect: tell the client, then close
    pub fn disconnect(&self, sid: SessionId) -> Result<(), SessionError> {
        self.with_session(sid, |session, deliveries| {
            if session.state.is_live() {
                if let Err(e) = self.write_packet(&session.active, &Packet::disconnect(ROOT_NAMESPACE)) {
                    debug!(%sid, error = %e, "disconnect notice not sent");
                }
            }
            self.close_locked(session, CloseReason::ServerDisconnect, deliveries);
        })
    }

    pub(crate) fn session(&self, sid: SessionId) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.shared
            .sessions
            .get(&sid)
            .map(|entry| entry.value().clone())
            .ok_or(SessionError::NotFound(sid))
    }

    /// Run one transition under the session lock, then its deliveries
    pub(crate) fn with_session<R>(
        &self,
        sid: SessionId,
        f: impl FnOnce(&mut Session, &mut Vec<Delivery>) -> R,
    ) -> Result<R, SessionError> {
        let session = self.session(sid)?;
        let mut deliveries = Vec::new();
        let result = {
            let mut guard = session.lock();
            f(&mut guard, &mut deliveries)
        };
        self.deliver(sid, deliveries);
        Ok(result)
    }

    fn deliver(&self, sid: SessionId, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Connect(listener, namespace) => listener.on_connect(self, sid, &namespace),
                Delivery::Disconnect(listener, namespace) => listener.on_disconnect(self, sid, &namespace),
                Delivery::Event(listener, event) => listener.on_event(self, sid, event),
            }
        }
    }

    pub(crate) fn write_packet(&self, transport: &Arc<dyn Transport>, packet: &Packet) -> Result<(), SessionError> {
        let frames = encode_packet_with(packet, self.shared.json.as_ref())?;
        transport.write(frames)?;
        Ok(())
    }

    /// Arm `kind` for `sid`; the callback runs on the session's affinity
    pub(crate) fn arm(&self, sid: SessionId, kind: DeadlineKind, delay: Duration, on_fire: fn(&SessionManager, SessionId)) {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        self.shared.scheduler.schedule(SessionKey::new(kind, sid), delay, move || {
            if let Some(shared) = shared.upgrade() {
                on_fire(&SessionManager { shared }, sid);
            }
        });
    }

    /// Liveness seen: push the ping deadline out
    pub(crate) fn touch(&self, sid: SessionId) {
        self.arm(sid, DeadlineKind::PingTimeout, liveness_window(&self.shared.config), on_ping_timeout);
    }

    pub(crate) fn complete_upgrade_locked(&self, session: &mut Session) {
        let sid = session.id();
        if let Some(retired) = session.complete_upgrade() {
            retired.close();
            self.shared
                .scheduler
                .cancel(&SessionKey::new(DeadlineKind::UpgradeTimeout, sid));
            self.shared.scheduler.rebind_affinity(sid, session.active.affinity());
            info!(%sid, from = %retired.kind(), to = %session.active.kind(), "upgrade complete");
        }
    }

    /// Tear a session down. Idempotent.
    pub(crate) fn close_locked(&self, session: &mut Session, reason: CloseReason, deliveries: &mut Vec<Delivery>) {
        if session.state == SessionState::Closed {
            return;
        }
        let sid = session.id();
        let shared = &self.shared;
        session.state = SessionState::Closed;

        shared.scheduler.cancel_owner(&sid);
        session.decoder.reset();

        for name in session.namespaces.drain() {
            if let Some(namespace) = shared.namespaces.get(&name) {
                namespace.leave(sid);
                if let Some(listener) = namespace.listener() {
                    deliveries.push(Delivery::Disconnect(listener.clone(), name.clone()));
                }
            }
            self.publish(ClusterMessage::new(shared.node_id, ClusterKind::Disconnect, name).with_session(sid.to_string()));
        }

        shared.acks.release_session(sid);
        if session.store.take().is_some() {
            self.destroy_store(sid);
        }

        session.active.close();
        if let Some(candidate) = session.candidate.take() {
            candidate.close();
        }
        shared.sessions.remove(&sid);
        info!(%sid, %reason, "session closed");
    }

    /// Drop a session that never opened
    fn abandon(&self, sid: SessionId, transport: &Arc<dyn Transport>) {
        self.shared.scheduler.cancel_owner(&sid);
        self.shared.sessions.remove(&sid);
        transport.close();
    }

    fn destroy_store(&self, sid: SessionId) {
        let stores = self.shared.storage.stores.clone();
        self.shared.runtime.spawn(async move {
            if let Err(e) = stores.destroy(&sid.to_string()).await {
                warn!(%sid, error = %e, "session store not destroyed");
            }
        });
    }

    pub(crate) fn publish(&self, message: ClusterMessage) {
        let pubsub = self.shared.storage.pubsub.clone();
        self.shared.runtime.spawn(async move {
            let topic = message.kind.topic();
            if let Err(e) = pubsub.publish(topic, message).await {
                warn!(topic, error = %e, "cluster publish failed");
            }
        });
    }

    /// Write pre-encoded frames to local members. Members that left or
    /// closed since the roster snapshot are skipped.
    fn deliver_local(&self, namespace: &str, room: Option<&str>, frames: &[Frame], except: Option<SessionId>) -> usize {
        let Some(ns) = self.shared.namespaces.get(namespace) else {
            return 0;
        };
        let members = match room {
            Some(room) => ns.local_room_members(room),
            None => ns.members(),
        };

        let mut delivered = 0;
        for sid in members {
            if except == Some(sid) {
                continue;
            }
            let Ok(session) = self.session(sid) else {
                trace!(%sid, nsp = %namespace, "member departed before broadcast");
                continue;
            };
            let session = session.lock();
            if !session.state.is_live() || !session.namespaces.contains(namespace) {
                continue;
            }
            match session.send(frames.to_vec()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(%sid, error = %e, "broadcast write failed"),
            }
        }
        delivered
    }
}

fn cluster_frame(frame: &Frame) -> ClusterFrame {
    ClusterFrame {
        binary: frame.kind == FrameKind::Binary,
        data: frame.data.clone(),
    }
}

fn on_ping_timeout(manager: &SessionManager, sid: SessionId) {
    let _ = manager.with_session(sid, |session, deliveries| {
        warn!(%sid, "no ping within the liveness window");
        manager.close_locked(session, CloseReason::PingTimeout, deliveries);
    });
}

fn on_ping(manager: &SessionManager, sid: SessionId) {
    let _ = manager.with_session(sid, |session, _| {
        if !session.state.is_live() {
            return;
        }
        if let Err(e) = manager.write_packet(&session.active, &Packet::ping("")) {
            debug!(%sid, error = %e, "ping not sent");
        }
        manager.arm(sid, DeadlineKind::Ping, manager.shared.config.ping_interval, on_ping);
    });
}

pub(crate) fn on_upgrade_timeout(manager: &SessionManager, sid: SessionId) {
    let _ = manager.with_session(sid, |session, _| {
        if let Some(candidate) = session.abort_upgrade() {
            candidate.close();
            warn!(%sid, "upgrade timed out, staying on {}", session.active.kind());
        }
    });
}

/// Applies other nodes' cluster messages to local rosters
struct ClusterRelay {
    shared: Weak<Shared>,
}

impl ClusterListener for ClusterRelay {
    fn on_message(&self, message: ClusterMessage) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let manager = SessionManager { shared };

        match message.kind {
            ClusterKind::Dispatch => {
                let frames: Vec<Frame> = message
                    .frames
                    .into_iter()
                    .map(|frame| Frame {
                        kind: if frame.binary { FrameKind::Binary } else { FrameKind::Text },
                        data: frame.data,
                    })
                    .collect();
                let delivered = manager.deliver_local(&message.namespace, message.room.as_deref(), &frames, None);
                debug!(node = %message.node_id, nsp = %message.namespace, delivered, "relayed dispatch");
            }
            kind => manager.apply_remote_membership(kind, &message),
        }
    }
}

impl SessionManager {
    /// Mirror a room change of another node's session into the remote roster
    fn apply_remote_membership(&self, kind: ClusterKind, message: &ClusterMessage) {
        let Some(namespace) = self.shared.namespaces.get(&message.namespace) else {
            trace!(nsp = %message.namespace, "membership change for unknown namespace");
            return;
        };
        let Some(sid) = message.session_id.as_deref().and_then(|sid| sid.parse::<SessionId>().ok()) else {
            debug!(node = %message.node_id, ?kind, "membership change without a valid session id");
            return;
        };

        match (kind, message.room.as_deref()) {
            (ClusterKind::Join, Some(room)) => {
                namespace.join_remote_room(room, sid);
            }
            (ClusterKind::Leave, Some(room)) => {
                namespace.leave_remote_room(room, sid);
            }
            (ClusterKind::Disconnect, _) => namespace.forget_remote(sid),
            _ => {}
        }
        debug!(node = %message.node_id, ?kind, nsp = %message.namespace, %sid, room = ?message.room, "remote membership change");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SocketTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use switchboard_storage::{MemoryHub, MemoryPubSub, MemoryStoreFactory};
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Default)]
    struct Recorder {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        events: Mutex<Vec<InboundEvent>>,
    }

    impl NamespaceListener for Recorder {
        fn on_connect(&self, _manager: &SessionManager, _sid: SessionId, _namespace: &str) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self, _manager: &SessionManager, _sid: SessionId, _namespace: &str) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_event(&self, _manager: &SessionManager, _sid: SessionId, event: InboundEvent) {
            self.events.lock().push(event);
        }
    }

    struct Deny;

    #[async_trait]
    impl Authorizer for Deny {
        async fn authorize(&self, _request: &HandshakeRequest) -> bool {
            false
        }
    }

    struct Never;

    #[async_trait]
    impl Authorizer for Never {
        async fn authorize(&self, _request: &HandshakeRequest) -> bool {
            std::future::pending().await
        }
    }

    fn text(frame: Frame) -> String {
        frame.as_str().unwrap().to_string()
    }

    fn short_config() -> EngineConfig {
        EngineConfig {
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(1),
            upgrade_timeout: Duration::from_secs(1),
            first_data_timeout: Duration::from_millis(200),
            ack_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        }
    }

    async fn open_socket(manager: &SessionManager) -> (SessionId, Arc<SocketTransport>, UnboundedReceiver<Frame>) {
        let (transport, mut rx) = SocketTransport::new(false);
        let sid = manager
            .connect(HandshakeRequest::default(), transport.clone())
            .await
            .unwrap();
        let open = text(rx.recv().await.unwrap());
        assert!(open.starts_with("0{"));
        assert!(open.contains(&sid.to_string()));
        (sid, transport, rx)
    }

    fn receive(manager: &SessionManager, sid: SessionId, transport: &dyn Transport, data: &str) -> Result<(), SessionError> {
        manager.receive(sid, transport.id(), vec![Frame::text(data)])
    }

    #[tokio::test]
    async fn test_open_and_ping_pong() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let (sid, transport, mut rx) = open_socket(&manager).await;

        assert_eq!(manager.state(sid), Some(SessionState::Open));
        assert_eq!(manager.namespaces_of(sid), vec!["".to_string()]);
        assert!(manager.store(sid).is_some());

        receive(&manager, sid, transport.as_ref(), "2hello").unwrap();
        assert_eq!(text(rx.recv().await.unwrap()), "3hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout_closes_exactly_once() {
        let manager = SessionManager::builder(short_config(), NodeId(1)).build();
        manager.start().await.unwrap();
        let root = Arc::new(Recorder::default());
        manager.register_namespace("", Some(root.clone()));

        let (sid, transport, _rx) = open_socket(&manager).await;
        assert_eq!(root.connects.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(manager.state(sid), None);
        assert!(transport.is_closed());
        assert_eq!(root.disconnects.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(root.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_keeps_session_alive() {
        let manager = SessionManager::builder(short_config(), NodeId(1)).build();
        manager.start().await.unwrap();
        let (sid, transport, _rx) = open_socket(&manager).await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            receive(&manager, sid, transport.as_ref(), "2").unwrap();
        }
        assert_eq!(manager.state(sid), Some(SessionState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_initiated_ping() {
        let config = EngineConfig {
            heartbeat: HeartbeatMode::ServerInitiated,
            ..short_config()
        };
        let manager = SessionManager::builder(config, NodeId(1)).build();
        manager.start().await.unwrap();
        let (sid, transport, mut rx) = open_socket(&manager).await;

        assert_eq!(text(rx.recv().await.unwrap()), "2");
        receive(&manager, sid, transport.as_ref(), "3").unwrap();
        assert_eq!(text(rx.recv().await.unwrap()), "2");
        assert_eq!(manager.state(sid), Some(SessionState::Open));
    }

    #[tokio::test]
    async fn test_unknown_namespace_yields_error_and_stays_open() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let (sid, transport, mut rx) = open_socket(&manager).await;

        receive(&manager, sid, transport.as_ref(), "40/missing,").unwrap();
        assert_eq!(text(rx.recv().await.unwrap()), r#"44/missing,"Invalid namespace""#);
        assert_eq!(manager.state(sid), Some(SessionState::Open));
        assert_eq!(manager.namespaces_of(sid), vec!["".to_string()]);
    }

    #[tokio::test]
    async fn test_namespace_connect_event_and_ack() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let chat = Arc::new(Recorder::default());
        manager.register_namespace("/chat", Some(chat.clone()));
        let (sid, transport, mut rx) = open_socket(&manager).await;

        receive(&manager, sid, transport.as_ref(), "40/chat,").unwrap();
        let reply = text(rx.recv().await.unwrap());
        assert_eq!(reply, format!(r#"40/chat,{{"sid":"{}"}}"#, sid));
        assert_eq!(chat.connects.load(Ordering::SeqCst), 1);

        receive(&manager, sid, transport.as_ref(), r#"42/chat,7["hello","x"]"#).unwrap();
        let events = chat.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "hello");
        assert_eq!(events[0].args, vec![json!("x")]);
        assert_eq!(events[0].ack_id, Some(7));

        manager.send_ack(sid, "/chat", 7, vec![json!("ok")]).unwrap();
        assert_eq!(text(rx.recv().await.unwrap()), r#"43/chat,7["ok"]"#);

        receive(&manager, sid, transport.as_ref(), "41/chat,").unwrap();
        assert_eq!(chat.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(sid), Some(SessionState::Open));
        assert!(matches!(
            manager.emit(sid, "/chat", "gone", vec![]),
            Err(SessionError::UnknownNamespace(_))
        ));
    }

    #[tokio::test]
    async fn test_repeated_connect_fires_once() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let chat = Arc::new(Recorder::default());
        manager.register_namespace("/chat", Some(chat.clone()));
        let (sid, transport, mut rx) = open_socket(&manager).await;

        receive(&manager, sid, transport.as_ref(), "40/chat,").unwrap();
        rx.recv().await.unwrap();
        receive(&manager, sid, transport.as_ref(), r#"40/chat,{"token":"t"}"#).unwrap();
        let reply = text(rx.recv().await.unwrap());
        assert_eq!(reply, format!(r#"40/chat,{{"sid":"{}"}}"#, sid));

        tokio::task::yield_now().await;
        assert_eq!(chat.connects.load(Ordering::SeqCst), 1);
        let mut namespaces = manager.namespaces_of(sid);
        namespaces.sort();
        assert_eq!(namespaces, vec!["".to_string(), "/chat".to_string()]);
    }

    #[tokio::test]
    async fn test_event_on_unjoined_namespace_dropped() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let other = Arc::new(Recorder::default());
        manager.register_namespace("/other", Some(other.clone()));
        let (sid, transport, _rx) = open_socket(&manager).await;

        receive(&manager, sid, transport.as_ref(), r#"42/other,["x"]"#).unwrap();
        assert!(other.events.lock().is_empty());
        assert_eq!(manager.state(sid), Some(SessionState::Open));
    }

    #[tokio::test]
    async fn test_binary_event_delivered_after_attachments() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let root = Arc::new(Recorder::default());
        manager.register_namespace("", Some(root.clone()));
        let (sid, transport, _rx) = open_socket(&manager).await;

        receive(
            &manager,
            sid,
            transport.as_ref(),
            r#"451-["upload",{"_placeholder":true,"num":0}]"#,
        )
        .unwrap();
        assert!(root.events.lock().is_empty());

        manager
            .receive(sid, transport.id(), vec![Frame::binary(Bytes::from_static(&[4, 1, 2, 3]))])
            .unwrap();
        let events = root.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].args, vec![json!("AQID")]);
        assert_eq!(events[0].attachments, vec![Bytes::from_static(&[1, 2, 3])]);
    }

    #[tokio::test]
    async fn test_decode_error_closes_session() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let (sid, transport, _rx) = open_socket(&manager).await;

        let result = receive(&manager, sid, transport.as_ref(), "9");
        assert!(matches!(result, Err(SessionError::Wire(_))));
        assert_eq!(manager.state(sid), None);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_root_disconnect_and_close_packet() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let (a, transport_a, _rx_a) = open_socket(&manager).await;
        let (b, transport_b, _rx_b) = open_socket(&manager).await;

        receive(&manager, a, transport_a.as_ref(), "41").unwrap();
        assert_eq!(manager.state(a), None);

        receive(&manager, b, transport_b.as_ref(), "1").unwrap();
        assert_eq!(manager.state(b), None);
        assert_eq!(manager.session_count(), 0);
        assert!(matches!(
            receive(&manager, b, transport_b.as_ref(), "2"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_authorization_rejected() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1))
            .authorizer(Arc::new(Deny))
            .build();
        let (transport, _rx) = SocketTransport::new(false);

        let result = manager.connect(HandshakeRequest::default(), transport.clone()).await;
        assert!(matches!(result, Err(SessionError::Unauthorized)));
        assert_eq!(manager.session_count(), 0);
        assert!(transport.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let manager = SessionManager::builder(short_config(), NodeId(1))
            .authorizer(Arc::new(Never))
            .build();
        manager.start().await.unwrap();
        let (transport, _rx) = SocketTransport::new(false);

        let result = manager.connect(HandshakeRequest::default(), transport.clone()).await;
        assert!(matches!(result, Err(SessionError::HandshakeTimeout)));
        assert_eq!(manager.session_count(), 0);
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_upgrade_swaps_transport() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let polling = PollingTransport::new(false);
        let sid = manager
            .connect(HandshakeRequest::default(), polling.clone())
            .await
            .unwrap();

        let (socket, mut socket_rx) = SocketTransport::new(false);
        manager.attach(sid, socket.clone()).unwrap();

        receive(&manager, sid, socket.as_ref(), "2probe").unwrap();
        assert_eq!(text(socket_rx.recv().await.unwrap()), "3probe");

        receive(&manager, sid, socket.as_ref(), "5").unwrap();
        assert_eq!(manager.state(sid), Some(SessionState::Upgrading));

        // OPEN and the NOOP are still buffered on the old transport
        let body = manager.poll(sid, &polling, None).unwrap();
        assert!(body.ends_with(b"1:6"));
        assert_eq!(manager.state(sid), Some(SessionState::Open));
        assert!(polling.is_closed());

        manager.emit(sid, "", "x", vec![]).unwrap();
        assert_eq!(text(socket_rx.recv().await.unwrap()), r#"42["x"]"#);
    }

    #[tokio::test]
    async fn test_upgrade_completes_when_already_drained() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let polling = PollingTransport::new(false);
        let sid = manager
            .connect(HandshakeRequest::default(), polling.clone())
            .await
            .unwrap();
        manager.poll(sid, &polling, None).unwrap();

        let (socket, _socket_rx) = SocketTransport::new(false);
        manager.attach(sid, socket.clone()).unwrap();
        receive(&manager, sid, socket.as_ref(), "5").unwrap();

        assert_eq!(manager.state(sid), Some(SessionState::Open));
        assert!(polling.is_closed());
        assert!(matches!(
            manager.poll(sid, &polling, None),
            Err(SessionError::BadRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_timeout_keeps_old_transport() {
        let manager = SessionManager::builder(short_config(), NodeId(1)).build();
        manager.start().await.unwrap();
        let polling = PollingTransport::new(false);
        let sid = manager
            .connect(HandshakeRequest::default(), polling.clone())
            .await
            .unwrap();

        let (socket, _socket_rx) = SocketTransport::new(false);
        manager.attach(sid, socket.clone()).unwrap();
        receive(&manager, sid, socket.as_ref(), "5").unwrap();
        assert_eq!(manager.state(sid), Some(SessionState::Upgrading));

        // keep the session alive past the upgrade deadline
        tokio::time::sleep(Duration::from_millis(700)).await;
        receive(&manager, sid, polling.as_ref(), "2").unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(manager.state(sid), Some(SessionState::Open));
        assert!(socket.is_closed());
        assert!(!polling.is_closed());
    }

    #[tokio::test]
    async fn test_attach_rejects_disallowed_transport() {
        let config = EngineConfig {
            upgrades: Vec::new(),
            ..Default::default()
        };
        let manager = SessionManager::builder(config, NodeId(1)).build();
        let polling = PollingTransport::new(false);
        let sid = manager
            .connect(HandshakeRequest::default(), polling.clone())
            .await
            .unwrap();
        let (socket, _rx) = SocketTransport::new(false);
        assert!(matches!(manager.attach(sid, socket), Err(SessionError::Upgrade(_))));
    }

    #[tokio::test]
    async fn test_ack_reply_resolves() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let (sid, transport, mut rx) = open_socket(&manager).await;

        let outcome = manager
            .emit_with_ack(sid, "", "question", vec![json!(1)], ArgSpec::any())
            .unwrap();
        assert_eq!(text(rx.recv().await.unwrap()), r#"420["question",1]"#);

        receive(&manager, sid, transport.as_ref(), r#"430["answer"]"#).unwrap();
        assert_eq!(outcome.await.unwrap(), AckOutcome::Reply(vec![json!("answer")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_timeout_is_dropped() {
        let manager = SessionManager::builder(short_config(), NodeId(1)).build();
        manager.start().await.unwrap();
        let (sid, transport, _rx) = open_socket(&manager).await;

        let outcome = manager
            .emit_with_ack(sid, "", "question", vec![], ArgSpec::any())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(outcome.await.unwrap(), AckOutcome::TimedOut);

        receive(&manager, sid, transport.as_ref(), r#"430["late"]"#).unwrap();
        assert_eq!(manager.state(sid), Some(SessionState::Open));
    }

    #[tokio::test]
    async fn test_close_releases_pending_acks() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        let (sid, _transport, _rx) = open_socket(&manager).await;

        let outcome = manager
            .emit_with_ack(sid, "", "question", vec![], ArgSpec::any())
            .unwrap();
        manager.disconnect(sid).unwrap();
        assert_eq!(outcome.await.unwrap(), AckOutcome::SessionClosed);
        assert!(manager.emit_with_ack(sid, "", "question", vec![], ArgSpec::any()).is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_departed_members() {
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1)).build();
        manager.register_namespace("/chat", None);
        let (a, transport_a, mut rx_a) = open_socket(&manager).await;
        let (b, transport_b, mut rx_b) = open_socket(&manager).await;
        receive(&manager, a, transport_a.as_ref(), "40/chat,").unwrap();
        receive(&manager, b, transport_b.as_ref(), "40/chat,").unwrap();
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        // a roster entry whose session is already gone
        manager.namespace("/chat").unwrap().join(SessionId::new());

        let delivered = manager
            .broadcast("/chat", None, Packet::event("", "news", vec![]), Some(b))
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(text(rx_a.recv().await.unwrap()), r#"42/chat,["news"]"#);

        assert!(manager.join_room(b, "/chat", "lobby").unwrap());
        let delivered = manager
            .broadcast("/chat", Some("lobby"), Packet::event("", "room", vec![]), None)
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(text(rx_b.recv().await.unwrap()), r#"42/chat,["room"]"#);
        assert!(manager.leave_room(b, "/chat", "lobby").unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_relayed_between_nodes() {
        let hub = MemoryHub::new();
        let storage = |node| Storage {
            pubsub: Arc::new(MemoryPubSub::new(hub.clone(), node)),
            stores: Arc::new(MemoryStoreFactory::new()),
        };
        let first = SessionManager::builder(EngineConfig::default(), NodeId(1))
            .storage(storage(NodeId(1)))
            .build();
        let second = SessionManager::builder(EngineConfig::default(), NodeId(2))
            .storage(storage(NodeId(2)))
            .build();
        first.start().await.unwrap();
        second.start().await.unwrap();
        first.register_namespace("/chat", None);
        second.register_namespace("/chat", None);

        let (sid, transport, mut rx) = open_socket(&second).await;
        receive(&second, sid, transport.as_ref(), "40/chat,").unwrap();
        rx.recv().await.unwrap();

        let delivered = first
            .broadcast("/chat", None, Packet::event("", "remote", vec![]), None)
            .unwrap();
        assert_eq!(delivered, 0);

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text(frame), r#"42/chat,["remote"]"#);
    }

    #[tokio::test]
    async fn test_remote_room_membership_mirrored() {
        let hub = MemoryHub::new();
        let storage = |node| Storage {
            pubsub: Arc::new(MemoryPubSub::new(hub.clone(), node)),
            stores: Arc::new(MemoryStoreFactory::new()),
        };
        let first = SessionManager::builder(EngineConfig::default(), NodeId(1))
            .storage(storage(NodeId(1)))
            .build();
        let second = SessionManager::builder(EngineConfig::default(), NodeId(2))
            .storage(storage(NodeId(2)))
            .build();
        first.start().await.unwrap();
        second.start().await.unwrap();
        first.register_namespace("/chat", None);
        second.register_namespace("/chat", None);

        let (sid, transport, mut rx) = open_socket(&first).await;
        receive(&first, sid, transport.as_ref(), "40/chat,").unwrap();
        rx.recv().await.unwrap();
        assert!(first.join_room(sid, "/chat", "lobby").unwrap());

        let remote = second.namespace("/chat").unwrap();
        for _ in 0..50 {
            if !remote.room_members("lobby").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(remote.room_members("lobby"), vec![sid]);
        assert!(remote.local_room_members("lobby").is_empty());
        assert!(!remote.contains(sid));

        // the mirrored member is never written to from the remote node
        let delivered = second
            .broadcast("/chat", Some("lobby"), Packet::event("", "hi", vec![]), None)
            .unwrap();
        assert_eq!(delivered, 0);

        first.disconnect(sid).unwrap();
        for _ in 0..50 {
            if remote.room_members("lobby").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(remote.room_members("lobby").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_store_follows_session() {
        let stores = Arc::new(MemoryStoreFactory::new());
        let storage = Storage {
            pubsub: Arc::new(MemoryPubSub::new(MemoryHub::new(), NodeId(1))),
            stores: stores.clone(),
        };
        let manager = SessionManager::builder(EngineConfig::default(), NodeId(1))
            .storage(storage)
            .build();
        let (sid, transport, _rx) = open_socket(&manager).await;

        let store = manager.store(sid).unwrap();
        store.set("name", json!("ada")).await.unwrap();
        assert_eq!(stores.len(), 1);

        manager.transport_closed(sid, transport.id()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stores.len(), 0);
        assert_eq!(manager.state(sid), None);
    }
}
