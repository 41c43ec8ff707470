//! Inbound frame handling: decode, then apply protocol semantics.

use crate::deadline::DeadlineKind;
use crate::error::SessionError;
use crate::keepalive::PROBE;
use crate::manager::{on_upgrade_timeout, Delivery, SessionManager, Shared};
use crate::namespace::InboundEvent;
use crate::session::{CloseReason, Origin, Session, SessionId, SessionState};
use crate::transport::TransportId;
use bytes::Bytes;
use serde_json::json;
use switchboard_storage::{ClusterKind, ClusterMessage};
use switchboard_wire::{
    decode_payload, ArgSpec, DecodeContext, Frame, JsonSupport, MessageType, Packet, PacketType, Payload,
    ROOT_NAMESPACE,
};
use tracing::{debug, error, trace, warn};

/// Decode hints backed by the manager's registries
struct InboundContext<'a> {
    shared: &'a Shared,
    sid: SessionId,
}

impl DecodeContext for InboundContext<'_> {
    fn json(&self) -> &dyn JsonSupport {
        self.shared.json.as_ref()
    }

    fn event_arg_spec(&self, namespace: &str, event: &str) -> ArgSpec {
        self.shared.events.lookup(namespace, event)
    }

    fn ack_arg_spec(&self, _namespace: &str, ack_id: u64) -> Option<ArgSpec> {
        self.shared.acks.arg_spec(self.sid, ack_id)
    }
}

impl SessionManager {
    /// Feed frames received on `transport`. A structural decode error closes
    /// the session and is returned so the frontend can drop the connection.
    pub fn receive(&self, sid: SessionId, transport: TransportId, frames: Vec<Frame>) -> Result<(), SessionError> {
        self.with_session(sid, |session, deliveries| {
            self.receive_locked(session, transport, frames, deliveries)
        })?
    }

    /// Feed a long-polling request body
    pub fn receive_payload(&self, sid: SessionId, transport: TransportId, body: Bytes) -> Result<(), SessionError> {
        match decode_payload(body, self.shared.config.max_frame_size) {
            Ok(frames) => self.receive(sid, transport, frames),
            Err(e) => {
                error!(%sid, error = %e, "undecodable payload, closing session");
                self.with_session(sid, |session, deliveries| {
                    self.close_locked(session, CloseReason::DecodeError, deliveries)
                })?;
                Err(e.into())
            }
        }
    }

    fn receive_locked(
        &self,
        session: &mut Session,
        transport: TransportId,
        frames: Vec<Frame>,
        deliveries: &mut Vec<Delivery>,
    ) -> Result<(), SessionError> {
        let sid = session.id();
        let origin = session
            .origin(transport)
            .ok_or_else(|| SessionError::BadRequest("frame on a transport the session does not own".to_string()))?;

        for frame in frames {
            match session.state {
                SessionState::Closed => return Err(SessionError::Closed(sid)),
                SessionState::PendingHandshake => {
                    return Err(SessionError::BadRequest("handshake not complete".to_string()))
                }
                SessionState::Open | SessionState::Upgrading => {}
            }

            let ctx = InboundContext {
                shared: &self.shared,
                sid,
            };
            let packet = match session.decoder.decode(frame, &ctx) {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(e) => {
                    error!(%sid, error = %e, "undecodable frame, closing session");
                    self.close_locked(session, CloseReason::DecodeError, deliveries);
                    return Err(e.into());
                }
            };
            self.handle_packet(session, origin, packet, deliveries);
        }
        Ok(())
    }

    fn handle_packet(&self, session: &mut Session, origin: Origin, packet: Packet, deliveries: &mut Vec<Delivery>) {
        let sid = session.id();
        match packet.packet_type {
            PacketType::Ping => {
                let data = packet.payload.text().unwrap_or_default().to_string();
                if origin == Origin::Candidate {
                    if data == PROBE {
                        self.reply(session, Origin::Candidate, &Packet::pong(PROBE));
                        self.reply(session, Origin::Active, &Packet::new(PacketType::Noop));
                        debug!(%sid, "upgrade probe answered");
                    } else {
                        debug!(%sid, "ping on candidate transport ignored");
                    }
                    return;
                }
                self.touch(sid);
                self.reply(session, Origin::Active, &Packet::pong(data));
            }
            PacketType::Pong => self.touch(sid),
            PacketType::Upgrade => {
                if origin != Origin::Candidate {
                    warn!(%sid, "upgrade on the active transport ignored");
                    return;
                }
                if let Err(e) = session.begin_upgrade() {
                    warn!(%sid, error = %e, "upgrade refused");
                    return;
                }
                self.arm(
                    sid,
                    DeadlineKind::UpgradeTimeout,
                    self.shared.config.upgrade_timeout,
                    on_upgrade_timeout,
                );
                if session.active.drain() {
                    self.complete_upgrade_locked(session);
                } else {
                    debug!(%sid, "waiting for the old transport to drain");
                }
            }
            PacketType::Close => self.close_locked(session, CloseReason::ClosePacket, deliveries),
            PacketType::Open | PacketType::Noop => trace!(%sid, packet = ?packet.packet_type, "ignored"),
            PacketType::Message => self.handle_message(session, packet, deliveries),
        }
    }

    fn handle_message(&self, session: &mut Session, packet: Packet, deliveries: &mut Vec<Delivery>) {
        let sid = session.id();
        let Some(message_type) = packet.message_type else {
            return;
        };

        match message_type {
            MessageType::Connect => {
                let name = packet.namespace;
                let Some(namespace) = self.shared.namespaces.join(&name, sid) else {
                    warn!(%sid, nsp = %name, "connect to unknown namespace");
                    self.reply(session, Origin::Active, &Packet::error(name, json!("Invalid namespace")));
                    return;
                };
                // no namespace middleware: the auth object is accepted as-is
                let auth = matches!(packet.payload, Payload::Json(_));
                let fresh = session.namespaces.insert(name.clone());
                self.reply(
                    session,
                    Origin::Active,
                    &Packet::connect(name.clone(), Some(json!({ "sid": sid.to_string() }))),
                );
                if !fresh {
                    debug!(%sid, nsp = %name, auth, "repeated connect acknowledged");
                    return;
                }
                if let Some(listener) = namespace.listener() {
                    deliveries.push(Delivery::Connect(listener.clone(), name.clone()));
                }
                self.publish(ClusterMessage::new(self.shared.node_id, ClusterKind::Connect, name.as_str()).with_session(sid.to_string()));
                debug!(%sid, nsp = %name, auth, "namespace connected");
            }
            MessageType::Disconnect => {
                let name = packet.namespace;
                if name == ROOT_NAMESPACE {
                    self.close_locked(session, CloseReason::ClientDisconnect, deliveries);
                    return;
                }
                if !session.namespaces.remove(&name) {
                    return;
                }
                if let Some(namespace) = self.shared.namespaces.get(&name) {
                    namespace.leave(sid);
                    if let Some(listener) = namespace.listener() {
                        deliveries.push(Delivery::Disconnect(listener.clone(), name.clone()));
                    }
                }
                self.publish(ClusterMessage::new(self.shared.node_id, ClusterKind::Disconnect, name.as_str()).with_session(sid.to_string()));
                debug!(%sid, nsp = %name, "namespace disconnected");
            }
            MessageType::Event | MessageType::BinaryEvent => {
                if !session.namespaces.contains(&packet.namespace) {
                    debug!(%sid, nsp = %packet.namespace, "event on a namespace not joined, dropped");
                    return;
                }
                let Some(listener) = self
                    .shared
                    .namespaces
                    .get(&packet.namespace)
                    .and_then(|ns| ns.listener().cloned())
                else {
                    trace!(%sid, nsp = %packet.namespace, "no listener for event");
                    return;
                };
                let attachments = packet.attachments.received().to_vec();
                let args = match packet.payload {
                    Payload::Args(args) => args,
                    _ => Vec::new(),
                };
                deliveries.push(Delivery::Event(
                    listener,
                    InboundEvent {
                        namespace: packet.namespace,
                        name: packet.name.unwrap_or_default(),
                        args,
                        ack_id: packet.ack_id,
                        attachments,
                    },
                ));
            }
            MessageType::Ack | MessageType::BinaryAck => {
                let (Some(ack_id), Payload::Args(args)) = (packet.ack_id, packet.payload) else {
                    return;
                };
                self.shared.acks.resolve(sid, ack_id, args);
            }
            MessageType::Error => debug!(%sid, nsp = %packet.namespace, "error message from client"),
        }
    }

    fn reply(&self, session: &Session, origin: Origin, packet: &Packet) {
        let Some(transport) = session.transport(origin) else {
            return;
        };
        if let Err(e) = self.write_packet(transport, packet) {
            debug!(sid = %session.id(), error = %e, "reply not written");
        }
    }
}
