//! Packet model for the two protocol layers.
//!
//! The outer [`PacketType`] is transport control; the inner [`MessageType`]
//! only exists on [`PacketType::Message`] packets and multiplexes namespaces,
//! events and acknowledgments.

use crate::attachment::Attachments;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root namespace name
pub const ROOT_NAMESPACE: &str = "";

/// Outer (transport-level) packet types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Handshake response carrying session parameters
    Open = 0,
    /// Transport close request
    Close = 1,
    /// Keep-alive probe
    Ping = 2,
    /// Keep-alive reply
    Pong = 3,
    /// Multiplexed message, see [`MessageType`]
    Message = 4,
    /// Transport upgrade commit
    Upgrade = 5,
    /// No-op, used to flush a pending poll
    Noop = 6,
}

impl PacketType {
    /// ASCII digit written on the wire
    pub fn as_char(self) -> u8 {
        b'0' + self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = crate::WireError;

    /// Accepts both the ASCII digit and the raw nibble value.
    fn try_from(value: u8) -> Result<Self, crate::WireError> {
        match nibble(value) {
            0 => Ok(PacketType::Open),
            1 => Ok(PacketType::Close),
            2 => Ok(PacketType::Ping),
            3 => Ok(PacketType::Pong),
            4 => Ok(PacketType::Message),
            5 => Ok(PacketType::Upgrade),
            6 => Ok(PacketType::Noop),
            _ => Err(crate::WireError::UnknownPacketType(value)),
        }
    }
}

/// Inner (multiplexing-level) message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Namespace connect
    Connect = 0,
    /// Namespace disconnect
    Disconnect = 1,
    /// Named event with JSON arguments
    Event = 2,
    /// Reply to an event that requested acknowledgment
    Ack = 3,
    /// Namespace-level error
    Error = 4,
    /// Event whose arguments reference binary attachments
    BinaryEvent = 5,
    /// Ack whose arguments reference binary attachments
    BinaryAck = 6,
}

impl MessageType {
    /// ASCII digit written on the wire
    pub fn as_char(self) -> u8 {
        b'0' + self as u8
    }

    /// Whether packets of this type may declare attachments
    pub fn is_binary(self) -> bool {
        matches!(self, MessageType::BinaryEvent | MessageType::BinaryAck)
    }

    /// Whether the body is an event (`[name, ...args]`)
    pub fn is_event(self) -> bool {
        matches!(self, MessageType::Event | MessageType::BinaryEvent)
    }

    /// Whether the body is an ack argument list
    pub fn is_ack(self) -> bool {
        matches!(self, MessageType::Ack | MessageType::BinaryAck)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, crate::WireError> {
        match nibble(value) {
            0 => Ok(MessageType::Connect),
            1 => Ok(MessageType::Disconnect),
            2 => Ok(MessageType::Event),
            3 => Ok(MessageType::Ack),
            4 => Ok(MessageType::Error),
            5 => Ok(MessageType::BinaryEvent),
            6 => Ok(MessageType::BinaryAck),
            _ => Err(crate::WireError::UnknownMessageType(value)),
        }
    }
}

/// Empty echo data and no echo data are the same on the wire
fn echo_payload(data: String) -> Payload {
    if data.is_empty() {
        Payload::None
    } else {
        Payload::Text(data)
    }
}

fn nibble(value: u8) -> u8 {
    if value.is_ascii_digit() {
        value - b'0'
    } else {
        value
    }
}

/// Decoded packet payload
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// No body
    #[default]
    None,
    /// Opaque string (PING/PONG echo data)
    Text(String),
    /// Single JSON value (OPEN parameters, CONNECT auth, ERROR detail)
    Json(Value),
    /// Argument list (EVENT arguments after the name, ACK arguments)
    Args(Vec<Value>),
}

impl Payload {
    /// Argument list, empty for non-argument payloads
    pub fn args(&self) -> &[Value] {
        match self {
            Payload::Args(args) => args,
            _ => &[],
        }
    }

    /// Opaque text, if any
    pub fn text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Single JSON value, if any
    pub fn json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// One decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Outer packet type
    pub packet_type: PacketType,
    /// Inner type, only for [`PacketType::Message`]
    pub message_type: Option<MessageType>,
    /// Namespace, `""` for the root namespace
    pub namespace: String,
    /// Requested or supplied acknowledgment id
    pub ack_id: Option<u64>,
    /// Event name for EVENT/BINARY_EVENT
    pub name: Option<String>,
    /// Body
    pub payload: Payload,
    /// Binary attachments for BINARY_EVENT/BINARY_ACK
    pub attachments: Attachments,
}

impl Packet {
    /// Create a bare packet of the given outer type
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            message_type: None,
            namespace: ROOT_NAMESPACE.to_string(),
            ack_id: None,
            name: None,
            payload: Payload::None,
            attachments: Attachments::default(),
        }
    }

    /// Create a MESSAGE packet with the given inner type
    pub fn message(message_type: MessageType, namespace: impl Into<String>) -> Self {
        let mut packet = Self::new(PacketType::Message);
        packet.message_type = Some(message_type);
        packet.namespace = namespace.into();
        packet
    }

    /// OPEN packet carrying handshake parameters
    pub fn open(params: Value) -> Self {
        let mut packet = Self::new(PacketType::Open);
        packet.payload = Payload::Json(params);
        packet
    }

    /// PING packet with echo data
    pub fn ping(data: impl Into<String>) -> Self {
        let mut packet = Self::new(PacketType::Ping);
        packet.payload = echo_payload(data.into());
        packet
    }

    /// PONG packet with echo data
    pub fn pong(data: impl Into<String>) -> Self {
        let mut packet = Self::new(PacketType::Pong);
        packet.payload = echo_payload(data.into());
        packet
    }

    /// Namespace CONNECT, optionally with an auth/ack object
    pub fn connect(namespace: impl Into<String>, body: Option<Value>) -> Self {
        let mut packet = Self::message(MessageType::Connect, namespace);
        if let Some(body) = body {
            packet.payload = Payload::Json(body);
        }
        packet
    }

    /// Namespace DISCONNECT
    pub fn disconnect(namespace: impl Into<String>) -> Self {
        Self::message(MessageType::Disconnect, namespace)
    }

    /// Named EVENT
    pub fn event(namespace: impl Into<String>, name: impl Into<String>, args: Vec<Value>) -> Self {
        let mut packet = Self::message(MessageType::Event, namespace);
        packet.name = Some(name.into());
        packet.payload = Payload::Args(args);
        packet
    }

    /// ACK reply for `ack_id`
    pub fn ack(namespace: impl Into<String>, ack_id: u64, args: Vec<Value>) -> Self {
        let mut packet = Self::message(MessageType::Ack, namespace);
        packet.ack_id = Some(ack_id);
        packet.payload = Payload::Args(args);
        packet
    }

    /// Namespace ERROR
    pub fn error(namespace: impl Into<String>, detail: Value) -> Self {
        let mut packet = Self::message(MessageType::Error, namespace);
        packet.payload = Payload::Json(detail);
        packet
    }

    /// BINARY_EVENT; `args` must reference each attachment through
    /// [`crate::placeholder`] in order.
    pub fn binary_event(
        namespace: impl Into<String>,
        name: impl Into<String>,
        args: Vec<Value>,
        attachments: Vec<Bytes>,
    ) -> Self {
        let mut packet = Self::event(namespace, name, args);
        packet.message_type = Some(MessageType::BinaryEvent);
        packet.attachments = Attachments::loaded(attachments);
        packet
    }

    /// BINARY_ACK; `args` must reference each attachment through
    /// [`crate::placeholder`] in order.
    pub fn binary_ack(
        namespace: impl Into<String>,
        ack_id: u64,
        args: Vec<Value>,
        attachments: Vec<Bytes>,
    ) -> Self {
        let mut packet = Self::ack(namespace, ack_id, args);
        packet.message_type = Some(MessageType::BinaryAck);
        packet.attachments = Attachments::loaded(attachments);
        packet
    }

    /// Set the acknowledgment id
    pub fn with_ack_id(mut self, ack_id: u64) -> Self {
        self.ack_id = Some(ack_id);
        self
    }

    /// Whether all declared attachments have arrived
    pub fn is_deliverable(&self) -> bool {
        self.attachments.is_loaded()
    }

    /// Whether this is a MESSAGE of the given inner type
    pub fn is_message(&self, message_type: MessageType) -> bool {
        self.packet_type == PacketType::Message && self.message_type == Some(message_type)
    }
}
