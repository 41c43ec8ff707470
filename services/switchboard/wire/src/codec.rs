//! Packet encoding and decoding.
//!
//! One text frame holds one packet:
//!
//! ```text
//! <outer>[<inner>][<N>-][<namespace>,][<ackId>]<body>
//! ```
//!
//! The header ends at the first `[`, `{` or `"`. A binary packet is followed by
//! `N` attachment frames; the per-session [`Decoder`] holds the packet until
//! they have arrived.

use crate::attachment::{attachment_frame, decode_attachment, Attachments};
use crate::frame::{Frame, FrameKind};
use crate::json::{ArgSpec, DecodeContext, JsonSupport, SerdeJsonSupport};
use crate::packet::{MessageType, Packet, PacketType, Payload};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tracing::debug;

/// Encode a packet with `serde_json`
pub fn encode_packet(packet: &Packet) -> Result<Vec<Frame>, WireError> {
    encode_packet_with(packet, &SerdeJsonSupport)
}

/// Encode a packet into its text frame followed by one binary frame per
/// attachment.
pub fn encode_packet_with(packet: &Packet, json: &dyn JsonSupport) -> Result<Vec<Frame>, WireError> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(packet.packet_type.as_char());

    match packet.packet_type {
        PacketType::Ping | PacketType::Pong => {
            if let Some(text) = packet.payload.text() {
                buf.put_slice(text.as_bytes());
            }
        }
        PacketType::Open => {
            if let Some(params) = packet.payload.json() {
                buf.put_slice(&json.encode(params)?);
            }
        }
        PacketType::Close | PacketType::Upgrade | PacketType::Noop => {}
        PacketType::Message => {
            let message_type = packet
                .message_type
                .ok_or(WireError::Malformed("message packet without inner type"))?;
            buf.put_u8(message_type.as_char());
            return encode_message(packet, message_type, buf, json);
        }
    }

    Ok(vec![Frame {
        kind: FrameKind::Text,
        data: buf.freeze(),
    }])
}

fn encode_message(
    packet: &Packet,
    message_type: MessageType,
    mut buf: BytesMut,
    json: &dyn JsonSupport,
) -> Result<Vec<Frame>, WireError> {
    if message_type.is_binary() {
        if !packet.attachments.is_loaded() {
            return Err(WireError::Malformed("attachments not loaded"));
        }
        buf.put_slice(packet.attachments.declared().to_string().as_bytes());
        buf.put_u8(b'-');
    }

    let body = message_body(packet, message_type, json)?;
    // `40/chat` is only unambiguous when nothing follows the name and the
    // name itself marks the header as a namespace
    let bare_namespace = body.is_none()
        && packet.ack_id.is_none()
        && packet.namespace.starts_with('/')
        && matches!(message_type, MessageType::Connect | MessageType::Disconnect);

    if !packet.namespace.is_empty() {
        buf.put_slice(packet.namespace.as_bytes());
        if !bare_namespace {
            buf.put_u8(b',');
        }
    }
    if let Some(ack_id) = packet.ack_id {
        buf.put_slice(ack_id.to_string().as_bytes());
    }
    if let Some(body) = body {
        buf.put_slice(&body);
    }

    let mut frames = Vec::with_capacity(1 + packet.attachments.declared());
    frames.push(Frame {
        kind: FrameKind::Text,
        data: buf.freeze(),
    });
    if message_type.is_binary() {
        frames.extend(packet.attachments.received().iter().map(attachment_frame));
    }
    Ok(frames)
}

fn message_body(
    packet: &Packet,
    message_type: MessageType,
    json: &dyn JsonSupport,
) -> Result<Option<Bytes>, WireError> {
    if message_type.is_event() {
        let name = packet
            .name
            .as_deref()
            .ok_or(WireError::Malformed("event without name"))?;
        let mut values = Vec::with_capacity(1 + packet.payload.args().len());
        values.push(Value::String(name.to_string()));
        values.extend(packet.payload.args().iter().cloned());
        return json.encode(&Value::Array(values)).map(Some);
    }

    match &packet.payload {
        Payload::None => Ok(None),
        Payload::Json(value) => json.encode(value).map(Some),
        Payload::Args(args) => json.encode(&Value::Array(args.clone())).map(Some),
        Payload::Text(text) => Ok(Some(Bytes::copy_from_slice(text.as_bytes()))),
    }
}

/// Stateful per-session decoder
#[derive(Debug, Default)]
pub struct Decoder {
    pending: Option<Packet>,
}

impl Decoder {
    /// Create a decoder with nothing pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a binary packet is waiting for attachments
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop the pending binary packet, if any
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Decode one frame.
    ///
    /// Returns `Ok(None)` while a binary packet is still collecting
    /// attachments. Every error is structural.
    pub fn decode(&mut self, frame: Frame, ctx: &dyn DecodeContext) -> Result<Option<Packet>, WireError> {
        if let Some(mut packet) = self.pending.take() {
            let blob = decode_attachment(&frame)?;
            if !packet.attachments.push(blob)? {
                debug!(
                    remaining = packet.attachments.remaining(),
                    "waiting for attachments"
                );
                self.pending = Some(packet);
                return Ok(None);
            }
            let body = packet.attachments.splice()?;
            read_message_body(&mut packet, &body, ctx)?;
            return Ok(Some(packet));
        }

        if frame.kind == FrameKind::Binary {
            return Err(WireError::Malformed("binary frame without pending packet"));
        }

        let packet = decode_text(&frame.data, ctx)?;
        if packet.attachments.is_loaded() {
            return Ok(Some(packet));
        }

        debug!(
            declared = packet.attachments.declared(),
            nsp = %packet.namespace,
            "holding binary packet"
        );
        self.pending = Some(packet);
        Ok(None)
    }
}

fn decode_text(data: &Bytes, ctx: &dyn DecodeContext) -> Result<Packet, WireError> {
    let (&first, rest) = data
        .split_first()
        .ok_or(WireError::Malformed("empty frame"))?;
    let packet_type = PacketType::try_from(first)?;
    let mut packet = Packet::new(packet_type);

    match packet_type {
        PacketType::Ping | PacketType::Pong => {
            let text = std::str::from_utf8(rest).map_err(|_| WireError::Malformed("ping data is not utf-8"))?;
            if !text.is_empty() {
                packet.payload = Payload::Text(text.to_string());
            }
        }
        PacketType::Open => {
            if !rest.is_empty() {
                packet.payload = Payload::Json(ctx.json().read_value(rest)?);
            }
        }
        PacketType::Close | PacketType::Upgrade | PacketType::Noop => {}
        PacketType::Message => {
            let (&inner, rest) = rest
                .split_first()
                .ok_or(WireError::Malformed("message without inner type"))?;
            let message_type = MessageType::try_from(inner)?;
            packet.message_type = Some(message_type);

            let body_start = rest
                .iter()
                .position(|b| matches!(b, b'[' | b'{' | b'"'))
                .unwrap_or(rest.len());
            read_header(&mut packet, message_type, &rest[..body_start])?;

            let body = data.slice(data.len() - rest.len() + body_start..);
            if packet.attachments.is_loaded() {
                read_message_body(&mut packet, &body, ctx)?;
            } else {
                packet.attachments.retain_source(body);
            }
        }
    }

    Ok(packet)
}

fn read_header(packet: &mut Packet, message_type: MessageType, header: &[u8]) -> Result<(), WireError> {
    let header = std::str::from_utf8(header).map_err(|_| WireError::Malformed("header is not utf-8"))?;

    let header = if message_type.is_binary() {
        let (count, rest) = header
            .split_once('-')
            .ok_or(WireError::Malformed("binary packet without attachment count"))?;
        let count: usize = count.parse().map_err(|_| WireError::InvalidLength)?;
        packet.attachments = Attachments::expect(count);
        rest
    } else {
        header
    };

    let (namespace, ack) = match header.split_once(',') {
        Some((namespace, ack)) => (namespace, ack),
        None if header.starts_with('/') => (header, ""),
        None => ("", header),
    };

    // query parameters on a namespace belong to the connect request, not the name
    packet.namespace = match namespace.split_once('?') {
        Some((name, _query)) => name.to_string(),
        None => namespace.to_string(),
    };
    if !ack.is_empty() {
        packet.ack_id = Some(ack.parse().map_err(|_| WireError::Malformed("invalid ack id"))?);
    }
    Ok(())
}

fn read_message_body(packet: &mut Packet, body: &[u8], ctx: &dyn DecodeContext) -> Result<(), WireError> {
    let message_type = packet
        .message_type
        .ok_or(WireError::Malformed("message packet without inner type"))?;
    let json = ctx.json();

    packet.payload = match message_type {
        MessageType::Connect | MessageType::Disconnect | MessageType::Error => {
            if body.is_empty() {
                Payload::None
            } else {
                Payload::Json(json.read_value(body)?)
            }
        }
        MessageType::Event | MessageType::BinaryEvent => {
            let mut values = json.read_args(body, &ArgSpec::any())?;
            if values.is_empty() {
                return Err(WireError::Malformed("event without name"));
            }
            let name = match values.remove(0) {
                Value::String(name) => name,
                _ => return Err(WireError::Malformed("event name is not a string")),
            };
            ctx.event_arg_spec(&packet.namespace, &name).check(&values)?;
            packet.name = Some(name);
            Payload::Args(values)
        }
        MessageType::Ack | MessageType::BinaryAck => {
            let ack_id = packet
                .ack_id
                .ok_or(WireError::Malformed("ack without id"))?;
            match ctx.ack_arg_spec(&packet.namespace, ack_id) {
                Some(spec) => Payload::Args(json.read_args(body, &spec)?),
                None => {
                    debug!(ack_id, nsp = %packet.namespace, "no registration for ack, body skipped");
                    Payload::None
                }
            }
        }
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::placeholder;
    use crate::json::{ArgKind, PermissiveContext};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::json;

    fn decode_one(text: &str) -> Packet {
        Decoder::new()
            .decode(Frame::text(text), &PermissiveContext)
            .unwrap()
            .unwrap()
    }

    fn round_trip(packet: Packet) {
        let frames = encode_packet(&packet).unwrap();
        assert_eq!(frames.len(), 1);
        let mut decoder = Decoder::new();
        let decoded = decoder
            .decode(frames.into_iter().next().unwrap(), &PermissiveContext)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_open_frame() {
        let packet = decode_one(
            r#"0{"sid":"AAA","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":60000}"#,
        );
        assert_eq!(packet.packet_type, PacketType::Open);
        let params = packet.payload.json().unwrap();
        assert_eq!(params["sid"], "AAA");
        assert_eq!(params["upgrades"], json!(["websocket"]));
        assert_eq!(params["pingInterval"], 25000);
        assert_eq!(params["pingTimeout"], 60000);
    }

    #[test]
    fn test_event_with_ack_id_reencodes_identically() {
        let packet = decode_one(r#"420["hello","world"]"#);
        assert_eq!(packet.packet_type, PacketType::Message);
        assert_eq!(packet.message_type, Some(MessageType::Event));
        assert_eq!(packet.ack_id, Some(0));
        assert_eq!(packet.namespace, "");
        assert_eq!(packet.name.as_deref(), Some("hello"));
        assert_eq!(packet.payload.args(), &[json!("world")]);

        let frames = encode_packet(&packet).unwrap();
        assert_eq!(&frames[0].data[..], br#"420["hello","world"]"#);
    }

    #[test]
    fn test_round_trip_without_attachments() {
        round_trip(Packet::new(PacketType::Close));
        round_trip(Packet::new(PacketType::Upgrade));
        round_trip(Packet::new(PacketType::Noop));
        round_trip(Packet::ping("probe"));
        round_trip(Packet::pong(""));
        round_trip(Packet::open(json!({"sid": "x", "pingInterval": 1})));
        round_trip(Packet::connect("", None));
        round_trip(Packet::connect("/chat", None));
        round_trip(Packet::connect("", Some(json!({"token": "t"}))));
        round_trip(Packet::connect("/chat", Some(json!({"token": "t"}))));
        round_trip(Packet::disconnect("/chat"));
        round_trip(Packet::event("", "ping", vec![]));
        round_trip(Packet::event("/chat", "say", vec![json!("hi"), json!(2)]).with_ack_id(17));
        round_trip(Packet::ack("", 3, vec![json!({"ok": true})]));
        round_trip(Packet::ack("/chat", 12, vec![]));
        round_trip(Packet::error("/missing", json!("Invalid namespace")));
    }

    #[test]
    fn test_round_trip_bodyless_control_packets() {
        round_trip(Packet::new(PacketType::Open));
        round_trip(Packet::new(PacketType::Ping));
        round_trip(Packet::new(PacketType::Pong));
        assert_eq!(decode_one("2"), Packet::ping(""));
        assert_eq!(decode_one("0").payload, Payload::None);
    }

    #[test]
    fn test_ack_id_after_bare_namespace() {
        let packet = Packet::connect("/chat", None).with_ack_id(5);
        let frames = encode_packet(&packet).unwrap();
        assert_eq!(&frames[0].data[..], b"40/chat,5");
        round_trip(packet);

        let frames = encode_packet(&Packet::connect("chat", None)).unwrap();
        assert_eq!(&frames[0].data[..], b"40chat,");
        round_trip(Packet::connect("chat", None));
    }

    #[test]
    fn test_round_trip_across_headers() {
        let namespaces = ["", "/", "/chat", "chat", "/a/b"];
        let ack_ids = [None, Some(0), Some(42)];

        for namespace in namespaces {
            for ack_id in ack_ids {
                let packets = [
                    Packet::connect(namespace, None),
                    Packet::connect(namespace, Some(json!({"token": "t"}))),
                    Packet::disconnect(namespace),
                    Packet::event(namespace, "say", vec![]),
                    Packet::event(namespace, "say", vec![json!("hi"), json!(7), json!({"k": [1]})]),
                    Packet::ack(namespace, 1, vec![json!(null)]),
                    Packet::error(namespace, json!({"message": "nope"})),
                ];
                for packet in packets {
                    let packet = match ack_id {
                        Some(id) => packet.with_ack_id(id),
                        None => packet,
                    };
                    round_trip(packet);
                }
            }
        }
    }

    #[test]
    fn test_header_forms() {
        let packet = decode_one("40/admin");
        assert_eq!(packet.message_type, Some(MessageType::Connect));
        assert_eq!(packet.namespace, "/admin");
        assert_eq!(packet.ack_id, None);

        let packet = decode_one("40/admin?token=abc,");
        assert_eq!(packet.namespace, "/admin");

        let packet = decode_one(r#"42/admin,["x"]"#);
        assert_eq!(packet.namespace, "/admin");
        assert_eq!(packet.ack_id, None);

        let packet = decode_one(r#"4312["done"]"#);
        assert_eq!(packet.namespace, "");
        assert_eq!(packet.ack_id, Some(12));

        let packet = decode_one(r#"44/x,{"message":"nope"}"#);
        assert_eq!(packet.payload.json().unwrap()["message"], "nope");
    }

    #[test]
    fn test_encoding_header_layout() {
        let frames = encode_packet(&Packet::connect("/chat", None)).unwrap();
        assert_eq!(&frames[0].data[..], b"40/chat");
        let frames = encode_packet(&Packet::connect("/chat", Some(json!({})))).unwrap();
        assert_eq!(&frames[0].data[..], b"40/chat,{}");
        let frames = encode_packet(&Packet::event("/chat", "m", vec![]).with_ack_id(4)).unwrap();
        assert_eq!(&frames[0].data[..], br#"42/chat,4["m"]"#);
        let frames = encode_packet(&Packet::error("/missing", json!("Invalid namespace"))).unwrap();
        assert_eq!(&frames[0].data[..], br#"44/missing,"Invalid namespace""#);
    }

    #[test]
    fn test_binary_event_reassembly() {
        let blobs = vec![Bytes::from_static(b"\x00\x01\x02"), Bytes::from_static(b"png")];
        let packet = Packet::binary_event(
            "/files",
            "upload",
            vec![placeholder(0), json!({"thumb": placeholder(1)})],
            blobs.clone(),
        )
        .with_ack_id(9);

        let frames = encode_packet(&packet).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].data.starts_with(b"452-/files,9["));
        assert_eq!(frames[1].kind, FrameKind::Binary);

        let mut decoder = Decoder::new();
        let mut frames = frames.into_iter();
        assert!(decoder.decode(frames.next().unwrap(), &PermissiveContext).unwrap().is_none());
        assert!(decoder.has_pending());
        assert!(decoder.decode(frames.next().unwrap(), &PermissiveContext).unwrap().is_none());
        let decoded = decoder
            .decode(frames.next().unwrap(), &PermissiveContext)
            .unwrap()
            .unwrap();
        assert!(!decoder.has_pending());

        assert_eq!(decoded.message_type, Some(MessageType::BinaryEvent));
        assert_eq!(decoded.name.as_deref(), Some("upload"));
        assert_eq!(decoded.ack_id, Some(9));
        assert_eq!(decoded.attachments.received(), &blobs[..]);
        assert_eq!(
            decoded.payload.args(),
            &[
                json!(STANDARD.encode(&blobs[0])),
                json!({"thumb": STANDARD.encode(&blobs[1])})
            ]
        );
    }

    #[test]
    fn test_binary_ack_with_swapped_placeholder_over_text_transport() {
        let mut decoder = Decoder::new();
        let header = Frame::text(r#"461-3[{"num":0,"_placeholder":true}]"#);
        assert!(decoder.decode(header, &PermissiveContext).unwrap().is_none());

        let attachment = Frame::text(format!("b4{}", STANDARD.encode(b"blob")));
        let decoded = decoder.decode(attachment, &PermissiveContext).unwrap().unwrap();
        assert_eq!(decoded.message_type, Some(MessageType::BinaryAck));
        assert_eq!(decoded.ack_id, Some(3));
        assert_eq!(decoded.payload.args(), &[json!(STANDARD.encode(b"blob"))]);
    }

    #[test]
    fn test_missing_placeholder_is_fatal() {
        let mut decoder = Decoder::new();
        let header = Frame::text(r#"451-["evt",{"_placeholder":true,"num":7}]"#);
        assert!(decoder.decode(header, &PermissiveContext).unwrap().is_none());
        let err = decoder
            .decode(Frame::binary(Bytes::from_static(b"\x04x")), &PermissiveContext)
            .unwrap_err();
        assert!(matches!(err, WireError::MissingPlaceholder(0)));
    }

    struct NoAcks;

    impl DecodeContext for NoAcks {
        fn json(&self) -> &dyn JsonSupport {
            &SerdeJsonSupport
        }

        fn event_arg_spec(&self, _namespace: &str, event: &str) -> ArgSpec {
            if event == "typed" {
                ArgSpec::new([ArgKind::Number])
            } else {
                ArgSpec::any()
            }
        }

        fn ack_arg_spec(&self, _namespace: &str, _ack_id: u64) -> Option<ArgSpec> {
            None
        }
    }

    #[test]
    fn test_unclaimed_ack_body_is_skipped() {
        // body is not even valid json; it is never parsed
        let packet = Decoder::new()
            .decode(Frame::text("435[not json"), &NoAcks)
            .unwrap()
            .unwrap();
        assert_eq!(packet.ack_id, Some(5));
        assert_eq!(packet.payload, Payload::None);
    }

    #[test]
    fn test_event_args_checked_against_registry() {
        let mut decoder = Decoder::new();
        assert!(decoder.decode(Frame::text(r#"42["typed",1]"#), &NoAcks).is_ok());
        assert!(matches!(
            decoder.decode(Frame::text(r#"42["typed","one"]"#), &NoAcks),
            Err(WireError::ArgMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn test_structural_errors() {
        let mut decoder = Decoder::new();
        let ctx = PermissiveContext;
        assert!(decoder.decode(Frame::text(""), &ctx).is_err());
        assert!(decoder.decode(Frame::text("9"), &ctx).is_err());
        assert!(decoder.decode(Frame::text("4"), &ctx).is_err());
        assert!(decoder.decode(Frame::text("48[]"), &ctx).is_err());
        assert!(decoder.decode(Frame::text(r#"5["x"]"#), &ctx).unwrap().is_some());
        assert!(decoder.decode(Frame::text(r#"45["x"]"#), &ctx).is_err());
        assert!(decoder.decode(Frame::text("42x["), &ctx).is_err());
        assert!(decoder.decode(Frame::text("42[]"), &ctx).is_err());
        assert!(decoder
            .decode(Frame::binary(Bytes::from_static(b"\x04")), &ctx)
            .is_err());
    }
}
