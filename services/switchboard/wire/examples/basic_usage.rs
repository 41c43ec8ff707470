//! Basic usage example for the switchboard wire protocol.

use bytes::Bytes;
use serde_json::json;
use switchboard_wire::{
    decode_payload, encode_packet, encode_payload, placeholder, Decoder, Packet,
    PayloadStyle, PermissiveContext, DEFAULT_MAX_FRAME_SIZE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Switchboard Wire Protocol Example ===\n");

    // 1. Encode an event that requests an acknowledgment
    println!("1. Encoding an EVENT with ack id...");
    let event = Packet::event("/chat", "message", vec![json!({"text": "héllo"})]).with_ack_id(1);
    let frames = encode_packet(&event)?;
    println!("   Frame: {}", frames[0].as_str()?);

    // 2. Encode a binary event; the blob travels as its own frame
    println!("\n2. Encoding a BINARY_EVENT...");
    let upload = Packet::binary_event(
        "/chat",
        "upload",
        vec![placeholder(0)],
        vec![Bytes::from_static(b"\x89PNG")],
    );
    let mut all = frames;
    all.extend(encode_packet(&upload)?);
    println!("   Total frames: {}", all.len());

    // 3. Pack everything into one long-polling body
    println!("\n3. Building a long-polling body...");
    let body = encode_payload(&all, PayloadStyle::Marker);
    println!("   Body size: {} bytes", body.len());

    // 4. Split and decode again
    println!("\n4. Decoding the body...");
    let mut decoder = Decoder::new();
    for frame in decode_payload(body, DEFAULT_MAX_FRAME_SIZE)? {
        match decoder.decode(frame, &PermissiveContext)? {
            Some(packet) => println!(
                "   {:?}/{:?} nsp={} name={:?} args={:?}",
                packet.packet_type,
                packet.message_type,
                packet.namespace,
                packet.name,
                packet.payload.args()
            ),
            None => println!("   (waiting for attachments)"),
        }
    }

    println!("\n=== Example completed successfully ===");
    Ok(())
}
