//! Wire protocol framing, packet encoding/decoding and binary attachment
//! reassembly for switchboard.
//!
//! This crate provides the low-level protocol implementation: splitting
//! transport bodies into frames, parsing the two-layer packet format, and
//! holding binary packets until their attachments arrive.
//!
//! ## Features
//!
//! - **Three body framings**: length-prefixed, marker-framed and `0x1E` separated
//! - **Character-counted lengths**: UTF-16 code units with an ASCII fast path
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **Binary attachments**: placeholder splicing in either field order
//! - **Pluggable JSON**: bodies go through a [`JsonSupport`] delegate
//!
//! ## Wire Format
//!
//! ```text
//! +-----------+-----------+-------------+------------------+-----------+---------+
//! | outer (1) | inner (1) | N- (binary) | namespace, (opt) | ackId opt | body    |
//! +-----------+-----------+-------------+------------------+-----------+---------+
//!   0 OPEN      0 CONNECT                                                JSON
//!   1 CLOSE     1 DISCONNECT
//!   2 PING      2 EVENT
//!   3 PONG      3 ACK
//!   4 MESSAGE   4 ERROR
//!   5 UPGRADE   5 BINARY_EVENT    followed by N attachment frames
//!   6 NOOP      6 BINARY_ACK
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attachment;
pub mod codec;
pub mod error;
pub mod frame;
pub mod json;
pub mod packet;

// Re-export main types
pub use attachment::{
    decode_attachment, placeholder, splice_placeholders, to_text_frame, Attachments,
    BINARY_MESSAGE_BYTE, TEXT_BINARY_PREFIX,
};
pub use codec::{encode_packet, encode_packet_with, Decoder};
pub use error::WireError;
pub use frame::{
    decode_payload, encode_frame_into, encode_payload, split_records, Frame, FrameDecoder,
    FrameKind, PayloadStyle, DEFAULT_MAX_FRAME_SIZE, RECORD_SEPARATOR,
};
pub use json::{
    ArgKind, ArgSpec, DecodeContext, EventTypeRegistry, JsonSupport, PermissiveContext,
    SerdeJsonSupport,
};
pub use packet::{MessageType, Packet, PacketType, Payload, ROOT_NAMESPACE};
