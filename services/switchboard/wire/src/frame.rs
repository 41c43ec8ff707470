//! Transport-level framing.
//!
//! A long-polling body (or a byte stream) may hold several frames. Three
//! delimiting styles exist:
//!
//! ```text
//! length-prefixed:   <count>:<data>                      count in UTF-16 units
//! marker-framed:     0x00|0x01 <digits> 0xFF <data>      0x00 text (units), 0x01 binary (bytes)
//! record-separated:  <data> 0x1E <data> 0x1E <data>      no counts at all
//! ```
//!
//! Text counts are what a JavaScript peer reports as string length, so a
//! multi-byte UTF-8 body has to be scanned character by character to find
//! its byte length. An all-ASCII prefix skips the scan.

use crate::attachment::to_text_frame;
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Separator between packets glued into one frame
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Marker byte introducing a text frame
pub const MARKER_TEXT: u8 = 0x00;

/// Marker byte introducing a binary frame
pub const MARKER_BINARY: u8 = 0x01;

/// Terminator written after marker-frame digits
pub const MARKER_TERMINATOR: u8 = 0xFF;

/// Maximum frame size (1 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Longest accepted decimal length header
const MAX_LENGTH_DIGITS: usize = 10;

/// Frame payload kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// UTF-8 text
    Text,
    /// Raw bytes
    Binary,
}

/// One transport-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Payload kind
    pub kind: FrameKind,
    /// Payload bytes
    pub data: Bytes,
}

impl Frame {
    /// Text frame
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Text,
            data: Bytes::from(data.into()),
        }
    }

    /// Binary frame
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Binary,
            data: data.into(),
        }
    }

    /// Payload as UTF-8 text
    pub fn as_str(&self) -> Result<&str, WireError> {
        std::str::from_utf8(&self.data).map_err(|_| WireError::Malformed("frame is not valid utf-8"))
    }

    /// Length as counted by a length header of this frame's kind
    pub fn counted_len(&self) -> usize {
        match self.kind {
            FrameKind::Binary => self.data.len(),
            FrameKind::Text => match std::str::from_utf8(&self.data) {
                Ok(text) => text.encode_utf16().count(),
                Err(_) => self.data.len(),
            },
        }
    }
}

/// How several frames are laid out in one body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadStyle {
    /// `<count>:<data>`; binary frames travel as `b4<base64>` text
    #[default]
    LengthPrefixed,
    /// Marker byte, digits, `0xFF`, data
    Marker,
    /// Text frames joined by `0x1E`; binary frames travel as `b4<base64>`
    RecordSeparated,
}

/// Frame decoder for length-counted byte streams
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        let (kind, header_len, count) = if first == MARKER_TEXT || first == MARKER_BINARY {
            let Some((count, digits)) = read_length(&buf[1..], None)? else {
                return Ok(None);
            };
            let kind = if first == MARKER_TEXT {
                FrameKind::Text
            } else {
                FrameKind::Binary
            };
            // marker + digits + terminator
            (kind, 1 + digits + 1, count)
        } else {
            let Some((count, digits)) = read_length(buf, Some(b':'))? else {
                return Ok(None);
            };
            (FrameKind::Text, digits + 1, count)
        };

        if count > self.max_frame_size {
            return Err(WireError::Size(count));
        }

        let body = &buf[header_len..];
        let data_len = match kind {
            FrameKind::Binary => {
                if body.len() < count {
                    return Ok(None);
                }
                count
            }
            FrameKind::Text => match scan_utf16_units(body, count)? {
                Some(len) => len,
                None => return Ok(None),
            },
        };

        buf.advance(header_len);
        let data = buf.split_to(data_len).freeze();
        Ok(Some(Frame { kind, data }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a decimal length. With `terminator` set, the digits must be followed
/// by exactly that byte; otherwise any non-digit ends them. Raw digit values
/// `0..=9` are accepted alongside ASCII digits when no terminator is given.
///
/// Returns `(value, digit_count)`, or `None` when the header is not complete.
fn read_length(buf: &[u8], terminator: Option<u8>) -> Result<Option<(usize, usize)>, WireError> {
    let mut value: usize = 0;
    let mut digits = 0;

    for &byte in buf {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            0..=9 if terminator.is_none() => byte,
            _ => {
                if digits == 0 || terminator.is_some_and(|t| t != byte) {
                    return Err(WireError::InvalidLength);
                }
                return Ok(Some((value, digits)));
            }
        };
        digits += 1;
        if digits > MAX_LENGTH_DIGITS {
            return Err(WireError::InvalidLength);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(digit as usize))
            .ok_or(WireError::InvalidLength)?;
    }

    Ok(None)
}

/// Byte length of the first `units` UTF-16 code units of `buf`, or `None`
/// if `buf` ends first.
pub fn scan_utf16_units(buf: &[u8], units: usize) -> Result<Option<usize>, WireError> {
    if buf.len() >= units && buf[..units].is_ascii() {
        return Ok(Some(units));
    }

    let mut counted = 0;
    let mut pos = 0;
    while counted < units {
        let Some(&lead) = buf.get(pos) else {
            return Ok(None);
        };
        let (width, weight) = match lead {
            0x00..=0x7F => (1, 1),
            0xC0..=0xDF => (2, 1),
            0xE0..=0xEF => (3, 1),
            0xF0..=0xF7 => (4, 2),
            _ => return Err(WireError::Malformed("invalid utf-8 lead byte")),
        };
        if pos + width > buf.len() {
            return Ok(None);
        }
        pos += width;
        counted += weight;
    }

    if counted != units {
        return Err(WireError::Malformed("length splits a surrogate pair"));
    }
    Ok(Some(pos))
}

/// Split a complete body into frames, choosing the framing from its first
/// bytes.
pub fn decode_payload(body: Bytes, max_frame_size: usize) -> Result<Vec<Frame>, WireError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    if !is_length_counted(&body) {
        return Ok(split_records(body));
    }

    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    let mut buf = BytesMut::from(&body[..]);
    let mut frames = Vec::new();
    while !buf.is_empty() {
        match decoder.decode(&mut buf)? {
            Some(frame) => frames.push(frame),
            None => return Err(WireError::Malformed("truncated payload")),
        }
    }
    Ok(frames)
}

fn is_length_counted(body: &[u8]) -> bool {
    match body.first() {
        Some(&MARKER_TEXT) | Some(&MARKER_BINARY) => true,
        Some(b) if b.is_ascii_digit() => body
            .iter()
            .take(MAX_LENGTH_DIGITS + 1)
            .find(|b| !b.is_ascii_digit())
            .is_some_and(|&b| b == b':'),
        _ => false,
    }
}

/// Split a record-separated body. Every record is a text frame.
pub fn split_records(body: Bytes) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut start = 0;
    for (idx, byte) in body.iter().enumerate() {
        if *byte == RECORD_SEPARATOR {
            if idx > start {
                frames.push(Frame {
                    kind: FrameKind::Text,
                    data: body.slice(start..idx),
                });
            }
            start = idx + 1;
        }
    }
    if start < body.len() {
        frames.push(Frame {
            kind: FrameKind::Text,
            data: body.slice(start..),
        });
    }
    frames
}

/// Append one frame to `buf` in the given style. For
/// [`PayloadStyle::RecordSeparated`] the caller places separators.
pub fn encode_frame_into(frame: &Frame, style: PayloadStyle, buf: &mut BytesMut) {
    match style {
        PayloadStyle::LengthPrefixed => {
            let frame = to_text_frame(frame);
            buf.put_slice(frame.counted_len().to_string().as_bytes());
            buf.put_u8(b':');
            buf.put_slice(&frame.data);
        }
        PayloadStyle::Marker => {
            let marker = match frame.kind {
                FrameKind::Text => MARKER_TEXT,
                FrameKind::Binary => MARKER_BINARY,
            };
            buf.put_u8(marker);
            buf.put_slice(frame.counted_len().to_string().as_bytes());
            buf.put_u8(MARKER_TERMINATOR);
            buf.put_slice(&frame.data);
        }
        PayloadStyle::RecordSeparated => {
            buf.put_slice(&to_text_frame(frame).data);
        }
    }
}

/// Encode several frames into one body
pub fn encode_payload(frames: &[Frame], style: PayloadStyle) -> Bytes {
    let mut buf = BytesMut::with_capacity(frames.iter().map(|f| f.data.len() + 12).sum());
    for (idx, frame) in frames.iter().enumerate() {
        if style == PayloadStyle::RecordSeparated && idx > 0 {
            buf.put_u8(RECORD_SEPARATOR);
        }
        encode_frame_into(frame, style, &mut buf);
    }
    buf.freeze()
}
