//! Binary attachment bookkeeping and reassembly.
//!
//! A BINARY_EVENT or BINARY_ACK declares `N` attachments in its header. Its
//! JSON body references them with placeholder objects and the blobs follow as
//! `N` separate frames. Until all of them have arrived the packet keeps its
//! raw body as a data source; once complete, [`Attachments::splice`] replaces
//! every placeholder with the quoted base64 text of its blob.

use crate::frame::{Frame, FrameKind};
use crate::WireError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{json, Value};
use smallvec::SmallVec;

/// Message-type byte that prefixes binary frames on the wire
pub const BINARY_MESSAGE_BYTE: u8 = 4;

/// Prefix of a base64-encoded binary frame on text-only transports
pub const TEXT_BINARY_PREFIX: &[u8] = b"b4";

/// JSON placeholder referencing attachment `num`
pub fn placeholder(num: usize) -> Value {
    json!({ "_placeholder": true, "num": num })
}

fn placeholder_tokens(num: usize) -> [String; 2] {
    [
        format!("{{\"_placeholder\":true,\"num\":{}}}", num),
        format!("{{\"num\":{},\"_placeholder\":true}}", num),
    ]
}

/// Attachment state of one packet
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Attachments {
    declared: usize,
    received: SmallVec<[Bytes; 4]>,
    source: Option<Bytes>,
}

impl Attachments {
    /// Attachments that are already present (outbound packets)
    pub fn loaded(blobs: Vec<Bytes>) -> Self {
        Self {
            declared: blobs.len(),
            received: SmallVec::from_vec(blobs),
            source: None,
        }
    }

    /// Expect `count` attachments to arrive later
    pub fn expect(count: usize) -> Self {
        Self {
            declared: count,
            received: SmallVec::new(),
            source: None,
        }
    }

    /// Number of attachments declared in the header
    pub fn declared(&self) -> usize {
        self.declared
    }

    /// Attachments received so far, in order
    pub fn received(&self) -> &[Bytes] {
        &self.received
    }

    /// Whether the packet declared no attachments
    pub fn is_empty(&self) -> bool {
        self.declared == 0
    }

    /// Whether every declared attachment has arrived
    pub fn is_loaded(&self) -> bool {
        self.received.len() >= self.declared
    }

    /// Number of attachments still outstanding
    pub fn remaining(&self) -> usize {
        self.declared.saturating_sub(self.received.len())
    }

    /// Append the next attachment; returns whether the set is now complete
    pub fn push(&mut self, blob: Bytes) -> Result<bool, WireError> {
        if self.is_loaded() {
            return Err(WireError::Malformed("attachment beyond declared count"));
        }
        self.received.push(blob);
        Ok(self.is_loaded())
    }

    /// Keep the raw JSON body until the attachments are in
    pub(crate) fn retain_source(&mut self, body: Bytes) {
        self.source = Some(body);
    }

    /// Raw JSON body retained while attachments are pending
    pub fn source(&self) -> Option<&Bytes> {
        self.source.as_ref()
    }

    /// Replace every placeholder in the retained source with its quoted
    /// attachment. The source is consumed.
    pub fn splice(&mut self) -> Result<Bytes, WireError> {
        let source = self
            .source
            .take()
            .ok_or(WireError::Malformed("no attachment data source"))?;
        splice_placeholders(&source, &self.received)
    }
}

/// Replace placeholders `0..blobs.len()` in `source`, keeping the bytes
/// between them untouched.
pub fn splice_placeholders(source: &[u8], blobs: &[Bytes]) -> Result<Bytes, WireError> {
    let mut out = BytesMut::with_capacity(source.len() + blobs.iter().map(|b| b.len() * 4 / 3 + 4).sum::<usize>());
    let mut cursor = 0;

    for (num, blob) in blobs.iter().enumerate() {
        let (pos, token_len) = placeholder_tokens(num)
            .iter()
            .find_map(|token| {
                find(&source[cursor..], token.as_bytes()).map(|pos| (cursor + pos, token.len()))
            })
            .ok_or(WireError::MissingPlaceholder(num))?;

        out.put_slice(&source[cursor..pos]);
        out.put_u8(b'"');
        out.put_slice(STANDARD.encode(blob).as_bytes());
        out.put_u8(b'"');
        cursor = pos + token_len;
    }

    out.put_slice(&source[cursor..]);
    Ok(out.freeze())
}

/// Extract the attachment carried by a frame.
///
/// Binary frames must start with the message-type byte, which is dropped;
/// text frames must be `b4<base64>` and are decoded.
pub fn decode_attachment(frame: &Frame) -> Result<Bytes, WireError> {
    match frame.kind {
        FrameKind::Binary => {
            if frame.data.first() != Some(&BINARY_MESSAGE_BYTE) {
                return Err(WireError::Malformed("binary attachment without type byte"));
            }
            Ok(frame.data.slice(1..))
        }
        FrameKind::Text => {
            let text = frame
                .data
                .strip_prefix(TEXT_BINARY_PREFIX)
                .ok_or(WireError::Malformed("text attachment without b4 prefix"))?;
            Ok(Bytes::from(STANDARD.decode(text)?))
        }
    }
}

/// Binary frame carrying one attachment
pub fn attachment_frame(blob: &Bytes) -> Frame {
    let mut buf = BytesMut::with_capacity(blob.len() + 1);
    buf.put_u8(BINARY_MESSAGE_BYTE);
    buf.put_slice(blob);
    Frame::binary(buf.freeze())
}

/// Re-encode a binary frame for a text-only transport (`b4<base64>`)
pub fn to_text_frame(frame: &Frame) -> Frame {
    match frame.kind {
        FrameKind::Text => frame.clone(),
        FrameKind::Binary => {
            let data = frame
                .data
                .strip_prefix(&[BINARY_MESSAGE_BYTE])
                .unwrap_or(&frame.data[..]);
            let mut text = String::with_capacity(2 + data.len() * 4 / 3 + 4);
            text.push_str("b4");
            STANDARD.encode_string(data, &mut text);
            Frame::text(text)
        }
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
