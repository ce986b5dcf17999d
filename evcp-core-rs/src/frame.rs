//! Frame codec for the charging point wire protocol
//!
//! Each frame on the stream is laid out as:
//!
//! ```text
//! +------+-------------------------------+------+-----+
//! | STX  | field0 # field1 # ... # fieldN | ETX  | LRC |
//! +------+-------------------------------+------+-----+
//! ```
//!
//! `LRC` is the XOR of every payload byte between `STX` and `ETX`. Fields are
//! UTF-8 and never contain `#` or an ASCII control byte, so the first `ETX`
//! after `STX` always ends the payload.
//!
//! Decoding is three-way: a complete frame, "need more bytes", or a corrupt
//! stream. Incomplete input is never consumed, so bytes from partial reads
//! accumulate in the buffer until a full frame is present. A corrupt stream
//! cannot be resynchronised and the link owning it must be closed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::types::{Message, ETX, FIELD_SEPARATOR, STX};

/// Largest frame accepted before a terminator must have been seen
pub const MAX_FRAME_LEN: usize = 4096;

/// Result of one decode attempt
#[derive(Debug)]
pub enum Decoded {
    /// A valid frame was removed from the front of the buffer
    Frame(Message),
    /// The buffer holds a prefix of a frame; nothing was consumed
    Incomplete,
    /// The stream is corrupt and should be closed
    Corrupt(FrameError),
}

/// XOR checksum over the payload
pub fn lrc(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Encode a message into a standalone frame
pub fn encode(msg: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    encode_into(msg, &mut buf);
    buf.freeze()
}

/// Append the frame for `msg` to `dst`
pub fn encode_into(msg: &Message, dst: &mut BytesMut) {
    let start = dst.len();
    dst.put_u8(STX);
    for (i, field) in msg.fields().enumerate() {
        if i > 0 {
            dst.put_u8(FIELD_SEPARATOR);
        }
        dst.extend_from_slice(field.as_bytes());
    }
    let checksum = lrc(&dst[start + 1..]);
    dst.put_u8(ETX);
    dst.put_u8(checksum);
}

/// Decode the frame at the front of `buf` (see [`Decoded`])
pub fn decode(buf: &mut BytesMut, max_frame_len: usize) -> Decoded {
    if buf.is_empty() {
        return Decoded::Incomplete;
    }
    if buf[0] != STX {
        return Decoded::Corrupt(FrameError::Corrupt(format!(
            "expected STX, found 0x{:02x}",
            buf[0]
        )));
    }

    let mut etx_pos = None;
    for (i, &b) in buf.iter().enumerate().skip(1) {
        if b == ETX {
            etx_pos = Some(i);
            break;
        }
        if i >= max_frame_len {
            return Decoded::Corrupt(FrameError::TooLarge { max: max_frame_len });
        }
        if b.is_ascii_control() || !can_appear_in_utf8(b) {
            return Decoded::Corrupt(FrameError::Corrupt(format!(
                "unexpected byte 0x{:02x} at offset {}",
                b, i
            )));
        }
    }

    let etx_pos = match etx_pos {
        Some(pos) => pos,
        None => return Decoded::Incomplete,
    };

    // The checksum byte follows the terminator
    if buf.len() < etx_pos + 2 {
        return Decoded::Incomplete;
    }

    let mut frame = buf.split_to(etx_pos + 2);
    frame.advance(1);
    let payload = frame.split_to(etx_pos - 1);
    let expected = frame[1];

    let actual = lrc(&payload);
    if actual != expected {
        return Decoded::Corrupt(FrameError::Corrupt(format!(
            "checksum mismatch: expected 0x{:02x}, computed 0x{:02x}",
            expected, actual
        )));
    }

    let text = match std::str::from_utf8(&payload) {
        Ok(text) => text,
        Err(e) => return Decoded::Corrupt(FrameError::Corrupt(format!("payload not UTF-8: {}", e))),
    };

    let fields = text
        .split(FIELD_SEPARATOR as char)
        .map(str::to_string)
        .collect();

    match Message::from_fields(fields) {
        Some(msg) => Decoded::Frame(msg),
        None => Decoded::Corrupt(FrameError::Corrupt("empty message type".to_string())),
    }
}

/// Bytes that never occur in well-formed UTF-8
fn can_appear_in_utf8(b: u8) -> bool {
    !matches!(b, 0xC0 | 0xC1 | 0xF5..=0xFF)
}

/// Codec for use with `tokio_util::codec::Framed`
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Codec with a custom frame size limit
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        match decode(src, self.max_frame_len) {
            Decoded::Frame(msg) => Ok(Some(msg)),
            Decoded::Incomplete => Ok(None),
            Decoded::Corrupt(e) => Err(e),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_into(&item, dst);
        Ok(())
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_into(item, dst);
        Ok(())
    }
}
