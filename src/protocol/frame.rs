//! Frame encoding and decoding.
//!
//! Every frame starts with a 4-byte big-endian stream-ID word whose high
//! byte carries the frame type and whose low 24 bits carry the stream ID:
//!
//! ```text
//! ┌──────┬───────────┬──────────┬───────────┐
//! │ Type │ Stream ID │ Data Len │  Payload  │
//! │ 1 B  │  24 bits  │ 2 B (BE) │ <= 8192 B │
//! └──────┴───────────┴──────────┴───────────┘
//! ```
//!
//! The length field and payload are present only for DATA frames; ACK and
//! RST are the bare 4-byte word. All multi-byte integers are big endian.
//!
//! A session begins with an 11-byte preamble: the 9-byte tag `\0cmstart\0`,
//! one protocol-version byte, and one window byte (frames, 1..=255).

use crate::error::{MuxError, Result};

/// Size of the stream-ID word (frame type + 24-bit stream ID).
pub const ID_LEN: usize = 4;

/// Size of the DATA length field.
pub const LEN_LEN: usize = 2;

/// Size of a full DATA frame header.
pub const FRAME_HEADER_LEN: usize = ID_LEN + LEN_LEN;

/// Maximum payload carried by a single DATA frame.
pub const MAX_DATA_LEN: usize = 8192;

/// Maximum size of any frame on the wire.
pub const MAX_FRAME_LEN: usize = FRAME_HEADER_LEN + MAX_DATA_LEN;

/// Highest stream ID expressible in the 24-bit ID field.
pub const MAX_STREAM_ID: u32 = (1 << 24) - 1;

/// Protocol version carried in the preamble.
pub const PROTOCOL_VERSION: u8 = 1;

/// Literal tag opening a multiplexed session.
pub const SESSION_START: &[u8; 9] = b"\0cmstart\0";

/// Total preamble size: tag, version byte, window byte.
pub const PREAMBLE_LEN: usize = SESSION_START.len() + 2;

/// Frame type, carried in the high byte of the stream-ID word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Payload-bearing frame.
    Data = 0,
    /// Flow-control credit: the peer's reader advanced past one frame.
    Ack = 1,
    /// Abortive close of a single stream. No payload, no response.
    Rst = 2,
}

impl FrameType {
    /// Decode a frame type from the wire.
    pub fn from_wire(byte: u8) -> Result<FrameType> {
        match byte {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Ack),
            2 => Ok(FrameType::Rst),
            other => Err(MuxError::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

/// Encode the 4-byte word for a payload-less control frame (ACK or RST).
#[inline]
pub fn encode_control(ty: FrameType, id: u32) -> [u8; ID_LEN] {
    (((ty as u32) << 24) | (id & MAX_STREAM_ID)).to_be_bytes()
}

/// Split a stream-ID word into its raw type byte and 24-bit stream ID.
#[inline]
pub fn split_id_word(word: [u8; ID_LEN]) -> (u8, u32) {
    (word[0], u32::from_be_bytes(word) & MAX_STREAM_ID)
}

/// Encode a DATA header in place at the front of a frame buffer.
///
/// # Panics
///
/// Panics if `header` is shorter than `FRAME_HEADER_LEN` or `len` exceeds
/// `MAX_DATA_LEN`.
#[inline]
pub fn encode_data_header(header: &mut [u8], id: u32, len: usize) {
    debug_assert!(header.len() >= FRAME_HEADER_LEN);
    assert!(len <= MAX_DATA_LEN);
    header[..ID_LEN].copy_from_slice(&encode_control(FrameType::Data, id));
    header[ID_LEN..FRAME_HEADER_LEN].copy_from_slice(&(len as u16).to_be_bytes());
}

/// Decode the DATA length field that follows the stream-ID word.
///
/// A length past the payload cap is a protocol violation and fails the
/// session.
#[inline]
pub fn decode_data_len(field: [u8; LEN_LEN]) -> Result<usize> {
    let len = u16::from_be_bytes(field) as usize;
    if len > MAX_DATA_LEN {
        return Err(MuxError::Protocol(format!(
            "data length {len} exceeds maximum {MAX_DATA_LEN}"
        )));
    }
    Ok(len)
}

/// Outcome of probing a fresh pipe for the session preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preamble {
    /// The tag matched: the pipe is multiplexed with this window.
    Mux { window: u8 },
    /// Not a multiplexed pipe; the probed bytes belong to the caller.
    Other,
}

/// Encode the session preamble an initiator sends on a fresh pipe.
pub fn encode_preamble(window: u8) -> [u8; PREAMBLE_LEN] {
    let mut buf = [0u8; PREAMBLE_LEN];
    buf[..SESSION_START.len()].copy_from_slice(SESSION_START);
    buf[SESSION_START.len()] = PROTOCOL_VERSION;
    buf[SESSION_START.len() + 1] = window;
    buf
}

/// Parse the 11 bytes probed from a fresh pipe.
///
/// A non-matching tag means the pipe is not multiplexed and the bytes must
/// be replayed to the caller. A matching tag with an unknown version or a
/// zero window is a protocol violation: the bytes are ours, but unusable.
pub fn parse_preamble(buf: &[u8; PREAMBLE_LEN]) -> Result<Preamble> {
    if &buf[..SESSION_START.len()] != SESSION_START {
        return Ok(Preamble::Other);
    }
    let version = buf[SESSION_START.len()];
    if version != PROTOCOL_VERSION {
        return Err(MuxError::Protocol(format!(
            "unsupported protocol version {version}"
        )));
    }
    let window = buf[SESSION_START.len() + 1];
    if window == 0 {
        return Err(MuxError::Protocol("advertised window is zero".to_string()));
    }
    Ok(Preamble::Mux { window })
}
