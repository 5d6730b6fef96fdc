//! # Frame
//!
//! WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2),
//! the atomic unit of transmission on a connection.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data frames**: [`OpCode::Text`] (UTF-8), [`OpCode::Binary`] (raw
//!   bytes), and [`OpCode::Continuation`] for fragmented messages.
//! - **Control frames**: [`OpCode::Close`], [`OpCode::Ping`], and
//!   [`OpCode::Pong`]; always final, payload at most 125 bytes.
//!
//! A [`Frame`] caches its serialized form: the first call to
//! [`Frame::encode`] builds the wire bytes, and subsequent calls reuse them
//! until the payload or masking key is mutated.

use bytes::{Bytes, BytesMut};

use crate::{close::CloseCode, mask, WebSocketError};

/// Largest possible frame header: 2 fixed bytes, 8 bytes of extended
/// length, and a 4-byte masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// Upper bound on a control-frame payload, including the 2-byte close code.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code (OpCode) that determines the semantic meaning and
/// handling of a frame.
///
/// The numeric values are defined in
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// Continuation = 0x0, Text = 0x1, Binary = 0x2, Close = 0x8, Ping = 0x9,
/// Pong = 0xA. The ranges 0x3-0x7 and 0xB-0xF are reserved; frames carrying
/// them are rejected as invalid.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame
    /// (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames manage the connection state and have special
    /// constraints: they cannot be fragmented, their payload must not exceed
    /// 125 bytes, and they are processed immediately rather than queued with
    /// data frames.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    /// Interprets the opcode field of a frame header, rejecting the reserved
    /// ranges with [`WebSocketError::InvalidOpCode`].
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A single WebSocket frame: control bits, opcode, optional masking key, and
/// payload.
///
/// Servers emit unmasked frames; the masking path exists for protocol
/// symmetry (and for reuse by client-role code) and uses a random key drawn
/// per frame when none is set explicitly.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The three reserved header bits. Always zero here since no extension
    /// is ever negotiated; kept so a parsed frame retains what was on the
    /// wire.
    rsv: u8,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key, present iff the frame is masked.
    mask: Option<[u8; 4]>,
    /// The unmasked payload of the frame.
    payload: BytesMut,
    /// Cached wire encoding; dropped whenever payload or key change.
    encoded: Option<Bytes>,
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        // the cache is derived state and does not take part in identity
        self.fin == other.fin
            && self.rsv == other.rsv
            && self.opcode == other.opcode
            && self.mask == other.mask
            && self.payload == other.payload
    }
}

impl Frame {
    /// Creates a new WebSocket `Frame`.
    ///
    /// # Parameters
    /// - `fin`: Indicates if this frame is the final fragment in a message.
    /// - `opcode`: The operation code of the frame.
    /// - `mask`: Optional 4-byte masking key, used in client-to-server frames.
    /// - `payload`: The frame payload data, unmasked.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            rsv: 0,
            opcode,
            mask,
            payload: payload.into(),
            encoded: None,
        }
    }

    /// Creates a final text frame with the given payload.
    pub fn text(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Creates a final binary frame with the given payload.
    pub fn binary(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Creates a ping frame with the given payload.
    pub fn ping(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// Creates a pong frame with the given payload, typically echoing the
    /// payload of the ping it answers.
    pub fn pong(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Creates a close frame carrying `code` and as much of `reason` as fits.
    ///
    /// The payload is the 2-byte big-endian code followed by the UTF-8
    /// reason, truncated at a character boundary so the total stays within
    /// the 125-byte control-frame limit.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut cut = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }

        let mut payload = BytesMut::with_capacity(2 + cut);
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(&reason.as_bytes()[..cut]);

        Self::new(true, OpCode::Close, None, payload)
    }

    /// Creates a close frame with an empty payload, read by the peer as
    /// code 1005 (no status).
    pub fn close_empty() -> Self {
        Self::new(true, OpCode::Close, None, BytesMut::new())
    }

    /// Creates a close frame with a raw payload, without enforcing the
    /// code/reason structure.
    pub fn close_raw(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Creates a continuation frame for a fragmented message.
    pub fn continuation(fin: bool, payload: impl Into<BytesMut>) -> Self {
        Self::new(fin, OpCode::Continuation, None, payload)
    }

    pub(crate) fn with_rsv(mut self, rsv: u8) -> Self {
        self.rsv = rsv & 0b111;
        self.encoded = None;
        self
    }

    /// The three reserved header bits, packed into the low bits of a byte.
    pub fn rsv(&self) -> u8 {
        self.rsv
    }

    /// The unmasked payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Mutable access to the payload. Invalidates the cached encoding.
    pub fn payload_mut(&mut self) -> &mut BytesMut {
        self.encoded = None;
        &mut self.payload
    }

    /// Consumes the frame, returning its payload.
    pub fn into_payload(self) -> BytesMut {
        self.payload
    }

    /// Returns whether the frame carries a masking key.
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// The masking key, if any.
    pub fn masking_key(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Sets an explicit masking key. Invalidates the cached encoding.
    pub fn set_mask(&mut self, key: [u8; 4]) {
        self.mask = Some(key);
        self.encoded = None;
    }

    /// Masks the frame with a fresh random key, as a client would before
    /// transmission. No-op if a key is already set.
    pub fn mask_with_random_key(&mut self) {
        if self.mask.is_none() {
            self.set_mask(rand::random());
        }
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// Extracts the close code from a close frame's payload.
    ///
    /// # Returns
    /// - `Some(CloseCode)` if the payload holds at least the 2-byte code
    /// - `None` if the payload is empty or too short
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Extracts the close reason from a close frame's payload.
    ///
    /// # Returns
    /// - `Some(&str)` when bytes follow the code and are valid UTF-8
    /// - `None` otherwise
    pub fn close_reason(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }

    /// Serializes the frame, returning (and caching) the wire bytes.
    ///
    /// The header is formatted per the frame layout above; when a masking
    /// key is present the emitted payload is XORed with it, leaving the
    /// in-memory payload untouched.
    pub fn encode(&mut self) -> Bytes {
        if let Some(cached) = &self.encoded {
            return cached.clone();
        }

        let mut head = [0u8; MAX_HEAD_SIZE];
        let head_len = self.fmt_head(&mut head);

        let mut out = BytesMut::with_capacity(head_len + self.payload.len());
        out.extend_from_slice(&head[..head_len]);
        match self.mask {
            Some(key) => {
                let masked_at = out.len();
                out.extend_from_slice(&self.payload);
                mask::apply_mask(&mut out[masked_at..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }

        let encoded = out.freeze();
        self.encoded = Some(encoded.clone());
        encoded
    }

    /// Formats the frame header into `head` and returns its size: the two
    /// fixed bytes, 0/2/8 bytes of big-endian extended length, and the
    /// 4-byte key when masked.
    fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | self.rsv << 4 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(key) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&key);
            size + 4
        } else {
            size
        }
    }
}
