//! Incremental frame parser.
//!
//! [`FrameCodec`] consumes bytes from a connection's read buffer and yields
//! complete [`Frame`] values. Parsing happens in stages — fixed header,
//! extended length, masking key, payload — and partial progress is kept
//! across calls, so the codec can be driven by a non-blocking read loop that
//! appends whatever the socket had available and retries on the next tick.
//!
//! Serialization lives on [`Frame::encode`]; [`FrameCodec::encode`] is a thin
//! wrapper that appends the (cached) wire bytes to an output buffer.

use bytes::{Buf, BytesMut};

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    mask, Result, WebSocketError,
};

/// Parsing state once the fixed 2-byte header has been consumed.
struct Header {
    /// Final-fragment flag from bit 7 of the first byte.
    fin: bool,
    /// The three reserved bits (must be zero without extensions).
    rsv: u8,
    /// Whether a masking key follows the length.
    masked: bool,
    /// Frame type.
    opcode: OpCode,
    /// The 7-bit length code (0-125 literal, 126/127 extended).
    length_code: u8,
    /// Bytes of extended length still to read (0, 2, or 8).
    extra: usize,
    /// Remaining header size: extended length plus masking key.
    header_size: usize,
}

/// Header plus resolved length and key, waiting for the payload bytes.
struct HeaderAndKey {
    header: Header,
    key: Option<[u8; 4]>,
    payload_len: usize,
}

enum ReadState {
    /// Fixed header consumed, reading extended length and key.
    Header(Header),
    /// Everything but the payload consumed.
    Payload(HeaderAndKey),
}

/// Stateful parser for a single direction of a connection.
///
/// A server-side codec rejects unmasked input, as RFC 6455 requires; the
/// [`accept_unmasked`](FrameCodec::accept_unmasked) toggle exists for tests
/// and for interoperating with peers that ignore the masking rule.
pub struct FrameCodec {
    /// Current reading state, `None` before a frame starts.
    state: Option<ReadState>,
    /// Maximum allowed size for a single frame payload.
    max_payload_read: usize,
    /// Whether inbound frames must carry a masking key.
    require_masked: bool,
}

impl FrameCodec {
    /// Creates a parser that enforces client-to-server masking and rejects
    /// payloads larger than `max_payload_read` bytes.
    pub fn new(max_payload_read: usize) -> Self {
        Self {
            state: None,
            max_payload_read,
            require_masked: true,
        }
    }

    /// Accept frames without a masking key. Off by default: a conforming
    /// server fails the connection on unmasked input.
    pub fn accept_unmasked(mut self) -> Self {
        self.require_masked = false;
        self
    }

    /// Attempts to decode one frame from `src`.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))` when a full frame was consumed; the payload is
    ///   already unmasked and the masking key (if any) is retained on the
    ///   frame.
    /// - `Ok(None)` when more bytes are needed; consumed prefix bytes are
    ///   remembered and parsing resumes where it left off.
    /// - `Err(WebSocketError)` on a protocol violation. The codec is not
    ///   usable afterwards; the connection fails with the error's close code.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv = (src[0] & 0b0111_0000) >> 4;
                    if rsv != 0 {
                        // no extension is ever negotiated
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    if self.require_masked && !masked {
                        return Err(WebSocketError::UnmaskedFrame);
                    }

                    let length_code = src[1] & 0x7F;
                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: u64 = match header.extra {
                        0 => u64::from(header.length_code),
                        2 => u64::from(src.get_u16()),
                        8 => src.get_u64(),
                        _ => unreachable!(),
                    };

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }

                    if payload_len > self.max_payload_read as u64 {
                        return Err(WebSocketError::FrameTooLarge);
                    }
                    let payload_len = usize::try_from(payload_len)
                        .map_err(|_| WebSocketError::FrameTooLarge)?;

                    let key = header.masked.then(|| src.get_u32().to_be_bytes());

                    self.state = Some(ReadState::Payload(HeaderAndKey {
                        header,
                        key,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(pending)) => {
                    if src.remaining() < pending.payload_len {
                        self.state = Some(ReadState::Payload(pending));
                        return Ok(None);
                    }

                    let mut payload = src.split_to(pending.payload_len);
                    if let Some(key) = pending.key {
                        mask::apply_mask(&mut payload, key);
                    }

                    let header = pending.header;
                    let frame = Frame::new(header.fin, header.opcode, pending.key, payload)
                        .with_rsv(header.rsv);

                    break Ok(Some(frame));
                }
            }
        }
    }

    /// Appends the wire encoding of `frame` to `dst`.
    pub fn encode(&mut self, frame: &mut Frame, dst: &mut BytesMut) {
        dst.extend_from_slice(&frame.encode());
    }
}
