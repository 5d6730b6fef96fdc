//! Per-peer connection state machine.
//!
//! A [`Connection`] owns one [`ByteStream`] and walks it through the
//! WebSocket lifecycle:
//!
//! ```text
//!  NEW ──handshake ok──▶ OPEN ──close started──▶ CLOSING ──▶ CLOSED
//!   │                      │                                    ▲
//!   └──handshake error─────┴────────TCP lost (1006)─────────────┘
//! ```
//!
//! Progress happens exclusively inside [`cycle`](Connection::cycle), which
//! the application's driver loop invokes once per tick per connection. A
//! cycle never blocks: it reads whatever bytes the stream has, advances the
//! handshake or the frame parser, and dispatches events to subscribed
//! [`ConnectionObserver`]s. All protocol failures are recovered into a
//! clean close — the only failure signal an application ever sees is the
//! final `close(code, reason)` event.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};

use crate::close::CloseCode;
use crate::codec::FrameCodec;
use crate::cookie::{self, Cookie};
use crate::frame::{Frame, OpCode};
use crate::http::{self, Headers};
use crate::observer::{self, Bus, ConnectionObserver, SharedConnectionObserver};
use crate::options::Options;
use crate::stream::{ByteStream, READ_CHUNK};
use crate::{Result, WebSocketError};

/// Shared handle to a connection, as stored in the driver's table.
pub type SharedConnection = Rc<RefCell<Connection>>;

/// Observable phase of a connection. Advances monotonically; there are no
/// backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    /// Created, handshake not finished.
    New,
    /// Handshake complete; messages flow.
    Open,
    /// A close frame went out; waiting for the peer's reply or the grace
    /// period.
    Closing,
    /// Fully terminated. The close event has been (or is being) delivered.
    Closed,
}

impl ReadyState {
    /// True while messages can be sent.
    pub fn is_open(self) -> bool {
        self == ReadyState::Open
    }

    /// True once the connection is fully terminated.
    pub fn is_closed(self) -> bool {
        self == ReadyState::Closed
    }
}

/// A complete application message, assembled from one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text. Validation happened during assembly; invalid text never
    /// reaches the application (the connection fails with 1007 instead).
    Text(String),
    /// Raw bytes.
    Binary(Bytes),
}

impl Message {
    /// The opcode the first frame of this message carries.
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    /// The payload as bytes, whatever the message type.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(bytes) => bytes,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(text) => Bytes::from(text.into_bytes()),
            Message::Binary(bytes) => bytes,
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(bytes))
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Message::Binary(bytes)
    }
}

/// One peer of the server.
///
/// The listener creates a connection in `NEW` and hands it to the
/// application, which keeps it in a collection and calls
/// [`cycle`](Connection::cycle) every tick until the state reaches
/// `CLOSED`. The connection exclusively owns its byte stream; observers
/// hold non-owning references back to it (see [`crate::observer`]).
pub struct Connection {
    id: u64,
    addr: SocketAddr,
    stream: ByteStream,
    state: ReadyState,
    options: Options,
    codec: FrameCodec,

    /// Bytes read off the stream, waiting for the frame parser.
    read_buf: BytesMut,
    /// Serialized frames (or handshake bytes) not yet accepted by the
    /// transport.
    write_buf: BytesMut,

    // --- opening handshake ---
    resource: String,
    headers: Headers,
    request_cookies: Vec<(String, String)>,
    pending_cookies: Vec<Cookie>,
    allowed_subprotocols: Vec<String>,
    subprotocol: Option<String>,
    got_request_line: bool,
    read_handshake: bool,
    sent_handshake: bool,

    // --- message assembly ---
    /// Opcode of the in-flight fragmented message, `None` when idle.
    fragment_opcode: Option<OpCode>,
    fragments: BytesMut,

    // --- closing handshake ---
    received_close: bool,
    sent_close: bool,
    close_started_at: Option<Instant>,
    close_code: Option<CloseCode>,
    close_reason: String,
    close_emitted: bool,

    last_traffic: Instant,
    observers: Bus<dyn ConnectionObserver>,
}

impl Connection {
    /// Creates a connection in `NEW` over an accepted stream.
    ///
    /// The stream's transport must already be non-blocking. `id` is the
    /// stable opaque identity observers use to correlate events.
    pub fn new(
        id: u64,
        stream: ByteStream,
        addr: SocketAddr,
        allowed_subprotocols: Vec<String>,
        options: Options,
    ) -> Self {
        let codec = FrameCodec::new(options.max_payload_read);
        Self {
            id,
            addr,
            stream,
            state: ReadyState::New,
            options,
            codec,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            resource: String::new(),
            headers: Headers::default(),
            request_cookies: Vec::new(),
            pending_cookies: Vec::new(),
            allowed_subprotocols,
            subprotocol: None,
            got_request_line: false,
            read_handshake: false,
            sent_handshake: false,
            fragment_opcode: None,
            fragments: BytesMut::new(),
            received_close: false,
            sent_close: false,
            close_started_at: None,
            close_code: None,
            close_reason: String::new(),
            close_emitted: false,
            last_traffic: Instant::now(),
            observers: Bus::default(),
        }
    }

    /// Stable opaque identity of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer's address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current lifecycle phase.
    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    /// Resource path from the upgrade request line (empty before the
    /// handshake).
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Request header lookup, case-insensitive.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Value of a cookie the client sent in its `Cookie` header.
    pub fn get_cookie(&self, name: &str) -> Option<&str> {
        self.request_cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Subprotocol negotiated during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Total bytes read from the peer.
    pub fn bytes_in(&self) -> u64 {
        self.stream.bytes_in()
    }

    /// Total bytes written to the peer.
    pub fn bytes_out(&self) -> u64 {
        self.stream.bytes_out()
    }

    /// Queues a cookie for the handshake response. Only meaningful while
    /// the connection is `NEW`; ignored once the response has gone out.
    pub fn set_cookie(&mut self, cookie: Cookie) {
        if self.state == ReadyState::New && !self.sent_handshake {
            self.pending_cookies.push(cookie);
        }
    }

    /// Subscribes an observer. Idempotent by identity.
    pub fn subscribe(&mut self, observer: SharedConnectionObserver) {
        self.observers.subscribe(observer);
    }

    /// Unsubscribes an observer by identity.
    pub fn unsubscribe(&mut self, observer: &SharedConnectionObserver) {
        self.observers.unsubscribe(observer);
    }

    /// Runs one non-blocking step of the connection.
    ///
    /// While `NEW` this advances the handshake; once open it drains
    /// pending writes, reads up to one chunk off the stream, parses as many
    /// frames as that yields, and dispatches the resulting events. Always
    /// returns promptly and is idempotent when there is nothing to do.
    pub fn cycle(&mut self) {
        if self.state == ReadyState::New {
            self.flush();
            self.advance_handshake();
            self.flush();
            self.maybe_open();
        }

        if matches!(self.state, ReadyState::Open | ReadyState::Closing) {
            self.flush();
            self.pump_frames();
            if self.state == ReadyState::Closing {
                self.check_close_grace();
            }
        }
    }

    /// Sends a complete message, fragmenting it when it exceeds the
    /// configured outbound frame size.
    ///
    /// # Errors
    /// [`WebSocketError::ConnectionClosed`] unless the connection is OPEN.
    pub fn send(&mut self, message: impl Into<Message>) -> Result<()> {
        if self.state != ReadyState::Open {
            return Err(WebSocketError::ConnectionClosed);
        }

        let message = message.into();
        let opcode = message.opcode();
        let payload = message.into_bytes();
        let max = self.options.max_payload_write.max(1);

        if payload.len() <= max {
            self.queue_frame(Frame::new(true, opcode, None, payload.as_ref()));
        } else {
            let mut offset = 0;
            let mut first = true;
            while offset < payload.len() {
                let end = (offset + max).min(payload.len());
                let fin = end == payload.len();
                let op = if first { opcode } else { OpCode::Continuation };
                self.queue_frame(Frame::new(fin, op, None, &payload[offset..end]));
                first = false;
                offset = end;
            }
        }

        self.flush();
        Ok(())
    }

    /// Sends a zero-payload ping.
    pub fn ping(&mut self) -> Result<()> {
        self.send_control(Frame::ping(BytesMut::new()))
    }

    /// Sends a zero-payload pong.
    pub fn pong(&mut self) -> Result<()> {
        self.send_control(Frame::pong(BytesMut::new()))
    }

    fn send_control(&mut self, frame: Frame) -> Result<()> {
        if self.state != ReadyState::Open {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.queue_frame(frame);
        self.flush();
        Ok(())
    }

    /// Runs the closing handshake.
    ///
    /// - Neither side has sent a close yet: sends `close(code, reason)`,
    ///   moves to `CLOSING`, and starts the grace timer.
    /// - The peer's close already arrived: sends the reply (echoing the
    ///   peer's code when no code is given), shuts the socket, `CLOSED`.
    /// - Both closes already exchanged: shuts the socket, `CLOSED`.
    ///
    /// With no `code` the close frame carries no payload (the peer reads
    /// 1005); with a code the reason is truncated to fit the control-frame
    /// limit.
    pub fn disconnect(&mut self, code: Option<CloseCode>, reason: Option<&str>) {
        match self.state {
            ReadyState::Closed => {}
            ReadyState::New => {
                // nothing to close over yet
                self.record_close(code.unwrap_or(CloseCode::Away), reason.unwrap_or(""));
                self.finish_close();
            }
            ReadyState::Open | ReadyState::Closing => {
                if self.received_close && self.sent_close {
                    self.finish_close();
                } else if self.received_close {
                    let reply = match (code, self.close_code) {
                        (Some(code), _) => Frame::close(code, reason.unwrap_or("")),
                        (None, Some(peer)) if peer != CloseCode::NoStatus => {
                            Frame::close(peer, "")
                        }
                        _ => Frame::close_empty(),
                    };
                    self.queue_frame(reply);
                    self.sent_close = true;
                    self.flush();
                    self.finish_close();
                } else if !self.sent_close {
                    log::debug!(
                        "connection {}: closing with {:?} {:?}",
                        self.id,
                        code,
                        reason
                    );
                    let frame = match code {
                        Some(code) => Frame::close(code, reason.unwrap_or("")),
                        None => Frame::close_empty(),
                    };
                    self.record_close(code.unwrap_or(CloseCode::NoStatus), reason.unwrap_or(""));
                    self.queue_frame(frame);
                    self.sent_close = true;
                    self.close_started_at = Some(Instant::now());
                    self.state = ReadyState::Closing;
                    self.flush();
                }
                // close sent and still waiting: nothing more to do
            }
        }
    }

    /// Tears the connection down immediately, without waiting for the
    /// peer's side of the closing handshake. The close event still fires
    /// exactly once, with `code` (default 1000).
    pub fn close(&mut self, code: Option<CloseCode>, reason: Option<&str>) {
        if self.state == ReadyState::Closed {
            return;
        }
        self.record_close(code.unwrap_or(CloseCode::Normal), reason.unwrap_or(""));
        self.finish_close();
    }

    /// Applies the idle policy: ping after `ping_after` without traffic,
    /// disconnect with 1001 after `drop_after`. The driver calls this
    /// periodically (every few hundred ticks is plenty).
    pub fn keepalive(&mut self) {
        if self.state != ReadyState::Open {
            return;
        }
        let idle = self.last_traffic.elapsed();
        if idle >= self.options.drop_after {
            log::debug!("connection {}: idle for {idle:?}, dropping", self.id);
            self.disconnect(Some(CloseCode::Away), Some("idle timeout"));
        } else if idle >= self.options.ping_after {
            let _ = self.ping();
        }
    }

    // --- opening handshake ---

    fn advance_handshake(&mut self) {
        while self.state == ReadyState::New && !self.read_handshake {
            let Some(line) = self.stream.read_line() else {
                if self.stream.is_eof() {
                    self.transport_lost();
                }
                return;
            };
            self.last_traffic = Instant::now();

            if !self.got_request_line {
                match http::parse_request_line(&line) {
                    Ok(resource) => {
                        self.resource = resource;
                        self.got_request_line = true;
                    }
                    Err(err) => return self.fail_handshake(err),
                }
            } else if line.is_empty() {
                match http::validate_upgrade(&self.headers) {
                    Ok(key) => self.finish_handshake(&key),
                    Err(err) => return self.fail_handshake(err),
                }
                return;
            } else {
                match http::parse_header_line(&line) {
                    Ok((name, value)) => {
                        if name == "cookie" {
                            self.request_cookies
                                .extend(cookie::parse_cookie_header(&value));
                        }
                        self.headers.insert(name, value);
                    }
                    Err(err) => return self.fail_handshake(err),
                }
            }
        }
    }

    fn finish_handshake(&mut self, key: &str) {
        self.read_handshake = true;
        log::debug!(
            "connection {}: handshake for {} from {}",
            self.id,
            self.resource,
            self.addr
        );
        self.emit_handshake();

        self.subprotocol = http::select_subprotocol(&self.headers, &self.allowed_subprotocols);
        let response =
            http::accept_response(key, self.subprotocol.as_deref(), &self.pending_cookies);
        self.pending_cookies.clear();
        self.write_buf.extend_from_slice(response.as_bytes());
        self.sent_handshake = true;
    }

    fn maybe_open(&mut self) {
        if self.state == ReadyState::New && self.sent_handshake && self.write_buf.is_empty() {
            self.state = ReadyState::Open;
            log::debug!("connection {}: open", self.id);
            self.emit_open();
        }
    }

    /// A request that never was a valid upgrade: answer with plain HTTP and
    /// drop the link. No WebSocket events beyond the final close.
    fn fail_handshake(&mut self, err: WebSocketError) {
        log::debug!("connection {}: handshake rejected: {err}", self.id);
        self.write_buf
            .extend_from_slice(http::error_response(err.http_status()).as_bytes());
        self.flush();
        self.record_close(CloseCode::Protocol, "");
        self.finish_close();
    }

    // --- frame pump ---

    fn pump_frames(&mut self) {
        if let Some(chunk) = self.stream.read(READ_CHUNK) {
            self.last_traffic = Instant::now();
            self.read_buf.extend_from_slice(&chunk);
        }

        while matches!(self.state, ReadyState::Open | ReadyState::Closing) {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(frame)) => self.on_frame(frame),
                Ok(None) => break,
                Err(err) => return self.fail(err),
            }
        }

        if !matches!(self.state, ReadyState::Closed) && self.stream.is_eof() {
            self.transport_lost();
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        // once our close is out only the peer's close still matters
        if self.state == ReadyState::Closing && frame.opcode != OpCode::Close {
            return;
        }

        match frame.opcode {
            OpCode::Close => self.on_close_frame(&frame),
            OpCode::Ping => {
                // the pong goes out before the application hears about it
                self.queue_frame(Frame::pong(frame.payload()));
                self.flush();
                self.emit_ping(frame.payload());
            }
            OpCode::Pong => self.emit_pong(frame.payload()),
            OpCode::Text | OpCode::Binary => {
                if self.fragment_opcode.is_some() {
                    return self.fail(WebSocketError::InvalidFragment);
                }
                if frame.fin {
                    self.deliver_message(frame.opcode, frame.into_payload());
                } else {
                    self.fragment_opcode = Some(frame.opcode);
                    self.fragments.extend_from_slice(frame.payload());
                }
            }
            OpCode::Continuation => {
                let Some(opcode) = self.fragment_opcode else {
                    return self.fail(WebSocketError::InvalidContinuationFrame);
                };
                if self
                    .fragments
                    .len()
                    .saturating_add(frame.payload().len())
                    > self.options.max_payload_read
                {
                    return self.fail(WebSocketError::FrameTooLarge);
                }
                self.fragments.extend_from_slice(frame.payload());
                if frame.fin {
                    let payload = std::mem::take(&mut self.fragments);
                    self.fragment_opcode = None;
                    self.deliver_message(opcode, payload);
                }
            }
        }
    }

    fn deliver_message(&mut self, opcode: OpCode, payload: BytesMut) {
        let message = match opcode {
            OpCode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => Message::Text(text),
                Err(_) => return self.fail(WebSocketError::InvalidUTF8),
            },
            _ => Message::Binary(payload.freeze()),
        };
        self.emit_message(&message);
    }

    // --- closing handshake ---

    fn on_close_frame(&mut self, frame: &Frame) {
        self.received_close = true;

        let payload = frame.payload();
        let (code, reason) = if payload.is_empty() {
            (None, String::new())
        } else if payload.len() == 1 {
            return self.fail(WebSocketError::InvalidCloseFrame);
        } else {
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            let code = CloseCode::from(raw);
            if !code.is_allowed_on_wire() {
                return self.fail(WebSocketError::InvalidCloseCode(raw));
            }
            match std::str::from_utf8(&payload[2..]) {
                Ok(reason) => (Some(code), reason.to_owned()),
                Err(_) => return self.fail(WebSocketError::InvalidCloseFrame),
            }
        };

        self.record_close(code.unwrap_or(CloseCode::NoStatus), &reason);

        if !self.sent_close {
            let reply = match code {
                Some(code) => Frame::close(code, ""),
                None => Frame::close_empty(),
            };
            self.queue_frame(reply);
            self.sent_close = true;
        }
        self.flush();
        self.finish_close();
    }

    fn check_close_grace(&mut self) {
        if let Some(started) = self.close_started_at {
            if started.elapsed() >= self.options.close_grace {
                log::debug!(
                    "connection {}: peer never answered the close frame",
                    self.id
                );
                self.finish_close();
            }
        }
    }

    /// Fails the connection over a protocol violation: send a close frame
    /// with the matching code, then tear down without waiting for a reply.
    fn fail(&mut self, err: WebSocketError) {
        log::debug!("connection {}: failing: {err}", self.id);
        let code = err.close_code();
        let reason = err.close_reason();
        self.record_close(code, &reason);
        if !self.sent_close && code != CloseCode::Abnormal {
            self.queue_frame(Frame::close(code, &reason));
            self.sent_close = true;
            self.flush();
        }
        self.finish_close();
    }

    /// The TCP link died without a closing handshake: synthesize 1006.
    fn transport_lost(&mut self) {
        log::debug!("connection {}: transport lost", self.id);
        self.close_code = Some(CloseCode::Abnormal);
        self.close_reason.clear();
        self.finish_close();
    }

    /// First close recording wins; later paths keep the original
    /// code/reason for the close event.
    fn record_close(&mut self, code: CloseCode, reason: &str) {
        if self.close_code.is_none() {
            self.close_code = Some(code);
            self.close_reason = reason.to_owned();
        }
    }

    fn finish_close(&mut self) {
        self.stream.close();
        self.state = ReadyState::Closed;
        self.emit_close();
    }

    // --- output ---

    fn queue_frame(&mut self, mut frame: Frame) {
        self.codec.encode(&mut frame, &mut self.write_buf);
    }

    fn flush(&mut self) {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => break, // backpressure, retry next tick
                Ok(n) => self.write_buf.advance(n),
                Err(err) => {
                    log::debug!("connection {}: write failed: {err}", self.id);
                    self.write_buf.clear();
                    if self.state != ReadyState::Closed {
                        self.transport_lost();
                    }
                    break;
                }
            }
        }
    }

    // --- event dispatch ---
    //
    // State is fully consistent before each dispatch, and handlers receive
    // `&mut self`, so re-entrant send/disconnect calls are fine.

    fn emit_handshake(&mut self) {
        for subscriber in self.observers.snapshot() {
            let mut handler = subscriber.borrow_mut();
            observer::guard("handshake-received", || handler.on_handshake(&mut *self));
        }
    }

    fn emit_open(&mut self) {
        for subscriber in self.observers.snapshot() {
            let mut handler = subscriber.borrow_mut();
            observer::guard("open", || handler.on_open(&mut *self));
        }
    }

    fn emit_message(&mut self, message: &Message) {
        for subscriber in self.observers.snapshot() {
            let mut handler = subscriber.borrow_mut();
            observer::guard("message", || handler.on_message(&mut *self, message));
        }
    }

    fn emit_ping(&mut self, payload: &[u8]) {
        for subscriber in self.observers.snapshot() {
            let mut handler = subscriber.borrow_mut();
            observer::guard("ping", || handler.on_ping(&mut *self, payload));
        }
    }

    fn emit_pong(&mut self, payload: &[u8]) {
        for subscriber in self.observers.snapshot() {
            let mut handler = subscriber.borrow_mut();
            observer::guard("pong", || handler.on_pong(&mut *self, payload));
        }
    }

    fn emit_close(&mut self) {
        if self.close_emitted {
            return;
        }
        self.close_emitted = true;

        let code = self.close_code.unwrap_or(CloseCode::NoStatus);
        let reason = std::mem::take(&mut self.close_reason);
        for subscriber in self.observers.snapshot() {
            let mut handler = subscriber.borrow_mut();
            observer::guard("close", || handler.on_close(&mut *self, code, &reason));
        }
        self.close_reason = reason;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::{pipe, Pipe};
    use std::time::Duration;

    const RFC_HANDSHAKE: &str = "GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Origin: http://example.com\r\n\
        Sec-WebSocket-Protocol: chat, superchat\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Handshake,
        Open,
        Message(Message),
        Ping(Vec<u8>),
        Pong(Vec<u8>),
        Close(CloseCode, String),
    }

    struct Recorder {
        log: Rc<RefCell<Vec<Event>>>,
    }

    impl ConnectionObserver for Recorder {
        fn on_handshake(&mut self, _conn: &mut Connection) {
            self.log.borrow_mut().push(Event::Handshake);
        }

        fn on_open(&mut self, _conn: &mut Connection) {
            self.log.borrow_mut().push(Event::Open);
        }

        fn on_message(&mut self, _conn: &mut Connection, message: &Message) {
            self.log.borrow_mut().push(Event::Message(message.clone()));
        }

        fn on_ping(&mut self, _conn: &mut Connection, payload: &[u8]) {
            self.log.borrow_mut().push(Event::Ping(payload.to_vec()));
        }

        fn on_pong(&mut self, _conn: &mut Connection, payload: &[u8]) {
            self.log.borrow_mut().push(Event::Pong(payload.to_vec()));
        }

        fn on_close(&mut self, _conn: &mut Connection, code: CloseCode, reason: &str) {
            self.log
                .borrow_mut()
                .push(Event::Close(code, reason.to_owned()));
        }
    }

    fn recorder() -> (SharedConnectionObserver, Rc<RefCell<Vec<Event>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let observer: SharedConnectionObserver = Rc::new(RefCell::new(Recorder {
            log: Rc::clone(&log),
        }));
        (observer, log)
    }

    fn new_connection(options: Options, protocols: &[&str]) -> (Connection, Pipe) {
        let (server, client) = pipe();
        let connection = Connection::new(
            1,
            ByteStream::new(Box::new(server)),
            "203.0.113.7:54321".parse().unwrap(),
            protocols.iter().map(|p| p.to_string()).collect(),
            options,
        );
        (connection, client)
    }

    /// Runs the RFC sample handshake and returns the server's 101 response.
    fn open_handshake(connection: &mut Connection, client: &mut Pipe) -> String {
        client.feed(RFC_HANDSHAKE.as_bytes());
        connection.cycle();
        assert!(connection.ready_state().is_open());
        String::from_utf8(client.drain()).unwrap()
    }

    fn masked(mut frame: Frame) -> Vec<u8> {
        frame.set_mask(MASK);
        frame.encode().to_vec()
    }

    #[test]
    fn s1_rfc_sample_handshake() {
        let (mut connection, mut client) = new_connection(Options::default(), &["chat"]);
        let (observer, log) = recorder();
        connection.subscribe(observer);

        let response = open_handshake(&mut connection, &mut client);

        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains(&format!("Sec-WebSocket-Accept: {RFC_ACCEPT}\r\n")));
        assert!(response.ends_with("\r\n\r\n"));
        assert_eq!(*log.borrow(), vec![Event::Handshake, Event::Open]);
        assert_eq!(connection.resource(), "/chat");
        assert_eq!(connection.get_header("Origin"), Some("http://example.com"));
    }

    #[test]
    fn s2_masked_text_frame_delivers_message() {
        let (mut connection, mut client) = new_connection(Options::default(), &[]);
        let (observer, log) = recorder();
        connection.subscribe(observer);
        open_handshake(&mut connection, &mut client);

        client.feed(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        connection.cycle();

        assert_eq!(
            log.borrow().last(),
            Some(&Event::Message(Message::Text("Hello".into())))
        );
    }

    #[test]
    fn s3_fragmented_binary_message() {
        let (mut connection, mut client) = new_connection(Options::default(), &[]);
        let (observer, log) = recorder();
        connection.subscribe(observer);
        open_handshake(&mut connection, &mut client);

        client.feed(&masked(Frame::new(false, OpCode::Binary, None, &[0x01u8, 0x02][..])));
        connection.cycle();
        client.feed(&masked(Frame::continuation(true, &[0x03u8][..])));
        connection.cycle();

        assert_eq!(
            log.borrow().last(),
            Some(&Event::Message(Message::Binary(Bytes::from_static(&[
                0x01, 0x02, 0x03
            ]))))
        );
    }

    #[test]
    fn s4_ping_interleaved_between_fragments() {
        let (mut connection, mut client) = new_connection(Options::default(), &[]);
        let (observer, log) = recorder();
        connection.subscribe(observer);
        open_handshake(&mut connection, &mut client);

        client.feed(&masked(Frame::new(false, OpCode::Binary, None, &[0x01u8, 0x02][..])));
        client.feed(&masked(Frame::ping("hi")));
        client.feed(&masked(Frame::continuation(true, &[0x03u8][..])));
        connection.cycle();

        // the auto-pong echoes the ping payload, unmasked
        assert_eq!(client.drain(), vec![0x8A, 0x02, b'h', b'i']);

        let events = log.borrow();
        let tail = &events[events.len() - 2..];
        assert_eq!(tail[0], Event::Ping(b"hi".to_vec()));
        assert_eq!(
            tail[1],
            Event::Message(Message::Binary(Bytes::from_static(&[0x01, 0x02, 0x03])))
        );
    }

    #[test]
    fn s5_clean_close_initiated_by_server() {
        let (mut connection, mut client) = new_connection(Options::default(), &[]);
        let (observer, log) = recorder();
        connection.subscribe(observer);
        open_handshake(&mut connection, &mut client);

        connection.disconnect(Some(CloseCode::Normal), Some("bye"));
        assert_eq!(connection.ready_state(), ReadyState::Closing);
        assert_eq!(client.drain(), vec![0x88, 0x05, 0x03, 0xe8, b'b', b'y', b'e']);

        // peer replies in kind; the connection finishes closing
        client.feed(&masked(Frame::close(CloseCode::Normal, "bye")));
        connection.cycle();

        assert_eq!(connection.ready_state(), ReadyState::Closed);
        assert_eq!(
            log.borrow().last(),
            Some(&Event::Close(CloseCode::Normal, "bye".into()))
        );
    }

    #[test]
    fn s6_unmasked_frame_fails_with_1002() {
        let (mut connection, mut client) = new_connection(Options::default(), &[]);
        let (observer, log) = recorder();
        connection.subscribe(observer);
        open_handshake(&mut connection, &mut client);

        // unmasked text frame straight from the RFC example
        client.feed(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
        connection.cycle();
        connection.cycle();

        assert_eq!(connection.ready_state(), ReadyState::Closed);
        let sent = client.drain();
        // close frame: FIN+Close, len 2+reason, code 1002
        assert_eq!(sent[0], 0x88);
        assert_eq!(&sent[2..4], &1002u16.to_be_bytes());
        assert_eq!(
            log.borrow().last(),
            Some(&Event::Close(
                CloseCode::Protocol,
                "Message should be masked.".into()
            ))
        );
    }

    mod handshake {
        use super::*;

        #[test]
        fn post_is_answered_with_405() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            let (observer, log) = recorder();
            connection.subscribe(observer);

            client.feed(b"POST /chat HTTP/1.1\r\nHost: x\r\n\r\n");
            connection.cycle();

            let response = String::from_utf8(client.drain()).unwrap();
            assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
            assert!(response.contains("Allow: GET\r\n"));
            assert_eq!(connection.ready_state(), ReadyState::Closed);
            assert_eq!(
                *log.borrow(),
                vec![Event::Close(CloseCode::Protocol, String::new())]
            );
        }

        #[test]
        fn http_10_is_answered_with_400() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            client.feed(b"GET /chat HTTP/1.0\r\n\r\n");
            connection.cycle();

            let response = String::from_utf8(client.drain()).unwrap();
            assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
            assert_eq!(connection.ready_state(), ReadyState::Closed);
        }

        #[test]
        fn missing_key_is_answered_with_400() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            client.feed(
                b"GET /chat HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Version: 13\r\n\r\n",
            );
            connection.cycle();

            let response = String::from_utf8(client.drain()).unwrap();
            assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        }

        #[test]
        fn wrong_version_is_answered_with_400() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            client.feed(
                b"GET / HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Version: 8\r\n\r\n",
            );
            connection.cycle();
            assert!(String::from_utf8(client.drain())
                .unwrap()
                .starts_with("HTTP/1.1 400"));
            assert_eq!(connection.ready_state(), ReadyState::Closed);
        }

        #[test]
        fn request_split_across_ticks_still_parses() {
            let (mut connection, mut client) = new_connection(Options::default(), &["chat"]);
            let handshake = RFC_HANDSHAKE.as_bytes();

            client.feed(&handshake[..40]);
            connection.cycle();
            assert_eq!(connection.ready_state(), ReadyState::New);

            client.feed(&handshake[40..]);
            connection.cycle();
            assert!(connection.ready_state().is_open());
        }

        #[test]
        fn subprotocol_respects_client_preference_order() {
            let (mut connection, mut client) =
                new_connection(Options::default(), &["superchat", "chat"]);
            let response = open_handshake(&mut connection, &mut client);

            // client offered "chat, superchat": chat wins
            assert!(response.contains("Sec-WebSocket-Protocol: chat\r\n"));
            assert_eq!(connection.subprotocol(), Some("chat"));
        }

        #[test]
        fn no_subprotocol_header_when_nothing_matches() {
            let (mut connection, mut client) =
                new_connection(Options::default(), &["graphql-ws"]);
            let response = open_handshake(&mut connection, &mut client);

            assert!(!response.contains("Sec-WebSocket-Protocol"));
            assert_eq!(connection.subprotocol(), None);
        }

        #[test]
        fn cookies_queued_during_handshake_reach_the_response() {
            struct CookieSetter;
            impl ConnectionObserver for CookieSetter {
                fn on_handshake(&mut self, connection: &mut Connection) {
                    connection.set_cookie(Cookie::new("sid", "abc123").http_only());
                }
            }

            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            connection.subscribe(Rc::new(RefCell::new(CookieSetter)));
            let response = open_handshake(&mut connection, &mut client);

            assert!(response.contains("Set-Cookie: sid=abc123; HttpOnly\r\n"));
        }

        #[test]
        fn request_cookies_are_parsed() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            client.feed(
                b"GET / HTTP/1.1\r\n\
                Host: x\r\n\
                Cookie: sid=abc; theme=dark\r\n\
                Sec-WebSocket-Key: k\r\n\
                Sec-WebSocket-Version: 13\r\n\
                \r\n",
            );
            connection.cycle();

            assert!(connection.ready_state().is_open());
            assert_eq!(connection.get_cookie("sid"), Some("abc"));
            assert_eq!(connection.get_cookie("theme"), Some("dark"));
            assert_eq!(connection.get_cookie("missing"), None);
        }

        #[test]
        fn set_cookie_after_open_is_ignored() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            open_handshake(&mut connection, &mut client);

            connection.set_cookie(Cookie::new("late", "nope"));
            assert!(connection.pending_cookies.is_empty());
        }
    }

    mod protocol_failures {
        use super::*;

        #[test]
        fn new_data_frame_mid_message_fails() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            let (observer, log) = recorder();
            connection.subscribe(observer);
            open_handshake(&mut connection, &mut client);

            client.feed(&masked(Frame::new(false, OpCode::Binary, None, &[1u8][..])));
            client.feed(&masked(Frame::text("interloper")));
            connection.cycle();

            assert_eq!(connection.ready_state(), ReadyState::Closed);
            assert!(matches!(
                log.borrow().last(),
                Some(Event::Close(CloseCode::Protocol, _))
            ));
        }

        #[test]
        fn continuation_without_a_message_fails() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            open_handshake(&mut connection, &mut client);

            client.feed(&masked(Frame::continuation(true, &b"orphan"[..])));
            connection.cycle();
            assert_eq!(connection.ready_state(), ReadyState::Closed);
        }

        #[test]
        fn oversized_frame_fails_with_1009() {
            let options = Options::default().with_max_payload_read(16);
            let (mut connection, mut client) = new_connection(options, &[]);
            let (observer, log) = recorder();
            connection.subscribe(observer);
            open_handshake(&mut connection, &mut client);

            client.feed(&masked(Frame::binary(bytes::Bytes::from(vec![0u8; 64]))));
            connection.cycle();

            assert_eq!(
                log.borrow().last(),
                Some(&Event::Close(CloseCode::Size, "Frame too large".into()))
            );
        }

        #[test]
        fn invalid_utf8_text_fails_with_1007() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            let (observer, log) = recorder();
            connection.subscribe(observer);
            open_handshake(&mut connection, &mut client);

            client.feed(&masked(Frame::new(
                true,
                OpCode::Text,
                None,
                &[0xFFu8, 0xFE, 0xFD][..],
            )));
            connection.cycle();

            assert!(matches!(
                log.borrow().last(),
                Some(Event::Close(CloseCode::Invalid, _))
            ));
        }

        #[test]
        fn one_byte_close_payload_fails() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            open_handshake(&mut connection, &mut client);

            client.feed(&masked(Frame::close_raw(&[0x03u8][..])));
            connection.cycle();
            assert_eq!(connection.ready_state(), ReadyState::Closed);
        }

        #[test]
        fn reserved_close_code_fails() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            open_handshake(&mut connection, &mut client);

            client.feed(&masked(Frame::close_raw(&1005u16.to_be_bytes()[..])));
            connection.cycle();
            assert_eq!(connection.ready_state(), ReadyState::Closed);
        }
    }

    mod closing {
        use super::*;

        #[test]
        fn peer_initiated_close_is_replied_and_closed() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            let (observer, log) = recorder();
            connection.subscribe(observer);
            open_handshake(&mut connection, &mut client);
            client.drain();

            client.feed(&masked(Frame::close(CloseCode::Away, "going away")));
            connection.cycle();

            assert_eq!(connection.ready_state(), ReadyState::Closed);
            // reply echoes the peer's code
            let reply = client.drain();
            assert_eq!(reply[0], 0x88);
            assert_eq!(&reply[2..4], &1001u16.to_be_bytes());
            assert_eq!(
                log.borrow().last(),
                Some(&Event::Close(CloseCode::Away, "going away".into()))
            );
        }

        #[test]
        fn empty_close_payload_reads_as_1005() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            let (observer, log) = recorder();
            connection.subscribe(observer);
            open_handshake(&mut connection, &mut client);

            client.feed(&masked(Frame::close_empty()));
            connection.cycle();

            assert_eq!(
                log.borrow().last(),
                Some(&Event::Close(CloseCode::NoStatus, String::new()))
            );
        }

        #[test]
        fn grace_expiry_forces_the_socket_shut() {
            let options = Options::default().with_close_grace(Duration::ZERO);
            let (mut connection, mut client) = new_connection(options, &[]);
            let (observer, log) = recorder();
            connection.subscribe(observer);
            open_handshake(&mut connection, &mut client);

            connection.disconnect(Some(CloseCode::Normal), None);
            assert_eq!(connection.ready_state(), ReadyState::Closing);

            // peer never answers; the grace period (zero here) expires
            connection.cycle();
            assert_eq!(connection.ready_state(), ReadyState::Closed);
            assert_eq!(
                log.borrow().last(),
                Some(&Event::Close(CloseCode::Normal, String::new()))
            );
        }

        #[test]
        fn eof_synthesizes_1006() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            let (observer, log) = recorder();
            connection.subscribe(observer);
            open_handshake(&mut connection, &mut client);

            crate::stream::Transport::shutdown(&mut client).unwrap();
            connection.cycle();

            assert_eq!(connection.ready_state(), ReadyState::Closed);
            assert_eq!(
                log.borrow().last(),
                Some(&Event::Close(CloseCode::Abnormal, String::new()))
            );
        }

        #[test]
        fn close_event_fires_exactly_once() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            let (observer, log) = recorder();
            connection.subscribe(observer);
            open_handshake(&mut connection, &mut client);

            client.feed(&masked(Frame::close(CloseCode::Normal, "")));
            connection.cycle();
            connection.cycle();
            connection.disconnect(Some(CloseCode::Normal), None);
            connection.close(None, None);

            let closes = log
                .borrow()
                .iter()
                .filter(|e| matches!(e, Event::Close(..)))
                .count();
            assert_eq!(closes, 1);
        }

        #[test]
        fn ready_state_is_monotonic() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            assert_eq!(connection.ready_state(), ReadyState::New);

            open_handshake(&mut connection, &mut client);
            assert!(ReadyState::New < connection.ready_state());

            connection.disconnect(Some(CloseCode::Normal), None);
            assert!(ReadyState::Open < connection.ready_state());

            client.feed(&masked(Frame::close(CloseCode::Normal, "")));
            connection.cycle();
            assert_eq!(connection.ready_state(), ReadyState::Closed);
        }

        #[test]
        fn send_after_close_is_rejected() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            open_handshake(&mut connection, &mut client);
            connection.disconnect(Some(CloseCode::Normal), None);

            assert!(matches!(
                connection.send("too late"),
                Err(WebSocketError::ConnectionClosed)
            ));
            assert!(matches!(
                connection.ping(),
                Err(WebSocketError::ConnectionClosed)
            ));
        }
    }

    mod sending {
        use super::*;

        #[test]
        fn text_goes_out_unmasked() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            open_handshake(&mut connection, &mut client);

            connection.send("Hello").unwrap();
            assert_eq!(
                client.drain(),
                vec![0x81, 0x05, b'H', b'e', b'l', b'l', b'o']
            );
        }

        #[test]
        fn large_payloads_fragment() {
            let options = Options::default().with_max_payload_write(2);
            let (mut connection, mut client) = new_connection(options, &[]);
            open_handshake(&mut connection, &mut client);

            connection.send(vec![1u8, 2, 3, 4, 5]).unwrap();
            assert_eq!(
                client.drain(),
                vec![
                    0x02, 0x02, 1, 2, // binary, fin=0
                    0x00, 0x02, 3, 4, // continuation, fin=0
                    0x80, 0x01, 5, // continuation, fin=1
                ]
            );
        }

        #[test]
        fn ping_and_pong_are_empty_control_frames() {
            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            open_handshake(&mut connection, &mut client);

            connection.ping().unwrap();
            connection.pong().unwrap();
            assert_eq!(client.drain(), vec![0x89, 0x00, 0x8A, 0x00]);
        }

        #[test]
        fn observer_can_echo_from_inside_the_message_handler() {
            struct Echo;
            impl ConnectionObserver for Echo {
                fn on_message(&mut self, connection: &mut Connection, message: &Message) {
                    connection.send(message.clone()).unwrap();
                }
            }

            let (mut connection, mut client) = new_connection(Options::default(), &[]);
            connection.subscribe(Rc::new(RefCell::new(Echo)));
            open_handshake(&mut connection, &mut client);

            client.feed(&masked(Frame::text("marco")));
            connection.cycle();

            assert_eq!(
                client.drain(),
                vec![0x81, 0x05, b'm', b'a', b'r', b'c', b'o']
            );
        }
    }

    mod keepalive {
        use super::*;

        #[test]
        fn idle_connection_gets_pinged() {
            let options = Options::default()
                .with_keepalive(Duration::ZERO, Duration::from_secs(3600));
            let (mut connection, mut client) = new_connection(options, &[]);
            open_handshake(&mut connection, &mut client);

            connection.keepalive();
            assert_eq!(client.drain(), vec![0x89, 0x00]);
            assert!(connection.ready_state().is_open());
        }

        #[test]
        fn dead_connection_is_dropped_with_1001() {
            let options = Options::default().with_keepalive(Duration::ZERO, Duration::ZERO);
            let (mut connection, mut client) = new_connection(options, &[]);
            open_handshake(&mut connection, &mut client);

            connection.keepalive();
            assert_eq!(connection.ready_state(), ReadyState::Closing);
            let sent = client.drain();
            assert_eq!(sent[0], 0x88);
            assert_eq!(&sent[2..4], &1001u16.to_be_bytes());
        }
    }

    #[test]
    fn byte_counters_track_both_directions() {
        let (mut connection, mut client) = new_connection(Options::default(), &[]);
        open_handshake(&mut connection, &mut client);

        assert_eq!(connection.bytes_in() as usize, RFC_HANDSHAKE.len());
        assert!(connection.bytes_out() > 0);
    }
}
