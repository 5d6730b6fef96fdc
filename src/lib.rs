//! # shoal
//!
//! A server-side implementation of the WebSocket protocol
//! ([RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455), version 13)
//! built around a single-threaded, cooperative, non-blocking driver loop.
//!
//! The library accepts TCP (optionally TLS) connections, performs the
//! HTTP-compatible opening handshake, exchanges framed text/binary messages
//! and control frames with peers, and terminates connections through the
//! closing handshake. Application logic attaches to lifecycle events via an
//! observer interface instead of owning the I/O.
//!
//! ## Driving a server
//!
//! The application owns the loop: each tick it lets the [`Listener`] accept
//! at most one connection and gives every [`Connection`] one [`cycle`] step.
//! Every call returns promptly; nothing inside the library blocks or spawns
//! threads.
//!
//! ```no_run
//! use shoal::{Listener, Options};
//!
//! fn main() -> shoal::Result<()> {
//!     let mut listener = Listener::new(None, 9001, None, vec!["chat".into()], Options::default());
//!     listener.open()?;
//!
//!     let mut connections = Vec::new();
//!     loop {
//!         if let Some(conn) = listener.accept() {
//!             connections.push(conn);
//!         }
//!         for conn in &connections {
//!             conn.borrow_mut().cycle();
//!         }
//!         connections.retain(|c| !c.borrow().ready_state().is_closed());
//!         std::thread::sleep(std::time::Duration::from_millis(40));
//!     }
//! }
//! ```
//!
//! [`cycle`]: Connection::cycle

pub mod close;
pub mod codec;
pub mod connection;
pub mod cookie;
pub mod frame;
pub mod http;
pub mod listener;
mod mask;
pub mod observer;
pub mod options;
pub mod stream;

use thiserror::Error;

pub use close::CloseCode;
pub use connection::{Connection, Message, ReadyState, SharedConnection};
pub use cookie::Cookie;
pub use frame::{Frame, OpCode};
pub use listener::{Listener, TlsConfig};
pub use observer::{ConnectionObserver, ServerObserver};
pub use options::Options;
pub use stream::{ByteStream, Transport};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
///
/// This type alias simplifies function signatures within the crate by providing a
/// standard result type for operations that may return a `WebSocketError`.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// This enum encompasses all possible error conditions that may arise when serving
/// WebSocket connections, broadly categorized into:
///
/// - Protocol errors (e.g., invalid frames, incorrect sequence of operations)
/// - Data validation errors (e.g., invalid UTF-8, oversized payloads)
/// - Handshake errors (malformed upgrade requests)
/// - I/O and system-level errors
///
/// Every protocol-level variant maps onto a close code via [`close_code`];
/// connections recover from these errors by running the closing handshake with
/// that code rather than surfacing the error to the application.
///
/// [`close_code`]: WebSocketError::close_code
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Occurs when receiving a WebSocket fragment that violates the protocol
    /// specification, such as receiving a new data frame before the previous
    /// fragmented message completed.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Indicates that a text message contains invalid UTF-8 data.
    /// According to RFC 6455, all text payloads must be valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Occurs when receiving a continuation frame without a preceding initial
    /// frame, or when the continuation sequence is otherwise invalid.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Returned when attempting to perform operations on a closed connection.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Indicates that a received close frame has an invalid format, such as
    /// containing a 1-byte payload (close payloads are either empty or ≥2 bytes).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Occurs when a close frame carries a status code that must not appear
    /// on the wire (reserved codes or codes in invalid ranges).
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Indicates that reserved bits in the frame header are set without any
    /// negotiated extension giving them meaning.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with the
    /// FIN bit not set. Control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Indicates that a received control frame exceeds the maximum allowed
    /// size of 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Occurs when a received frame's payload length exceeds the maximum
    /// configured size. This helps prevent memory exhaustion attacks.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A client-to-server frame arrived without masking. Servers must fail
    /// the connection when this happens.
    #[error("Message should be masked.")]
    UnmaskedFrame,

    /// Indicates receipt of a frame with a reserved opcode value
    /// (0x3-0x7 or 0xB-0xF).
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// The first line of the upgrade request did not parse as
    /// `<METHOD> <resource> HTTP/<version>`.
    #[error("Malformed request line")]
    BadRequestLine,

    /// The upgrade request used an HTTP method other than GET.
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The upgrade request used an HTTP version below 1.1.
    #[error("Unsupported HTTP version: {0}")]
    UnsupportedHttpVersion(String),

    /// A header line in the upgrade request did not parse as `Name: Value`.
    #[error("Malformed header line")]
    BadHeaderLine,

    /// A header the handshake requires is missing or has an empty value.
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    /// Returned when the `Sec-WebSocket-Version` header is not 13.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// Wraps standard I/O errors that may occur during communication,
    /// such as connection resets.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps TLS configuration and handshake errors from rustls.
    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

impl WebSocketError {
    /// The close code a connection fails with when it hits this error
    /// after the opening handshake.
    pub fn close_code(&self) -> CloseCode {
        match self {
            WebSocketError::FrameTooLarge => CloseCode::Size,
            WebSocketError::InvalidUTF8 => CloseCode::Invalid,
            WebSocketError::Io(_) | WebSocketError::Tls(_) => CloseCode::Abnormal,
            _ => CloseCode::Protocol,
        }
    }

    /// Human-readable reason carried in the close frame for this error.
    pub fn close_reason(&self) -> String {
        match self {
            WebSocketError::UnmaskedFrame => "Message should be masked.".to_owned(),
            WebSocketError::FrameTooLarge => "Frame too large".to_owned(),
            WebSocketError::Io(_) | WebSocketError::Tls(_) => String::new(),
            other => other.to_string(),
        }
    }

    /// HTTP status for handshake failures: `405` for a non-GET method,
    /// `400` for everything else that can fail before the upgrade.
    pub(crate) fn http_status(&self) -> u16 {
        match self {
            WebSocketError::MethodNotAllowed(_) => 405,
            _ => 400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_to_1002() {
        for err in [
            WebSocketError::InvalidFragment,
            WebSocketError::ReservedBitsNotZero,
            WebSocketError::ControlFrameFragmented,
            WebSocketError::UnmaskedFrame,
            WebSocketError::InvalidOpCode(0x3),
        ] {
            assert_eq!(err.close_code(), CloseCode::Protocol);
        }
    }

    #[test]
    fn size_and_data_errors_have_dedicated_codes() {
        assert_eq!(WebSocketError::FrameTooLarge.close_code(), CloseCode::Size);
        assert_eq!(WebSocketError::InvalidUTF8.close_code(), CloseCode::Invalid);
    }

    #[test]
    fn unmasked_frame_reason_matches_wire_text() {
        assert_eq!(
            WebSocketError::UnmaskedFrame.close_reason(),
            "Message should be masked."
        );
    }
}
