//! Non-blocking byte streams over TCP and TLS.
//!
//! [`Transport`] is the raw socket seam: everything above it only needs
//! `read`/`write`/`shutdown` plus blocking-mode control, so plain
//! [`TcpStream`], a rustls server stream, and the in-memory pipe used by
//! tests all plug in interchangeably.
//!
//! [`ByteStream`] layers the conveniences the connection state machine
//! relies on: a readahead buffer shared between line-oriented handshake
//! reads and frame-oriented reads, byte counters, and EOF tracking. All
//! reads are non-blocking — `WouldBlock` simply means "nothing available
//! this tick".

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use bytes::{Bytes, BytesMut};
use rustls::{ServerConnection, StreamOwned};

/// How many bytes a single fill pulls off the socket.
pub(crate) const READ_CHUNK: usize = 2048;

/// Raw byte transport under a connection.
///
/// Implementations must be non-blocking after `set_nonblocking(true)`:
/// reads and writes return `ErrorKind::WouldBlock` instead of waiting.
pub trait Transport {
    /// Reads available bytes into `buf`, returning the count. `Ok(0)` means
    /// the peer shut down its writing side.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes as much of `buf` as the transport accepts right now.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Shuts the underlying socket down in both directions.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Switches the transport between blocking and non-blocking mode.
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

/// TLS server stream. The handshake completes in `Listener::accept` before
/// the stream is handed over, so reads and writes here only move
/// application data.
impl Transport for StreamOwned<ServerConnection, TcpStream> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        // flush the close_notify on a best-effort basis; the TCP shutdown
        // is what actually tears the link down
        let _ = self.conn.write_tls(&mut self.sock);
        self.sock.shutdown(Shutdown::Both)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.sock.set_nonblocking(nonblocking)
    }
}

/// Buffered non-blocking byte stream owned by exactly one connection.
pub struct ByteStream {
    inner: Box<dyn Transport>,
    /// Bytes read off the transport but not yet consumed.
    buf: BytesMut,
    /// Set once the transport reported EOF or a fatal read error.
    eof: bool,
    /// Set by [`close`](ByteStream::close); writes are refused afterwards.
    closed: bool,
    bytes_in: u64,
    bytes_out: u64,
}

impl ByteStream {
    /// Wraps a transport. The transport should already be in non-blocking
    /// mode; use [`set_blocking`](ByteStream::set_blocking) to switch later.
    pub fn new(inner: Box<dyn Transport>) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
            closed: false,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Pulls one chunk of available bytes off the transport into the
    /// readahead buffer. Quiet on `WouldBlock`; EOF and fatal errors latch
    /// the `eof` flag.
    fn fill(&mut self) {
        if self.eof || self.closed {
            return;
        }

        let mut chunk = [0u8; READ_CHUNK];
        match self.inner.read(&mut chunk) {
            Ok(0) => self.eof = true,
            Ok(n) => {
                self.bytes_in += n as u64;
                self.buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("transport read failed: {e}");
                self.eof = true;
            }
        }
    }

    /// Returns up to `n` buffered-or-available bytes, or `None` when the
    /// transport had nothing this tick.
    pub fn read(&mut self, n: usize) -> Option<Bytes> {
        self.fill();
        if self.buf.is_empty() {
            return None;
        }
        let take = self.buf.len().min(n);
        Some(self.buf.split_to(take).freeze())
    }

    /// Returns the next complete line, reading through `\r\n`.
    ///
    /// The terminator is consumed but not included in the returned bytes
    /// (a bare `\n` is tolerated). `None` means no full line has arrived
    /// yet; the partial prefix stays buffered. Bytes after the line remain
    /// buffered for subsequent `read` calls, which is how frame data that
    /// rides in the same segment as the handshake survives.
    pub fn read_line(&mut self) -> Option<BytesMut> {
        self.fill();
        let newline = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line = self.buf.split_to(newline + 1);
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line)
    }

    /// Writes as much of `data` as the transport accepts, returning the
    /// count. `Ok(0)` means the transport is backpressured; the caller keeps
    /// the unwritten tail and retries on a later tick.
    pub fn write(&mut self, data: &[u8]) -> crate::Result<usize> {
        if self.closed {
            return Err(crate::WebSocketError::ConnectionClosed);
        }
        match self.inner.write(data) {
            Ok(n) => {
                self.bytes_out += n as u64;
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Shuts the transport down. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.inner.shutdown() {
                // NotConnected is routine when the peer already dropped
                if e.kind() != io::ErrorKind::NotConnected {
                    log::debug!("transport shutdown failed: {e}");
                }
            }
        }
    }

    /// Switches the transport between blocking and non-blocking mode.
    pub fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(!blocking)
    }

    /// True once the peer closed its writing side *and* the readahead
    /// buffer has been drained.
    pub fn is_eof(&self) -> bool {
        (self.eof || self.closed) && self.buf.is_empty()
    }

    /// Total bytes read off the transport.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Total bytes written to the transport.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }
}
