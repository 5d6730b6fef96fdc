//! Accepting endpoint: TCP bind, per-source connecting gate, TLS upgrade.
//!
//! A [`Listener`] accepts at most one connection per [`accept`] call, which
//! the driver invokes once per tick. Incoming sockets pass through a
//! *connecting gate*: RFC 6455 §4.1 obliges clients to run at most one
//! opening handshake per host at a time, and the gate enforces that limit
//! server-side. While a source IP has a connection still in `NEW`, further
//! sockets from the same IP wait in a FIFO queue and are promoted one per
//! tick once the earlier connection leaves `NEW` (to `OPEN` or `CLOSED`).
//!
//! The gate is owned by the listener, so multiple listeners in one process
//! stay independent.
//!
//! [`accept`]: Listener::accept

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::PrivateKeyDer;
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use crate::connection::{Connection, ReadyState, SharedConnection};
use crate::observer::{self, Bus, ServerObserver, SharedServerObserver};
use crate::options::Options;
use crate::stream::ByteStream;
use crate::{Result, WebSocketError};

/// Ceiling on how long a TLS handshake may hold up the accept path.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS settings for a listener.
///
/// The PEM file holds both the certificate chain and the private key.
/// Self-signed certificates work; no client verification is performed.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the PEM file with certificate(s) and key.
    pub pem_path: PathBuf,
}

impl TlsConfig {
    /// TLS configuration reading certificates and key from `pem_path`.
    pub fn new(pem_path: impl Into<PathBuf>) -> Self {
        Self {
            pem_path: pem_path.into(),
        }
    }
}

/// Server endpoint that accepts WebSocket connections.
pub struct Listener {
    bind_ip: Option<IpAddr>,
    port: u16,
    tls: Option<TlsConfig>,
    tls_config: Option<Arc<ServerConfig>>,
    allowed_subprotocols: Vec<String>,
    options: Options,
    socket: Option<TcpListener>,
    /// Source IPs with a handshake still in flight.
    connecting: HashSet<IpAddr>,
    /// Sockets waiting for their source's connecting slot, oldest first.
    deferred: VecDeque<(IpAddr, TcpStream)>,
    /// Connections this listener spawned, watched so their source slot can
    /// be released once they leave `NEW`.
    tracked: Vec<(IpAddr, Weak<RefCell<Connection>>)>,
    observers: Bus<dyn ServerObserver>,
    next_id: u64,
}

impl Listener {
    /// Creates a listener; nothing is bound until [`open`](Listener::open).
    ///
    /// `bind_ip` narrows the bind to one local address (default: all
    /// interfaces). `allowed_subprotocols` is the set offered during
    /// subprotocol negotiation; `options` is cloned into every accepted
    /// connection.
    pub fn new(
        bind_ip: Option<IpAddr>,
        port: u16,
        tls: Option<TlsConfig>,
        allowed_subprotocols: Vec<String>,
        options: Options,
    ) -> Self {
        Self {
            bind_ip,
            port,
            tls,
            tls_config: None,
            allowed_subprotocols,
            options,
            socket: None,
            connecting: HashSet::new(),
            deferred: VecDeque::new(),
            tracked: Vec::new(),
            observers: Bus::default(),
            next_id: 1,
        }
    }

    /// Whether this listener terminates TLS.
    pub fn secure(&self) -> bool {
        self.tls.is_some()
    }

    /// The bound local address, once open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Subscribes a server observer. Idempotent by identity.
    pub fn subscribe(&mut self, observer: SharedServerObserver) {
        self.observers.subscribe(observer);
    }

    /// Unsubscribes a server observer by identity.
    pub fn unsubscribe(&mut self, observer: &SharedServerObserver) {
        self.observers.unsubscribe(observer);
    }

    /// Binds the listening socket (and loads the TLS material when
    /// configured), then emits `server-opened`. A second call on an open
    /// listener is a no-op.
    pub fn open(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        if let Some(tls) = &self.tls {
            self.tls_config = Some(load_tls_config(tls)?);
        }

        let ip = self
            .bind_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let socket = TcpListener::bind(SocketAddr::new(ip, self.port))?;
        socket.set_nonblocking(true)?;
        log::debug!("listening on {:?}", socket.local_addr());
        self.socket = Some(socket);

        self.emit_server_open();
        Ok(())
    }

    /// Shuts the listener down and emits `server-closed`. Connections
    /// already handed to the application keep running.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("listener closed");
            self.connecting.clear();
            self.deferred.clear();
            self.tracked.clear();
            self.emit_server_close();
        }
    }

    /// Accepts at most one connection. Non-blocking: `None` simply means no
    /// connection was produced this tick.
    ///
    /// A fresh socket whose source IP already holds the connecting slot is
    /// parked on the deferred queue instead. When nothing new arrived, the
    /// head-most deferred socket whose slot has freed up is promoted. A
    /// selected socket gets its TLS handshake (when configured; on failure
    /// the socket is closed and `None` returned), becomes a [`Connection`],
    /// runs one priming [`cycle`](Connection::cycle), and is announced via
    /// `new-connection`.
    pub fn accept(&mut self) -> Option<SharedConnection> {
        if self.socket.is_none() {
            return None;
        }
        self.release_finished();

        let accepted = match &self.socket {
            Some(socket) => socket.accept(),
            None => return None,
        };

        let (sock, addr) = match accepted {
            Ok((sock, addr)) => {
                let ip = addr.ip();
                if self.connecting.contains(&ip) {
                    log::debug!("deferring connection from {addr}: source already connecting");
                    self.deferred.push_back((ip, sock));
                    return None;
                }
                (sock, addr)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.promote_deferred()?,
            Err(e) => {
                log::warn!("accept failed: {e}");
                return None;
            }
        };

        let ip = addr.ip();
        self.connecting.insert(ip);

        let stream = match self.upgrade(sock) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("dropping connection from {addr}: {e}");
                self.connecting.remove(&ip);
                return None;
            }
        };

        let id = self.next_id;
        self.next_id += 1;
        let mut connection = Connection::new(
            id,
            stream,
            addr,
            self.allowed_subprotocols.clone(),
            self.options.clone(),
        );
        log::debug!("accepted connection {id} from {addr}");

        // prime the handshake with one step before the application sees it
        connection.cycle();

        let shared = Rc::new(RefCell::new(connection));
        self.tracked.push((ip, Rc::downgrade(&shared)));
        self.emit_connection(&shared);
        Some(shared)
    }

    /// Releases the connecting slot of every tracked connection that has
    /// left `NEW` (or been dropped), making deferred sockets from that
    /// source eligible for promotion.
    fn release_finished(&mut self) {
        let connecting = &mut self.connecting;
        self.tracked.retain(|(ip, weak)| {
            let still_new = weak
                .upgrade()
                .map(|conn| conn.borrow().ready_state() == ReadyState::New)
                .unwrap_or(false);
            if !still_new {
                connecting.remove(ip);
            }
            still_new
        });
    }

    /// One pass over the deferred queue from the head: the first socket
    /// whose source slot is free gets dequeued.
    fn promote_deferred(&mut self) -> Option<(TcpStream, SocketAddr)> {
        let position = self
            .deferred
            .iter()
            .position(|(ip, _)| !self.connecting.contains(ip))?;
        let (ip, sock) = self.deferred.remove(position)?;
        match sock.peer_addr() {
            Ok(addr) => {
                log::debug!("promoting deferred connection from {addr}");
                Some((sock, addr))
            }
            Err(e) => {
                // the socket died while queued
                log::debug!("discarding deferred connection from {ip}: {e}");
                None
            }
        }
    }

    /// Prepares the accepted socket: completes the TLS handshake when
    /// configured, then switches to non-blocking mode.
    fn upgrade(&self, sock: TcpStream) -> Result<ByteStream> {
        match &self.tls_config {
            None => {
                sock.set_nonblocking(true)?;
                Ok(ByteStream::new(Box::new(sock)))
            }
            Some(config) => {
                let mut sock = sock;
                sock.set_nonblocking(false)?;
                sock.set_read_timeout(Some(TLS_HANDSHAKE_TIMEOUT))?;

                let mut tls = ServerConnection::new(Arc::clone(config))?;
                while tls.is_handshaking() {
                    tls.complete_io(&mut sock)?;
                }

                sock.set_read_timeout(None)?;
                sock.set_nonblocking(true)?;
                Ok(ByteStream::new(Box::new(StreamOwned::new(tls, sock))))
            }
        }
    }

    fn emit_server_open(&mut self) {
        for subscriber in self.observers.snapshot() {
            let mut handler = subscriber.borrow_mut();
            observer::guard("server-opened", || handler.on_server_open(&mut *self));
        }
    }

    fn emit_server_close(&mut self) {
        for subscriber in self.observers.snapshot() {
            let mut handler = subscriber.borrow_mut();
            observer::guard("server-closed", || handler.on_server_close(&mut *self));
        }
    }

    fn emit_connection(&mut self, connection: &SharedConnection) {
        for subscriber in self.observers.snapshot() {
            let mut handler = subscriber.borrow_mut();
            observer::guard("new-connection", || handler.on_connection(connection));
        }
    }
}

/// Reads certificate chain and private key from one PEM file and builds the
/// rustls server configuration (no client verification).
fn load_tls_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let pem = fs::read(&tls.pem_path)?;
    let mut reader = pem.as_slice();

    let mut certs = Vec::new();
    let mut key: Option<PrivateKeyDer<'static>> = None;
    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::X509Certificate(cert) => certs.push(cert),
            rustls_pemfile::Item::Pkcs8Key(k) if key.is_none() => {
                key = Some(PrivateKeyDer::Pkcs8(k));
            }
            rustls_pemfile::Item::Pkcs1Key(k) if key.is_none() => {
                key = Some(PrivateKeyDer::Pkcs1(k));
            }
            rustls_pemfile::Item::Sec1Key(k) if key.is_none() => {
                key = Some(PrivateKeyDer::Sec1(k));
            }
            _ => {}
        }
    }

    let key = key.ok_or_else(|| {
        WebSocketError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "no private key found in PEM file",
        ))
    })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread::sleep;

    fn localhost_listener() -> Listener {
        let mut listener = Listener::new(
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            0, // ephemeral port
            None,
            vec!["chat".to_owned()],
            Options::default(),
        );
        listener.open().unwrap();
        listener
    }

    /// Polls `accept` for up to ~2 seconds; loopback accepts are fast but
    /// not instantaneous.
    fn poll_accept(listener: &mut Listener) -> Option<SharedConnection> {
        for _ in 0..200 {
            if let Some(conn) = listener.accept() {
                return Some(conn);
            }
            sleep(Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn accepts_a_loopback_connection() {
        let mut listener = localhost_listener();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        let connection = poll_accept(&mut listener).expect("connection accepted");
        assert_eq!(connection.borrow().ready_state(), ReadyState::New);
    }

    #[test]
    fn accept_without_clients_returns_none() {
        let mut listener = localhost_listener();
        assert!(listener.accept().is_none());
    }

    #[test]
    fn second_connection_from_same_source_waits_for_the_first() {
        let mut listener = localhost_listener();
        let addr = listener.local_addr().unwrap();

        let _client1 = TcpStream::connect(addr).unwrap();
        let first = poll_accept(&mut listener).expect("first connection");

        // same source IP: the second socket must sit in the deferred queue
        // while the first handshake is unfinished
        let _client2 = TcpStream::connect(addr).unwrap();
        sleep(Duration::from_millis(50));
        for _ in 0..20 {
            assert!(listener.accept().is_none());
            sleep(Duration::from_millis(5));
        }

        // first connection goes away without ever finishing its handshake;
        // its slot frees and the deferred socket is promoted
        drop(first);
        let second = poll_accept(&mut listener).expect("second connection");
        assert_eq!(second.borrow().ready_state(), ReadyState::New);
    }

    #[test]
    fn connection_ids_are_distinct() {
        let mut listener = localhost_listener();
        let addr = listener.local_addr().unwrap();

        let _client1 = TcpStream::connect(addr).unwrap();
        let first = poll_accept(&mut listener).expect("first connection");
        let first_id = first.borrow().id();
        drop(first);

        let _client2 = TcpStream::connect(addr).unwrap();
        let second = poll_accept(&mut listener).expect("second connection");
        assert_ne!(first_id, second.borrow().id());
    }

    #[test]
    fn server_observer_sees_lifecycle_events() {
        struct ServerRecorder {
            log: Rc<RefCell<Vec<&'static str>>>,
        }

        impl ServerObserver for ServerRecorder {
            fn on_server_open(&mut self, _listener: &mut Listener) {
                self.log.borrow_mut().push("server-opened");
            }
            fn on_server_close(&mut self, _listener: &mut Listener) {
                self.log.borrow_mut().push("server-closed");
            }
            fn on_connection(&mut self, _connection: &SharedConnection) {
                self.log.borrow_mut().push("new-connection");
            }
        }

        let log = Rc::new(RefCell::new(Vec::new()));
        let observer: SharedServerObserver = Rc::new(RefCell::new(ServerRecorder {
            log: Rc::clone(&log),
        }));

        let mut listener = Listener::new(
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            0,
            None,
            Vec::new(),
            Options::default(),
        );
        listener.subscribe(observer);
        listener.open().unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        poll_accept(&mut listener).expect("connection accepted");
        listener.close();

        assert_eq!(
            *log.borrow(),
            vec!["server-opened", "new-connection", "server-closed"]
        );
    }

    #[test]
    fn close_is_idempotent() {
        let mut listener = localhost_listener();
        listener.close();
        listener.close();
        assert!(listener.local_addr().is_none());
        assert!(listener.accept().is_none());
    }
}
