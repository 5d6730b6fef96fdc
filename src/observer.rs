//! Observer interface and dispatch machinery.
//!
//! Applications attach behavior by subscribing observers rather than owning
//! the I/O loop. Two disjoint capabilities exist: [`ServerObserver`] for
//! listener lifecycle events and [`ConnectionObserver`] for per-connection
//! protocol events.
//!
//! Dispatch is synchronous, in registration order, from whichever
//! `accept`/`cycle` call produced the event. The subject's state is fully
//! updated *before* handlers run, and handlers receive a `&mut` borrow of
//! the subject, so calling [`send`](crate::Connection::send) or
//! [`disconnect`](crate::Connection::disconnect) from inside a handler is
//! safe. Handlers must use that borrow rather than a retained handle — a
//! `SharedConnection` kept from `new_connection` cannot be borrowed again
//! while one of its own events is being dispatched.
//!
//! Subscription is idempotent and identity-based: subscribing the same
//! `Rc` twice registers it once, and unsubscription compares by pointer.
//! Each dispatch iterates a snapshot of the subscriber list, so handlers
//! may subscribe or unsubscribe observers without corrupting iteration.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use crate::close::CloseCode;
use crate::connection::{Connection, Message, SharedConnection};
use crate::listener::Listener;

/// Observer of listener lifecycle events.
///
/// All methods have empty default bodies; implement the ones of interest.
pub trait ServerObserver {
    /// The listener bound its socket and is accepting connections.
    fn on_server_open(&mut self, listener: &mut Listener) {
        let _ = listener;
    }

    /// The listener shut down.
    fn on_server_close(&mut self, listener: &mut Listener) {
        let _ = listener;
    }

    /// A connection was accepted and began its handshake. Retain a
    /// [`std::rc::Weak`] (not the `Rc`) if the connection must be found
    /// again later; connection-level events deliver `&mut Connection`
    /// directly.
    fn on_connection(&mut self, connection: &SharedConnection) {
        let _ = connection;
    }
}

/// Observer of per-connection protocol events.
///
/// Events arrive in wire order: `on_handshake` strictly before `on_open`,
/// control frames as they appear, assembled messages after their final
/// fragment, and `on_close` exactly once, last.
pub trait ConnectionObserver {
    /// A valid upgrade request was parsed; the 101 response has not been
    /// sent yet, so this is the last chance to queue cookies.
    fn on_handshake(&mut self, connection: &mut Connection) {
        let _ = connection;
    }

    /// The handshake response went out; the connection is OPEN.
    fn on_open(&mut self, connection: &mut Connection) {
        let _ = connection;
    }

    /// A complete text or binary message was assembled.
    fn on_message(&mut self, connection: &mut Connection, message: &Message) {
        let _ = (connection, message);
    }

    /// A ping arrived. The pong reply has already been queued.
    fn on_ping(&mut self, connection: &mut Connection, payload: &[u8]) {
        let _ = (connection, payload);
    }

    /// A pong arrived.
    fn on_pong(&mut self, connection: &mut Connection, payload: &[u8]) {
        let _ = (connection, payload);
    }

    /// The connection reached CLOSED. Emitted exactly once per connection,
    /// whatever the path: clean closing handshake, protocol failure, or
    /// TCP loss (code 1006).
    fn on_close(&mut self, connection: &mut Connection, code: CloseCode, reason: &str) {
        let _ = (connection, code, reason);
    }
}

/// Shared handle to a connection observer.
pub type SharedConnectionObserver = Rc<RefCell<dyn ConnectionObserver>>;

/// Shared handle to a server observer.
pub type SharedServerObserver = Rc<RefCell<dyn ServerObserver>>;

/// Subscriber list for one subject.
///
/// Purely a registration container: subjects snapshot it and invoke
/// handlers themselves so they can pass `&mut self` into the callback.
pub(crate) struct Bus<T: ?Sized> {
    subscribers: Vec<Rc<RefCell<T>>>,
}

impl<T: ?Sized> Default for Bus<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<T: ?Sized> Bus<T> {
    /// Adds `observer` unless the same `Rc` is already registered.
    pub(crate) fn subscribe(&mut self, observer: Rc<RefCell<T>>) {
        if !self.subscribers.iter().any(|o| Rc::ptr_eq(o, &observer)) {
            self.subscribers.push(observer);
        }
    }

    /// Removes `observer` by identity. Unknown observers are ignored.
    pub(crate) fn unsubscribe(&mut self, observer: &Rc<RefCell<T>>) {
        self.subscribers.retain(|o| !Rc::ptr_eq(o, observer));
    }

    /// Clones the current subscriber list for iteration, so handlers can
    /// (un)subscribe during dispatch.
    pub(crate) fn snapshot(&self) -> Vec<Rc<RefCell<T>>> {
        self.subscribers.clone()
    }
}

/// Runs one handler invocation, containing panics so a misbehaving
/// observer cannot corrupt protocol state or starve later subscribers.
pub(crate) fn guard<F: FnOnce()>(event: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("observer panicked while handling `{event}`; continuing");
    }
}
