//! Connection tuning knobs.

use std::time::Duration;

/// Configuration options for connections produced by a listener.
///
/// `Options` sets payload limits in both directions and the timings the
/// close and keepalive machinery uses. Every knob has a protocol-sensible
/// default, so `Options::default()` is a working configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum accepted payload size for a single inbound frame, in bytes.
    ///
    /// A frame announcing a larger payload fails the connection with close
    /// code 1009 before the payload is buffered. Default: unlimited (the
    /// platform word size).
    pub max_payload_read: usize,

    /// Maximum payload carried by a single outbound frame, in bytes.
    ///
    /// Messages larger than this are fragmented across continuation
    /// frames. Default: unlimited, i.e. messages go out unfragmented.
    pub max_payload_write: usize,

    /// How long a connection waits for the peer's close reply before
    /// forcing the TCP socket shut. Default: 5 seconds.
    pub close_grace: Duration,

    /// Idle time after which a keepalive pass sends a ping.
    /// Default: 60 seconds.
    pub ping_after: Duration,

    /// Idle time after which a keepalive pass gives up and closes the
    /// connection with 1001. Default: 120 seconds.
    pub drop_after: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: usize::MAX,
            max_payload_write: usize::MAX,
            close_grace: Duration::from_secs(5),
            ping_after: Duration::from_secs(60),
            drop_after: Duration::from_secs(120),
        }
    }
}

impl Options {
    /// Sets the maximum accepted inbound frame payload size.
    ///
    /// Frames above the limit fail the connection with close code 1009.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: size,
            ..self
        }
    }

    /// Sets the outbound fragmentation threshold: payloads larger than
    /// `size` are split across continuation frames.
    pub fn with_max_payload_write(self, size: usize) -> Self {
        Self {
            max_payload_write: size,
            ..self
        }
    }

    /// Sets the close grace period.
    pub fn with_close_grace(self, grace: Duration) -> Self {
        Self {
            close_grace: grace,
            ..self
        }
    }

    /// Sets the keepalive timings: ping after `ping_after` idle, drop the
    /// connection after `drop_after` idle.
    pub fn with_keepalive(self, ping_after: Duration, drop_after: Duration) -> Self {
        Self {
            ping_after,
            drop_after,
            ..self
        }
    }
}
