//! Close status codes as defined in
//! [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
//!
//! A close frame optionally carries a 2-byte big-endian status code followed
//! by a UTF-8 reason. Some codes are never placed on the wire: `NoStatus`
//! (1005) stands in for "close frame had no code" and `Abnormal` (1006) is
//! synthesized locally when the TCP connection is lost without a closing
//! handshake.

/// Status code sent or received in a close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000 — normal closure; the purpose of the connection is fulfilled.
    Normal,
    /// 1001 — endpoint is going away (server shutdown, browser navigation,
    /// idle-timeout policy).
    Away,
    /// 1002 — protocol error.
    Protocol,
    /// 1003 — received a data type the endpoint cannot accept.
    Unsupported,
    /// 1005 — no status code was present. Never sent on the wire.
    NoStatus,
    /// 1006 — connection lost without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007 — payload was inconsistent with the message type
    /// (e.g. invalid UTF-8 in a text message).
    Invalid,
    /// 1008 — message violated the endpoint's policy.
    Policy,
    /// 1009 — message too big to process.
    Size,
    /// 1010 — client expected the server to negotiate an extension.
    Extension,
    /// 1011 — server encountered an unexpected condition.
    Error,
    /// 1012 — server is restarting.
    Restart,
    /// 1013 — server is overloaded; the client should retry later.
    Again,
    /// Any other code, including the 3000-3999 registered range and the
    /// 4000-4999 private-use range.
    Other(u16),
}

impl CloseCode {
    /// Whether this code may appear inside a close frame on the wire.
    ///
    /// Reserved codes (1004-1006, 1015, anything below 1000 and the
    /// unassigned 1xxx range) must be rejected when received; a peer sending
    /// one commits a protocol error.
    pub fn is_allowed_on_wire(self) -> bool {
        let code = u16::from(self);
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Other(other) => other,
        }
    }
}
