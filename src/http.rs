//! Opening-handshake HTTP helpers.
//!
//! The handshake is the only HTTP the library ever speaks, so this is a
//! deliberately small one-shot parser: a request line, `Name: Value` header
//! lines folded to lower-case for lookup, and a handful of response
//! builders. Once the 101 response is on the wire the connection never
//! touches HTTP again.

use base64::prelude::*;
use sha1::{Digest, Sha1};

use crate::{cookie::Cookie, Result, WebSocketError};

/// GUID appended to the client key when deriving `Sec-WebSocket-Accept`
/// (RFC 6455 §1.3).
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derives the `Sec-WebSocket-Accept` value for a client key:
/// `base64(SHA1(key || GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID);
    let digest = sha1.finalize();
    BASE64_STANDARD.encode(&digest[..])
}

/// Request headers with case-insensitive names.
///
/// Names are folded to lower-case on insert; lookups fold the probe the
/// same way. Duplicate names are kept in arrival order.
#[derive(Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// First value for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn insert(&mut self, name: String, value: String) {
        self.entries.push((name, value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Parses the request line of an upgrade request.
///
/// Only `GET <resource> HTTP/1.1` is acceptable: another method maps to a
/// `405`, a version below 1.1 to a `400`, anything unparsable to a `400`.
pub fn parse_request_line(line: &[u8]) -> Result<String> {
    let line = std::str::from_utf8(line).map_err(|_| WebSocketError::BadRequestLine)?;
    let mut parts = line.split_ascii_whitespace();
    let (method, resource, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(r), Some(v), None) => (m, r, v),
        _ => return Err(WebSocketError::BadRequestLine),
    };

    if method != "GET" {
        return Err(WebSocketError::MethodNotAllowed(method.to_owned()));
    }
    if version != "HTTP/1.1" {
        return Err(WebSocketError::UnsupportedHttpVersion(version.to_owned()));
    }

    Ok(resource.to_owned())
}

/// Parses one `Name: Value` header line, folding the name to lower-case and
/// trimming whitespace around the value.
pub fn parse_header_line(line: &[u8]) -> Result<(String, String)> {
    let line = std::str::from_utf8(line).map_err(|_| WebSocketError::BadHeaderLine)?;
    let (name, value) = line.split_once(':').ok_or(WebSocketError::BadHeaderLine)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(WebSocketError::BadHeaderLine);
    }
    Ok((name.to_ascii_lowercase(), value.trim().to_owned()))
}

/// Validates the headers an upgrade request must carry and returns the
/// client's `Sec-WebSocket-Key`.
///
/// `Host` and `Sec-WebSocket-Key` need any non-empty value (key base64
/// validity is deliberately not checked); `Sec-WebSocket-Version` must be
/// exactly 13.
pub fn validate_upgrade(headers: &Headers) -> Result<String> {
    match headers.get("host") {
        Some(host) if !host.is_empty() => {}
        _ => return Err(WebSocketError::MissingHeader("Host")),
    }

    let key = match headers.get("sec-websocket-key") {
        Some(key) if !key.is_empty() => key.to_owned(),
        _ => return Err(WebSocketError::MissingHeader("Sec-WebSocket-Key")),
    };

    match headers.get("sec-websocket-version") {
        Some("13") => {}
        _ => return Err(WebSocketError::InvalidSecWebsocketVersion),
    }

    Ok(key)
}

/// Selects the subprotocol for the response: the client's preference order
/// is walked and the first name the server allows wins. `None` when nothing
/// matches (the handshake still succeeds, just without the header).
pub fn select_subprotocol(headers: &Headers, allowed: &[String]) -> Option<String> {
    for value in headers.get_all("sec-websocket-protocol") {
        for offered in value.split(',') {
            let offered = offered.trim();
            if !offered.is_empty() && allowed.iter().any(|a| a == offered) {
                return Some(offered.to_owned());
            }
        }
    }
    None
}

/// Builds the `101 Switching Protocols` response for an accepted upgrade.
pub fn accept_response(
    key: &str,
    subprotocol: Option<&str>,
    cookies: &[Cookie],
) -> String {
    let mut response = String::with_capacity(160);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept_key(key)));
    response.push_str(concat!(
        "Server: ",
        env!("CARGO_PKG_NAME"),
        "/",
        env!("CARGO_PKG_VERSION"),
        "\r\n"
    ));
    if let Some(proto) = subprotocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {proto}\r\n"));
    }
    for cookie in cookies {
        response.push_str(&format!("Set-Cookie: {cookie}\r\n"));
    }
    response.push_str("\r\n");
    response
}

/// Builds the error response for a rejected upgrade: `405` with an `Allow`
/// header for a bad method, `400` for everything else.
pub fn error_response(status: u16) -> &'static str {
    match status {
        405 => "HTTP/1.1 405 Method Not Allowed\r\nAllow: GET\r\n\r\n",
        _ => "HTTP/1.1 400 Bad Request\r\n\r\n",
    }
}
