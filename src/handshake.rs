//! Minimal RFC 6455 accept handshake.
//!
//! The accept worker briefly configures the freshly-accepted socket as
//! blocking with a 20ms read deadline (mirroring the original's
//! `conn.SetReadDeadline` before `party.go` hands the connection to its
//! external upgrader), reads the HTTP/1.1 request line and headers, and
//! replies `101 Switching Protocols` with a computed `Sec-WebSocket-Accept`.
//! Anything else aborts the accept, discarding the connection — there is no
//! pluggable upgrader in this crate; the handshake is intentionally minimal
//! (see §6 of the design notes).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::EngineError;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const READ_DEADLINE: Duration = Duration::from_millis(20);
const MAX_REQUEST_BYTES: usize = 8192;

/// Performs the handshake on `stream`, already converted to a blocking
/// `std::net::TcpStream`. On success the socket has been replied to and is
/// ready to be handed back to the reactor as a non-blocking connection.
pub fn accept(stream: &mut TcpStream) -> Result<(), EngineError> {
    stream
        .set_read_timeout(Some(READ_DEADLINE))
        .map_err(EngineError::Io)?;

    let request = read_request(stream)?;

    let key = header(&request, "sec-websocket-key")
        .ok_or_else(|| EngineError::Handshake("missing Sec-WebSocket-Key".into()))?;
    let version = header(&request, "sec-websocket-version")
        .ok_or_else(|| EngineError::Handshake("missing Sec-WebSocket-Version".into()))?;
    if version != "13" {
        return Err(EngineError::Handshake(format!(
            "unsupported Sec-WebSocket-Version {version}"
        )));
    }
    let upgrade = header(&request, "upgrade")
        .ok_or_else(|| EngineError::Handshake("missing Upgrade header".into()))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(EngineError::Handshake("Upgrade header is not websocket".into()));
    }
    let connection = header(&request, "connection")
        .ok_or_else(|| EngineError::Handshake("missing Connection header".into()))?;
    if !connection
        .split(',')
        .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(EngineError::Handshake(
            "Connection header missing upgrade token".into(),
        ));
    }

    let accept_key = compute_accept(key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\r\n"
    );
    stream
        .write_all(response.as_bytes())
        .map_err(EngineError::Io)?;
    stream.set_read_timeout(None).map_err(EngineError::Io)?;
    Ok(())
}

fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn read_request(stream: &mut TcpStream) -> Result<String, EngineError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(EngineError::Handshake("request headers too large".into()));
        }
        let n = stream.read(&mut chunk).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                EngineError::Handshake("handshake read deadline exceeded".into())
            } else {
                EngineError::Io(e)
            }
        })?;
        if n == 0 {
            return Err(EngineError::Handshake(
                "connection closed during handshake".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(buf).map_err(|_| EngineError::Handshake("request is not valid utf-8".into()))
}

fn header<'a>(request: &'a str, name: &str) -> Option<&'a str> {
    request.split("\r\n").skip(1).find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_known_accept_value() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            compute_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn extracts_header_case_insensitively() {
        let req = "GET / HTTP/1.1\r\nUpgrade: WebSocket\r\nSec-WebSocket-Version: 13\r\n\r\n";
        assert_eq!(header(req, "upgrade"), Some("WebSocket"));
        assert_eq!(header(req, "sec-websocket-version"), Some("13"));
        assert_eq!(header(req, "missing"), None);
    }
}
