//! Error taxonomy for the connection engine and accept path.
//!
//! Every variant here closes the connection that produced it; close is
//! idempotent regardless of which error triggered it (see [`crate::engine`]).

use thiserror::Error;

/// Protocol or I/O failure surfaced while driving a connection.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A reserved bit (RSV1/2/3) was set on an incoming frame.
    #[error("reserved bits set on frame header")]
    NotSupportRsv,

    /// A 64-bit extended length was requested, either on read (7-bit length
    /// field == 127) or on write (payload exceeds 65535 bytes).
    #[error("64-bit frame length is not supported")]
    NotSupportLength64,

    /// An opcode outside {continuation, text, binary, ping, pong, close}.
    #[error("unsupported or reserved opcode {0:#x}")]
    Opcode(u8),

    /// A close frame was received, or an operation was attempted on a
    /// connection that is already closed.
    #[error("connection is closed")]
    Closed,

    /// The decoded action has no entry in the router table.
    #[error("no router registered for action {0}")]
    ActionNotFound(u32),

    /// The action varint exceeded its 5-byte limit without terminating.
    #[error("action varint exceeds 5 bytes")]
    Action,

    /// The length varint exceeded its 3-byte limit, or its decoded value
    /// exceeded the 16-bit cap.
    #[error("length varint exceeds 3 bytes or 16-bit value cap")]
    Length,

    /// A VLEN envelope's declared length exceeds the bytes remaining in a
    /// FIN-set frame.
    #[error("envelope length exceeds remaining frame bytes")]
    NotEnough,

    /// The accept-time WebSocket upgrade failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A non-transient I/O error (not `WouldBlock`/`Interrupted`).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// True for errors that should be retried locally rather than closing
    /// the connection (`WouldBlock`/`Interrupted` surfaced through `Io`).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Io(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
