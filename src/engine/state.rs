//! The connection's read state, modeled as an explicit enum rather than the
//! original's `goto`-chained `readLoop`.
//!
//! `Connection::read_step` re-enters this state machine on every READ
//! readiness event; it runs until the socket would block or a full envelope
//! has been handed to the router.

/// What a single call to the read state machine accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStep {
    /// At least one byte was consumed; the caller should not re-enqueue
    /// unless further readiness arrives (edge-triggered: the reactor already
    /// knows to call again once more data is ready).
    Progress,
    /// The socket would block; control returns to the reactor until the
    /// next READ readiness event.
    WouldBlock,
}

/// Where the per-connection parser sits within one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Fewer than the full frame header (2, +2 extended length, +4 mask)
    /// bytes have been read.
    NeedHeader,
    /// Header parsed; the envelope's `action` varint is not yet complete.
    NeedAction,
    /// Action decoded as `Vlen`; the `length` varint is not yet complete.
    NeedLength,
    /// Length known (or the route is `All`/`Stream`); payload bytes remain.
    NeedData,
    /// `payload_offset == payload_len` for the current frame.
    FrameDone,
}
