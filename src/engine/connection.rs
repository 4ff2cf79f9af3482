//! `Chum`: a single client connection — socket, parser state, write
//! coalescing, and team membership.
//!
//! Grounded in `bbq/chum.go` in full; the write backlog is shaped after
//! `flux-network`'s `TcpStream` (`RxState`-style read state, a pending
//! buffer standing in for its `VecDeque` backlog).

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::clock;
use crate::engine::frame::{self, FrameHeader};
use crate::engine::state::ParserState;
use crate::engine::varint::{FeedResult, VarintDecoder};
use crate::error::EngineError;
use crate::party::Context;
use crate::router::{Handler, RouteKind};

/// Bytes buffered per handler invocation in `Stream` mode before the handler
/// is invoked again with the next chunk.
const STREAM_CHUNK: usize = 1024;

fn mask_byte(header: &FrameHeader, offset: usize, raw: u8) -> u8 {
    if header.masked {
        raw ^ header.mask[offset % 4]
    } else {
        raw
    }
}

struct ParseState {
    state: ParserState,
    header_buf: Vec<u8>,
    header: Option<FrameHeader>,
    payload_offset: usize,

    action_read: bool,
    action: u32,
    action_decoder: Option<VarintDecoder>,
    kind: Option<RouteKind>,
    handler: Option<Handler>,

    length: usize,
    length_decoder: Option<VarintDecoder>,

    read_buf: Vec<u8>,
    data_offset: usize,
    first_chunk: bool,
}

impl ParseState {
    fn new() -> Self {
        Self {
            state: ParserState::NeedHeader,
            header_buf: Vec::with_capacity(frame::MAX_HEADER_BYTES),
            header: None,
            payload_offset: 0,
            action_read: false,
            action: 0,
            action_decoder: None,
            kind: None,
            handler: None,
            length: 0,
            length_decoder: None,
            read_buf: Vec::new(),
            data_offset: 0,
            first_chunk: true,
        }
    }
}

#[derive(Default)]
struct CurrentEnvelope {
    action: u32,
    length: usize,
    data: Vec<u8>,
    first: bool,
    received: bool,
}

struct WriteState {
    pending: Option<Vec<u8>>,
    write_armed: bool,
}

/// A single WebSocket client connection.
pub struct Chum {
    token: Token,
    ctx: Arc<Context>,
    socket: Mutex<TcpStream>,
    reading: AtomicBool,
    closed: AtomicBool,
    last_active: AtomicI64,
    write_state: Mutex<WriteState>,
    parse: Mutex<ParseState>,
    current: Mutex<CurrentEnvelope>,
    team_id: Mutex<Option<String>>,
}

impl Chum {
    pub fn new(token: Token, socket: TcpStream, ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            token,
            ctx,
            socket: Mutex::new(socket),
            reading: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_active: AtomicI64::new(clock::now()),
            write_state: Mutex::new(WriteState {
                pending: None,
                write_armed: false,
            }),
            parse: Mutex::new(ParseState::new()),
            current: Mutex::new(CurrentEnvelope::default()),
            team_id: Mutex::new(None),
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.last_active.store(clock::now(), Ordering::Relaxed);
    }

    /// Nanoseconds since this connection last made read/write progress.
    pub fn idle_for(&self) -> i64 {
        clock::now() - self.last_active.load(Ordering::Relaxed)
    }

    pub fn action(&self) -> u32 {
        self.current.lock().unwrap().action
    }

    pub fn length(&self) -> usize {
        self.current.lock().unwrap().length
    }

    /// A copy of the envelope's accumulated payload, valid only during the
    /// handler invocation that produced it.
    pub fn data(&self) -> Vec<u8> {
        self.current.lock().unwrap().data.clone()
    }

    pub fn first(&self) -> bool {
        self.current.lock().unwrap().first
    }

    pub fn received(&self) -> bool {
        self.current.lock().unwrap().received
    }

    // ---- reads -----------------------------------------------------

    /// Drives the read state machine until the socket would block or a
    /// protocol error occurs. Re-entered by the reactor on each READ
    /// readiness event.
    pub fn read_step(self: &Arc<Self>) -> Result<super::ReadStep, EngineError> {
        if self
            .reading
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Another worker is already draining; it will observe
            // subsequent bytes itself under edge-triggered semantics.
            return Ok(super::ReadStep::WouldBlock);
        }
        let result = self.drive();
        self.reading.store(false, Ordering::Release);
        result
    }

    fn drive(self: &Arc<Self>) -> Result<super::ReadStep, EngineError> {
        let mut buf = [0u8; 4096];
        let mut progressed = false;
        loop {
            let n = {
                let mut socket = self.socket.lock().unwrap();
                match socket.read(&mut buf) {
                    Ok(0) => return Err(EngineError::Closed),
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        return Ok(if progressed {
                            super::ReadStep::Progress
                        } else {
                            super::ReadStep::WouldBlock
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(EngineError::Io(e)),
                }
            };
            progressed = true;
            let mut parse = self.parse.lock().unwrap();
            for &byte in &buf[..n] {
                self.on_byte(&mut parse, byte)?;
            }
        }
    }

    fn on_byte(self: &Arc<Self>, parse: &mut ParseState, raw: u8) -> Result<(), EngineError> {
        match parse.state {
            ParserState::NeedHeader => self.on_header_byte(parse, raw),
            ParserState::NeedAction => self.on_action_byte(parse, raw),
            ParserState::NeedLength => self.on_length_byte(parse, raw),
            ParserState::NeedData => self.on_data_byte(parse, raw),
            ParserState::FrameDone => unreachable!("FrameDone is resolved before the next byte"),
        }
    }

    fn on_header_byte(self: &Arc<Self>, parse: &mut ParseState, raw: u8) -> Result<(), EngineError> {
        parse.header_buf.push(raw);
        let header = match frame::parse_header(&parse.header_buf)? {
            None => return Ok(()),
            Some(h) => h,
        };
        parse.header = Some(header);
        parse.payload_offset = 0;
        parse.header_buf.clear();
        self.touch();

        if header.is_control() {
            parse.state = ParserState::NeedData;
        } else if !parse.action_read {
            parse.action_decoder = Some(VarintDecoder::action());
            parse.state = ParserState::NeedAction;
        } else {
            match parse.kind {
                Some(RouteKind::Vlen) | Some(RouteKind::All) | Some(RouteKind::Stream) => {
                    parse.state = ParserState::NeedData;
                }
                Some(RouteKind::Discard) => {
                    parse.state = ParserState::NeedData;
                }
                None => return Err(EngineError::NotEnough),
            }
        }

        if header.payload_len == 0 {
            self.on_frame_payload_complete(parse)?;
        }
        Ok(())
    }

    fn on_action_byte(self: &Arc<Self>, parse: &mut ParseState, raw: u8) -> Result<(), EngineError> {
        let header = *parse.header.as_ref().unwrap();
        let b = mask_byte(&header, parse.payload_offset, raw);
        parse.payload_offset += 1;

        match parse.action_decoder.as_mut().unwrap().feed(b) {
            Err(()) => return Err(EngineError::Action),
            Ok(FeedResult::Pending) => {}
            Ok(FeedResult::Done(v)) => {
                parse.action = v;
                parse.action_read = true;
                let kind = self
                    .ctx
                    .router
                    .kind_of(v)
                    .ok_or(EngineError::ActionNotFound(v))?;
                parse.kind = Some(kind);
                parse.handler = self.ctx.router.handler_of(v);
                match kind {
                    RouteKind::Vlen => {
                        parse.length_decoder = Some(VarintDecoder::length());
                        parse.state = ParserState::NeedLength;
                    }
                    RouteKind::Discard => {
                        self.invoke_handler(parse, true, true);
                        parse.state = ParserState::NeedData;
                    }
                    RouteKind::All | RouteKind::Stream => {
                        parse.length = 0;
                        parse.read_buf = Vec::new();
                        parse.data_offset = 0;
                        parse.first_chunk = true;
                        parse.state = ParserState::NeedData;
                    }
                }
            }
        }

        if parse.payload_offset == header.payload_len {
            self.on_frame_payload_complete(parse)?;
        }
        Ok(())
    }

    fn on_length_byte(self: &Arc<Self>, parse: &mut ParseState, raw: u8) -> Result<(), EngineError> {
        let header = *parse.header.as_ref().unwrap();
        if parse.payload_offset >= header.payload_len {
            return Err(EngineError::NotEnough);
        }
        let b = mask_byte(&header, parse.payload_offset, raw);
        parse.payload_offset += 1;

        match parse.length_decoder.as_mut().unwrap().feed(b) {
            Err(()) => return Err(EngineError::Length),
            Ok(FeedResult::Pending) => {}
            Ok(FeedResult::Done(v)) => {
                parse.length = v as usize;
                let remaining_in_frame = header.payload_len.saturating_sub(parse.payload_offset);
                if header.fin && parse.length > remaining_in_frame {
                    return Err(EngineError::NotEnough);
                }
                parse.read_buf = self.ctx.buffers.get(parse.length);
                parse.data_offset = 0;
                parse.state = ParserState::NeedData;
                if parse.length == 0 {
                    self.invoke_handler(parse, true, true);
                }
            }
        }

        if parse.payload_offset == header.payload_len {
            self.on_frame_payload_complete(parse)?;
        }
        Ok(())
    }

    fn on_data_byte(self: &Arc<Self>, parse: &mut ParseState, raw: u8) -> Result<(), EngineError> {
        let header = *parse.header.as_ref().unwrap();
        let b = mask_byte(&header, parse.payload_offset, raw);
        parse.payload_offset += 1;

        if !header.is_control() {
            match parse.kind {
                Some(RouteKind::Vlen) => {
                    parse.read_buf.push(b);
                    parse.data_offset += 1;
                    if parse.data_offset == parse.length {
                        self.invoke_handler(parse, true, true);
                    }
                }
                Some(RouteKind::All) => {
                    parse.read_buf.push(b);
                    parse.data_offset += 1;
                }
                Some(RouteKind::Stream) => {
                    parse.read_buf.push(b);
                    if parse.read_buf.len() >= STREAM_CHUNK {
                        self.invoke_handler(parse, parse.first_chunk, false);
                        parse.first_chunk = false;
                        parse.read_buf.clear();
                        parse.data_offset = 0;
                    }
                }
                Some(RouteKind::Discard) | None => {}
            }
        }

        if parse.payload_offset == header.payload_len {
            self.on_frame_payload_complete(parse)?;
        }
        Ok(())
    }

    fn on_frame_payload_complete(
        self: &Arc<Self>,
        parse: &mut ParseState,
    ) -> Result<(), EngineError> {
        let header = *parse.header.as_ref().unwrap();

        if header.is_control() {
            if header.opcode == frame::OPCODE_PING {
                let _ = self.write(&frame::PONG_FRAME);
            }
            self.touch();
            parse.header = None;
            parse.state = ParserState::NeedHeader;
            return Ok(());
        }

        match parse.kind {
            Some(RouteKind::All) => {
                if header.fin {
                    self.invoke_handler(parse, true, true);
                    self.reset_envelope(parse);
                } else {
                    parse.header = None;
                    parse.state = ParserState::NeedHeader;
                }
            }
            Some(RouteKind::Stream) => {
                if header.fin {
                    if !parse.read_buf.is_empty() {
                        self.invoke_handler(parse, parse.first_chunk, false);
                    }
                    self.reset_envelope(parse);
                } else {
                    parse.header = None;
                    parse.state = ParserState::NeedHeader;
                }
            }
            Some(RouteKind::Vlen) => {
                if header.fin {
                    self.reset_envelope(parse);
                } else {
                    parse.header = None;
                    parse.state = ParserState::NeedHeader;
                }
            }
            Some(RouteKind::Discard) => {
                if header.fin {
                    self.reset_envelope(parse);
                } else {
                    parse.header = None;
                    parse.state = ParserState::NeedHeader;
                }
            }
            None => {
                parse.header = None;
                parse.state = ParserState::NeedHeader;
            }
        }
        Ok(())
    }

    fn invoke_handler(self: &Arc<Self>, parse: &mut ParseState, first: bool, received: bool) {
        let Some(handler) = parse.handler.clone() else {
            parse.read_buf = Vec::new();
            return;
        };
        let snapshot_data = std::mem::take(&mut parse.read_buf);
        {
            let mut cur = self.current.lock().unwrap();
            cur.action = parse.action;
            cur.length = parse.length;
            cur.data = snapshot_data;
            cur.first = first;
            cur.received = received;
        }
        let chum = self.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (*handler)(&chum)));
        let leftover = std::mem::take(&mut self.current.lock().unwrap().data);
        self.ctx.buffers.put(leftover);
        if let Err(panic) = result {
            tracing::error!(token = ?self.token, ?panic, "handler panicked");
        }
    }

    fn invoke_terminal(self: &Arc<Self>, parse: &mut ParseState) {
        let Some(handler) = parse.handler.clone() else {
            return;
        };
        {
            let mut cur = self.current.lock().unwrap();
            cur.first = false;
            cur.received = true;
            cur.data = Vec::new();
        }
        let chum = self.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (*handler)(&chum)));
        if let Err(panic) = result {
            tracing::error!(token = ?self.token, ?panic, "stream terminator handler panicked");
        }
    }

    fn reset_envelope(&self, parse: &mut ParseState) {
        parse.header = None;
        parse.header_buf.clear();
        parse.action_read = false;
        parse.action = 0;
        parse.action_decoder = None;
        parse.kind = None;
        parse.handler = None;
        parse.length = 0;
        parse.length_decoder = None;
        parse.read_buf = Vec::new();
        parse.data_offset = 0;
        parse.first_chunk = true;
        parse.state = ParserState::NeedHeader;
    }

    // ---- writes ------------------------------------------------------

    /// Appends `b` to the send stream: one non-blocking write attempt, then
    /// buffering and write-interest arming if it would block or only wrote
    /// part of `b`.
    pub fn write(self: &Arc<Self>, b: &[u8]) -> Result<usize, EngineError> {
        let mut state = self.write_state.lock().unwrap();
        if let Some(pending) = state.pending.as_mut() {
            pending.extend_from_slice(b);
            return Ok(b.len());
        }
        let write_result = {
            let mut socket = self.socket.lock().unwrap();
            socket.write(b)
        };
        match write_result {
            Ok(n) if n == b.len() => Ok(n),
            Ok(n) => {
                let mut buf = self.ctx.buffers.get(b.len() - n);
                buf.extend_from_slice(&b[n..]);
                state.pending = Some(buf);
                self.arm_write(&mut state)?;
                Ok(b.len())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                let mut buf = self.ctx.buffers.get(b.len());
                buf.extend_from_slice(b);
                state.pending = Some(buf);
                self.arm_write(&mut state)?;
                Ok(b.len())
            }
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    /// Prepends a synthesized WebSocket server-to-client header (no mask)
    /// and writes the result as a single contiguous call.
    pub fn write_frame(self: &Arc<Self>, b: &[u8], text: bool) -> Result<(), EngineError> {
        let opcode = if text {
            frame::OPCODE_TEXT
        } else {
            frame::OPCODE_BINARY
        };
        let header = frame::server_header(opcode, b.len())?;
        let mut combined = self.ctx.buffers.get(header.len() + b.len());
        combined.extend_from_slice(&header);
        combined.extend_from_slice(b);
        let result = self.write(&combined);
        self.ctx.buffers.put(combined);
        result.map(|_| ())
    }

    fn arm_write(self: &Arc<Self>, state: &mut WriteState) -> Result<(), EngineError> {
        if state.write_armed {
            return Ok(());
        }
        state.write_armed = true;
        {
            let mut socket = self.socket.lock().unwrap();
            self.ctx
                .registry
                .reregister(
                    &mut *socket,
                    self.token,
                    Interest::READABLE | Interest::WRITABLE,
                )
                .map_err(EngineError::Io)?;
        }
        self.ctx.write_pool.put(self.clone());
        Ok(())
    }

    /// Attempts to drain the pending write buffer; invoked by a write-pool
    /// worker on WRITE readiness.
    pub fn write_loop(self: &Arc<Self>) {
        let mut state = self.write_state.lock().unwrap();
        let Some(mut pending) = state.pending.take() else {
            return;
        };
        let write_result = {
            let mut socket = self.socket.lock().unwrap();
            socket.write(&pending)
        };
        match write_result {
            Ok(n) if n == pending.len() => {
                self.ctx.buffers.put(pending);
                state.write_armed = false;
                let mut socket = self.socket.lock().unwrap();
                let _ =
                    self.ctx
                        .registry
                        .reregister(&mut *socket, self.token, Interest::READABLE);
            }
            Ok(n) => {
                pending.drain(..n);
                state.pending = Some(pending);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                state.pending = Some(pending);
            }
            Err(e) => {
                self.ctx.buffers.put(pending);
                tracing::debug!(token = ?self.token, error = %e, "write drain failed");
            }
        }
    }

    // ---- membership ----------------------------------------------------

    pub fn join(self: &Arc<Self>, id: &str) {
        let mut cur = self.team_id.lock().unwrap();
        if let Some(prev) = cur.take() {
            self.ctx.teams.leave(&prev, self.token);
        }
        self.ctx.teams.join(id, self.clone());
        *cur = Some(id.to_string());
    }

    pub fn broadcast(
        self: &Arc<Self>,
        b: &[u8],
        text: bool,
        delay: Option<Duration>,
    ) -> Result<(), EngineError> {
        let id = self.team_id.lock().unwrap().clone();
        let Some(id) = id else {
            return Ok(());
        };
        let opcode = if text {
            frame::OPCODE_TEXT
        } else {
            frame::OPCODE_BINARY
        };
        let header = frame::server_header(opcode, b.len())?;
        let mut framed = Vec::with_capacity(header.len() + b.len());
        framed.extend_from_slice(&header);
        framed.extend_from_slice(b);

        let delay = match delay {
            Some(d) if d.is_zero() => Some(Duration::from_secs(1)),
            other => other,
        };
        self.ctx.teams.broadcast(&id, framed, delay, &self.ctx.timer);
        Ok(())
    }

    // ---- lifecycle -----------------------------------------------------

    /// Tears the connection down: idempotent, detaches from its team,
    /// deregisters from the notifier, returns buffers to the pool, and (for
    /// a stream handler) invokes the handler one last time as a terminator.
    pub fn close(self: &Arc<Self>) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        if let Some(id) = self.team_id.lock().unwrap().take() {
            self.ctx.teams.leave(&id, self.token);
        }

        {
            let mut socket = self.socket.lock().unwrap();
            let _ = self.ctx.registry.deregister(&mut *socket);
        }

        {
            let mut parse = self.parse.lock().unwrap();
            if parse.kind == Some(RouteKind::Stream) {
                self.invoke_terminal(&mut parse);
            }
            let leftover = std::mem::take(&mut parse.read_buf);
            self.ctx.buffers.put(leftover);
        }

        {
            let mut state = self.write_state.lock().unwrap();
            if let Some(buf) = state.pending.take() {
                self.ctx.buffers.put(buf);
            }
        }

        true
    }
}

impl std::fmt::Debug for Chum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chum")
            .field("token", &self.token)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_byte_is_identity_for_unmasked_header() {
        let header = FrameHeader {
            fin: true,
            opcode: frame::OPCODE_BINARY,
            masked: false,
            mask: [0; 4],
            payload_len: 1,
            header_len: 2,
        };
        assert_eq!(mask_byte(&header, 0, 0x42), 0x42);
    }

    #[test]
    fn mask_byte_xors_with_cycling_key() {
        let header = FrameHeader {
            fin: true,
            opcode: frame::OPCODE_BINARY,
            masked: true,
            mask: [1, 2, 3, 4],
            payload_len: 5,
            header_len: 6,
        };
        assert_eq!(mask_byte(&header, 0, 0x00), 1);
        assert_eq!(mask_byte(&header, 4, 0x00), 1);
    }
}
