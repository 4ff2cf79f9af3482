//! A high-concurrency WebSocket server runtime built directly on an
//! edge-triggered OS readiness notifier (epoll/kqueue via `mio`).
//!
//! The crate accepts long-lived WebSocket connections, parses an
//! application-layer envelope (`action` + optional `length` + payload)
//! nested inside WebSocket data frames, dispatches complete messages to
//! router-registered handlers, and supports membership-based broadcasting
//! with delay-coalesced delivery. See [`Party::listen`] for the entry
//! point and [`Router`] for registering handlers.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod party;
pub mod pool;
pub mod reaper;
pub mod router;
pub mod team;
pub mod timer;

pub use config::Config;
pub use engine::Chum;
pub use error::{EngineError, Result};
pub use party::Party;
pub use router::{RouteKind, Router};
