//! The server runtime: accept loop, reactor dispatch, router, teams, and
//! idle-timeout reaper.
//!
//! Grounded in `bbq/party.go`. `Party` is the crate's single entry point —
//! constructing one spawns its notifier, accept pool, read pool, write
//! pool, and reaper threads.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::{Arc, RwLock, Weak};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use slab::Slab;

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::engine::Chum;
use crate::pool::WorkerPool;
use crate::reaper;
use crate::router::Router;
use crate::team::Teams;
use crate::timer::Timer;

const LISTEN_TOKEN: Token = Token(usize::MAX - 1);

/// Shared service handles threaded into every [`Chum`]: the router table,
/// buffer pool, team directory, delay-queue timer, notifier registry, and
/// write-drain pool. Constructed once per `Party` rather than as Go-style
/// package-level singletons, so tests can build independent parties without
/// cross-talk (see DESIGN.md, Open Question 4).
pub struct Context {
    pub router: Router,
    pub buffers: Arc<BufferPool>,
    pub teams: Arc<Teams>,
    pub timer: Arc<Timer>,
    pub registry: Arc<mio::Registry>,
    pub write_pool: WorkerPool<Arc<Chum>>,
}

/// The server's top-level runtime.
pub struct Party {
    ctx: Arc<Context>,
    chums: RwLock<Slab<Arc<Chum>>>,
    listener: std::sync::Mutex<TcpListener>,
    config: Config,
    reaper_wake: crossbeam_channel::Sender<()>,
    accept_pool: WorkerPool<()>,
    read_pool: WorkerPool<Arc<Chum>>,
}

impl Party {
    /// Binds `addr`, registers the listener with a fresh reactor, and spawns
    /// the notifier, accept, read, write, and reaper threads. `router` must
    /// be fully populated before calling — registration after `listen` is
    /// not supported.
    pub fn listen(addr: SocketAddr, router: Router, config: Config) -> io::Result<Arc<Party>> {
        let mut listener = TcpListener::bind(addr)?;
        let poll = mio::Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        registry.register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;

        let timer = Timer::new();
        let buffers = Arc::new(BufferPool::new());
        let teams = Arc::new(Teams::new());
        let write_pool = WorkerPool::with_handler(None, |chum: Arc<Chum>| chum.write_loop());
        let ctx = Arc::new(Context {
            router,
            buffers,
            teams,
            timer,
            registry,
            write_pool,
        });

        let (reaper_tx, reaper_rx) = crossbeam_channel::unbounded();

        let party = Arc::new_cyclic(|weak: &Weak<Party>| {
            let read_weak = weak.clone();
            let read_pool = WorkerPool::with_handler(None, move |chum: Arc<Chum>| {
                if let Some(party) = read_weak.upgrade() {
                    party.handle_read(chum);
                }
            });
            let accept_weak = weak.clone();
            let accept_pool = WorkerPool::with_handler(None, move |()| {
                if let Some(party) = accept_weak.upgrade() {
                    party.handle_accept();
                }
            });
            Party {
                ctx,
                chums: RwLock::new(Slab::new()),
                listener: std::sync::Mutex::new(listener),
                config,
                reaper_wake: reaper_tx,
                accept_pool,
                read_pool,
            }
        });

        let notifier_party = party.clone();
        std::thread::Builder::new()
            .name("party-notifier".into())
            .spawn(move || notifier_party.notifier_loop(poll))
            .expect("failed to spawn notifier thread");

        let reaper_party = party.clone();
        std::thread::Builder::new()
            .name("party-reaper".into())
            .spawn(move || reaper::run(reaper_party, reaper_rx))
            .expect("failed to spawn reaper thread");

        Ok(party)
    }

    pub(crate) fn config(&self) -> Config {
        self.config
    }

    /// Returns the number of currently tracked connections.
    pub fn connection_count(&self) -> usize {
        self.chums.read().unwrap().len()
    }

    fn notifier_loop(self: Arc<Self>, mut poll: mio::Poll) {
        let mut events = mio::Events::with_capacity(1024);
        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "notifier poll failed, terminating reactor thread");
                return;
            }
            for event in events.iter() {
                if event.token() == LISTEN_TOKEN {
                    self.accept_pool.put(());
                } else {
                    self.dispatch_client_event(event);
                }
            }
        }
    }

    fn dispatch_client_event(self: &Arc<Self>, event: &mio::event::Event) {
        let token = event.token();
        let chum = {
            let chums = self.chums.read().unwrap();
            chums.get(token.0).cloned()
        };
        let Some(chum) = chum else { return };
        if chum.is_closed() {
            return;
        }
        if event.is_error() || event.is_read_closed() {
            self.close_chum(&chum);
            return;
        }
        if event.is_writable() {
            self.ctx.write_pool.put(chum.clone());
        }
        if event.is_readable() {
            self.read_pool.put(chum);
        }
    }

    fn handle_read(self: &Arc<Self>, chum: Arc<Chum>) {
        if chum.is_closed() {
            return;
        }
        if let Err(e) = chum.read_step() {
            tracing::debug!(token = ?chum.token(), error = %e, "closing connection");
            self.close_chum(&chum);
        }
    }

    fn close_chum(self: &Arc<Self>, chum: &Arc<Chum>) {
        if chum.close() {
            self.chums.write().unwrap().try_remove(chum.token().0);
        }
    }

    fn handle_accept(self: &Arc<Self>) {
        loop {
            let accepted = {
                let mut listener = self.listener.lock().unwrap();
                listener.accept()
            };
            match accepted {
                Ok((stream, _addr)) => self.complete_accept(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    let _ = self.reaper_wake.send(());
                    break;
                }
            }
        }
    }

    /// Performs the blocking handshake and, on success, registers the
    /// connection for non-blocking READ events.
    fn complete_accept(self: &Arc<Self>, stream: TcpStream) {
        // SAFETY: the fd is uniquely owned by `stream`, which is consumed by
        // `into_raw_fd` here; no other handle observes it until the
        // resulting `std::net::TcpStream` (and later, the `mio` stream
        // rebuilt from it) takes ownership.
        let mut blocking = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
        if let Err(e) = crate::handshake::accept(&mut blocking) {
            tracing::debug!(error = %e, "handshake failed");
            let _ = self.reaper_wake.send(());
            return;
        }
        let stream = TcpStream::from_std(blocking);
        self.register_chum(stream);
    }

    fn register_chum(self: &Arc<Self>, mut stream: TcpStream) {
        let mut chums = self.chums.write().unwrap();
        let entry = chums.vacant_entry();
        let token = Token(entry.key());
        if let Err(e) = self
            .ctx
            .registry
            .register(&mut stream, token, Interest::READABLE)
        {
            tracing::warn!(error = %e, "failed to register accepted connection");
            return;
        }
        let chum = Chum::new(token, stream, self.ctx.clone());
        entry.insert(chum);
    }

    /// One round-robin pass over tracked connections, closing those idle
    /// past `config.timeout`. Bounded to avoid a single sweep stalling on a
    /// pathologically large connection table.
    pub(crate) fn sweep_once(self: &Arc<Self>) {
        const MAX_CLOSES: usize = 1000;
        const MAX_VISITS: usize = 100_000;

        let timeout_nanos = self.config.timeout.as_nanos() as i64;
        let tokens: Vec<Token> = {
            let chums = self.chums.read().unwrap();
            chums.iter().take(MAX_VISITS).map(|(k, _)| Token(k)).collect()
        };

        let mut closed = 0usize;
        for token in tokens {
            if closed >= MAX_CLOSES {
                break;
            }
            let chum = {
                let chums = self.chums.read().unwrap();
                chums.get(token.0).cloned()
            };
            let Some(chum) = chum else { continue };
            if chum.idle_for() >= timeout_nanos {
                self.close_chum(&chum);
                closed += 1;
            }
        }
        tracing::debug!(closed, "idle-timeout sweep complete");
    }
}
