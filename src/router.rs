//! Action routing table.
//!
//! Mirrors `bbq.Router`/`ActionType_*` from the original: handlers are
//! registered once before the party starts listening, keyed by the envelope's
//! decoded `action`. Mutation after `Party::listen` is not supported.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::Chum;

/// How a router entry's payload is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// No payload; the handler runs immediately after the action varint.
    Discard,
    /// A length varint follows the action, then exactly that many bytes.
    Vlen,
    /// The handler is invoked once per arriving chunk until the frame (and
    /// any continuations) completes.
    Stream,
    /// The payload is every remaining byte of the frame, across
    /// continuations, until FIN.
    All,
}

pub type Handler = Arc<dyn Fn(&Chum) + Send + Sync + 'static>;

struct Route {
    kind: RouteKind,
    handler: Handler,
}

/// An immutable `action -> (kind, handler)` table built before the party
/// starts accepting connections.
#[derive(Default)]
pub struct Router {
    routes: HashMap<u32, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Registers a handler for `action`. Re-registering an action replaces
    /// its previous entry.
    pub fn add<F>(&mut self, action: u32, kind: RouteKind, handler: F)
    where
        F: Fn(&Chum) + Send + Sync + 'static,
    {
        self.routes.insert(
            action,
            Route {
                kind,
                handler: Arc::new(handler),
            },
        );
    }

    pub fn kind_of(&self, action: u32) -> Option<RouteKind> {
        self.routes.get(&action).map(|r| r.kind)
    }

    pub fn handler_of(&self, action: u32) -> Option<Handler> {
        self.routes.get(&action).map(|r| r.handler.clone())
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn looks_up_registered_action() {
        let mut router = Router::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        router.add(7, RouteKind::Discard, move |_chum| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(router.kind_of(7), Some(RouteKind::Discard));
        assert!(router.kind_of(8).is_none());
    }

    #[test]
    fn replaces_existing_registration() {
        let mut router = Router::new();
        router.add(1, RouteKind::Discard, |_| {});
        router.add(1, RouteKind::Vlen, |_| {});
        assert_eq!(router.kind_of(1), Some(RouteKind::Vlen));
    }
}
