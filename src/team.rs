//! Membership and broadcast coalescing.
//!
//! Grounded in `bbq/team.go`: a team is a named set of connections; a
//! broadcast with a positive delay is fingerprinted so that repeated equal
//! broadcasts within the same delay window collapse into a single emission.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::engine::Chum;

/// `h = 5381; for each byte b: h = h + (h<<5) + b` — the original's
/// duplicate-suppression fingerprint. Not a cryptographic hash; teams are a
/// trusted server-side grouping, not an attacker-controlled surface.
pub fn hash_times33(bytes: &[u8]) -> u64 {
    let mut h: u64 = 5381;
    for &b in bytes {
        h = h.wrapping_add(h << 5).wrapping_add(b as u64);
    }
    h
}

/// A named multicast group of connections.
pub struct Team {
    members: RwLock<Vec<Arc<Chum>>>,
    in_flight: std::sync::Mutex<HashSet<u64>>,
}

impl Team {
    fn new() -> Self {
        Self {
            members: RwLock::new(Vec::new()),
            in_flight: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.members.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add(&self, chum: Arc<Chum>) {
        self.members.write().unwrap().push(chum);
    }

    fn remove(&self, token: mio::Token) {
        self.members.write().unwrap().retain(|c| c.token() != token);
    }

    /// Writes `framed` to every current member, synchronously, under the
    /// team's read lock.
    pub fn write_to_all(&self, framed: &[u8]) {
        let members = self.members.read().unwrap();
        for member in members.iter() {
            let _ = member.write(framed);
        }
    }

    /// Returns `true` if `fingerprint` was newly inserted (i.e. this
    /// broadcast is not a duplicate of one already in flight).
    fn mark_in_flight(&self, fingerprint: u64) -> bool {
        self.in_flight.lock().unwrap().insert(fingerprint)
    }

    fn clear_in_flight(&self, fingerprint: u64) {
        self.in_flight.lock().unwrap().remove(&fingerprint);
    }
}

/// The party-wide directory of teams, keyed by id.
#[derive(Default)]
pub struct Teams {
    inner: RwLock<HashMap<String, Arc<Team>>>,
}

impl Teams {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, id: &str) -> Arc<Team> {
        if let Some(team) = self.inner.read().unwrap().get(id) {
            return team.clone();
        }
        let mut inner = self.inner.write().unwrap();
        inner
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Team::new()))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Team>> {
        self.inner.read().unwrap().get(id).cloned()
    }

    /// Adds `chum` to team `id`, creating the team if needed.
    pub fn join(&self, id: &str, chum: Arc<Chum>) -> Arc<Team> {
        let team = self.get_or_create(id);
        team.add(chum);
        team
    }

    /// Removes `token` from team `id`; deletes the team if it becomes empty.
    pub fn leave(&self, id: &str, token: mio::Token) {
        let team = {
            let inner = self.inner.read().unwrap();
            match inner.get(id) {
                Some(t) => t.clone(),
                None => return,
            }
        };
        team.remove(token);
        if team.is_empty() {
            self.inner.write().unwrap().remove(id);
        }
    }

    /// Schedules (or performs, for negative delay) a coalesced broadcast of
    /// `framed` to every member of team `id`.
    ///
    /// `delay < 0` (represented here as `None`) writes synchronously and
    /// immediately. `Some(Duration::ZERO)` is remapped by the caller to the
    /// 1s default before reaching this function.
    pub fn broadcast(
        self: &Arc<Self>,
        id: &str,
        framed: Vec<u8>,
        delay: Option<std::time::Duration>,
        timer: &Arc<crate::timer::Timer>,
    ) {
        let team = match self.get(id) {
            Some(t) => t,
            None => return,
        };
        match delay {
            None => team.write_to_all(&framed),
            Some(delay) => {
                let fingerprint = hash_times33(&framed);
                if !team.mark_in_flight(fingerprint) {
                    return;
                }
                let team = team.clone();
                timer.after(delay, move || {
                    team.write_to_all(&framed);
                    team.clear_in_flight(fingerprint);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times33_matches_known_values() {
        assert_eq!(hash_times33(b""), 5381);
        assert_eq!(hash_times33(b"a"), 5381u64.wrapping_mul(33).wrapping_add(b'a' as u64));
    }

    #[test]
    fn join_creates_and_leave_removes_empty_team() {
        let teams = Teams::new();
        assert!(teams.get("t").is_none());
    }
}
