//! Idle-timeout sweep thread.
//!
//! Grounded in `party.timeoutLoop`: a dedicated thread walks connections in
//! round-robin order, closing those idle past the configured timeout, woken
//! early by accept/handshake failures so a storm of bad connections doesn't
//! wait out a full `timeout_interval`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::party::Party;

/// Minimum gap between effective sweeps, regardless of how often the wakeup
/// channel fires — prevents a wakeup flood from turning into a busy loop.
const MIN_SWEEP_GAP: Duration = Duration::from_millis(100);

pub fn run(party: Arc<Party>, wake: Receiver<()>) {
    let mut last_sweep = Instant::now()
        .checked_sub(MIN_SWEEP_GAP)
        .unwrap_or_else(Instant::now);
    loop {
        let interval = party.config().timeout_interval;
        match wake.recv_timeout(interval) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        if last_sweep.elapsed() < MIN_SWEEP_GAP {
            continue;
        }
        party.sweep_once();
        last_sweep = Instant::now();
    }
}
