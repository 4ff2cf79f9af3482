//! Server-wide tunables.
//!
//! Grounded in `bbq.Config`/`defaultConfig`: the original loads nothing from
//! disk or environment (constructing `Config` is the embedder's job), so this
//! stays a plain struct with `Default` rather than gaining a config-file
//! layer of its own.

use std::time::Duration;

/// Tunables for the idle-timeout reaper.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// A connection idle for at least this long is eligible for reaping.
    pub timeout: Duration,
    /// How often the reaper wakes to sweep, absent an explicit wakeup.
    pub timeout_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(4 * 60),
            timeout_interval: Duration::from_secs(60),
        }
    }
}
