//! Wall-independent monotonic time.

use std::time::Instant;

/// Nanoseconds since an arbitrary, process-local epoch.
///
/// Only differences between two `now()` calls are meaningful; the absolute
/// value carries no wall-clock meaning, matching the Go original's reliance
/// on `runtime.nanotime`.
pub fn now() -> i64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().saturating_duration_since(start).as_nanos() as i64
}
