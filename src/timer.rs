//! Single-process delay queue for deferred callbacks.
//!
//! The ordering structure itself is a plain [`BinaryHeap`] — the spec treats
//! the raw priority queue as a replaceable external collaborator ("a
//! standard min-ordered delay queue suffices"). What this module owns is the
//! scheduling thread: a single background thread sleeps until the next
//! deadline or until woken by a newly-scheduled callback that jumped the
//! queue, then hands due callbacks off to a worker pool so the timer thread
//! itself never runs user code.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::clock;
use crate::pool::WorkerPool;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    when: i64,
    f: Callback,
}

// BinaryHeap is a max-heap; wrap in Reverse so the earliest deadline sorts
// first, and order entries solely by `when` (callbacks aren't comparable).
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.when.cmp(&other.when)
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<Reverse<Entry>>>,
    wakeup: Condvar,
}

/// A deferred-callback scheduler with its own background thread and worker
/// pool for running due callbacks.
pub struct Timer {
    shared: Arc<Shared>,
    pool: WorkerPool,
}

impl Timer {
    /// Spawns the timer's background thread and its callback worker pool.
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
        });
        let pool = WorkerPool::new(None);

        let loop_shared = shared.clone();
        let loop_pool = pool.clone();
        std::thread::Builder::new()
            .name("party-timer".into())
            .spawn(move || Self::run(loop_shared, loop_pool))
            .expect("failed to spawn timer thread");

        Arc::new(Self { shared, pool })
    }

    /// Schedules `f` to run after `delay`, clamped to a 4ms minimum (matching
    /// the original's treatment of non-positive delays).
    pub fn after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = if delay.is_zero() {
            Duration::from_millis(4)
        } else {
            delay
        };
        let when = clock::now() + delay.as_nanos() as i64;
        let mut queue = self.shared.queue.lock().unwrap();
        let wake = match queue.peek() {
            Some(Reverse(top)) => when < top.when,
            None => true,
        };
        queue.push(Reverse(Entry {
            when,
            f: Box::new(f),
        }));
        drop(queue);
        if wake {
            self.shared.wakeup.notify_one();
        }
    }

    fn run(shared: Arc<Shared>, pool: WorkerPool) {
        loop {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                let now = clock::now();
                match queue.peek() {
                    Some(Reverse(top)) if top.when <= now => {
                        let Reverse(entry) = queue.pop().unwrap();
                        pool.put_task(entry.f);
                    }
                    _ => break,
                }
            }
            let wait = match queue.peek() {
                Some(Reverse(top)) => Duration::from_nanos((top.when - clock::now()).max(0) as u64),
                None => Duration::from_secs(3600),
            };
            let (_guard, _) = shared.wakeup.wait_timeout(queue, wait).unwrap();
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").finish_non_exhaustive()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_after_delay() {
        let timer = Timer::new();
        let (tx, rx) = mpsc::channel();
        timer.after(Duration::from_millis(20), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn fires_in_deadline_order() {
        let timer = Timer::new();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        timer.after(Duration::from_millis(60), move || tx2.send(2).unwrap());
        timer.after(Duration::from_millis(10), move || tx.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    }
}
