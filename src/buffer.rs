// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Size-classed free-list pool for read/write buffers.
//!
//! Connections borrow buffers for frame payloads and pending writes instead
//! of allocating per frame. Classes are powers of two from 2 to 65536 bytes;
//! anything larger falls through to a plain allocation that is never pooled.

use std::sync::Mutex;

const MIN_CLASS: usize = 2;
const MAX_CLASS: usize = 65536;
/// Caps how many buffers a single size class retains, so a connection storm
/// followed by a quiet period doesn't pin memory forever.
const MAX_FREE_PER_CLASS: usize = 256;

fn class_for(cap: usize) -> usize {
    cap.max(MIN_CLASS).next_power_of_two()
}

fn class_index(class: usize) -> usize {
    class.trailing_zeros() as usize - MIN_CLASS.trailing_zeros() as usize
}

const NUM_CLASSES: usize = {
    let mut n = 0;
    let mut c = MIN_CLASS;
    while c <= MAX_CLASS {
        n += 1;
        c <<= 1;
    }
    n
};

/// A size-classed pool of reusable byte buffers.
///
/// `get` rounds the requested capacity up to the nearest power-of-two class
/// and either reuses a free buffer from that class or allocates a fresh one.
/// `put` must be given a buffer previously returned by `get` on the same
/// pool; buffers larger than [`MAX_CLASS`] are simply dropped.
#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    /// Creates an empty pool; buffers are allocated lazily on first `get`.
    pub fn new() -> Self {
        Self {
            classes: (0..NUM_CLASSES).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Returns a buffer with capacity at least `need`, truncated to length 0.
    ///
    /// Buffers larger than 65536 bytes are allocated directly and are not
    /// eligible to be returned to the pool by `put`.
    pub fn get(&self, need: usize) -> Vec<u8> {
        if need > MAX_CLASS {
            return Vec::with_capacity(need);
        }
        let class = class_for(need);
        let idx = class_index(class);
        let mut free = self.classes[idx].lock().unwrap();
        if let Some(mut buf) = free.pop() {
            buf.clear();
            buf
        } else {
            Vec::with_capacity(class)
        }
    }

    /// Returns `buf` to its size class for reuse.
    ///
    /// Buffers whose capacity is not one of this pool's classes (i.e. not
    /// obtained from `get`, or oversized beyond 65536) are dropped instead of
    /// retained.
    pub fn put(&self, mut buf: Vec<u8>) {
        let cap = buf.capacity();
        if cap < MIN_CLASS || cap > MAX_CLASS || !cap.is_power_of_two() {
            return;
        }
        buf.clear();
        let idx = class_index(cap);
        let mut free = self.classes[idx].lock().unwrap();
        if free.len() < MAX_FREE_PER_CLASS {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_power_of_two() {
        let pool = BufferPool::new();
        let buf = pool.get(100);
        assert_eq!(buf.capacity(), 128);
    }

    #[test]
    fn reuses_returned_buffer() {
        let pool = BufferPool::new();
        let buf = pool.get(64);
        let ptr = buf.as_ptr();
        pool.put(buf);
        let buf2 = pool.get(64);
        assert_eq!(buf2.as_ptr(), ptr);
    }

    #[test]
    fn oversized_falls_through() {
        let pool = BufferPool::new();
        let buf = pool.get(200_000);
        assert!(buf.capacity() >= 200_000);
        pool.put(buf);
        // not retained: a fresh get() at the same size allocates again
        let buf2 = pool.get(200_000);
        assert!(buf2.capacity() >= 200_000);
    }

    #[test]
    fn zero_need_uses_min_class() {
        let pool = BufferPool::new();
        let buf = pool.get(0);
        assert_eq!(buf.capacity(), MIN_CLASS);
    }
}
