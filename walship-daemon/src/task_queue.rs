// Copyright 2025 Sushanth (https://github.com/sushanthpy)
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

//! Delayed, deduplicating task queue.
//!
//! The proxy schedules one wdiff transfer per (volume, archive) and the
//! storage daemon one wlog transfer per volume; a task pushed while already
//! queued keeps its earlier due time. Worker threads block in `pop_wait`
//! until a task is due or the queue is closed.

use std::collections::{BinaryHeap, HashSet};
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Entry<T> {
    due: Instant,
    seq: u64,
    task: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert for earliest-due-first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner<T> {
    heap: BinaryHeap<Entry<T>>,
    queued: HashSet<T>,
    seq: u64,
    closed: bool,
}

pub struct TaskQueue<T: Clone + Eq + Hash> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T: Clone + Eq + Hash> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                queued: HashSet::new(),
                seq: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Schedule `task` after `delay`; a task already queued is left at its
    /// earlier due time.
    pub fn push(&self, task: T, delay: Duration) {
        let mut inner = self.inner.lock();
        if inner.closed || inner.queued.contains(&task) {
            return;
        }
        inner.queued.insert(task.clone());
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Entry {
            due: Instant::now() + delay,
            seq,
            task,
        });
        self.cond.notify_one();
    }

    /// Block until the earliest task is due; `None` once closed and empty.
    pub fn pop_wait(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(entry) = inner.heap.peek() {
                let now = Instant::now();
                if entry.due <= now {
                    let entry = inner.heap.pop().unwrap();
                    inner.queued.remove(&entry.task);
                    return Some(entry.task);
                }
                let due = entry.due;
                self.cond.wait_until(&mut inner, due);
            } else {
                if inner.closed {
                    return None;
                }
                self.cond.wait(&mut inner);
            }
        }
    }

    /// Close the queue; blocked workers drain what is due and exit.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.heap.clear();
        inner.queued.clear();
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Eq + Hash> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
