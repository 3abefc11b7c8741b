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

//! Bounded queue with explicit terminal signals.
//!
//! The streaming pipelines need to distinguish three ways a queue can end:
//! normal close (producer finished), producer failure, and consumer failure.
//! `pop` therefore returns `Next(T) | End | Error(reason)` instead of a bare
//! `Option`, and `fail` poisons the queue in both directions.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::error::{CoreError, Result};

/// Result of a [`BoundedQueue::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum Popped<T> {
    Next(T),
    End,
    Error(String),
}

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    failed: Option<String>,
}

pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must not be zero");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
                failed: None,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Push an item, blocking while the queue is full.
    pub fn push(&self, item: T) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(reason) = &inner.failed {
                return Err(CoreError::QueueFailed(reason.clone()));
            }
            if inner.closed {
                return Err(CoreError::QueueClosed);
            }
            if inner.queue.len() < inner.capacity {
                break;
            }
            self.not_full.wait(&mut inner);
        }
        inner.queue.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop an item, blocking while the queue is empty and still open.
    pub fn pop(&self) -> Popped<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                self.not_full.notify_one();
                return Popped::Next(item);
            }
            if let Some(reason) = &inner.failed {
                return Popped::Error(reason.clone());
            }
            if inner.closed {
                return Popped::End;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Close the queue normally; queued items remain poppable.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Poison the queue; pending items are dropped and both sides wake up
    /// with the failure reason.
    pub fn fail(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.failed.is_none() {
            inner.failed = Some(reason.to_string());
        }
        inner.queue.clear();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().failed.is_some()
    }
}
