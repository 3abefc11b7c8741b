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

//! Named per-volume state machine with transactional transitions.
//!
//! A transition runs in two steps: `begin` asserts the current state and
//! advances to a *transient* state; `commit` advances to the final stable
//! state. Dropping an uncommitted transaction rolls back to the original
//! state. Both steps take the volume mutex, but long work happens between
//! them with the mutex released.

use std::collections::HashSet;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::action_counter::ActionCounters;
use crate::error::{DaemonError, Result};
use walship_format::MetaDiffManager;

/// Permitted `(from, to)` pairs plus the current state name.
#[derive(Debug)]
pub struct StateMachine {
    allowed: HashSet<(&'static str, &'static str)>,
    states: HashSet<&'static str>,
    state: &'static str,
}

impl StateMachine {
    pub fn new(pairs: &[(&'static str, &'static str)], init: &'static str) -> Self {
        let mut allowed = HashSet::new();
        let mut states = HashSet::new();
        states.insert(init);
        for &(from, to) in pairs {
            allowed.insert((from, to));
            states.insert(from);
            states.insert(to);
        }
        Self {
            allowed,
            states,
            state: init,
        }
    }

    pub fn get(&self) -> &'static str {
        self.state
    }

    /// Force the state, e.g. when rehydrating from the state file. The name
    /// must be one the table knows.
    pub fn set(&mut self, state: &str) -> Result<()> {
        let known = self
            .states
            .iter()
            .find(|s| **s == state)
            .copied()
            .ok_or_else(|| DaemonError::State(format!("unknown state: {state}")))?;
        self.state = known;
        Ok(())
    }

    pub fn can_transit(&self, from: &str, to: &str) -> bool {
        self.allowed
            .iter()
            .any(|&(f, t)| f == from && t == to)
    }

    fn transit(&mut self, from: &str, to: &'static str) -> Result<()> {
        if self.state != from {
            return Err(DaemonError::State(format!(
                "state is {} not {from}",
                self.state
            )));
        }
        if !self.can_transit(from, to) {
            return Err(DaemonError::State(format!(
                "transition {from} -> {to} not permitted"
            )));
        }
        self.state = to;
        Ok(())
    }
}

/// Everything the per-volume mutex owns.
#[derive(Debug)]
pub struct VolInner {
    pub sm: StateMachine,
    pub ac: ActionCounters,
    pub diff_mgr: MetaDiffManager,
}

/// Per-volume shared state: one mutex, one condvar, one stop flag.
#[derive(Debug)]
pub struct VolState {
    vol_id: String,
    pub mu: Mutex<VolInner>,
    pub cond: Condvar,
    pub stop: crate::stop::StopFlag,
}

impl VolState {
    pub fn new(
        vol_id: &str,
        pairs: &[(&'static str, &'static str)],
        init: &'static str,
    ) -> Self {
        Self {
            vol_id: vol_id.to_string(),
            mu: Mutex::new(VolInner {
                sm: StateMachine::new(pairs, init),
                ac: ActionCounters::new(),
                diff_mgr: MetaDiffManager::new(),
            }),
            cond: Condvar::new(),
            stop: crate::stop::StopFlag::new(),
        }
    }

    pub fn vol_id(&self) -> &str {
        &self.vol_id
    }

    pub fn state(&self) -> &'static str {
        self.mu.lock().sm.get()
    }

    pub fn notify(&self) {
        self.cond.notify_all();
    }

    /// Block until `pred` holds, or fail after `timeout`.
    pub fn wait_until(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&mut VolInner) -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.mu.lock();
        while !pred(&mut guard) {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return Err(DaemonError::State(format!(
                    "timed out waiting on volume {}",
                    self.vol_id
                )));
            }
        }
        Ok(())
    }
}

/// An in-flight state transition. `begin_locked` moves to the transient
/// state; `commit` finishes; dropping uncommitted rolls back.
pub struct SmTransaction {
    vol: Arc<VolState>,
    from: &'static str,
    via: &'static str,
    committed: bool,
}

impl SmTransaction {
    /// Begin under an already-held volume guard.
    pub fn begin_locked(
        vol: &Arc<VolState>,
        inner: &mut VolInner,
        from: &'static str,
        via: &'static str,
    ) -> Result<Self> {
        inner.sm.transit(from, via)?;
        vol.notify();
        Ok(Self {
            vol: Arc::clone(vol),
            from,
            via,
            committed: false,
        })
    }

    /// Begin from whichever of `froms` the volume is currently in.
    pub fn begin_locked_from(
        vol: &Arc<VolState>,
        inner: &mut VolInner,
        froms: &[&'static str],
        via: &'static str,
    ) -> Result<Self> {
        let cur = inner.sm.get();
        let from = froms
            .iter()
            .copied()
            .find(|f| *f == cur)
            .ok_or_else(|| {
                DaemonError::State(format!("state is {cur}, expected one of {froms:?}"))
            })?;
        Self::begin_locked(vol, inner, from, via)
    }

    /// Convenience wrapper that takes the lock itself.
    pub fn begin(vol: &Arc<VolState>, from: &'static str, via: &'static str) -> Result<Self> {
        let vol = Arc::clone(vol);
        let mut guard = vol.mu.lock();
        let tran = {
            let inner = &mut *guard;
            inner.sm.transit(from, via)?;
            Self {
                vol: Arc::clone(&vol),
                from,
                via,
                committed: false,
            }
        };
        drop(guard);
        tran.vol.notify();
        Ok(tran)
    }

    pub fn via(&self) -> &'static str {
        self.via
    }

    pub fn commit(mut self, to: &'static str) -> Result<()> {
        let mut guard = self.vol.mu.lock();
        guard.sm.transit(self.via, to)?;
        drop(guard);
        self.committed = true;
        self.vol.notify();
        Ok(())
    }
}

impl Drop for SmTransaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut guard = self.vol.mu.lock();
        if guard.sm.get() == self.via {
            guard.sm.state = self.from;
        }
        drop(guard);
        self.vol.notify();
    }
}
