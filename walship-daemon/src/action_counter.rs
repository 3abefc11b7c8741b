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

//! Counted long-running actions per volume.
//!
//! Actions (merge, apply, restore, resize) coexist with stable states, but
//! destructive transitions require the relevant counters to be zero. Tokens
//! decrement on drop, so an action never leaks its count on an error path.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DaemonError, Result};
use crate::state_machine::{VolInner, VolState};

/// Multiset of in-flight action names.
#[derive(Debug, Default)]
pub struct ActionCounters {
    counts: HashMap<&'static str, usize>,
}

impl ActionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, name: &str) -> usize {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn is_all_zero(&self, names: &[&'static str]) -> bool {
        names.iter().all(|n| self.value(n) == 0)
    }

    pub fn values(&self, names: &[&'static str]) -> Vec<(&'static str, usize)> {
        names.iter().map(|&n| (n, self.value(n))).collect()
    }

    fn inc(&mut self, name: &'static str) {
        *self.counts.entry(name).or_insert(0) += 1;
    }

    fn dec(&mut self, name: &'static str) {
        match self.counts.get_mut(name) {
            Some(v) if *v > 0 => *v -= 1,
            _ => debug_assert!(false, "action counter underflow for {name}"),
        }
    }
}

/// Scoped token for one running action.
pub struct ActionToken {
    vol: Arc<VolState>,
    name: &'static str,
}

impl ActionToken {
    /// Take a token under an already-held volume guard.
    pub fn begin_locked(vol: &Arc<VolState>, inner: &mut VolInner, name: &'static str) -> Self {
        inner.ac.inc(name);
        Self {
            vol: Arc::clone(vol),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for ActionToken {
    fn drop(&mut self) {
        let mut guard = self.vol.mu.lock();
        guard.ac.dec(self.name);
        drop(guard);
        self.vol.notify();
    }
}

/// Precondition used before destructive transitions.
pub fn verify_no_action_running(ac: &ActionCounters, names: &[&'static str]) -> Result<()> {
    if !ac.is_all_zero(names) {
        return Err(DaemonError::State(format!(
            "actions still running: {:?}",
            ac.values(names)
                .into_iter()
                .filter(|(_, v)| *v > 0)
                .collect::<Vec<_>>()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TBL: &[(&str, &str)] = &[("Archived", "Stop"), ("Stop", "Stopped")];

    fn vol() -> Arc<VolState> {
        Arc::new(VolState::new("v0", TBL, "Archived"))
    }

    #[test]
    fn test_token_counts() {
        let v = vol();
        {
            let mut guard = v.mu.lock();
            let t1 = ActionToken::begin_locked(&v, &mut guard, "Merge");
            let t2 = ActionToken::begin_locked(&v, &mut guard, "Merge");
            let t3 = ActionToken::begin_locked(&v, &mut guard, "Apply");
            assert_eq!(guard.ac.value("Merge"), 2);
            assert_eq!(guard.ac.value("Apply"), 1);
            assert!(!guard.ac.is_all_zero(&["Merge", "Apply"]));
            drop(guard);
            drop((t1, t2, t3));
        }
        assert!(v.mu.lock().ac.is_all_zero(&["Merge", "Apply"]));
    }

    #[test]
    fn test_verify_no_action_running() {
        let v = vol();
        let mut guard = v.mu.lock();
        verify_no_action_running(&guard.ac, &["Merge"]).unwrap();
        let token = ActionToken::begin_locked(&v, &mut guard, "Merge");
        assert!(verify_no_action_running(&guard.ac, &["Merge"]).is_err());
        verify_no_action_running(&guard.ac, &["Apply"]).unwrap();
        drop(guard);
        drop(token);
    }

    #[test]
    fn test_token_wakes_waiter() {
        let v = vol();
        let token = {
            let mut guard = v.mu.lock();
            ActionToken::begin_locked(&v, &mut guard, "Restore")
        };
        let v2 = Arc::clone(&v);
        let waiter = std::thread::spawn(move || {
            v2.wait_until(std::time::Duration::from_secs(5), |inner| {
                inner.ac.is_all_zero(&["Restore"])
            })
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(token);
        waiter.join().unwrap().unwrap();
    }
}
