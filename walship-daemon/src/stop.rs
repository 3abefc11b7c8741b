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

//! Per-volume stop flags.
//!
//! A `stop` command marks the volume stopping (gracefully or forcefully);
//! long loops poll the flag between chunks and bail out without committing.
//! The flag holder clears it when the stop handshake finishes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::state_machine::VolState;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    NotStopping = 0,
    Stopping = 1,
    ForceStopping = 2,
}

/// Lock-free view of the volume's stop state.
#[derive(Debug)]
pub struct StopFlag(AtomicU8);

impl StopFlag {
    pub fn new() -> Self {
        Self(AtomicU8::new(StopState::NotStopping as u8))
    }

    pub fn get(&self) -> StopState {
        match self.0.load(Ordering::Acquire) {
            1 => StopState::Stopping,
            2 => StopState::ForceStopping,
            _ => StopState::NotStopping,
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.get() != StopState::NotStopping
    }

    pub fn is_force(&self) -> bool {
        self.get() == StopState::ForceStopping
    }

    fn set(&self, state: StopState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that marks a volume stopping for the duration of a stop handshake.
///
/// Creation fails (returns `None`) when a stop is already in progress,
/// except that a force stop may supersede a graceful one.
pub struct Stopper {
    vol: Arc<VolState>,
}

impl Stopper {
    pub fn new(vol: &Arc<VolState>, force: bool) -> Option<Self> {
        let target = if force {
            StopState::ForceStopping
        } else {
            StopState::Stopping
        };
        match (vol.stop.get(), force) {
            (StopState::NotStopping, _) => {}
            (StopState::Stopping, true) => {} // upgrade
            _ => return None,
        }
        vol.stop.set(target);
        vol.notify();
        Some(Self {
            vol: Arc::clone(vol),
        })
    }
}

impl Drop for Stopper {
    fn drop(&mut self) {
        self.vol.stop.set(StopState::NotStopping);
        self.vol.notify();
    }
}
