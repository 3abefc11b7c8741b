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

//! Concurrent volume-id to volume-state map.
//!
//! The map itself is lock-free to callers; the states it hands out carry
//! their own mutexes. Entries are created on first touch with a
//! caller-supplied constructor (which typically rehydrates from disk).

use std::sync::Arc;

use dashmap::DashMap;

pub struct VolMap<S> {
    map: DashMap<String, Arc<S>>,
}

impl<S> VolMap<S> {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Get the state for `vol_id`, creating it with `make` on first touch.
    pub fn get_or_create(&self, vol_id: &str, make: impl FnOnce(&str) -> S) -> Arc<S> {
        self.map
            .entry(vol_id.to_string())
            .or_insert_with(|| Arc::new(make(vol_id)))
            .clone()
    }

    pub fn get(&self, vol_id: &str) -> Option<Arc<S>> {
        self.map.get(vol_id).map(|e| e.clone())
    }

    pub fn remove(&self, vol_id: &str) {
        self.map.remove(vol_id);
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }
}

impl<S> Default for VolMap<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_once() {
        let map: VolMap<String> = VolMap::new();
        let a = map.get_or_create("v0", |id| format!("state-{id}"));
        let b = map.get_or_create("v0", |_| unreachable!("must not rebuild"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, "state-v0");
    }

    #[test]
    fn test_remove_and_keys() {
        let map: VolMap<u32> = VolMap::new();
        map.get_or_create("a", |_| 1);
        map.get_or_create("b", |_| 2);
        let mut keys = map.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        map.remove("a");
        assert!(map.get("a").is_none());
        assert!(map.get("b").is_some());
    }
}
