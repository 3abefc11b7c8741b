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

//! In-memory set of the wdiffs currently present for one volume.
//!
//! The manager persists nothing itself: it is rehydrated by scanning the
//! volume directory at startup, and is only ever mutated under the volume
//! mutex.

use std::collections::BTreeMap;

use crate::error::{FormatError, Result};
use crate::meta::{
    can_apply, can_merge, get_relation, Gid, MetaDiff, MetaSnap, MetaState, Relation,
};

#[derive(Debug, Default)]
pub struct MetaDiffManager {
    diffs: BTreeMap<(Gid, Gid, Gid, Gid), MetaDiff>,
}

impl MetaDiffManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a diff. Duplicates are rejected, as is a gid_b collision with an
    /// existing non-mergeable diff (two independent chains forking at the
    /// same point).
    pub fn add(&mut self, diff: MetaDiff) -> Result<()> {
        if self.diffs.contains_key(&diff.key()) {
            return Err(FormatError::BadMeta(format!("duplicate diff: {diff}")));
        }
        for d in self.diffs.values() {
            if d.snap_b.gid_b == diff.snap_b.gid_b && !d.is_mergeable && !diff.is_mergeable {
                return Err(FormatError::BadMeta(format!(
                    "diff {diff} overlaps existing {d}"
                )));
            }
        }
        self.diffs.insert(diff.key(), diff);
        Ok(())
    }

    /// Remove by exact match; removing an absent diff is a no-op.
    pub fn remove(&mut self, diff: &MetaDiff) {
        self.diffs.remove(&diff.key());
    }

    pub fn clear(&mut self) {
        self.diffs.clear();
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn all(&self) -> Vec<MetaDiff> {
        self.diffs.values().copied().collect()
    }

    /// The best snapshot reachable from `base` along clean applicable diffs.
    pub fn get_latest_snapshot(&self, base: &MetaState) -> MetaSnap {
        let mut cur = base.snap;
        loop {
            let next = self
                .diffs
                .values()
                .filter(|d| can_apply(cur, d) && d.is_clean())
                .max_by_key(|d| d.snap_e.gid_b);
            match next {
                Some(d) => cur = d.snap_e,
                None => return cur,
            }
        }
    }

    /// Every clean gid reachable from `base`, in order. These are the
    /// restorable snapshots.
    pub fn get_restorable_gids(&self, base: &MetaState) -> Vec<Gid> {
        let mut out = Vec::new();
        let mut cur = base.snap;
        if cur.is_clean() {
            out.push(cur.gid_b);
        }
        loop {
            let next = self
                .diffs
                .values()
                .filter(|d| can_apply(cur, d) && d.is_clean())
                .max_by_key(|d| d.snap_e.gid_b);
            match next {
                Some(d) => {
                    cur = d.snap_e;
                    out.push(cur.gid_b);
                }
                None => return out,
            }
        }
    }

    /// Longest prefix of clean diffs applicable to `base`, cut at `max_gid`.
    pub fn get_applicable_diff_list(&self, base: &MetaState, max_gid: Gid) -> Vec<MetaDiff> {
        let mut out = Vec::new();
        let mut cur = base.snap;
        loop {
            let next = self
                .diffs
                .values()
                .filter(|d| can_apply(cur, d) && d.is_clean() && d.snap_e.gid_b <= max_gid)
                .max_by_key(|d| d.snap_e.gid_b);
            match next {
                Some(d) => {
                    out.push(*d);
                    cur = d.snap_e;
                }
                None => return out,
            }
        }
    }

    /// Contiguous mergeable run starting at `gid_b`, bounded by `max_gid`.
    /// The first diff anchors the run and need not be marked mergeable
    /// itself; every subsequent diff must be.
    pub fn get_mergeable_diff_list(&self, gid_b: Gid, max_gid: Gid) -> Vec<MetaDiff> {
        let Some(first) = self
            .diffs
            .values()
            .find(|d| d.snap_b.gid_b == gid_b && d.snap_e.gid_b <= max_gid)
        else {
            return Vec::new();
        };
        let mut out = vec![*first];
        loop {
            let prev = out.last().unwrap();
            let next = self
                .diffs
                .values()
                .find(|d| can_merge(prev, d) && d.snap_e.gid_b <= max_gid);
            match next {
                Some(d) => out.push(*d),
                None => return out,
            }
        }
    }

    pub fn get_relation(&self, latest: MetaSnap, diff: &MetaDiff) -> Relation {
        get_relation(latest, diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(b: Gid, e: Gid) -> MetaDiff {
        MetaDiff::clean_step(b, e).unwrap()
    }

    fn base(gid: Gid) -> MetaState {
        MetaState::new(MetaSnap::clean(gid), 0)
    }

    #[test]
    fn test_add_remove() {
        let mut mgr = MetaDiffManager::new();
        mgr.add(step(0, 1)).unwrap();
        assert!(mgr.add(step(0, 1)).is_err(), "duplicate");
        mgr.add(step(1, 2)).unwrap();
        assert_eq!(mgr.len(), 2);
        mgr.remove(&step(0, 1));
        mgr.remove(&step(0, 1)); // idempotent
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_gid_overlap_rejected() {
        let mut mgr = MetaDiffManager::new();
        mgr.add(step(0, 1)).unwrap();
        assert!(mgr.add(step(0, 2)).is_err());
        // but a mergeable variant coexists
        mgr.add(step(0, 3).with_mergeable(true)).unwrap();
    }

    #[test]
    fn test_latest_snapshot_follows_chain() {
        let mut mgr = MetaDiffManager::new();
        mgr.add(step(0, 1)).unwrap();
        mgr.add(step(1, 2)).unwrap();
        mgr.add(step(2, 5)).unwrap();
        assert_eq!(mgr.get_latest_snapshot(&base(0)), MetaSnap::clean(5));
        // chain broken at 7
        mgr.add(step(7, 9)).unwrap();
        assert_eq!(mgr.get_latest_snapshot(&base(0)), MetaSnap::clean(5));
        assert_eq!(mgr.get_latest_snapshot(&base(7)), MetaSnap::clean(9));
    }

    #[test]
    fn test_latest_snapshot_skips_dirty() {
        let mut mgr = MetaDiffManager::new();
        mgr.add(step(0, 1)).unwrap();
        let dirty = MetaDiff::new(MetaSnap::clean(1), MetaSnap::new(2, 4).unwrap()).unwrap();
        mgr.add(dirty).unwrap();
        assert_eq!(mgr.get_latest_snapshot(&base(0)), MetaSnap::clean(1));
    }

    #[test]
    fn test_applicable_list_bounded() {
        let mut mgr = MetaDiffManager::new();
        for (b, e) in [(0, 1), (1, 2), (2, 3), (3, 4)] {
            mgr.add(step(b, e)).unwrap();
        }
        let list = mgr.get_applicable_diff_list(&base(0), 2);
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].snap_e, MetaSnap::clean(2));
        let all = mgr.get_applicable_diff_list(&base(0), u64::MAX);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_mergeable_run() {
        let mut mgr = MetaDiffManager::new();
        mgr.add(step(0, 1)).unwrap();
        mgr.add(step(1, 2).with_mergeable(true)).unwrap();
        mgr.add(step(2, 3).with_mergeable(true)).unwrap();
        mgr.add(step(3, 4)).unwrap(); // not mergeable: run stops before it
        let run = mgr.get_mergeable_diff_list(0, u64::MAX);
        assert_eq!(run.len(), 3);
        assert_eq!(run.last().unwrap().snap_e, MetaSnap::clean(3));

        let bounded = mgr.get_mergeable_diff_list(0, 2);
        assert_eq!(bounded.len(), 2);
    }

    #[test]
    fn test_restorable_gids() {
        let mut mgr = MetaDiffManager::new();
        mgr.add(step(0, 1)).unwrap();
        mgr.add(step(1, 3)).unwrap();
        assert_eq!(mgr.get_restorable_gids(&base(0)), vec![0, 1, 3]);
    }
}
