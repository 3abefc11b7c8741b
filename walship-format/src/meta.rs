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

//! Snapshot metadata: generation ids, snapshots, diffs and volume state.
//!
//! A snapshot is a pair of generation ids `(gid_b, gid_e)`; equal endpoints
//! mean the snapshot is *clean* (restorable), otherwise it is *dirty* and
//! covers a range of in-flight writes. A diff advances one snapshot to
//! another; the relation rules below decide whether a candidate diff can
//! extend a volume's chain.

use std::fmt;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use walship_core::checksum;

use crate::error::{FormatError, Result};

/// Generation id: a monotonic label for a point in the write stream.
/// Gid 0 is the initial post-full-sync state.
pub type Gid = u64;

/// Canonical wire tags for [`Relation`].
pub const TAG_APPLICABLE: &str = "applicable-diff";
pub const TAG_NOT_APPLICABLE: &str = "not-applicable-diff";
pub const TAG_TOO_OLD: &str = "too-old-diff";
pub const TAG_TOO_NEW: &str = "too-new-diff";

/// A snapshot name: ordered gid pair with `gid_b <= gid_e`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MetaSnap {
    pub gid_b: Gid,
    pub gid_e: Gid,
}

impl MetaSnap {
    pub fn new(gid_b: Gid, gid_e: Gid) -> Result<Self> {
        if gid_b > gid_e {
            return Err(FormatError::BadMeta(format!(
                "snapshot gid order violated: ({gid_b}, {gid_e})"
            )));
        }
        Ok(Self { gid_b, gid_e })
    }

    /// A clean snapshot `(gid, gid)`.
    pub fn clean(gid: Gid) -> Self {
        Self {
            gid_b: gid,
            gid_e: gid,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.gid_b == self.gid_e
    }

    pub fn is_dirty(&self) -> bool {
        !self.is_clean()
    }
}

impl fmt::Display for MetaSnap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            write!(f, "|{}|", self.gid_b)
        } else {
            write!(f, "|{},{}|", self.gid_b, self.gid_e)
        }
    }
}

/// Description of a wdiff: advances `snap_b` to `snap_e`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaDiff {
    pub snap_b: MetaSnap,
    pub snap_e: MetaSnap,
    /// Can be folded with an adjacent mergeable diff.
    pub is_mergeable: bool,
    /// Already the product of a merge.
    pub is_comp_diff: bool,
    /// Unix seconds; informational only, never part of identity.
    pub timestamp: u64,
}

impl MetaDiff {
    pub fn new(snap_b: MetaSnap, snap_e: MetaSnap) -> Result<Self> {
        if snap_b.gid_b > snap_e.gid_b || snap_b.gid_e > snap_e.gid_e {
            return Err(FormatError::BadMeta(format!(
                "diff endpoints out of order: {snap_b} -> {snap_e}"
            )));
        }
        Ok(Self {
            snap_b,
            snap_e,
            is_mergeable: false,
            is_comp_diff: false,
            timestamp: 0,
        })
    }

    /// A clean single-step diff `(b,b) -> (e,e)`.
    pub fn clean_step(gid_b: Gid, gid_e: Gid) -> Result<Self> {
        Self::new(MetaSnap::clean(gid_b), MetaSnap::clean(gid_e))
    }

    pub fn with_mergeable(mut self, mergeable: bool) -> Self {
        self.is_mergeable = mergeable;
        self
    }

    pub fn with_timestamp(mut self, ts: u64) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn is_clean(&self) -> bool {
        self.snap_b.is_clean() && self.snap_e.is_clean()
    }

    pub fn is_dirty(&self) -> bool {
        !self.is_clean()
    }

    /// Key that identifies the diff among its volume's files.
    pub fn key(&self) -> (Gid, Gid, Gid, Gid) {
        (
            self.snap_b.gid_b,
            self.snap_b.gid_e,
            self.snap_e.gid_b,
            self.snap_e.gid_e,
        )
    }

    /// File name this diff is stored under: `b0-b1-e0-e1-flags.wdiff`.
    pub fn file_name(&self) -> String {
        let mut flags = 0u32;
        if self.is_mergeable {
            flags |= 1;
        }
        if self.is_comp_diff {
            flags |= 2;
        }
        format!(
            "{}-{}-{}-{}-{}.wdiff",
            self.snap_b.gid_b, self.snap_b.gid_e, self.snap_e.gid_b, self.snap_e.gid_e, flags
        )
    }

    /// Inverse of [`MetaDiff::file_name`]; the timestamp is not encoded in
    /// the name and comes back as zero.
    pub fn parse_file_name(name: &str) -> Result<Self> {
        let stem = name
            .strip_suffix(".wdiff")
            .ok_or_else(|| FormatError::BadMeta(format!("not a wdiff file name: {name}")))?;
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() != 5 {
            return Err(FormatError::BadMeta(format!("bad wdiff file name: {name}")));
        }
        let mut nums = [0u64; 5];
        for (i, p) in parts.iter().enumerate() {
            nums[i] = p
                .parse()
                .map_err(|_| FormatError::BadMeta(format!("bad wdiff file name: {name}")))?;
        }
        let mut diff = MetaDiff::new(
            MetaSnap::new(nums[0], nums[1])?,
            MetaSnap::new(nums[2], nums[3])?,
        )?;
        diff.is_mergeable = nums[4] & 1 != 0;
        diff.is_comp_diff = nums[4] & 2 != 0;
        Ok(diff)
    }
}

impl fmt::Display for MetaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-->{}", self.snap_b, self.snap_e)?;
        if self.is_mergeable {
            write!(f, " M")?;
        }
        if self.is_comp_diff {
            write!(f, " C")?;
        }
        Ok(())
    }
}

/// Volume base state: a snapshot, a timestamp, and optionally the target
/// snapshot of an in-progress apply. At most one apply is pending per volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaState {
    pub snap: MetaSnap,
    pub pending: Option<MetaSnap>,
    pub timestamp: u64,
}

const META_STATE_MAGIC: u32 = 0x5753_4d53; // "WSMS"
const META_STATE_VERSION: u16 = 1;

impl MetaState {
    pub fn new(snap: MetaSnap, timestamp: u64) -> Self {
        Self {
            snap,
            pending: None,
            timestamp,
        }
    }

    pub fn is_applying(&self) -> bool {
        self.pending.is_some()
    }

    /// Fixed-width binary encoding with magic/version prefix and a trailing
    /// checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(51);
        buf.write_u32::<LittleEndian>(META_STATE_MAGIC).unwrap();
        buf.write_u16::<LittleEndian>(META_STATE_VERSION).unwrap();
        buf.write_u8(self.pending.is_some() as u8).unwrap();
        buf.write_u64::<LittleEndian>(self.snap.gid_b).unwrap();
        buf.write_u64::<LittleEndian>(self.snap.gid_e).unwrap();
        let pending = self.pending.unwrap_or(MetaSnap::clean(0));
        buf.write_u64::<LittleEndian>(pending.gid_b).unwrap();
        buf.write_u64::<LittleEndian>(pending.gid_e).unwrap();
        buf.write_u64::<LittleEndian>(self.timestamp).unwrap();
        let crc = checksum(&buf, 0);
        buf.write_u32::<LittleEndian>(crc).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 51 {
            return Err(FormatError::BadMeta("meta state record too short".into()));
        }
        let body = &data[..data.len() - 4];
        let mut tail = &data[data.len() - 4..];
        let stored = tail.read_u32::<LittleEndian>()?;
        if checksum(body, 0) != stored {
            return Err(FormatError::BadMeta("meta state checksum mismatch".into()));
        }
        let mut r = body;
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != META_STATE_MAGIC {
            return Err(FormatError::BadMeta("meta state magic mismatch".into()));
        }
        let version = r.read_u16::<LittleEndian>()?;
        if version != META_STATE_VERSION {
            return Err(FormatError::BadMeta(format!(
                "unsupported meta state version {version}"
            )));
        }
        let has_pending = r.read_u8()? != 0;
        let snap = MetaSnap::new(r.read_u64::<LittleEndian>()?, r.read_u64::<LittleEndian>()?)?;
        let pending_b = r.read_u64::<LittleEndian>()?;
        let pending_e = r.read_u64::<LittleEndian>()?;
        let timestamp = r.read_u64::<LittleEndian>()?;
        let pending = if has_pending {
            Some(MetaSnap::new(pending_b, pending_e)?)
        } else {
            None
        };
        Ok(Self {
            snap,
            pending,
            timestamp,
        })
    }
}

impl fmt::Display for MetaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pending {
            Some(p) => write!(f, "<{}--{}>", self.snap, p),
            None => write!(f, "<{}>", self.snap),
        }
    }
}

/// Classification of a candidate diff against a latest snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Applicable,
    NotApplicable,
    TooOld,
    TooNew,
}

impl Relation {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Relation::Applicable => TAG_APPLICABLE,
            Relation::NotApplicable => TAG_NOT_APPLICABLE,
            Relation::TooOld => TAG_TOO_OLD,
            Relation::TooNew => TAG_TOO_NEW,
        }
    }
}

/// Whether `diff` extends the chain at `snap`.
pub fn can_apply(snap: MetaSnap, diff: &MetaDiff) -> bool {
    diff.snap_b == snap
}

/// The snapshot reached by applying `diff` (caller checked applicability).
pub fn apply_snap(_snap: MetaSnap, diff: &MetaDiff) -> MetaSnap {
    diff.snap_e
}

/// Relation of a candidate diff to the latest snapshot, per the rules:
/// applicable when `snap_b` matches exactly; too old when the diff ends at or
/// before the snapshot; too new when it begins past it; gap otherwise.
pub fn get_relation(latest: MetaSnap, diff: &MetaDiff) -> Relation {
    if can_apply(latest, diff) {
        Relation::Applicable
    } else if diff.snap_e.gid_b <= latest.gid_b {
        Relation::TooOld
    } else if diff.snap_b.gid_b > latest.gid_b {
        Relation::TooNew
    } else {
        Relation::NotApplicable
    }
}

/// Whether `d2` can be folded onto `d1`: endpoints must be adjacent and `d2`
/// must be marked mergeable. Dirty endpoints survive merging, so a dirty
/// boundary shows up as non-adjacent endpoints and is refused here.
pub fn can_merge(d1: &MetaDiff, d2: &MetaDiff) -> bool {
    d2.is_mergeable && d1.snap_e == d2.snap_b
}

/// Fold `d2` onto `d1` (caller checked [`can_merge`]).
pub fn merge_diff(d1: &MetaDiff, d2: &MetaDiff) -> MetaDiff {
    MetaDiff {
        snap_b: d1.snap_b,
        snap_e: d2.snap_e,
        is_mergeable: d1.is_mergeable,
        is_comp_diff: true,
        timestamp: d2.timestamp,
    }
}
