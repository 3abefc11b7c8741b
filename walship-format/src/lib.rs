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

//! walship on-disk formats and snapshot metadata algebra.
//!
//! ## Data flow
//!
//! ```text
//! WAL device ──wlog──▶ log packs ──▶ diff records ──wdiff──▶ volume dir
//!                                                               │
//!                                            merge / apply ◀────┤
//!                                                               ▼
//!                                   virt: base image ⊕ ordered diffs
//! ```
//!
//! - `meta`: generation ids, snapshots, diffs, states and their algebra
//! - `diff_mgr`: the in-memory set of present diffs and chain resolution
//! - `wlog`: the WAL device layout (super block, log packs, iterator)
//! - `wdiff`: the differential file layout (header, packs, reader/writer)
//! - `merge`: k-way merge of sorted wdiffs, last writer wins
//! - `virt`: a virtual full image over a base plus ordered diffs
//! - `volume`: the persistent per-volume directory

pub mod diff_mgr;
pub mod error;
pub mod merge;
pub mod meta;
pub mod virt;
pub mod volume;
pub mod wdiff;
pub mod wlog;

pub use diff_mgr::MetaDiffManager;
pub use error::{FormatError, Result};
pub use merge::DiffMerger;
pub use meta::{Gid, MetaDiff, MetaSnap, MetaState, Relation};
pub use virt::VirtualFullReader;
pub use volume::VolumeDir;
pub use wdiff::{DiffFileHeader, DiffPack, DiffReader, DiffRecord, DiffRecordKind, DiffWriter, RecIo};
pub use wlog::{LogPackHeader, LogPackIter, LogRecord, SuperBlock};
