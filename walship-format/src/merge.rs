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

//! K-way merge of ordered wdiffs.
//!
//! Sources are added oldest first; on overlapping ranges the newest source
//! wins and older records are split around it. Adjacent output slices from
//! the same source coalesce when contiguous with matching kinds.
//!
//! The merge is a sweep over per-source heads kept in a map ordered by
//! `(current start address, source index)`:
//!
//! 1. the winner is the head with the lowest start, newest source on ties;
//! 2. its emission is clipped where a newer head begins;
//! 3. older heads shadowed by the emitted range are advanced past it;
//! 4. the emitted slice is coalesced with the previous one when possible.

use std::collections::BTreeMap;
use std::io::Read;

use uuid::Uuid;
use walship_core::codec::CodecKind;
use walship_core::LOGICAL_BLOCK_SIZE;

use crate::error::{FormatError, Result};
use crate::meta::{merge_diff, MetaDiff};
use crate::wdiff::{DiffReader, DiffRecord, DiffRecordKind, RecIo};

struct Head {
    rec_io: RecIo,
    off_lb: u32,
}

impl Head {
    fn start(&self) -> u64 {
        self.rec_io.rec.io_address + self.off_lb as u64
    }

    fn end(&self) -> u64 {
        self.rec_io.rec.end_lb()
    }

    fn is_empty(&self) -> bool {
        self.start() >= self.end()
    }

    fn advance_to(&mut self, addr: u64) {
        debug_assert!(addr >= self.start() && addr <= self.end());
        self.off_lb = (addr - self.rec_io.rec.io_address) as u32;
    }

    /// The next `len_lb` blocks of this head as an output record.
    fn slice(&self, len_lb: u32) -> RecIo {
        let rec = self.rec_io.rec;
        let data = if rec.has_payload() {
            let start = self.off_lb as usize * LOGICAL_BLOCK_SIZE;
            let end = start + len_lb as usize * LOGICAL_BLOCK_SIZE;
            self.rec_io.data[start..end].to_vec()
        } else {
            Vec::new()
        };
        RecIo {
            rec: DiffRecord {
                io_address: self.start(),
                io_blocks: len_lb,
                kind: rec.kind,
                codec: CodecKind::AsIs,
                data_offset: 0,
                data_size: data.len() as u32,
                checksum: 0,
            },
            data,
        }
    }
}

/// K-way merger over wdiff readers ordered oldest to newest.
pub struct DiffMerger<R: Read> {
    sources: Vec<DiffReader<R>>,
    metas: Vec<MetaDiff>,
    heads: BTreeMap<(u64, usize), Head>,
    pending: Option<(RecIo, usize)>,
    uuid: Option<Uuid>,
    max_io_blocks: u32,
    validate_uuid: bool,
    prepared: bool,
}

impl<R: Read> DiffMerger<R> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            metas: Vec::new(),
            heads: BTreeMap::new(),
            pending: None,
            uuid: None,
            max_io_blocks: 0,
            validate_uuid: true,
            prepared: false,
        }
    }

    pub fn set_validate_uuid(&mut self, validate: bool) {
        self.validate_uuid = validate;
    }

    /// Add the next source. Sources must be added oldest first and each
    /// diff's begin snapshot must equal the previous diff's end snapshot;
    /// a dirty boundary shows up as a gap and is refused.
    pub fn add_source(&mut self, reader: DiffReader<R>, meta: MetaDiff) -> Result<()> {
        assert!(!self.prepared, "source added after prepare");
        if let Some(prev) = self.metas.last() {
            if prev.snap_e != meta.snap_b {
                return Err(FormatError::NotMergeable(format!(
                    "diff chain broken: {prev} then {meta}"
                )));
            }
        }
        let header = reader.header();
        if self.validate_uuid {
            match self.uuid {
                None => self.uuid = Some(header.uuid),
                Some(uuid) if uuid == header.uuid => {}
                Some(uuid) => {
                    return Err(FormatError::NotMergeable(format!(
                        "uuid mismatch: {uuid} vs {}",
                        header.uuid
                    )));
                }
            }
        } else if self.uuid.is_none() {
            self.uuid = Some(header.uuid);
        }
        self.max_io_blocks = self.max_io_blocks.max(header.max_io_blocks);
        self.sources.push(reader);
        self.metas.push(meta);
        Ok(())
    }

    /// Load the first head of every source. Must be called once before
    /// [`DiffMerger::pop`].
    pub fn prepare(&mut self) -> Result<()> {
        assert!(!self.prepared, "prepare called twice");
        self.prepared = true;
        for src in 0..self.sources.len() {
            self.refill(src)?;
        }
        Ok(())
    }

    /// Metadata of the merged composite diff.
    pub fn merged_meta(&self) -> Result<MetaDiff> {
        let first = self
            .metas
            .first()
            .ok_or_else(|| FormatError::InvalidArgument("merger has no sources".into()))?;
        let mut out = *first;
        for meta in &self.metas[1..] {
            out = merge_diff(&out, &MetaDiff {
                is_mergeable: true,
                ..*meta
            });
        }
        out.is_comp_diff = self.metas.len() > 1;
        Ok(out)
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn max_io_blocks(&self) -> u32 {
        self.max_io_blocks
    }

    fn refill(&mut self, src: usize) -> Result<()> {
        if let Some(rec_io) = self.sources[src].next_rec_io()? {
            self.heads
                .insert((rec_io.rec.io_address, src), Head { rec_io, off_lb: 0 });
        }
        Ok(())
    }

    /// Next merged record, or `None` when every source is drained.
    pub fn pop(&mut self) -> Result<Option<RecIo>> {
        assert!(self.prepared, "pop before prepare");
        loop {
            if self.heads.is_empty() {
                return Ok(self.pending.take().map(|(rec_io, _)| rec_io));
            }

            let start = self.heads.keys().next().unwrap().0;
            let winner_key = *self
                .heads
                .range((start, 0)..=(start, usize::MAX))
                .next_back()
                .unwrap()
                .0;
            let winner_src = winner_key.1;
            let winner_end = self.heads[&winner_key].end();

            // Clip the emission where a newer source takes over.
            let mut emit_end = winner_end;
            for (&(s, src), _) in self.heads.iter() {
                if s >= emit_end {
                    break;
                }
                if src > winner_src && s > start {
                    emit_end = emit_end.min(s);
                }
            }

            // Older heads shadowed by [start, emit_end) lose that range.
            let shadowed: Vec<(u64, usize)> = self
                .heads
                .iter()
                .take_while(|(&(s, _), _)| s < emit_end)
                .filter(|(&key, _)| key != winner_key && key.1 < winner_src)
                .map(|(&key, _)| key)
                .collect();
            for key in shadowed {
                let mut head = self.heads.remove(&key).unwrap();
                let new_start = emit_end.min(head.end());
                head.advance_to(new_start);
                if head.is_empty() {
                    self.refill(key.1)?;
                } else {
                    self.heads.insert((new_start, key.1), head);
                }
            }

            // Emit the winner's slice.
            let mut winner = self.heads.remove(&winner_key).unwrap();
            let len_lb = (emit_end - start) as u32;
            let slice = winner.slice(len_lb);
            winner.advance_to(emit_end);
            if winner.is_empty() {
                self.refill(winner_src)?;
            } else {
                self.heads.insert((emit_end, winner_src), winner);
            }

            // Coalesce with the previous slice when possible.
            match self.pending.take() {
                None => {
                    self.pending = Some((slice, winner_src));
                }
                Some((mut prev, prev_src)) => {
                    let contiguous = prev_src == winner_src
                        && prev.rec.end_lb() == slice.rec.io_address
                        && prev.rec.kind == slice.rec.kind
                        && prev.rec.io_blocks + slice.rec.io_blocks <= self.max_io_blocks;
                    if contiguous {
                        prev.rec.io_blocks += slice.rec.io_blocks;
                        prev.rec.data_size += slice.rec.data_size;
                        prev.data.extend_from_slice(&slice.data);
                        self.pending = Some((prev, prev_src));
                    } else {
                        self.pending = Some((slice, winner_src));
                        return Ok(Some(prev));
                    }
                }
            }
        }
    }
}

impl<R: Read> Default for DiffMerger<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaSnap;
    use crate::wdiff::{DiffFileHeader, DiffWriter};
    use std::io::Cursor;

    const SALT: u32 = 0x5a17;

    fn build_wdiff(uuid: Uuid, recs: &[(DiffRecordKind, u64, u32, u8)]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = DiffWriter::new(&mut buf);
        w.write_header(&DiffFileHeader::new(uuid, 1 << 16, SALT)).unwrap();
        for &(kind, addr, blocks, seed) in recs {
            let data = if kind == DiffRecordKind::Normal {
                vec![seed; blocks as usize * LOGICAL_BLOCK_SIZE]
            } else {
                Vec::new()
            };
            w.push(kind, addr, blocks, CodecKind::AsIs, &data).unwrap();
        }
        w.close().unwrap();
        drop(w);
        buf
    }

    fn merger_over(files: Vec<Vec<u8>>) -> DiffMerger<Cursor<Vec<u8>>> {
        let mut merger = DiffMerger::new();
        for (i, bytes) in files.into_iter().enumerate() {
            let reader = DiffReader::new(Cursor::new(bytes)).unwrap();
            let meta = MetaDiff::clean_step(i as u64, i as u64 + 1)
                .unwrap()
                .with_mergeable(i > 0);
            merger.add_source(reader, meta).unwrap();
        }
        merger.prepare().unwrap();
        merger
    }

    fn drain(merger: &mut DiffMerger<Cursor<Vec<u8>>>) -> Vec<RecIo> {
        let mut out = Vec::new();
        while let Some(rec_io) = merger.pop().unwrap() {
            out.push(rec_io);
        }
        out
    }

    /// Apply records to a byte image, newest last.
    fn apply_to(image: &mut [u8], recs: &[RecIo]) {
        for r in recs {
            let start = r.rec.io_address as usize * LOGICAL_BLOCK_SIZE;
            let len = r.rec.io_blocks as usize * LOGICAL_BLOCK_SIZE;
            match r.rec.kind {
                DiffRecordKind::Normal => image[start..start + len].copy_from_slice(&r.data),
                DiffRecordKind::AllZero | DiffRecordKind::Discard => {
                    image[start..start + len].fill(0)
                }
            }
        }
    }

    #[test]
    fn test_disjoint_sources_union() {
        let uuid = Uuid::new_v4();
        let a = build_wdiff(uuid, &[(DiffRecordKind::Normal, 0, 4, 1)]);
        let b = build_wdiff(uuid, &[(DiffRecordKind::Normal, 10, 4, 2)]);
        let mut merger = merger_over(vec![a, b]);
        let out = drain(&mut merger);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].rec.io_address, 0);
        assert_eq!(out[1].rec.io_address, 10);
    }

    #[test]
    fn test_newer_shadows_overlap() {
        let uuid = Uuid::new_v4();
        let older = build_wdiff(uuid, &[(DiffRecordKind::Normal, 0, 10, 1)]);
        let newer = build_wdiff(uuid, &[(DiffRecordKind::Normal, 4, 2, 2)]);
        let mut merger = merger_over(vec![older, newer]);
        let out = drain(&mut merger);

        assert_eq!(out.len(), 3);
        assert_eq!((out[0].rec.io_address, out[0].rec.io_blocks), (0, 4));
        assert_eq!(out[0].data[0], 1);
        assert_eq!((out[1].rec.io_address, out[1].rec.io_blocks), (4, 2));
        assert_eq!(out[1].data[0], 2);
        assert_eq!((out[2].rec.io_address, out[2].rec.io_blocks), (6, 4));
        assert_eq!(out[2].data[0], 1);
    }

    #[test]
    fn test_equal_address_newest_wins() {
        let uuid = Uuid::new_v4();
        let older = build_wdiff(uuid, &[(DiffRecordKind::Normal, 8, 4, 1)]);
        let newer = build_wdiff(uuid, &[(DiffRecordKind::Normal, 8, 4, 2)]);
        let mut merger = merger_over(vec![older, newer]);
        let out = drain(&mut merger);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data[0], 2);
    }

    #[test]
    fn test_all_zero_shadows_normal() {
        let uuid = Uuid::new_v4();
        let older = build_wdiff(uuid, &[(DiffRecordKind::Normal, 0, 8, 9)]);
        let newer = build_wdiff(uuid, &[(DiffRecordKind::AllZero, 2, 2, 0)]);
        let mut merger = merger_over(vec![older, newer]);
        let out = drain(&mut merger);

        let mut image = vec![0xffu8; 8 * LOGICAL_BLOCK_SIZE];
        apply_to(&mut image, &out);
        assert_eq!(image[0], 9);
        assert_eq!(image[2 * LOGICAL_BLOCK_SIZE], 0);
        assert_eq!(image[4 * LOGICAL_BLOCK_SIZE], 9);
    }

    #[test]
    fn test_contiguous_same_source_coalesces() {
        let uuid = Uuid::new_v4();
        let a = build_wdiff(
            uuid,
            &[
                (DiffRecordKind::Normal, 0, 4, 1),
                (DiffRecordKind::Normal, 4, 4, 1),
            ],
        );
        let mut merger = merger_over(vec![a]);
        let out = drain(&mut merger);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rec.io_blocks, 8);
        assert_eq!(out[0].data.len(), 8 * LOGICAL_BLOCK_SIZE);
    }

    #[test]
    fn test_chain_gap_refused() {
        let uuid = Uuid::new_v4();
        let a = build_wdiff(uuid, &[(DiffRecordKind::Normal, 0, 1, 1)]);
        let b = build_wdiff(uuid, &[(DiffRecordKind::Normal, 1, 1, 2)]);
        let mut merger = DiffMerger::new();
        merger
            .add_source(
                DiffReader::new(Cursor::new(a)).unwrap(),
                MetaDiff::clean_step(0, 1).unwrap(),
            )
            .unwrap();
        let err = merger.add_source(
            DiffReader::new(Cursor::new(b)).unwrap(),
            MetaDiff::clean_step(2, 3).unwrap(),
        );
        assert!(matches!(err, Err(FormatError::NotMergeable(_))));
    }

    #[test]
    fn test_uuid_mismatch_refused() {
        let a = build_wdiff(Uuid::new_v4(), &[(DiffRecordKind::Normal, 0, 1, 1)]);
        let b = build_wdiff(Uuid::new_v4(), &[(DiffRecordKind::Normal, 1, 1, 2)]);
        let mut merger = DiffMerger::new();
        merger
            .add_source(
                DiffReader::new(Cursor::new(a)).unwrap(),
                MetaDiff::clean_step(0, 1).unwrap(),
            )
            .unwrap();
        let err = merger.add_source(
            DiffReader::new(Cursor::new(b)).unwrap(),
            MetaDiff::clean_step(1, 2).unwrap(),
        );
        assert!(matches!(err, Err(FormatError::NotMergeable(_))));
    }

    #[test]
    fn test_merged_meta() {
        let uuid = Uuid::new_v4();
        let a = build_wdiff(uuid, &[(DiffRecordKind::Normal, 0, 1, 1)]);
        let b = build_wdiff(uuid, &[(DiffRecordKind::Normal, 1, 1, 2)]);
        let merger = merger_over(vec![a, b]);
        let meta = merger.merged_meta().unwrap();
        assert_eq!(meta.snap_b, MetaSnap::clean(0));
        assert_eq!(meta.snap_e, MetaSnap::clean(2));
        assert!(meta.is_comp_diff);
    }

    #[test]
    fn test_merge_then_apply_equals_sequential_apply() {
        // Merging adjacent diffs and applying the result must equal applying
        // the originals in order, byte for byte.
        let uuid = Uuid::new_v4();
        let d1 = [
            (DiffRecordKind::Normal, 0u64, 8u32, 0x11u8),
            (DiffRecordKind::Normal, 20, 4, 0x12),
            (DiffRecordKind::AllZero, 40, 4, 0),
        ];
        let d2 = [
            (DiffRecordKind::Normal, 4, 8, 0x21),
            (DiffRecordKind::Discard, 22, 2, 0),
            (DiffRecordKind::Normal, 60, 2, 0x22),
        ];
        let f1 = build_wdiff(uuid, &d1);
        let f2 = build_wdiff(uuid, &d2);

        // Sequential application of the originals.
        let blocks = 64usize;
        let mut seq = vec![0x77u8; blocks * LOGICAL_BLOCK_SIZE];
        for file in [&f1, &f2] {
            let mut r = DiffReader::new(Cursor::new(file.clone())).unwrap();
            let mut recs = Vec::new();
            while let Some(rec_io) = r.next_rec_io().unwrap() {
                recs.push(rec_io);
            }
            apply_to(&mut seq, &recs);
        }

        // Application of the merged stream.
        let mut merged = vec![0x77u8; blocks * LOGICAL_BLOCK_SIZE];
        let mut merger = merger_over(vec![f1, f2]);
        let out = drain(&mut merger);
        apply_to(&mut merged, &out);

        assert_eq!(seq, merged);

        // And the merged stream is sorted and non-overlapping.
        let mut prev_end = 0;
        for r in &out {
            assert!(r.rec.io_address >= prev_end);
            prev_end = r.rec.end_lb();
        }
    }
}
