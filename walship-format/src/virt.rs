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

//! Virtual full image: a base image overlaid by an ordered diff stream.
//!
//! The reader exposes one sequential, non-restartable byte stream equal to
//! the base with every merged diff record applied on top. Restore and
//! hash-sync read through this.

use std::io::{Read, Seek, SeekFrom, Write};

use walship_core::LOGICAL_BLOCK_SIZE;

use crate::error::{FormatError, Result};
use crate::merge::DiffMerger;
use crate::wdiff::{DiffRecordKind, RecIo};

/// Base image access: sequential reads plus the ability to skip forward.
/// Seekable bases skip with `lseek`; stream bases drain into a scratch
/// buffer.
pub trait BaseRead {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn skip(&mut self, bytes: u64) -> std::io::Result<()>;
}

/// Base backed by anything seekable (a file or block device).
pub struct SeekableBase<T: Read + Seek> {
    inner: T,
}

impl<T: Read + Seek> SeekableBase<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T: Read + Seek> BaseRead for SeekableBase<T> {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }

    fn skip(&mut self, bytes: u64) -> std::io::Result<()> {
        self.inner.seek(SeekFrom::Current(bytes as i64))?;
        Ok(())
    }
}

/// Base backed by a forward-only stream.
pub struct StreamBase<T: Read> {
    inner: T,
    scratch: Vec<u8>,
}

impl<T: Read> StreamBase<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            scratch: vec![0u8; 64 * LOGICAL_BLOCK_SIZE],
        }
    }
}

impl<T: Read> BaseRead for StreamBase<T> {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }

    fn skip(&mut self, mut bytes: u64) -> std::io::Result<()> {
        while bytes > 0 {
            let n = (self.scratch.len() as u64).min(bytes) as usize;
            self.inner.read_exact(&mut self.scratch[..n])?;
            bytes -= n as u64;
        }
        Ok(())
    }
}

/// The virtual full image reader.
pub struct VirtualFullReader<B: BaseRead, R: Read> {
    base: B,
    merger: Option<DiffMerger<R>>,
    /// Next logical block to emit.
    addr_lb: u64,
    cur: Option<RecIo>,
    /// Block offset into the current overlay IO.
    off_in_io: u32,
    diffs_done: bool,
}

impl<B: BaseRead, R: Read> VirtualFullReader<B, R> {
    /// `merger` must already be prepared; pass `None` for a bare base read.
    pub fn new(base: B, merger: Option<DiffMerger<R>>) -> Self {
        let diffs_done = merger.is_none();
        Self {
            base,
            merger,
            addr_lb: 0,
            cur: None,
            off_in_io: 0,
            diffs_done,
        }
    }

    fn fill_diff_io(&mut self) -> Result<()> {
        if self.diffs_done {
            return Ok(());
        }
        let exhausted = match &self.cur {
            Some(rec_io) => self.off_in_io >= rec_io.rec.io_blocks,
            None => true,
        };
        if exhausted {
            self.off_in_io = 0;
            self.cur = self.merger.as_mut().unwrap().pop()?;
            if self.cur.is_none() {
                self.diffs_done = true;
            }
        }
        Ok(())
    }

    /// Copy up to `blks` blocks from the base; a mid-block EOF is an error.
    fn read_base(&mut self, buf: &mut [u8], blks: u64) -> Result<usize> {
        let want = blks as usize * LOGICAL_BLOCK_SIZE;
        let mut done = 0;
        while done < want {
            let n = self.base.read_some(&mut buf[done..want])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        if done % LOGICAL_BLOCK_SIZE != 0 {
            return Err(FormatError::BaseNotAligned);
        }
        self.addr_lb += (done / LOGICAL_BLOCK_SIZE) as u64;
        Ok(done)
    }

    /// Emit up to `blks` blocks from the current overlay IO and skip the
    /// same range on the base.
    fn read_overlay(&mut self, buf: &mut [u8], blks: u32) -> Result<usize> {
        let rec_io = self.cur.as_ref().unwrap();
        let bytes = blks as usize * LOGICAL_BLOCK_SIZE;
        match rec_io.rec.kind {
            DiffRecordKind::Normal => {
                let start = self.off_in_io as usize * LOGICAL_BLOCK_SIZE;
                buf[..bytes].copy_from_slice(&rec_io.data[start..start + bytes]);
            }
            DiffRecordKind::AllZero | DiffRecordKind::Discard => {
                buf[..bytes].fill(0);
            }
        }
        self.off_in_io += blks;
        self.base.skip(bytes as u64)?;
        self.addr_lb += blks as u64;
        Ok(bytes)
    }

    /// Read up to `buf.len()` bytes (a multiple of the logical block size);
    /// returns 0 at the end of the stream.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || buf.len() % LOGICAL_BLOCK_SIZE != 0 {
            return Err(FormatError::InvalidArgument(
                "read size must be a positive multiple of the logical block size".into(),
            ));
        }
        let blks = (buf.len() / LOGICAL_BLOCK_SIZE) as u64;

        self.fill_diff_io()?;
        if self.diffs_done {
            return self.read_base(buf, blks);
        }

        let rec_io = self.cur.as_ref().unwrap();
        let diff_addr = rec_io.rec.io_address + self.off_in_io as u64;
        debug_assert!(self.addr_lb <= diff_addr);
        if self.addr_lb == diff_addr {
            let remaining = rec_io.rec.io_blocks - self.off_in_io;
            let n = (blks as u32).min(remaining);
            self.read_overlay(buf, n)
        } else {
            let n = blks.min(diff_addr - self.addr_lb);
            self.read_base(buf, n)
        }
    }

    /// Fill `buf` exactly; errors if the stream ends first.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_some(&mut buf[done..])?;
            if n == 0 {
                return Err(FormatError::InvalidArgument(
                    "virtual full image ended early".into(),
                ));
            }
            done += n;
        }
        Ok(())
    }

    /// Stream the whole image into `out` using `buf_blocks`-sized reads.
    pub fn write_all_to<W: Write>(&mut self, out: &mut W, buf_blocks: usize) -> Result<u64> {
        let mut buf = vec![0u8; buf_blocks * LOGICAL_BLOCK_SIZE];
        let mut total = 0u64;
        loop {
            let n = self.read_some(&mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaDiff;
    use crate::wdiff::{DiffFileHeader, DiffReader, DiffWriter};
    use std::io::Cursor;
    use uuid::Uuid;
    use walship_core::codec::CodecKind;

    fn wdiff_bytes(recs: &[(DiffRecordKind, u64, u32, u8)]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = DiffWriter::new(&mut buf);
        w.write_header(&DiffFileHeader::new(Uuid::nil(), 1 << 16, 0))
            .unwrap();
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

    fn reader_over(
        base: Vec<u8>,
        diffs: Vec<Vec<u8>>,
    ) -> VirtualFullReader<SeekableBase<Cursor<Vec<u8>>>, Cursor<Vec<u8>>> {
        let merger = if diffs.is_empty() {
            None
        } else {
            let mut m = DiffMerger::new();
            for (i, bytes) in diffs.into_iter().enumerate() {
                m.add_source(
                    DiffReader::new(Cursor::new(bytes)).unwrap(),
                    MetaDiff::clean_step(i as u64, i as u64 + 1)
                        .unwrap()
                        .with_mergeable(i > 0),
                )
                .unwrap();
            }
            m.prepare().unwrap();
            Some(m)
        };
        VirtualFullReader::new(SeekableBase::new(Cursor::new(base)), merger)
    }

    fn drain_all<B: BaseRead, R: Read>(r: &mut VirtualFullReader<B, R>) -> Vec<u8> {
        let mut out = Vec::new();
        r.write_all_to(&mut out, 7).unwrap();
        out
    }

    fn base_of(blocks: usize, fill: u8) -> Vec<u8> {
        vec![fill; blocks * LOGICAL_BLOCK_SIZE]
    }

    #[test]
    fn test_empty_diff_list_equals_base() {
        let base = base_of(16, 0x42);
        let mut r = reader_over(base.clone(), vec![]);
        assert_eq!(drain_all(&mut r), base);
    }

    #[test]
    fn test_normal_and_all_zero_overlay() {
        // One normal record of 8 blocks at 100, one all-zero of 4 at 200,
        // over a zeroed base: [100,108) is payload, [200,204) zero, rest zero.
        let base = base_of(512, 0);
        let diff = wdiff_bytes(&[
            (DiffRecordKind::Normal, 100, 8, 0xab),
            (DiffRecordKind::AllZero, 200, 4, 0),
        ]);
        let mut r = reader_over(base, vec![diff]);
        let out = drain_all(&mut r);
        assert_eq!(out.len(), 512 * LOGICAL_BLOCK_SIZE);
        for (i, chunk) in out.chunks(LOGICAL_BLOCK_SIZE).enumerate() {
            let expected = if (100..108).contains(&i) { 0xab } else { 0 };
            assert!(
                chunk.iter().all(|&b| b == expected),
                "block {i} expected {expected:#x}"
            );
        }
    }

    #[test]
    fn test_all_zero_overwrites_base_content() {
        let base = base_of(32, 0x99);
        let diff = wdiff_bytes(&[(DiffRecordKind::AllZero, 8, 4, 0)]);
        let mut r = reader_over(base, vec![diff]);
        let out = drain_all(&mut r);
        for (i, chunk) in out.chunks(LOGICAL_BLOCK_SIZE).enumerate() {
            let expected = if (8..12).contains(&i) { 0 } else { 0x99 };
            assert!(chunk.iter().all(|&b| b == expected), "block {i}");
        }
    }

    #[test]
    fn test_two_diffs_overlay_in_order() {
        let base = base_of(64, 0);
        let d1 = wdiff_bytes(&[(DiffRecordKind::Normal, 0, 16, 0x11)]);
        let d2 = wdiff_bytes(&[(DiffRecordKind::Normal, 8, 4, 0x22)]);
        let mut r = reader_over(base, vec![d1, d2]);
        let out = drain_all(&mut r);
        for (i, chunk) in out.chunks(LOGICAL_BLOCK_SIZE).enumerate() {
            let expected = match i {
                0..=7 => 0x11,
                8..=11 => 0x22,
                12..=15 => 0x11,
                _ => 0,
            };
            assert!(chunk.iter().all(|&b| b == expected), "block {i}");
        }
    }

    #[test]
    fn test_stream_base_matches_seekable() {
        let base = base_of(128, 0x05);
        let diff = wdiff_bytes(&[
            (DiffRecordKind::Normal, 3, 5, 0x66),
            (DiffRecordKind::Discard, 50, 7, 0),
        ]);

        let mut seekable = reader_over(base.clone(), vec![diff.clone()]);
        let expected = drain_all(&mut seekable);

        let mut m = DiffMerger::new();
        m.add_source(
            DiffReader::new(Cursor::new(diff)).unwrap(),
            MetaDiff::clean_step(0, 1).unwrap(),
        )
        .unwrap();
        m.prepare().unwrap();
        let mut streamed =
            VirtualFullReader::new(StreamBase::new(Cursor::new(base)), Some(m));
        assert_eq!(drain_all(&mut streamed), expected);
    }

    #[test]
    fn test_unaligned_base_rejected() {
        let mut base = base_of(4, 1);
        base.truncate(4 * LOGICAL_BLOCK_SIZE - 100);
        let mut r = reader_over(base, vec![]);
        let mut out = Vec::new();
        let err = r.write_all_to(&mut out, 4);
        assert!(matches!(err, Err(FormatError::BaseNotAligned)));
    }

    #[test]
    fn test_bad_read_size_rejected() {
        let mut r = reader_over(base_of(4, 0), vec![]);
        let mut buf = [0u8; 100];
        assert!(r.read_some(&mut buf).is_err());
    }
}
