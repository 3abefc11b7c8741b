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

//! The wdiff file layout.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ File header (40 bytes):                                  │
//! │   magic, version, max_io_blocks, salt, uuid, checksum    │
//! ├──────────────────────────────────────────────────────────┤
//! │ Pack 0: record table (checksummed) + payload             │
//! ├──────────────────────────────────────────────────────────┤
//! │ Pack 1: ...                                              │
//! ├──────────────────────────────────────────────────────────┤
//! │ End pack: zero records                                   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Records within a pack are sorted by `io_address` and do not overlap; each
//! normal record's payload is compressed with a per-record codec and
//! checksummed over the file's salt.

use std::io::{BufReader, BufWriter, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;
use walship_core::codec::{self, CodecKind};
use walship_core::{checksum, LOGICAL_BLOCK_SIZE};

use crate::error::{FormatError, Result};

const DIFF_MAGIC: [u8; 8] = *b"WSHPDIFF";
const DIFF_VERSION: u32 = 1;

/// File header size in bytes.
pub const DIFF_HEADER_SIZE: usize = 40;

/// Record entry size in a pack's record table.
pub const DIFF_RECORD_SIZE: usize = 32;

/// Pack table prefix: record count + payload size + table checksum.
pub const DIFF_PACK_PREFIX_SIZE: usize = 12;

/// Default compressed-payload threshold that flushes a pack.
pub const DEFAULT_PACK_SIZE: usize = 1 << 20;

/// Default upper bound for a single IO [logical blocks].
pub const DEFAULT_MAX_IO_BLOCKS: u32 = 65535;

/// wdiff file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffFileHeader {
    pub uuid: Uuid,
    pub max_io_blocks: u32,
    pub salt: u32,
}

impl DiffFileHeader {
    pub fn new(uuid: Uuid, max_io_blocks: u32, salt: u32) -> Self {
        Self {
            uuid,
            max_io_blocks,
            salt,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DIFF_HEADER_SIZE);
        buf.extend_from_slice(&DIFF_MAGIC);
        buf.write_u32::<LittleEndian>(DIFF_VERSION).unwrap();
        buf.write_u32::<LittleEndian>(self.max_io_blocks).unwrap();
        buf.write_u32::<LittleEndian>(self.salt).unwrap();
        buf.extend_from_slice(self.uuid.as_bytes());
        let crc = checksum(&buf, 0);
        buf.write_u32::<LittleEndian>(crc).unwrap();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < DIFF_HEADER_SIZE {
            return Err(FormatError::CorruptDiff("file header too short".into()));
        }
        if data[..8] != DIFF_MAGIC {
            return Err(FormatError::CorruptDiff("file header magic mismatch".into()));
        }
        let stored = u32::from_le_bytes(data[36..40].try_into().unwrap());
        if checksum(&data[..36], 0) != stored {
            return Err(FormatError::CorruptDiff("file header checksum mismatch".into()));
        }
        let mut r = &data[8..];
        let version = r.read_u32::<LittleEndian>()?;
        if version != DIFF_VERSION {
            return Err(FormatError::CorruptDiff(format!(
                "unsupported wdiff version {version}"
            )));
        }
        let max_io_blocks = r.read_u32::<LittleEndian>()?;
        let salt = r.read_u32::<LittleEndian>()?;
        let mut uuid_bytes = [0u8; 16];
        r.read_exact(&mut uuid_bytes)?;
        Ok(Self {
            uuid: Uuid::from_bytes(uuid_bytes),
            max_io_blocks,
            salt,
        })
    }
}

/// What a diff record describes. Only `Normal` records carry payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffRecordKind {
    #[default]
    Normal = 0,
    AllZero = 1,
    Discard = 2,
}

impl DiffRecordKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DiffRecordKind::Normal),
            1 => Some(DiffRecordKind::AllZero),
            2 => Some(DiffRecordKind::Discard),
            _ => None,
        }
    }
}

/// One record in a pack's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffRecord {
    pub io_address: u64,
    pub io_blocks: u32,
    pub kind: DiffRecordKind,
    pub codec: CodecKind,
    /// Offset of the compressed payload within the pack's payload area.
    pub data_offset: u32,
    /// Compressed payload size; zero for all-zero and discard records.
    pub data_size: u32,
    /// Salted checksum of the compressed payload; zero when no payload.
    pub checksum: u32,
}

impl DiffRecord {
    pub fn end_lb(&self) -> u64 {
        self.io_address + self.io_blocks as u64
    }

    pub fn has_payload(&self) -> bool {
        self.kind == DiffRecordKind::Normal
    }

    pub fn uncompressed_size(&self) -> usize {
        self.io_blocks as usize * LOGICAL_BLOCK_SIZE
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<LittleEndian>(self.io_address).unwrap();
        buf.write_u32::<LittleEndian>(self.io_blocks).unwrap();
        buf.write_u8(self.kind as u8).unwrap();
        buf.write_u8(self.codec as u8).unwrap();
        buf.extend_from_slice(&[0u8; 2]);
        buf.write_u32::<LittleEndian>(self.data_offset).unwrap();
        buf.write_u32::<LittleEndian>(self.data_size).unwrap();
        buf.write_u32::<LittleEndian>(self.checksum).unwrap();
        buf.extend_from_slice(&[0u8; 4]);
    }

    fn decode_from(mut r: &[u8]) -> Result<Self> {
        let io_address = r.read_u64::<LittleEndian>()?;
        let io_blocks = r.read_u32::<LittleEndian>()?;
        let kind = DiffRecordKind::from_u8(r.read_u8()?)
            .ok_or_else(|| FormatError::CorruptDiff("bad record kind".into()))?;
        let codec = CodecKind::from_u8(r.read_u8()?)
            .ok_or_else(|| FormatError::CorruptDiff("bad record codec".into()))?;
        let mut pad = [0u8; 2];
        r.read_exact(&mut pad)?;
        let data_offset = r.read_u32::<LittleEndian>()?;
        let data_size = r.read_u32::<LittleEndian>()?;
        let csum = r.read_u32::<LittleEndian>()?;
        if kind != DiffRecordKind::Normal && data_size != 0 {
            return Err(FormatError::CorruptDiff(
                "non-normal record with payload".into(),
            ));
        }
        if io_blocks == 0 {
            return Err(FormatError::CorruptDiff("record with zero blocks".into()));
        }
        Ok(Self {
            io_address,
            io_blocks,
            kind,
            codec,
            data_offset,
            data_size,
            checksum: csum,
        })
    }
}

/// A pack's record table.
#[derive(Debug, Clone, Default)]
pub struct DiffPack {
    pub records: Vec<DiffRecord>,
    pub total_data_size: u32,
}

impl DiffPack {
    pub fn is_end(&self) -> bool {
        self.records.is_empty()
    }

    pub fn encode(&self, salt: u32) -> Vec<u8> {
        let mut table = Vec::with_capacity(self.records.len() * DIFF_RECORD_SIZE);
        for rec in &self.records {
            rec.encode_into(&mut table);
        }
        let mut buf = Vec::with_capacity(DIFF_PACK_PREFIX_SIZE + table.len());
        buf.write_u32::<LittleEndian>(self.records.len() as u32)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.total_data_size).unwrap();
        buf.write_u32::<LittleEndian>(checksum(&table, salt)).unwrap();
        buf.extend_from_slice(&table);
        buf
    }

    pub fn decode<R: Read>(r: &mut R, salt: u32) -> Result<Self> {
        let n_records = r.read_u32::<LittleEndian>()? as usize;
        let total_data_size = r.read_u32::<LittleEndian>()?;
        let stored = r.read_u32::<LittleEndian>()?;
        let mut table = vec![0u8; n_records * DIFF_RECORD_SIZE];
        r.read_exact(&mut table)?;
        if checksum(&table, salt) != stored {
            return Err(FormatError::CorruptDiff("pack table checksum mismatch".into()));
        }
        let mut records = Vec::with_capacity(n_records);
        for i in 0..n_records {
            let off = i * DIFF_RECORD_SIZE;
            records.push(DiffRecord::decode_from(&table[off..off + DIFF_RECORD_SIZE])?);
        }
        let pack = Self {
            records,
            total_data_size,
        };
        pack.verify_structure()?;
        Ok(pack)
    }

    /// Sortedness and non-overlap within the pack, and payload accounting.
    fn verify_structure(&self) -> Result<()> {
        let mut prev_end = 0u64;
        let mut payload = 0u64;
        let mut offset = 0u64;
        for (i, rec) in self.records.iter().enumerate() {
            if i > 0 && rec.io_address < prev_end {
                return Err(FormatError::CorruptDiff(format!(
                    "records overlap at address {}",
                    rec.io_address
                )));
            }
            prev_end = rec.end_lb();
            if rec.has_payload() {
                if rec.data_offset as u64 != offset {
                    return Err(FormatError::CorruptDiff("payload offsets not packed".into()));
                }
                offset += rec.data_size as u64;
                payload += rec.data_size as u64;
            }
        }
        if payload != self.total_data_size as u64 {
            return Err(FormatError::CorruptDiff("payload size accounting mismatch".into()));
        }
        Ok(())
    }
}

/// A record together with its uncompressed payload (empty for all-zero and
/// discard records).
#[derive(Debug, Clone, Default)]
pub struct RecIo {
    pub rec: DiffRecord,
    pub data: Vec<u8>,
}

/// Buffered sequential wdiff writer with atomic pack flushing.
pub struct DiffWriter<W: Write> {
    w: BufWriter<W>,
    salt: u32,
    level: u32,
    records: Vec<DiffRecord>,
    payload: Vec<u8>,
    pack_size: usize,
    header_written: bool,
    closed: bool,
}

impl<W: Write> DiffWriter<W> {
    pub fn new(w: W) -> Self {
        Self::with_pack_size(w, DEFAULT_PACK_SIZE)
    }

    pub fn with_pack_size(w: W, pack_size: usize) -> Self {
        Self {
            w: BufWriter::new(w),
            salt: 0,
            level: 3,
            records: Vec::new(),
            payload: Vec::new(),
            pack_size,
            header_written: false,
            closed: false,
        }
    }

    pub fn set_level(&mut self, level: u32) {
        self.level = level;
    }

    pub fn write_header(&mut self, header: &DiffFileHeader) -> Result<()> {
        assert!(!self.header_written, "header written twice");
        self.salt = header.salt;
        self.w.write_all(&header.encode())?;
        self.header_written = true;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if !self.header_written || self.closed {
            return Err(FormatError::InvalidArgument(
                "diff writer not in writable state".into(),
            ));
        }
        Ok(())
    }

    /// Append a record with uncompressed data, compressing it with `codec`.
    pub fn push(
        &mut self,
        kind: DiffRecordKind,
        io_address: u64,
        io_blocks: u32,
        codec: CodecKind,
        data: &[u8],
    ) -> Result<()> {
        self.check_open()?;
        if io_blocks == 0 {
            return Err(FormatError::InvalidArgument("zero-block diff record".into()));
        }
        if kind == DiffRecordKind::Normal {
            if data.len() != io_blocks as usize * LOGICAL_BLOCK_SIZE {
                return Err(FormatError::InvalidArgument(format!(
                    "payload size {} does not match {} blocks",
                    data.len(),
                    io_blocks
                )));
            }
            let compressed = codec::compress(codec, self.level, data)?;
            let rec = DiffRecord {
                io_address,
                io_blocks,
                kind,
                codec,
                data_offset: 0, // fixed up on append
                data_size: compressed.len() as u32,
                checksum: checksum(&compressed, self.salt),
            };
            self.append(rec, compressed)
        } else {
            let rec = DiffRecord {
                io_address,
                io_blocks,
                kind,
                codec: CodecKind::AsIs,
                data_offset: 0,
                data_size: 0,
                checksum: 0,
            };
            self.append(rec, Vec::new())
        }
    }

    /// Append a record whose payload is already compressed (receive path).
    /// The checksum is verified before the bytes are accepted.
    pub fn push_compressed(&mut self, mut rec: DiffRecord, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if rec.has_payload() {
            if data.len() != rec.data_size as usize {
                return Err(FormatError::CorruptDiff("record payload size mismatch".into()));
            }
            if checksum(data, self.salt) != rec.checksum {
                return Err(FormatError::CorruptDiff("record payload checksum mismatch".into()));
            }
        } else if !data.is_empty() || rec.data_size != 0 {
            return Err(FormatError::CorruptDiff(
                "non-normal record with payload".into(),
            ));
        }
        self.append(rec, data.to_vec())
    }

    fn append(&mut self, mut rec: DiffRecord, data: Vec<u8>) -> Result<()> {
        // Keep the in-pack sorted/non-overlapping invariant: start a fresh
        // pack whenever the new record does not extend the current order.
        if let Some(last) = self.records.last() {
            if rec.io_address < last.end_lb() {
                self.flush_pack()?;
            }
        }
        rec.data_offset = self.payload.len() as u32;
        self.payload.extend_from_slice(&data);
        self.records.push(rec);
        if self.payload.len() >= self.pack_size {
            self.flush_pack()?;
        }
        Ok(())
    }

    /// Write out the current pack, if any.
    pub fn flush_pack(&mut self) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        let pack = DiffPack {
            records: std::mem::take(&mut self.records),
            total_data_size: self.payload.len() as u32,
        };
        self.w.write_all(&pack.encode(self.salt))?;
        self.w.write_all(&self.payload)?;
        self.payload.clear();
        Ok(())
    }

    /// Flush remaining records and write the end pack.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.check_open()?;
        self.flush_pack()?;
        let end = DiffPack::default();
        self.w.write_all(&end.encode(self.salt))?;
        self.w.flush()?;
        self.closed = true;
        Ok(())
    }
}

/// Forward reader yielding `RecIo`s with verified checksums.
pub struct DiffReader<R: Read> {
    r: BufReader<R>,
    header: DiffFileHeader,
    pack: Option<(DiffPack, Vec<u8>)>,
    index: usize,
    finished: bool,
}

impl<R: Read> DiffReader<R> {
    pub fn new(r: R) -> Result<Self> {
        let mut r = BufReader::new(r);
        let mut head = [0u8; DIFF_HEADER_SIZE];
        r.read_exact(&mut head)?;
        let header = DiffFileHeader::decode(&head)?;
        Ok(Self {
            r,
            header,
            pack: None,
            index: 0,
            finished: false,
        })
    }

    pub fn header(&self) -> &DiffFileHeader {
        &self.header
    }

    fn load_pack(&mut self) -> Result<bool> {
        let pack = DiffPack::decode(&mut self.r, self.header.salt)?;
        if pack.is_end() {
            self.finished = true;
            return Ok(false);
        }
        let mut payload = vec![0u8; pack.total_data_size as usize];
        self.r.read_exact(&mut payload)?;
        self.pack = Some((pack, payload));
        self.index = 0;
        Ok(true)
    }

    /// Next record with its uncompressed payload, or `None` at the end pack.
    pub fn next_rec_io(&mut self) -> Result<Option<RecIo>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let in_pack = self
                .pack
                .as_ref()
                .map(|(pack, _)| self.index < pack.records.len())
                .unwrap_or(false);
            if !in_pack {
                self.pack = None;
                if !self.load_pack()? {
                    return Ok(None);
                }
                continue;
            }
            let (pack, payload) = self.pack.as_ref().unwrap();
            let rec = pack.records[self.index];
            self.index += 1;
            let data = if rec.has_payload() {
                let start = rec.data_offset as usize;
                let end = start + rec.data_size as usize;
                let slice = payload
                    .get(start..end)
                    .ok_or_else(|| FormatError::CorruptDiff("payload slice out of range".into()))?;
                if checksum(slice, self.header.salt) != rec.checksum {
                    return Err(FormatError::CorruptDiff(format!(
                        "record checksum mismatch at address {}",
                        rec.io_address
                    )));
                }
                codec::uncompress(rec.codec, slice, rec.uncompressed_size())?
            } else {
                Vec::new()
            };
            return Ok(Some(RecIo { rec, data }));
        }
    }

    /// Next raw pack: table plus compressed payload, checksums verified.
    /// Used by the transfer path, which ships packs without recompressing.
    pub fn next_pack_raw(&mut self) -> Result<Option<(DiffPack, Vec<u8>)>> {
        if self.finished {
            return Ok(None);
        }
        if self.pack.is_none() && !self.load_pack()? {
            return Ok(None);
        }
        let (pack, payload) = self.pack.take().unwrap();
        for rec in &pack.records {
            if rec.has_payload() {
                let start = rec.data_offset as usize;
                let end = start + rec.data_size as usize;
                let slice = payload.get(start..end).ok_or_else(|| {
                    FormatError::CorruptDiff("payload slice out of range".into())
                })?;
                if checksum(slice, self.header.salt) != rec.checksum {
                    return Err(FormatError::CorruptDiff(format!(
                        "record checksum mismatch at address {}",
                        rec.io_address
                    )));
                }
            }
        }
        Ok(Some((pack, payload)))
    }
}

/// Walk a whole file verifying every pack and record checksum.
pub fn verify_file<R: Read>(r: R) -> Result<DiffFileHeader> {
    let mut reader = DiffReader::new(r)?;
    let header = *reader.header();
    while reader.next_rec_io()?.is_some() {}
    Ok(header)
}
