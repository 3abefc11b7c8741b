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

//! WAL device layout: super block, log packs, and the pack iterator.
//!
//! The device is a ring of physical blocks. Block 0 holds the super block;
//! blocks `1..=ring_pb` hold the log ring. An lsid (log sequence id) is a
//! monotonic position measured in physical blocks; its on-device offset is
//! `((lsid % ring_pb) + 1) * pbs`.
//!
//! A log pack is one header block followed by the payload blocks of its
//! records. Record lsids are contiguous within a pack, and the next pack
//! starts at `logpack_lsid + 1 + total_io_size_pb`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use walship_core::block_io::BlockDevice;
use walship_core::{checksum, LOGICAL_BLOCK_SIZE, MAX_PHYSICAL_BLOCK_SIZE};

use crate::error::{FormatError, Result};

const SUPER_MAGIC: [u8; 8] = *b"WSHPSUPR";
const SUPER_VERSION: u16 = 1;
const PACK_MAGIC: u32 = 0x574c_4f47; // "WLOG"

/// On-disk size of one log record entry in the pack header.
const LOG_RECORD_SIZE: usize = 32;

/// Record flags.
pub const LOG_FLAG_EXISTS: u8 = 0;
pub const LOG_FLAG_PADDING: u8 = 1;
pub const LOG_FLAG_DISCARD: u8 = 2;

/// WAL device geometry, stored in physical block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub pbs: u32,
    pub salt: u32,
    /// Ring capacity [physical blocks].
    pub ring_pb: u64,
    /// Oldest lsid still present in the ring.
    pub oldest_lsid: u64,
    /// One past the newest fully written lsid.
    pub written_lsid: u64,
}

impl SuperBlock {
    pub fn new(pbs: u32, salt: u32, ring_pb: u64) -> Result<Self> {
        if !pbs.is_power_of_two()
            || (pbs as usize) < LOGICAL_BLOCK_SIZE
            || pbs as usize > MAX_PHYSICAL_BLOCK_SIZE
        {
            return Err(FormatError::InvalidArgument(format!(
                "bad physical block size {pbs}"
            )));
        }
        if ring_pb == 0 {
            return Err(FormatError::InvalidArgument("ring size must not be zero".into()));
        }
        Ok(Self {
            pbs,
            salt,
            ring_pb,
            oldest_lsid: 0,
            written_lsid: 0,
        })
    }

    /// Byte offset of the block holding `lsid`.
    pub fn offset_of(&self, lsid: u64) -> u64 {
        ((lsid % self.ring_pb) + 1) * self.pbs as u64
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut head = Vec::with_capacity(48);
        head.extend_from_slice(&SUPER_MAGIC);
        head.write_u16::<LittleEndian>(SUPER_VERSION).unwrap();
        head.write_u16::<LittleEndian>(0).unwrap();
        head.write_u32::<LittleEndian>(self.pbs).unwrap();
        head.write_u32::<LittleEndian>(self.salt).unwrap();
        head.write_u64::<LittleEndian>(self.ring_pb).unwrap();
        head.write_u64::<LittleEndian>(self.oldest_lsid).unwrap();
        head.write_u64::<LittleEndian>(self.written_lsid).unwrap();
        let crc = checksum(&head, 0);
        head.write_u32::<LittleEndian>(crc).unwrap();
        head.resize(self.pbs as usize, 0);
        head
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 48 {
            return Err(FormatError::CorruptLog("super block too short".into()));
        }
        if data[..8] != SUPER_MAGIC {
            return Err(FormatError::CorruptLog("super block magic mismatch".into()));
        }
        let stored = u32::from_le_bytes(data[44..48].try_into().unwrap());
        if checksum(&data[..44], 0) != stored {
            return Err(FormatError::CorruptLog("super block checksum mismatch".into()));
        }
        let mut r = &data[8..];
        let version = r.read_u16::<LittleEndian>()?;
        if version != SUPER_VERSION {
            return Err(FormatError::CorruptLog(format!(
                "unsupported super block version {version}"
            )));
        }
        let _pad = r.read_u16::<LittleEndian>()?;
        let pbs = r.read_u32::<LittleEndian>()?;
        let salt = r.read_u32::<LittleEndian>()?;
        let ring_pb = r.read_u64::<LittleEndian>()?;
        let oldest_lsid = r.read_u64::<LittleEndian>()?;
        let written_lsid = r.read_u64::<LittleEndian>()?;
        let mut sb = SuperBlock::new(pbs, salt, ring_pb)?;
        sb.oldest_lsid = oldest_lsid;
        sb.written_lsid = written_lsid;
        Ok(sb)
    }

    /// Read the super block from physical block 0. The block size is not
    /// known yet, so read the minimal prefix first.
    pub fn read_from(dev: &mut BlockDevice) -> Result<Self> {
        let mut head = vec![0u8; LOGICAL_BLOCK_SIZE];
        dev.read_at(0, &mut head)?;
        Self::decode(&head)
    }

    /// Persist the super block to physical block 0.
    pub fn write_to(&self, dev: &mut BlockDevice) -> Result<()> {
        dev.write_at(0, &self.encode())?;
        dev.sync_data()?;
        Ok(())
    }
}

/// One record inside a log pack header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    /// Lsid of the record's first payload block (meaningless for discard).
    pub lsid: u64,
    pub io_address_lb: u64,
    pub io_size_lb: u32,
    pub flags: u8,
    pub checksum: u32,
}

impl LogRecord {
    pub fn is_exists(&self) -> bool {
        self.flags == LOG_FLAG_EXISTS
    }

    pub fn is_padding(&self) -> bool {
        self.flags == LOG_FLAG_PADDING
    }

    pub fn is_discard(&self) -> bool {
        self.flags == LOG_FLAG_DISCARD
    }

    /// Whether the record occupies payload blocks in the ring.
    pub fn has_payload_space(&self) -> bool {
        !self.is_discard()
    }

    /// Whether the record carries checksummed data.
    pub fn has_data(&self) -> bool {
        self.is_exists()
    }

    pub fn io_size_pb(&self, pbs: u32) -> u64 {
        (self.io_size_lb as u64 * LOGICAL_BLOCK_SIZE as u64).div_ceil(pbs as u64)
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<LittleEndian>(self.lsid).unwrap();
        buf.write_u64::<LittleEndian>(self.io_address_lb).unwrap();
        buf.write_u32::<LittleEndian>(self.io_size_lb).unwrap();
        buf.write_u8(self.flags).unwrap();
        buf.extend_from_slice(&[0u8; 3]);
        buf.write_u32::<LittleEndian>(self.checksum).unwrap();
        buf.extend_from_slice(&[0u8; 4]);
    }

    fn decode_from(mut r: &[u8]) -> Result<Self> {
        let lsid = r.read_u64::<LittleEndian>()?;
        let io_address_lb = r.read_u64::<LittleEndian>()?;
        let io_size_lb = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u8()?;
        if flags > LOG_FLAG_DISCARD {
            return Err(FormatError::CorruptLog(format!("bad record flags {flags}")));
        }
        let mut pad = [0u8; 3];
        std::io::Read::read_exact(&mut r, &mut pad)?;
        let csum = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            lsid,
            io_address_lb,
            io_size_lb,
            flags,
            checksum: csum,
        })
    }
}

/// A log pack header: one physical block describing the records whose
/// payload blocks follow it in the ring.
#[derive(Debug, Clone)]
pub struct LogPackHeader {
    pub logpack_lsid: u64,
    pub total_io_size_pb: u64,
    pub records: Vec<LogRecord>,
}

impl LogPackHeader {
    pub fn new(logpack_lsid: u64) -> Self {
        Self {
            logpack_lsid,
            total_io_size_pb: 0,
            records: Vec::new(),
        }
    }

    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    pub fn next_logpack_lsid(&self) -> u64 {
        self.logpack_lsid + 1 + self.total_io_size_pb
    }

    pub fn max_records(pbs: u32) -> usize {
        (pbs as usize - 24) / LOG_RECORD_SIZE
    }

    pub fn encode(&self, pbs: u32, salt: u32) -> Vec<u8> {
        let mut body = Vec::with_capacity(pbs as usize - 8);
        body.write_u64::<LittleEndian>(self.logpack_lsid).unwrap();
        body.write_u16::<LittleEndian>(self.records.len() as u16)
            .unwrap();
        body.extend_from_slice(&[0u8; 2]);
        body.write_u32::<LittleEndian>(self.total_io_size_pb as u32)
            .unwrap();
        for rec in &self.records {
            rec.encode_into(&mut body);
        }
        body.resize(pbs as usize - 8, 0);

        let mut buf = Vec::with_capacity(pbs as usize);
        buf.write_u32::<LittleEndian>(PACK_MAGIC).unwrap();
        buf.write_u32::<LittleEndian>(checksum(&body, salt)).unwrap();
        buf.extend_from_slice(&body);
        buf
    }

    pub fn decode(data: &[u8], pbs: u32, salt: u32) -> Result<Self> {
        if data.len() != pbs as usize {
            return Err(FormatError::CorruptLog("pack header block size mismatch".into()));
        }
        let mut r = &data[..8];
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != PACK_MAGIC {
            return Err(FormatError::CorruptLog("pack header magic mismatch".into()));
        }
        let stored = r.read_u32::<LittleEndian>()?;
        let body = &data[8..];
        if checksum(body, salt) != stored {
            return Err(FormatError::CorruptLog("pack header checksum mismatch".into()));
        }
        let mut r = body;
        let logpack_lsid = r.read_u64::<LittleEndian>()?;
        let n_records = r.read_u16::<LittleEndian>()? as usize;
        let mut pad = [0u8; 2];
        std::io::Read::read_exact(&mut r, &mut pad)?;
        let total_io_size_pb = r.read_u32::<LittleEndian>()? as u64;
        if n_records > Self::max_records(pbs) {
            return Err(FormatError::CorruptLog(format!(
                "record count {n_records} exceeds pack capacity"
            )));
        }
        let mut records = Vec::with_capacity(n_records);
        for i in 0..n_records {
            let off = i * LOG_RECORD_SIZE;
            records.push(LogRecord::decode_from(&r[off..off + LOG_RECORD_SIZE])?);
        }
        let header = Self {
            logpack_lsid,
            total_io_size_pb,
            records,
        };
        header.verify_structure(pbs)?;
        Ok(header)
    }

    /// Structural invariants: payload lsids are contiguous starting right
    /// after the header, and the advertised total matches the records.
    fn verify_structure(&self, pbs: u32) -> Result<()> {
        let mut expected_lsid = self.logpack_lsid + 1;
        let mut total = 0u64;
        for rec in &self.records {
            if rec.has_payload_space() {
                if rec.lsid != expected_lsid {
                    return Err(FormatError::CorruptLog(format!(
                        "record lsid {} not contiguous (expected {})",
                        rec.lsid, expected_lsid
                    )));
                }
                let pb = rec.io_size_pb(pbs);
                expected_lsid += pb;
                total += pb;
            }
        }
        if total != self.total_io_size_pb {
            return Err(FormatError::CorruptLog(format!(
                "total io size mismatch: {} != {}",
                total, self.total_io_size_pb
            )));
        }
        Ok(())
    }
}

/// Payload of one record: exactly `io_size_lb * 512` meaningful bytes, empty
/// for discard and padding records.
#[derive(Debug, Clone, Default)]
pub struct LogPackIo {
    pub data: Vec<u8>,
}

/// Forward iterator over log packs in `[begin_lsid, end_lsid)`.
pub struct LogPackIter {
    dev: BlockDevice,
    sb: SuperBlock,
    lsid: u64,
    end_lsid: u64,
}

impl LogPackIter {
    pub fn new(dev: BlockDevice, sb: SuperBlock, begin_lsid: u64, end_lsid: u64) -> Result<Self> {
        if end_lsid <= begin_lsid {
            return Err(FormatError::InvalidArgument(format!(
                "bad lsid range [{begin_lsid}, {end_lsid})"
            )));
        }
        Ok(Self {
            dev,
            sb,
            lsid: begin_lsid,
            end_lsid,
        })
    }

    pub fn current_lsid(&self) -> u64 {
        self.lsid
    }

    fn read_block(&mut self, lsid: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.sb.pbs as usize];
        let off = self.sb.offset_of(lsid);
        self.dev.read_at(off, &mut buf)?;
        Ok(buf)
    }

    /// Yield the next `(header, payloads)` pair, or `None` past `end_lsid`.
    pub fn next_pack(&mut self) -> Result<Option<(LogPackHeader, Vec<LogPackIo>)>> {
        if self.lsid >= self.end_lsid {
            return Ok(None);
        }
        let block = self.read_block(self.lsid)?;
        let header = LogPackHeader::decode(&block, self.sb.pbs, self.sb.salt)?;
        if header.logpack_lsid != self.lsid {
            return Err(FormatError::CorruptLog(format!(
                "pack header lsid {} does not match position {}",
                header.logpack_lsid, self.lsid
            )));
        }

        let pbs = self.sb.pbs;
        let mut ios = Vec::with_capacity(header.n_records());
        for rec in &header.records {
            if !rec.has_data() {
                ios.push(LogPackIo::default());
                continue;
            }
            let io_bytes = rec.io_size_lb as usize * LOGICAL_BLOCK_SIZE;
            let pb = rec.io_size_pb(pbs);
            let mut data = Vec::with_capacity(pb as usize * pbs as usize);
            for i in 0..pb {
                let off = self.sb.offset_of(rec.lsid + i);
                let start = data.len();
                data.resize(start + pbs as usize, 0);
                self.dev.read_at(off, &mut data[start..])?;
            }
            data.truncate(io_bytes);
            if checksum(&data, self.sb.salt) != rec.checksum {
                return Err(FormatError::CorruptLog(format!(
                    "io checksum mismatch at lsid {}",
                    rec.lsid
                )));
            }
            ios.push(LogPackIo { data });
        }

        self.lsid = header.next_logpack_lsid();
        Ok(Some((header, ios)))
    }
}

/// What a builder record carries.
pub enum LogIoSpec {
    Data { io_address_lb: u64, data: Vec<u8> },
    Discard { io_address_lb: u64, io_size_lb: u32 },
}

/// Writes log packs into a formatted device. Used by the verifier tooling
/// and by tests that fabricate WAL content.
pub struct LogPackBuilder {
    dev: BlockDevice,
    sb: SuperBlock,
}

impl LogPackBuilder {
    pub fn new(dev: BlockDevice, sb: SuperBlock) -> Self {
        Self { dev, sb }
    }

    /// Format a device: write a fresh super block.
    pub fn format(dev: &mut BlockDevice, pbs: u32, salt: u32) -> Result<SuperBlock> {
        let total_pb = dev.size_bytes() / pbs as u64;
        if total_pb < 2 {
            return Err(FormatError::InvalidArgument(
                "device too small for a log ring".into(),
            ));
        }
        let sb = SuperBlock::new(pbs, salt, total_pb - 1)?;
        sb.write_to(dev)?;
        Ok(sb)
    }

    /// Append one pack at `lsid`; returns the next pack's lsid. The caller
    /// is responsible for advancing `written_lsid` in the super block.
    pub fn append_pack(&mut self, lsid: u64, ios: &[LogIoSpec]) -> Result<u64> {
        let mut header = LogPackHeader::new(lsid);
        let mut payload_lsid = lsid + 1;
        let mut payloads: Vec<(u64, Vec<u8>)> = Vec::new();
        for spec in ios {
            match spec {
                LogIoSpec::Data {
                    io_address_lb,
                    data,
                } => {
                    if data.is_empty() || data.len() % LOGICAL_BLOCK_SIZE != 0 {
                        return Err(FormatError::InvalidArgument(
                            "log io payload must be a positive multiple of the logical block"
                                .into(),
                        ));
                    }
                    let io_size_lb = (data.len() / LOGICAL_BLOCK_SIZE) as u32;
                    let rec = LogRecord {
                        lsid: payload_lsid,
                        io_address_lb: *io_address_lb,
                        io_size_lb,
                        flags: LOG_FLAG_EXISTS,
                        checksum: checksum(data, self.sb.salt),
                    };
                    let pb = rec.io_size_pb(self.sb.pbs);
                    payloads.push((payload_lsid, data.clone()));
                    payload_lsid += pb;
                    header.total_io_size_pb += pb;
                    header.records.push(rec);
                }
                LogIoSpec::Discard {
                    io_address_lb,
                    io_size_lb,
                } => {
                    header.records.push(LogRecord {
                        lsid: 0,
                        io_address_lb: *io_address_lb,
                        io_size_lb: *io_size_lb,
                        flags: LOG_FLAG_DISCARD,
                        checksum: 0,
                    });
                }
            }
        }
        if header.records.len() > LogPackHeader::max_records(self.sb.pbs) {
            return Err(FormatError::InvalidArgument("too many records for one pack".into()));
        }

        let block = header.encode(self.sb.pbs, self.sb.salt);
        let off = self.sb.offset_of(lsid);
        self.dev.write_at(off, &block)?;

        let pbs = self.sb.pbs as usize;
        for (start_lsid, data) in &payloads {
            let mut padded = data.clone();
            padded.resize(padded.len().div_ceil(pbs) * pbs, 0);
            for (i, chunk) in padded.chunks(pbs).enumerate() {
                let off = self.sb.offset_of(start_lsid + i as u64);
                self.dev.write_at(off, chunk)?;
            }
        }
        self.dev.sync_data()?;
        Ok(header.next_logpack_lsid())
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    /// Advance `written_lsid`. The super block is re-read first: the log
    /// consumer owns `oldest_lsid` and may have advanced it concurrently.
    pub fn set_written_lsid(&mut self, lsid: u64) -> Result<()> {
        let mut sb = SuperBlock::read_from(&mut self.dev)?;
        sb.written_lsid = lsid;
        sb.write_to(&mut self.dev)?;
        self.sb = sb;
        Ok(())
    }

    pub fn into_parts(self) -> (BlockDevice, SuperBlock) {
        (self.dev, self.sb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PBS: u32 = 4096;

    fn make_device(total_pb: u64) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; (total_pb * PBS as u64) as usize])
            .unwrap();
        tmp.flush().unwrap();
        tmp
    }

    fn open(tmp: &NamedTempFile) -> BlockDevice {
        BlockDevice::open_rw(tmp.path()).unwrap()
    }

    #[test]
    fn test_super_block_round_trip() {
        let tmp = make_device(16);
        let mut dev = open(&tmp);
        let mut sb = LogPackBuilder::format(&mut dev, PBS, 0xabcd).unwrap();
        sb.written_lsid = 42;
        sb.write_to(&mut dev).unwrap();
        let read = SuperBlock::read_from(&mut dev).unwrap();
        assert_eq!(read, sb);
        assert_eq!(read.ring_pb, 15);
    }

    #[test]
    fn test_super_block_rejects_corruption() {
        let tmp = make_device(4);
        let mut dev = open(&tmp);
        let sb = LogPackBuilder::format(&mut dev, PBS, 1).unwrap();
        let mut bytes = sb.encode();
        bytes[12] ^= 1;
        assert!(SuperBlock::decode(&bytes).is_err());
    }

    #[test]
    fn test_pack_round_trip() {
        let tmp = make_device(64);
        let mut dev = open(&tmp);
        let sb = LogPackBuilder::format(&mut dev, PBS, 7).unwrap();
        let mut builder = LogPackBuilder::new(dev, sb);

        let data1 = vec![0x11u8; 8 * LOGICAL_BLOCK_SIZE];
        let data2 = vec![0x22u8; 3 * LOGICAL_BLOCK_SIZE];
        let next = builder
            .append_pack(
                0,
                &[
                    LogIoSpec::Data {
                        io_address_lb: 100,
                        data: data1.clone(),
                    },
                    LogIoSpec::Discard {
                        io_address_lb: 500,
                        io_size_lb: 16,
                    },
                    LogIoSpec::Data {
                        io_address_lb: 200,
                        data: data2.clone(),
                    },
                ],
            )
            .unwrap();
        builder.set_written_lsid(next).unwrap();
        let (dev, sb) = builder.into_parts();

        let mut iter = LogPackIter::new(dev, sb, 0, next).unwrap();
        let (header, ios) = iter.next_pack().unwrap().unwrap();
        assert_eq!(header.n_records(), 3);
        assert_eq!(header.next_logpack_lsid(), next);
        assert_eq!(ios[0].data, data1);
        assert!(header.records[1].is_discard());
        assert!(ios[1].data.is_empty());
        assert_eq!(ios[2].data, data2);
        assert!(iter.next_pack().unwrap().is_none());
    }

    #[test]
    fn test_record_count_over_range() {
        // Records yielded over [b, e) must equal the sum of header counts.
        let tmp = make_device(256);
        let mut dev = open(&tmp);
        let sb = LogPackBuilder::format(&mut dev, PBS, 3).unwrap();
        let mut builder = LogPackBuilder::new(dev, sb);

        let mut lsid = 0;
        let mut expected = 0usize;
        for pack in 0..5 {
            let mut ios = Vec::new();
            for i in 0..=pack {
                ios.push(LogIoSpec::Data {
                    io_address_lb: (pack * 100 + i) as u64,
                    data: vec![pack as u8; 2 * LOGICAL_BLOCK_SIZE],
                });
            }
            expected += ios.len();
            lsid = builder.append_pack(lsid, &ios).unwrap();
        }
        builder.set_written_lsid(lsid).unwrap();
        let (dev, sb) = builder.into_parts();

        let mut iter = LogPackIter::new(dev, sb, 0, lsid).unwrap();
        let mut got = 0usize;
        while let Some((header, ios)) = iter.next_pack().unwrap() {
            assert_eq!(header.n_records(), ios.len());
            got += header.n_records();
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_ring_wraparound() {
        // Ring of 15 blocks; write enough packs that the ring wraps.
        let tmp = make_device(16);
        let mut dev = open(&tmp);
        let sb = LogPackBuilder::format(&mut dev, PBS, 9).unwrap();
        let mut builder = LogPackBuilder::new(dev, sb);

        let mut lsid = 0;
        for round in 0..10u8 {
            lsid = builder
                .append_pack(
                    lsid,
                    &[LogIoSpec::Data {
                        io_address_lb: round as u64 * 8,
                        data: vec![round; 8 * LOGICAL_BLOCK_SIZE],
                    }],
                )
                .unwrap();
        }
        builder.set_written_lsid(lsid).unwrap();
        let (dev, sb) = builder.into_parts();

        // The two newest packs are intact; older ones were overwritten.
        let begin = lsid - 4; // two packs of (1 header + 1 payload) blocks
        let mut iter = LogPackIter::new(dev, sb, begin, lsid).unwrap();
        let mut n = 0;
        while let Some((_, ios)) = iter.next_pack().unwrap() {
            assert_eq!(ios[0].data.len(), 8 * LOGICAL_BLOCK_SIZE);
            n += 1;
        }
        assert_eq!(n, 2);
    }

    #[test]
    fn test_bad_range_rejected() {
        let tmp = make_device(8);
        let mut dev = open(&tmp);
        let sb = LogPackBuilder::format(&mut dev, PBS, 0).unwrap();
        assert!(LogPackIter::new(open(&tmp), sb, 5, 5).is_err());
        assert!(LogPackIter::new(open(&tmp), sb, 6, 2).is_err());
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let tmp = make_device(32);
        let mut dev = open(&tmp);
        let sb = LogPackBuilder::format(&mut dev, PBS, 5).unwrap();
        let mut builder = LogPackBuilder::new(dev, sb);
        let next = builder
            .append_pack(
                0,
                &[LogIoSpec::Data {
                    io_address_lb: 0,
                    data: vec![7u8; 8 * LOGICAL_BLOCK_SIZE],
                }],
            )
            .unwrap();
        let (mut dev, sb) = builder.into_parts();

        // Flip a byte inside the payload block (lsid 1).
        let off = sb.offset_of(1);
        let mut byte = vec![0u8; 1];
        dev.read_at(off, &mut byte).unwrap();
        byte[0] ^= 0xff;
        dev.write_at(off, &byte).unwrap();

        let mut iter = LogPackIter::new(dev, sb, 0, next).unwrap();
        match iter.next_pack() {
            Err(FormatError::CorruptLog(_)) => {}
            other => panic!("expected CorruptLog, got {other:?}"),
        }
    }
}
