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

//! Direct (unbuffered) block-device I/O.
//!
//! The WAL device and volume images are read and written through this layer.
//! On Linux the device is opened with `O_DIRECT` and all transfers go through
//! aligned buffers; elsewhere we fall back to buffered I/O. A ring-buffered
//! sequential reader provides read-ahead for the log scan path.

use std::alloc::{alloc, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::LOGICAL_BLOCK_SIZE;

/// Alignment required for direct I/O buffers.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

/// Heap buffer aligned for direct I/O.
pub struct AlignedBuffer {
    ptr: *mut u8,
    capacity: usize,
    alignment: usize,
}

impl AlignedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_alignment(capacity, DIRECT_IO_ALIGNMENT)
    }

    pub fn with_alignment(capacity: usize, alignment: usize) -> Self {
        let aligned_capacity = capacity.div_ceil(alignment) * alignment;
        let layout =
            Layout::from_size_align(aligned_capacity, alignment).expect("invalid alignment");
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            panic!("failed to allocate aligned buffer of {aligned_capacity} bytes");
        }
        Self {
            ptr,
            capacity: aligned_capacity,
            alignment,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.capacity) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.capacity) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, self.alignment)
            .expect("invalid alignment in drop");
        unsafe { dealloc(self.ptr, layout) };
    }
}

// The pointer is exclusively owned.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

/// Open a file or block device for direct reads.
#[cfg(target_os = "linux")]
pub fn open_direct(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
        .or_else(|_| {
            // Regular files on some filesystems refuse O_DIRECT.
            OpenOptions::new().read(true).open(path)
        })
}

#[cfg(not(target_os = "linux"))]
pub fn open_direct(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

/// Open a file or block device for direct reads and writes.
#[cfg(target_os = "linux")]
pub fn open_direct_rw(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
        .or_else(|_| OpenOptions::new().read(true).write(true).open(path))
}

#[cfg(not(target_os = "linux"))]
pub fn open_direct_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// A block device (or file-backed image) addressed in logical blocks.
pub struct BlockDevice {
    file: File,
    size_bytes: u64,
}

impl BlockDevice {
    pub fn open_read(path: &Path) -> Result<Self> {
        let file = open_direct(path)?;
        Self::from_file(file)
    }

    pub fn open_rw(path: &Path) -> Result<Self> {
        let file = open_direct_rw(path)?;
        Self::from_file(file)
    }

    pub fn from_file(file: File) -> Result<Self> {
        let size_bytes = file.metadata()?.len();
        if size_bytes % LOGICAL_BLOCK_SIZE as u64 != 0 {
            return Err(CoreError::Unaligned(format!(
                "device size {size_bytes} is not a multiple of {LOGICAL_BLOCK_SIZE}"
            )));
        }
        Ok(Self { file, size_bytes })
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn size_lb(&self) -> u64 {
        self.size_bytes / LOGICAL_BLOCK_SIZE as u64
    }

    /// Read exactly `buf.len()` bytes at byte `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write the whole of `buf` at byte `offset`.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

/// Ring-buffered sequential reader with read-ahead.
///
/// The ring holds data already read from the device ahead of the consumer:
///
/// ```text
/// |___XXXXXXXXXX______|
///     ^         ^
///     read_off  ahead_off
/// ```
///
/// `X` is readable, `_` is free. Refills fetch the largest contiguous free
/// span so the device sees big sequential reads.
pub struct SeqBlockReader {
    dev: BlockDevice,
    buf: Vec<u8>,
    read_off: usize,
    ahead_off: usize,
    readable: usize,
    dev_off: u64,
}

impl SeqBlockReader {
    pub const DEFAULT_BUFFER_SIZE: usize = 4 << 20;

    /// Start reading at byte offset `start` with a ring of `buffer_size`
    /// bytes (a multiple of the logical block size).
    pub fn new(dev: BlockDevice, start: u64, buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 || buffer_size % LOGICAL_BLOCK_SIZE != 0 {
            return Err(CoreError::InvalidArgument(format!(
                "bad read-ahead buffer size {buffer_size}"
            )));
        }
        Ok(Self {
            dev,
            buf: vec![0u8; buffer_size],
            read_off: 0,
            ahead_off: 0,
            readable: 0,
            dev_off: start,
        })
    }

    fn free(&self) -> usize {
        self.buf.len() - self.readable
    }

    /// Fill the ring from the device. Returns bytes added.
    fn read_ahead(&mut self) -> Result<usize> {
        let mut added = 0;
        loop {
            let remaining_dev = (self.dev.size_bytes() - self.dev_off) as usize;
            let contiguous = (self.buf.len() - self.ahead_off).min(self.free());
            let n = contiguous.min(remaining_dev);
            if n == 0 {
                return Ok(added);
            }
            let off = self.ahead_off;
            self.dev
                .read_at(self.dev_off, &mut self.buf[off..off + n])?;
            self.dev_off += n as u64;
            self.ahead_off = (self.ahead_off + n) % self.buf.len();
            self.readable += n;
            added += n;
        }
    }

    /// Read up to `out.len()` bytes; returns 0 only at end of device.
    pub fn read_some(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.readable == 0 {
            self.read_ahead()?;
        }
        let n = out.len().min(self.readable);
        let mut copied = 0;
        while copied < n {
            let contiguous = (self.buf.len() - self.read_off).min(n - copied);
            out[copied..copied + contiguous]
                .copy_from_slice(&self.buf[self.read_off..self.read_off + contiguous]);
            self.read_off = (self.read_off + contiguous) % self.buf.len();
            copied += contiguous;
        }
        self.readable -= n;
        Ok(n)
    }

    /// Read exactly `out.len()` bytes.
    pub fn read(&mut self, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            let n = self.read_some(&mut out[done..])?;
            if n == 0 {
                return Err(CoreError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "end of device during sequential read",
                )));
            }
            done += n;
        }
        Ok(())
    }

    /// Discard exactly `size` bytes without copying them out.
    pub fn skip(&mut self, mut size: usize) -> Result<()> {
        while size > 0 {
            if self.readable == 0 && self.read_ahead()? == 0 {
                return Err(CoreError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "end of device during skip",
                )));
            }
            let n = size.min(self.readable);
            self.read_off = (self.read_off + n) % self.buf.len();
            self.readable -= n;
            size -= n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn device_with(pattern_blocks: usize) -> (NamedTempFile, Vec<u8>) {
        let mut tmp = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..pattern_blocks * LOGICAL_BLOCK_SIZE)
            .map(|i| (i % 251) as u8)
            .collect();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();
        (tmp, data)
    }

    #[test]
    fn test_aligned_buffer() {
        let buf = AlignedBuffer::new(1000);
        assert!(buf.capacity() >= 1000);
        assert_eq!(buf.capacity() % DIRECT_IO_ALIGNMENT, 0);
    }

    #[test]
    fn test_block_device_read_write() {
        let (tmp, data) = device_with(8);
        let mut dev = BlockDevice::open_rw(tmp.path()).unwrap();
        assert_eq!(dev.size_lb(), 8);

        let mut buf = vec![0u8; LOGICAL_BLOCK_SIZE];
        dev.read_at(2 * LOGICAL_BLOCK_SIZE as u64, &mut buf).unwrap();
        assert_eq!(buf[..], data[2 * LOGICAL_BLOCK_SIZE..3 * LOGICAL_BLOCK_SIZE]);

        let patch = vec![0xaa; LOGICAL_BLOCK_SIZE];
        dev.write_at(0, &patch).unwrap();
        dev.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, patch);
    }

    #[test]
    fn test_unaligned_device_rejected() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 777]).unwrap();
        tmp.flush().unwrap();
        assert!(BlockDevice::open_read(tmp.path()).is_err());
    }

    #[test]
    fn test_seq_reader_small_ring() {
        let (tmp, data) = device_with(64);
        let dev = BlockDevice::open_read(tmp.path()).unwrap();
        // Ring far smaller than the device forces wraparound.
        let mut rd = SeqBlockReader::new(dev, 0, 4 * LOGICAL_BLOCK_SIZE).unwrap();
        let mut out = vec![0u8; data.len()];
        let mut done = 0;
        while done < out.len() {
            let end = done + 700.min(out.len() - done);
            let n = rd.read_some(&mut out[done..end]).unwrap();
            assert!(n > 0);
            done += n;
        }
        assert_eq!(out, data);
        assert_eq!(rd.read_some(&mut [0u8; 16]).unwrap(), 0);
    }

    #[test]
    fn test_seq_reader_skip() {
        let (tmp, data) = device_with(16);
        let dev = BlockDevice::open_read(tmp.path()).unwrap();
        let mut rd = SeqBlockReader::new(dev, 0, 2 * LOGICAL_BLOCK_SIZE).unwrap();
        rd.skip(5 * LOGICAL_BLOCK_SIZE).unwrap();
        let mut out = vec![0u8; LOGICAL_BLOCK_SIZE];
        rd.read(&mut out).unwrap();
        assert_eq!(out[..], data[5 * LOGICAL_BLOCK_SIZE..6 * LOGICAL_BLOCK_SIZE]);
    }

    #[test]
    fn test_seq_reader_start_offset() {
        let (tmp, data) = device_with(16);
        let dev = BlockDevice::open_read(tmp.path()).unwrap();
        let mut rd =
            SeqBlockReader::new(dev, 3 * LOGICAL_BLOCK_SIZE as u64, 8 * LOGICAL_BLOCK_SIZE)
                .unwrap();
        let mut out = vec![0u8; 2 * LOGICAL_BLOCK_SIZE];
        rd.read(&mut out).unwrap();
        assert_eq!(out[..], data[3 * LOGICAL_BLOCK_SIZE..5 * LOGICAL_BLOCK_SIZE]);
    }
}
