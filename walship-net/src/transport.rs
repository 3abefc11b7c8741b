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

//! Streaming transport for bulk log and diff transfer.
//!
//! The log stream runs a worker pipeline on each side:
//!
//! ```text
//! producer → q0 → compress worker → q1 → send worker → socket
//! socket → recv worker → q0 → uncompress worker → q1 → consumer
//! ```
//!
//! Queues are bounded (capacity 16) so the producer feels backpressure, and
//! each queue ends in one of three states: closed (normal), failed by the
//! producer side, or failed by the consumer side. Each streamed frame is
//! preceded by a stream-control byte so a failing peer can be drained.
//!
//! Diff packs are already compressed per record, so the wdiff path ships
//! packs directly without a worker pipeline.

use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use walship_core::codec::{self, CodecKind};
use walship_core::queue::{BoundedQueue, Popped};
use walship_core::{checksum, LOGICAL_BLOCK_SIZE};

use crate::error::{NetError, Result};
use crate::packet::{Packet, StreamCtl, MAX_MESSAGE_SIZE};
use walship_format::wdiff::{DiffPack, DiffReader, DiffWriter};
use walship_format::wlog::{LogPackHeader, LogRecord};

/// Queue capacity on each pipeline stage.
pub const QUEUE_SIZE: usize = 16;

/// One possibly-compressed message on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub orig_size: u32,
    pub codec: CodecKind,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn plain(data: Vec<u8>) -> Self {
        Self {
            orig_size: data.len() as u32,
            codec: CodecKind::AsIs,
            data,
        }
    }

    /// Compress in place; keeps the original when compression does not
    /// shrink the frame.
    pub fn compress(self, kind: CodecKind, level: u32) -> walship_core::Result<Self> {
        if self.codec != CodecKind::AsIs || kind == CodecKind::AsIs {
            return Ok(self);
        }
        let compressed = codec::compress(kind, level, &self.data)?;
        if compressed.len() < self.data.len() {
            Ok(Self {
                orig_size: self.orig_size,
                codec: kind,
                data: compressed,
            })
        } else {
            Ok(self)
        }
    }

    pub fn into_uncompressed(self) -> walship_core::Result<Vec<u8>> {
        if self.codec == CodecKind::AsIs {
            return Ok(self.data);
        }
        codec::uncompress(self.codec, &self.data, self.orig_size as usize)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(self.orig_size)?;
        w.write_u8(self.codec as u8)?;
        w.write_u32::<LittleEndian>(self.data.len() as u32)?;
        w.write_all(&self.data)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let orig_size = r.read_u32::<LittleEndian>()?;
        let codec_tag = r.read_u8()?;
        let codec = CodecKind::from_u8(codec_tag)
            .ok_or_else(|| NetError::Protocol(format!("bad frame codec {codec_tag}")))?;
        let len = r.read_u32::<LittleEndian>()? as usize;
        if len > MAX_MESSAGE_SIZE || orig_size as usize > MAX_MESSAGE_SIZE {
            return Err(NetError::Protocol(format!("frame too large: {len} bytes")));
        }
        let mut data = vec![0u8; len];
        r.read_exact(&mut data)?;
        Ok(Self {
            orig_size,
            codec,
            data,
        })
    }
}

fn join_quietly<T>(handle: &mut Option<JoinHandle<T>>) -> Option<T> {
    handle.take().and_then(|h| match h.join() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::error!("transport worker panicked");
            None
        }
    })
}

/// Log stream sender. Push a header, then one IO per record that carries
/// data; `sync` finishes the stream, `fail` aborts it.
pub struct LogSender<W: Write + Send + 'static> {
    q0: Arc<BoundedQueue<Frame>>,
    q1: Arc<BoundedQueue<Frame>>,
    compressor: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<W>>,
    pbs: u32,
    salt: u32,
    done: bool,
}

impl<W: Write + Send + 'static> LogSender<W> {
    pub fn start(w: W, pbs: u32, salt: u32) -> Self {
        let q0 = Arc::new(BoundedQueue::<Frame>::new(QUEUE_SIZE));
        let q1 = Arc::new(BoundedQueue::<Frame>::new(QUEUE_SIZE));

        let compressor = {
            let q0 = Arc::clone(&q0);
            let q1 = Arc::clone(&q1);
            std::thread::spawn(move || loop {
                match q0.pop() {
                    Popped::Next(frame) => match frame.compress(CodecKind::Snappy, 0) {
                        Ok(frame) => {
                            if q1.push(frame).is_err() {
                                q0.fail("downstream failed");
                                break;
                            }
                        }
                        Err(e) => {
                            let reason = format!("compress failed: {e}");
                            q0.fail(&reason);
                            q1.fail(&reason);
                            break;
                        }
                    },
                    Popped::End => {
                        q1.close();
                        break;
                    }
                    Popped::Error(reason) => {
                        q1.fail(&reason);
                        break;
                    }
                }
            })
        };

        let sender = {
            let q0 = Arc::clone(&q0);
            let q1 = Arc::clone(&q1);
            std::thread::spawn(move || {
                let mut out = BufWriter::new(w);
                loop {
                    match q1.pop() {
                        Popped::Next(frame) => {
                            let io = out
                                .write_u8(StreamCtl::Next as u8)
                                .and_then(|_| frame.write_to(&mut out));
                            if let Err(e) = io {
                                let reason = format!("send failed: {e}");
                                q1.fail(&reason);
                                q0.fail(&reason);
                                break;
                            }
                        }
                        Popped::End => {
                            let _ = out
                                .write_u8(StreamCtl::End as u8)
                                .and_then(|_| out.flush());
                            break;
                        }
                        Popped::Error(_) => {
                            // Let the peer drain cleanly.
                            let _ = out
                                .write_u8(StreamCtl::Error as u8)
                                .and_then(|_| out.flush());
                            break;
                        }
                    }
                }
                match out.into_inner() {
                    Ok(w) => w,
                    Err(e) => e.into_inner().into_parts().0,
                }
            })
        };

        Self {
            q0,
            q1,
            compressor: Some(compressor),
            sender: Some(sender),
            pbs,
            salt,
            done: false,
        }
    }

    /// Push a pack header. Every header must be followed by a `push_io` for
    /// each of its records.
    pub fn push_header(&self, header: &LogPackHeader) -> Result<()> {
        if header.n_records() > LogPackHeader::max_records(self.pbs) {
            return Err(NetError::Protocol(format!(
                "pack header does not fit pbs {}",
                self.pbs
            )));
        }
        let block = header.encode(self.pbs, self.salt);
        self.q0
            .push(Frame::plain(block))
            .map_err(|e| NetError::Stream(e.to_string()))
    }

    /// Push one record's IO. Records without data (discard, padding) still
    /// count as a virtual push but transmit nothing.
    pub fn push_io(&self, rec: &LogRecord, data: &[u8]) -> Result<()> {
        if !rec.has_data() {
            return Ok(());
        }
        if data.len() != rec.io_size_lb as usize * LOGICAL_BLOCK_SIZE {
            return Err(NetError::Protocol(format!(
                "io payload size {} does not match record ({} blocks)",
                data.len(),
                rec.io_size_lb
            )));
        }
        self.q0
            .push(Frame::plain(data.to_vec()))
            .map_err(|e| NetError::Stream(e.to_string()))
    }

    /// Finish the stream: close the input queue, drain the workers, and
    /// return the writer.
    pub fn sync(mut self) -> Result<W> {
        self.q0.close();
        self.done = true;
        join_quietly(&mut self.compressor);
        let w = join_quietly(&mut self.sender)
            .ok_or_else(|| NetError::Stream("send worker lost".into()))?;
        if self.q0.is_failed() || self.q1.is_failed() {
            return Err(NetError::Stream("log send pipeline failed".into()));
        }
        Ok(w)
    }

    /// Abort the stream; the peer sees a stream-control error marker.
    pub fn fail(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        self.done = true;
        self.q0.fail("sender aborted");
        self.q1.fail("sender aborted");
        join_quietly(&mut self.compressor);
        join_quietly(&mut self.sender);
    }
}

impl<W: Write + Send + 'static> Drop for LogSender<W> {
    fn drop(&mut self) {
        if !self.done {
            self.abort();
        }
    }
}

/// Log stream receiver; the mirror image of [`LogSender`].
pub struct LogReceiver {
    q1: Arc<BoundedQueue<Vec<u8>>>,
    q0: Arc<BoundedQueue<Frame>>,
    receiver: Option<JoinHandle<()>>,
    uncompressor: Option<JoinHandle<()>>,
    pbs: u32,
    salt: u32,
    done: bool,
}

impl LogReceiver {
    pub fn start<R: Read + Send + 'static>(r: R, pbs: u32, salt: u32) -> Self {
        let q0: Arc<BoundedQueue<Frame>> = Arc::new(BoundedQueue::new(QUEUE_SIZE));
        let q1: Arc<BoundedQueue<Vec<u8>>> = Arc::new(BoundedQueue::new(QUEUE_SIZE));

        let receiver = {
            let q0 = Arc::clone(&q0);
            std::thread::spawn(move || {
                let mut input = BufReader::new(r);
                loop {
                    let ctl = match input.read_u8().map(StreamCtl::from_u8) {
                        Ok(Ok(ctl)) => ctl,
                        Ok(Err(e)) => {
                            q0.fail(&e.to_string());
                            break;
                        }
                        Err(e) => {
                            q0.fail(&format!("recv failed: {e}"));
                            break;
                        }
                    };
                    match ctl {
                        StreamCtl::Next => match Frame::read_from(&mut input) {
                            Ok(frame) => {
                                if q0.push(frame).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                q0.fail(&format!("recv failed: {e}"));
                                break;
                            }
                        },
                        StreamCtl::End => {
                            q0.close();
                            break;
                        }
                        StreamCtl::Error => {
                            q0.fail("peer sent an error");
                            break;
                        }
                    }
                }
            })
        };

        let uncompressor = {
            let q0 = Arc::clone(&q0);
            let q1 = Arc::clone(&q1);
            std::thread::spawn(move || loop {
                match q0.pop() {
                    Popped::Next(frame) => match frame.into_uncompressed() {
                        Ok(data) => {
                            if q1.push(data).is_err() {
                                q0.fail("downstream failed");
                                break;
                            }
                        }
                        Err(e) => {
                            let reason = format!("uncompress failed: {e}");
                            q0.fail(&reason);
                            q1.fail(&reason);
                            break;
                        }
                    },
                    Popped::End => {
                        q1.close();
                        break;
                    }
                    Popped::Error(reason) => {
                        q1.fail(&reason);
                        break;
                    }
                }
            })
        };

        Self {
            q1,
            q0,
            receiver: Some(receiver),
            uncompressor: Some(uncompressor),
            pbs,
            salt,
            done: false,
        }
    }

    /// Pop the next pack header; `None` on clean end of stream. A peer
    /// error is lifted to a local failure here.
    pub fn pop_header(&mut self) -> Result<Option<LogPackHeader>> {
        match self.q1.pop() {
            Popped::Next(data) => {
                if data.len() != self.pbs as usize {
                    return Err(NetError::Protocol(format!(
                        "pack header frame of {} bytes, expected pbs {}",
                        data.len(),
                        self.pbs
                    )));
                }
                let header = LogPackHeader::decode(&data, self.pbs, self.salt)?;
                Ok(Some(header))
            }
            Popped::End => {
                self.finish();
                Ok(None)
            }
            Popped::Error(reason) => {
                self.finish();
                Err(NetError::Peer(reason))
            }
        }
    }

    /// Pop one record's IO; empty for records without data.
    pub fn pop_io(&mut self, rec: &LogRecord) -> Result<Vec<u8>> {
        if !rec.has_data() {
            return Ok(Vec::new());
        }
        match self.q1.pop() {
            Popped::Next(data) => {
                if data.len() != rec.io_size_lb as usize * LOGICAL_BLOCK_SIZE {
                    return Err(NetError::Protocol("io frame size mismatch".into()));
                }
                if checksum(&data, self.salt) != rec.checksum {
                    return Err(NetError::Protocol(format!(
                        "io checksum mismatch at lsid {}",
                        rec.lsid
                    )));
                }
                Ok(data)
            }
            Popped::End => Err(NetError::Stream("stream ended inside a pack".into())),
            Popped::Error(reason) => Err(NetError::Peer(reason)),
        }
    }

    /// Abort the stream.
    pub fn fail(mut self) {
        self.abort();
    }

    fn finish(&mut self) {
        self.done = true;
        join_quietly(&mut self.receiver);
        join_quietly(&mut self.uncompressor);
    }

    fn abort(&mut self) {
        self.done = true;
        self.q0.fail("receiver aborted");
        self.q1.fail("receiver aborted");
        join_quietly(&mut self.receiver);
        join_quietly(&mut self.uncompressor);
    }
}

impl Drop for LogReceiver {
    fn drop(&mut self) {
        if !self.done {
            self.abort();
        }
    }
}

/// Ship a whole wdiff file: for every pack, a control marker, the encoded
/// pack table, then each payload-bearing record's compressed bytes.
pub fn send_diff_file<S: Read, R: Read, W: Write>(
    pkt: &mut Packet<R, W>,
    reader: &mut DiffReader<S>,
) -> Result<()> {
    let salt = reader.header().salt;
    while let Some((pack, payload)) = reader.next_pack_raw()? {
        pkt.write_ctrl(StreamCtl::Next)?;
        pkt.write_bytes(&pack.encode(salt))?;
        for rec in &pack.records {
            if rec.has_payload() {
                let start = rec.data_offset as usize;
                let end = start + rec.data_size as usize;
                pkt.write_bytes(&payload[start..end])?;
            }
        }
    }
    pkt.write_ctrl(StreamCtl::End)?;
    pkt.flush()?;
    Ok(())
}

/// Receive a wdiff stream into a writer whose header carries `salt`.
/// Checksums are verified per record before anything is written.
pub fn recv_diff_file<R: Read, W: Write, O: Write>(
    pkt: &mut Packet<R, W>,
    writer: &mut DiffWriter<O>,
    salt: u32,
) -> Result<()> {
    match recv_diff_file_with(pkt, writer, salt, || true)? {
        true => Ok(()),
        false => unreachable!("unconditional receive cannot be interrupted"),
    }
}

/// Like [`recv_diff_file`], but polls `keep_going` between packs so a stop
/// request can interrupt the receive. Returns `false` when interrupted.
pub fn recv_diff_file_with<R: Read, W: Write, O: Write>(
    pkt: &mut Packet<R, W>,
    writer: &mut DiffWriter<O>,
    salt: u32,
    mut keep_going: impl FnMut() -> bool,
) -> Result<bool> {
    loop {
        if !keep_going() {
            return Ok(false);
        }
        match pkt.read_ctrl()? {
            StreamCtl::Next => {
                let table = pkt.read_bytes()?;
                let pack = DiffPack::decode(&mut Cursor::new(table), salt)?;
                for rec in &pack.records {
                    let data = if rec.has_payload() {
                        pkt.read_bytes()?
                    } else {
                        Vec::new()
                    };
                    writer.push_compressed(*rec, &data)?;
                }
            }
            StreamCtl::End => return Ok(true),
            StreamCtl::Error => return Err(NetError::Peer("peer aborted diff stream".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use uuid::Uuid;
    use walship_format::wdiff::{DiffFileHeader, DiffRecordKind};
    use walship_format::wlog::LOG_FLAG_EXISTS;

    const PBS: u32 = 4096;
    const SALT: u32 = 0xfeed;

    fn make_header(lsid: u64, ios: &[(u64, &[u8])]) -> LogPackHeader {
        let mut header = LogPackHeader::new(lsid);
        let mut payload_lsid = lsid + 1;
        for (addr, data) in ios {
            let rec = LogRecord {
                lsid: payload_lsid,
                io_address_lb: *addr,
                io_size_lb: (data.len() / LOGICAL_BLOCK_SIZE) as u32,
                flags: LOG_FLAG_EXISTS,
                checksum: checksum(data, SALT),
            };
            let pb = rec.io_size_pb(PBS);
            payload_lsid += pb;
            header.total_io_size_pb += pb;
            header.records.push(rec);
        }
        header
    }

    #[test]
    fn test_frame_round_trip() {
        let mut data = vec![0u8; 9000];
        rand::thread_rng().fill_bytes(&mut data);
        let frame = Frame::plain(data.clone())
            .compress(CodecKind::Snappy, 0)
            .unwrap();
        let mut wire = Vec::new();
        frame.write_to(&mut wire).unwrap();
        let back = Frame::read_from(&mut &wire[..]).unwrap();
        assert_eq!(back, frame);
        assert_eq!(back.into_uncompressed().unwrap(), data);
    }

    #[test]
    fn test_log_stream_round_trip() {
        // Headers and IOs arrive byte-identical and in order.
        let ios1: Vec<Vec<u8>> = (0..3)
            .map(|i| vec![i as u8 + 1; 8 * LOGICAL_BLOCK_SIZE])
            .collect();
        let ios2: Vec<Vec<u8>> = vec![vec![0xaa; 16 * LOGICAL_BLOCK_SIZE]];

        let h1 = make_header(
            0,
            &ios1
                .iter()
                .enumerate()
                .map(|(i, d)| (i as u64 * 100, d.as_slice()))
                .collect::<Vec<_>>(),
        );
        let h2 = make_header(h1.next_logpack_lsid(), &[(900, ios2[0].as_slice())]);

        let sender = LogSender::start(Vec::new(), PBS, SALT);
        sender.push_header(&h1).unwrap();
        for (rec, data) in h1.records.iter().zip(&ios1) {
            sender.push_io(rec, data).unwrap();
        }
        sender.push_header(&h2).unwrap();
        sender.push_io(&h2.records[0], &ios2[0]).unwrap();
        let wire = sender.sync().unwrap();

        let mut receiver = LogReceiver::start(Cursor::new(wire), PBS, SALT);
        let r1 = receiver.pop_header().unwrap().unwrap();
        assert_eq!(r1.logpack_lsid, h1.logpack_lsid);
        assert_eq!(r1.n_records(), 3);
        for (rec, expected) in r1.records.iter().zip(&ios1) {
            assert_eq!(&receiver.pop_io(rec).unwrap(), expected);
        }
        let r2 = receiver.pop_header().unwrap().unwrap();
        assert_eq!(&receiver.pop_io(&r2.records[0]).unwrap(), &ios2[0]);
        assert!(receiver.pop_header().unwrap().is_none());
    }

    #[test]
    fn test_receiver_sees_peer_error() {
        let sender = LogSender::start(Vec::new(), PBS, SALT);
        let h = make_header(0, &[]);
        sender.push_header(&h).unwrap();
        // Abort instead of syncing: the peer must observe an error marker.
        sender.fail();
        // The writer is lost on the failure path, so fabricate the wire:
        // one good frame then an error marker.
        let mut wire = Vec::new();
        wire.push(StreamCtl::Next as u8);
        Frame::plain(h.encode(PBS, SALT)).write_to(&mut wire).unwrap();
        wire.push(StreamCtl::Error as u8);

        let mut receiver = LogReceiver::start(Cursor::new(wire), PBS, SALT);
        assert!(receiver.pop_header().unwrap().is_some());
        assert!(matches!(receiver.pop_header(), Err(NetError::Peer(_))));
    }

    #[test]
    fn test_salt_mismatch_rejected() {
        let data = vec![3u8; 8 * LOGICAL_BLOCK_SIZE];
        let h = make_header(0, &[(0, data.as_slice())]);
        let sender = LogSender::start(Vec::new(), PBS, SALT);
        sender.push_header(&h).unwrap();
        sender.push_io(&h.records[0], &data).unwrap();
        let wire = sender.sync().unwrap();

        let mut receiver = LogReceiver::start(Cursor::new(wire), PBS, SALT + 1);
        assert!(receiver.pop_header().is_err());
    }

    #[test]
    fn test_diff_stream_round_trip() {
        let uuid = Uuid::new_v4();
        let header = DiffFileHeader::new(uuid, 1 << 16, SALT);
        let mut file = Vec::new();
        {
            let mut w = DiffWriter::new(&mut file);
            w.write_header(&header).unwrap();
            let mut data = vec![0u8; 8 * LOGICAL_BLOCK_SIZE];
            rand::thread_rng().fill_bytes(&mut data);
            w.push(DiffRecordKind::Normal, 0, 8, CodecKind::Snappy, &data)
                .unwrap();
            w.push(DiffRecordKind::AllZero, 100, 4, CodecKind::AsIs, &[])
                .unwrap();
            w.close().unwrap();
        }

        // Send into a buffer.
        let mut tx: Packet<Cursor<Vec<u8>>, Vec<u8>> =
            Packet::new(Cursor::new(Vec::new()), Vec::new());
        let mut reader = DiffReader::new(Cursor::new(file.clone())).unwrap();
        send_diff_file(&mut tx, &mut reader).unwrap();
        let wire = tx.into_writer();

        // Receive into a fresh file.
        let mut rx: Packet<Cursor<Vec<u8>>, Vec<u8>> = Packet::new(Cursor::new(wire), Vec::new());
        let mut out = Vec::new();
        {
            let mut w = DiffWriter::new(&mut out);
            w.write_header(&header).unwrap();
            recv_diff_file(&mut rx, &mut w, SALT).unwrap();
            w.close().unwrap();
        }

        // Same records, same data.
        let mut a = DiffReader::new(Cursor::new(file)).unwrap();
        let mut b = DiffReader::new(Cursor::new(out)).unwrap();
        loop {
            let (x, y) = (a.next_rec_io().unwrap(), b.next_rec_io().unwrap());
            match (x, y) {
                (None, None) => break,
                (Some(x), Some(y)) => {
                    assert_eq!(x.rec.io_address, y.rec.io_address);
                    assert_eq!(x.rec.io_blocks, y.rec.io_blocks);
                    assert_eq!(x.rec.kind, y.rec.kind);
                    assert_eq!(x.data, y.data);
                }
                other => panic!("stream mismatch: {other:?}"),
            }
        }
    }
}
