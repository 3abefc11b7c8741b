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

//! Length-prefixed packet framing over a duplex stream.
//!
//! All integers are little-endian. Byte strings and strings are framed as
//! `u32 length + bytes`; a length above [`MAX_MESSAGE_SIZE`] is a protocol
//! error, never an allocation.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::error::{NetError, Result};

/// Upper bound for one framed message.
pub const MAX_MESSAGE_SIZE: usize = 32 << 20;

/// Acknowledgement magic.
const ACK_VALUE: u32 = 0x6b63_6101; // "ack" + 1

/// Stream-control marker preceding each streamed message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCtl {
    Next = 0,
    End = 1,
    Error = 2,
}

impl StreamCtl {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StreamCtl::Next),
            1 => Ok(StreamCtl::End),
            2 => Ok(StreamCtl::Error),
            _ => Err(NetError::Protocol(format!("bad stream control byte {value}"))),
        }
    }
}

/// Typed reader/writer pair over one connection.
pub struct Packet<R: Read, W: Write> {
    r: BufReader<R>,
    w: BufWriter<W>,
}

/// The common case: both halves of a TCP connection.
pub type TcpPacket = Packet<TcpStream, TcpStream>;

impl TcpPacket {
    pub fn from_stream(stream: &TcpStream) -> Result<Self> {
        Ok(Packet::new(stream.try_clone()?, stream.try_clone()?))
    }
}

impl<R: Read, W: Write> Packet<R, W> {
    pub fn new(r: R, w: W) -> Self {
        Self {
            r: BufReader::new(r),
            w: BufWriter::new(w),
        }
    }

    // ---- writes ----

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.w.write_u8(v)?;
        Ok(())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.w.write_u32::<LittleEndian>(v)?;
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.w.write_u64::<LittleEndian>(v)?;
        Ok(())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::Protocol(format!(
                "outgoing message too large: {} bytes",
                data.len()
            )));
        }
        self.w.write_u32::<LittleEndian>(data.len() as u32)?;
        self.w.write_all(data)?;
        Ok(())
    }

    pub fn write_str(&mut self, s: &str) -> Result<()> {
        self.write_bytes(s.as_bytes())
    }

    pub fn write_str_vec(&mut self, v: &[String]) -> Result<()> {
        self.write_u32(v.len() as u32)?;
        for s in v {
            self.write_str(s)?;
        }
        Ok(())
    }

    pub fn write_uuid(&mut self, uuid: &Uuid) -> Result<()> {
        self.w.write_all(uuid.as_bytes())?;
        Ok(())
    }

    pub fn write_ctrl(&mut self, ctl: StreamCtl) -> Result<()> {
        self.w.write_u8(ctl as u8)?;
        // Control markers gate progress on the peer; never leave them
        // sitting in the buffer.
        if ctl != StreamCtl::Next {
            self.w.flush()?;
        }
        Ok(())
    }

    pub fn write_ack(&mut self) -> Result<()> {
        self.write_u32(ACK_VALUE)?;
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }

    // ---- reads ----

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.r.read_u8()?)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.r.read_u32::<LittleEndian>()?)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(self.r.read_u64::<LittleEndian>()?)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.r.read_u32::<LittleEndian>()? as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(NetError::Protocol(format!(
                "incoming message too large: {len} bytes"
            )));
        }
        let mut buf = vec![0u8; len];
        self.r.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_str(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| NetError::Protocol("non-utf8 string".into()))
    }

    pub fn read_str_vec(&mut self) -> Result<Vec<String>> {
        let n = self.read_u32()? as usize;
        if n > 4096 {
            return Err(NetError::Protocol(format!("string vector too long: {n}")));
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_str()?);
        }
        Ok(out)
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        let mut bytes = [0u8; 16];
        self.r.read_exact(&mut bytes)?;
        Ok(Uuid::from_bytes(bytes))
    }

    pub fn read_ctrl(&mut self) -> Result<StreamCtl> {
        StreamCtl::from_u8(self.read_u8()?)
    }

    pub fn read_ack(&mut self) -> Result<()> {
        let v = self.read_u32()?;
        if v != ACK_VALUE {
            return Err(NetError::Protocol(format!("bad ack value {v:#x}")));
        }
        Ok(())
    }

    /// Flush and hand back the write half (tests and tooling).
    pub fn into_writer(mut self) -> W {
        self.w.flush().expect("flush into buffered writer");
        match self.w.into_inner() {
            Ok(w) => w,
            Err(_) => unreachable!("flushed writer cannot fail on into_inner"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn loopback() -> (Packet<Cursor<Vec<u8>>, Vec<u8>>, fn(Vec<u8>) -> Packet<Cursor<Vec<u8>>, Vec<u8>>) {
        (
            Packet::new(Cursor::new(Vec::new()), Vec::new()),
            |bytes| Packet::new(Cursor::new(bytes), Vec::new()),
        )
    }

    fn written(pkt: Packet<Cursor<Vec<u8>>, Vec<u8>>) -> Vec<u8> {
        pkt.into_writer()
    }

    #[test]
    fn test_typed_round_trip() {
        let (mut tx, rx) = loopback();
        tx.write_u8(7).unwrap();
        tx.write_u32(0xdeadbeef).unwrap();
        tx.write_u64(1 << 40).unwrap();
        tx.write_str("hello").unwrap();
        tx.write_str_vec(&["a".into(), "bc".into()]).unwrap();
        let uuid = Uuid::new_v4();
        tx.write_uuid(&uuid).unwrap();
        tx.write_ctrl(StreamCtl::Next).unwrap();
        tx.write_ack().unwrap();

        let mut p = rx(written(tx));
        assert_eq!(p.read_u8().unwrap(), 7);
        assert_eq!(p.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(p.read_u64().unwrap(), 1 << 40);
        assert_eq!(p.read_str().unwrap(), "hello");
        assert_eq!(p.read_str_vec().unwrap(), vec!["a".to_string(), "bc".to_string()]);
        assert_eq!(p.read_uuid().unwrap(), uuid);
        assert_eq!(p.read_ctrl().unwrap(), StreamCtl::Next);
        p.read_ack().unwrap();
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(u32::MAX).to_le_bytes());
        let (_, rx) = loopback();
        let mut p = rx(bytes);
        assert!(matches!(p.read_bytes(), Err(NetError::Protocol(_))));
    }

    #[test]
    fn test_bad_ctrl_byte_rejected() {
        let (_, rx) = loopback();
        let mut p = rx(vec![9]);
        assert!(p.read_ctrl().is_err());
    }

    #[test]
    fn test_bad_ack_rejected() {
        let (_, rx) = loopback();
        let mut p = rx(5u32.to_le_bytes().to_vec());
        assert!(p.read_ack().is_err());
    }
}
