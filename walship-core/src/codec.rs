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

//! Pluggable compression codecs.
//!
//! Diff records, bulk sync chunks and streamed frames carry a one-byte codec
//! tag; the tag values are part of the on-disk and on-wire formats and must
//! never be renumbered.

use std::io::Read;

use crate::error::{CoreError, Result};

/// Codec identifier. `u8` values are stable on disk and on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// Store bytes unmodified.
    #[default]
    AsIs = 0,
    Snappy = 1,
    Zlib = 2,
    Xz = 3,
}

impl CodecKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CodecKind::AsIs),
            1 => Some(CodecKind::Snappy),
            2 => Some(CodecKind::Zlib),
            3 => Some(CodecKind::Xz),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CodecKind::AsIs => "none",
            CodecKind::Snappy => "snappy",
            CodecKind::Zlib => "gzip",
            CodecKind::Xz => "lzma",
        }
    }

    /// Parse the textual form used by the CLI (`none|snappy|gzip|lzma`).
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CodecKind::AsIs),
            "snappy" => Ok(CodecKind::Snappy),
            "gzip" => Ok(CodecKind::Zlib),
            "lzma" => Ok(CodecKind::Xz),
            _ => Err(CoreError::InvalidArgument(format!("unknown codec: {s}"))),
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compress `data` with the given codec. `level` is ignored by `AsIs` and
/// `Snappy`; Zlib accepts 0-9 and Xz 0-9.
pub fn compress(kind: CodecKind, level: u32, data: &[u8]) -> Result<Vec<u8>> {
    match kind {
        CodecKind::AsIs => Ok(data.to_vec()),
        CodecKind::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| CoreError::Codec(format!("snappy compress: {e}"))),
        CodecKind::Zlib => {
            let mut enc = flate2::read::ZlibEncoder::new(
                data,
                flate2::Compression::new(level.min(9)),
            );
            let mut out = Vec::with_capacity(data.len() / 2 + 16);
            enc.read_to_end(&mut out)?;
            Ok(out)
        }
        CodecKind::Xz => {
            let mut enc = xz2::read::XzEncoder::new(data, level.min(9));
            let mut out = Vec::with_capacity(data.len() / 2 + 64);
            enc.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// Uncompress `data`; the caller states the exact uncompressed size and a
/// mismatch is a hard error, never a short read.
pub fn uncompress(kind: CodecKind, data: &[u8], orig_size: usize) -> Result<Vec<u8>> {
    let out = match kind {
        CodecKind::AsIs => data.to_vec(),
        CodecKind::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| CoreError::Codec(format!("snappy uncompress: {e}")))?,
        CodecKind::Zlib => {
            let mut dec = flate2::read::ZlibDecoder::new(data);
            let mut out = Vec::with_capacity(orig_size);
            dec.read_to_end(&mut out)?;
            out
        }
        CodecKind::Xz => {
            let mut dec = xz2::read::XzDecoder::new(data);
            let mut out = Vec::with_capacity(orig_size);
            dec.read_to_end(&mut out)?;
            out
        }
    };
    if out.len() != orig_size {
        return Err(CoreError::Codec(format!(
            "uncompressed size mismatch: got {} expected {}",
            out.len(),
            orig_size
        )));
    }
    Ok(out)
}
