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

//! Small filesystem and parsing helpers.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CoreError, Result};
use crate::LOGICAL_BLOCK_SIZE;

/// Atomically publish `data` as `dir/name`: write to a temp file in the same
/// directory, fsync, then rename over the target.
pub fn persist_file(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name))
        .map_err(|e| CoreError::Io(e.error))?;
    Ok(())
}

/// Read a single-line text file, trimming trailing whitespace.
pub fn read_text_file(path: &Path) -> Result<String> {
    let s = fs::read_to_string(path)?;
    Ok(s.trim_end().to_string())
}

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Parse a size string with an optional `k`/`m`/`g`/`t` suffix into bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    if s.is_empty() {
        return Err(CoreError::InvalidArgument("empty size string".into()));
    }
    let (digits, multiplier) = match s.as_bytes()[s.len() - 1].to_ascii_lowercase() {
        b'k' => (&s[..s.len() - 1], 1u64 << 10),
        b'm' => (&s[..s.len() - 1], 1u64 << 20),
        b'g' => (&s[..s.len() - 1], 1u64 << 30),
        b't' => (&s[..s.len() - 1], 1u64 << 40),
        _ => (s, 1u64),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| CoreError::InvalidArgument(format!("bad size string: {s}")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| CoreError::InvalidArgument(format!("size overflow: {s}")))
}

/// Parse a size string into logical blocks; the byte value must be
/// block-aligned.
pub fn parse_size_lb(s: &str) -> Result<u64> {
    let bytes = parse_size(s)?;
    if bytes % LOGICAL_BLOCK_SIZE as u64 != 0 {
        return Err(CoreError::InvalidArgument(format!(
            "size {s} is not a multiple of the logical block size"
        )));
    }
    Ok(bytes / LOGICAL_BLOCK_SIZE as u64)
}
