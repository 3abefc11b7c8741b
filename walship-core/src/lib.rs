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

//! Shared primitives for the walship continuous-data-protection pipeline.
//!
//! Everything in this crate is daemon-agnostic: salted checksums, the
//! pluggable compression codecs, direct block-device I/O with sequential
//! read-ahead, the bounded queue used by the streaming pipelines, atomic
//! file publication, and throughput control.

pub mod block_io;
pub mod checksum;
pub mod codec;
pub mod error;
pub mod queue;
pub mod throughput;
pub mod util;

pub use checksum::{checksum, SaltedHasher};
pub use codec::CodecKind;
pub use error::{CoreError, Result};
pub use queue::{BoundedQueue, Popped};

/// Logical block size used by all application-level addressing [bytes].
pub const LOGICAL_BLOCK_SIZE: usize = 512;

/// Largest physical block size we accept from a device [bytes].
pub const MAX_PHYSICAL_BLOCK_SIZE: usize = 64 * 1024;

/// Convert a logical block count to bytes.
#[inline]
pub const fn lb_to_bytes(lb: u64) -> u64 {
    lb * LOGICAL_BLOCK_SIZE as u64
}

/// Convert a byte count to logical blocks; the caller guarantees alignment.
#[inline]
pub const fn bytes_to_lb(bytes: u64) -> u64 {
    bytes / LOGICAL_BLOCK_SIZE as u64
}
