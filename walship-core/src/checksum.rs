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

//! Salted CRC32 checksums.
//!
//! Every persistent structure (WAL packs, diff packs, metadata records) and
//! every bulk payload on the wire is protected by a CRC32 that folds a
//! per-device or per-file salt in front of the data, so a record copied
//! between devices with different salts never verifies.

/// Checksum of `data` with `salt` mixed in front.
pub fn checksum(data: &[u8], salt: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&salt.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

/// Incremental variant of [`checksum`] for data that arrives in pieces.
pub struct SaltedHasher {
    inner: crc32fast::Hasher,
}

impl SaltedHasher {
    pub fn new(salt: u32) -> Self {
        let mut inner = crc32fast::Hasher::new();
        inner.update(&salt.to_le_bytes());
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.inner.finalize()
    }
}
