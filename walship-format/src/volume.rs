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

//! The persistent per-volume directory.
//!
//! `<base_dir>/<vol_id>/` holds:
//! - `state`: the volume's stable state as one line of text
//! - `uuid`: the source volume uuid
//! - `base`: the binary [`MetaState`] record
//! - `*.wdiff`: the differential files, named after their [`MetaDiff`]
//!
//! Every file is updated by writing a temp file in the directory and
//! renaming it over the target.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use uuid::Uuid;
use walship_core::util::{persist_file, read_text_file};

use crate::diff_mgr::MetaDiffManager;
use crate::error::{FormatError, Result};
use crate::meta::{MetaDiff, MetaState};

const STATE_FILE: &str = "state";
const UUID_FILE: &str = "uuid";
const BASE_FILE: &str = "base";

#[derive(Debug, Clone)]
pub struct VolumeDir {
    dir: PathBuf,
    vol_id: String,
}

impl VolumeDir {
    pub fn new(base_dir: &Path, vol_id: &str) -> Self {
        Self {
            dir: base_dir.join(vol_id),
            vol_id: vol_id.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn vol_id(&self) -> &str {
        &self.vol_id
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Remove the directory and everything inside it.
    pub fn remove(&self) -> Result<()> {
        if self.dir.is_dir() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    pub fn get_state(&self) -> Result<String> {
        Ok(read_text_file(&self.dir.join(STATE_FILE))?)
    }

    pub fn set_state(&self, state: &str) -> Result<()> {
        persist_file(&self.dir, STATE_FILE, format!("{state}\n").as_bytes())?;
        Ok(())
    }

    pub fn get_uuid(&self) -> Result<Uuid> {
        let text = read_text_file(&self.dir.join(UUID_FILE))?;
        Uuid::parse_str(&text)
            .map_err(|_| FormatError::BadMeta(format!("bad uuid file content: {text}")))
    }

    pub fn set_uuid(&self, uuid: Uuid) -> Result<()> {
        persist_file(&self.dir, UUID_FILE, format!("{uuid}\n").as_bytes())?;
        Ok(())
    }

    pub fn get_meta_state(&self) -> Result<MetaState> {
        let bytes = fs::read(self.dir.join(BASE_FILE))?;
        MetaState::decode(&bytes)
    }

    pub fn set_meta_state(&self, state: &MetaState) -> Result<()> {
        persist_file(&self.dir, BASE_FILE, &state.encode())?;
        Ok(())
    }

    pub fn wdiff_path(&self, diff: &MetaDiff) -> PathBuf {
        self.dir.join(diff.file_name())
    }

    /// A temp file in the volume directory, renamed into place by the
    /// caller once the content is durable.
    pub fn create_tmp_file(&self) -> Result<NamedTempFile> {
        Ok(NamedTempFile::new_in(&self.dir)?)
    }

    /// Parse every `*.wdiff` file name in the directory. Timestamps come
    /// from file modification times. Unparseable names are skipped.
    pub fn scan_wdiffs(&self) -> Result<Vec<MetaDiff>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".wdiff") {
                continue;
            }
            let Ok(mut diff) = MetaDiff::parse_file_name(name) else {
                tracing::warn!(vol_id = %self.vol_id, file = name, "skipping unparseable wdiff name");
                continue;
            };
            if let Ok(meta) = entry.metadata() {
                if let Ok(mtime) = meta.modified() {
                    if let Ok(d) = mtime.duration_since(std::time::UNIX_EPOCH) {
                        diff.timestamp = d.as_secs();
                    }
                }
            }
            out.push(diff);
        }
        out.sort_by_key(|d| d.key());
        Ok(out)
    }

    /// Rebuild a diff manager from the directory contents.
    pub fn reload(&self, mgr: &mut MetaDiffManager) -> Result<()> {
        mgr.clear();
        for diff in self.scan_wdiffs()? {
            if let Err(e) = mgr.add(diff) {
                tracing::warn!(vol_id = %self.vol_id, diff = %diff, error = %e,
                    "skipping conflicting wdiff during reload");
            }
        }
        Ok(())
    }

    pub fn remove_wdiff(&self, diff: &MetaDiff) -> Result<()> {
        let path = self.wdiff_path(diff);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Sum of the on-disk sizes of the given diffs [bytes].
    pub fn total_wdiff_size(&self, diffs: &[MetaDiff]) -> u64 {
        diffs
            .iter()
            .filter_map(|d| fs::metadata(self.wdiff_path(d)).ok())
            .map(|m| m.len())
            .sum()
    }
}
