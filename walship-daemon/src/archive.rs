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

//! The archive daemon: receives full images and wdiffs per volume, applies
//! and merges them, and materializes restorable point-in-time images.
//!
//! Volume images are plain files in the volume directory (volume-manager
//! integration stays outside this daemon); restored snapshots land next to
//! them as `restored-<gid>` files.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use walship_core::codec::{self, CodecKind};
use walship_core::util::now_unix;
use walship_core::{checksum, LOGICAL_BLOCK_SIZE};
use walship_format::meta::{MetaSnap, MetaState, Relation, TAG_TOO_NEW};
use walship_format::merge::DiffMerger;
use walship_format::virt::{SeekableBase, VirtualFullReader};
use walship_format::wdiff::{DiffFileHeader, DiffReader, DiffRecordKind, DiffWriter};
use walship_format::{Gid, MetaDiff, VolumeDir};
use walship_net::packet::StreamCtl;
use walship_net::proto::{
    read_meta_diff, HT_ARCHIVE, HT_PROXY, HT_STORAGE, MSG_ARCHIVE_NOT_FOUND, MSG_DIFFERENT_UUID,
    MSG_OK, MSG_SMALLER_LV_SIZE, MSG_STOPPED,
};
use walship_net::transport::recv_diff_file_with;

use crate::action_counter::{verify_no_action_running, ActionToken};
use crate::error::{DaemonError, Result};
use crate::server::{Handler, ServerParams};
use crate::state_machine::{SmTransaction, VolState};
use crate::stop::Stopper;
use crate::vol_map::VolMap;

// Stable states.
pub const S_CLEAR: &str = "Clear";
pub const S_SYNC_READY: &str = "SyncReady";
pub const S_ARCHIVED: &str = "Archived";
pub const S_STOPPED: &str = "Stopped";

// Transient states.
const T_INIT_VOL: &str = "InitVol";
const T_CLEAR_VOL: &str = "ClearVol";
const T_RESET_VOL: &str = "ResetVol";
const T_FULL_SYNC: &str = "FullSync";
const T_HASH_SYNC: &str = "HashSync";
const T_WDIFF_RECV: &str = "WdiffRecv";
const T_STOP: &str = "Stop";
const T_START: &str = "Start";

const TRANSITION_TBL: &[(&str, &str)] = &[
    (S_CLEAR, T_INIT_VOL),
    (T_INIT_VOL, S_SYNC_READY),
    (S_SYNC_READY, T_CLEAR_VOL),
    (T_CLEAR_VOL, S_CLEAR),
    (S_SYNC_READY, T_FULL_SYNC),
    (T_FULL_SYNC, S_ARCHIVED),
    (S_ARCHIVED, T_HASH_SYNC),
    (T_HASH_SYNC, S_ARCHIVED),
    (S_ARCHIVED, T_WDIFF_RECV),
    (T_WDIFF_RECV, S_ARCHIVED),
    (S_ARCHIVED, T_STOP),
    (T_STOP, S_STOPPED),
    (S_STOPPED, T_CLEAR_VOL),
    (S_STOPPED, T_START),
    (T_START, S_ARCHIVED),
    (S_STOPPED, T_RESET_VOL),
    (T_RESET_VOL, S_SYNC_READY),
];

// Actions.
pub const A_MERGE: &str = "Merge";
pub const A_APPLY: &str = "Apply";
pub const A_RESTORE: &str = "Restore";
pub const A_RESIZE: &str = "Resize";

const ALL_ACTIONS: &[&str] = &[A_MERGE, A_APPLY, A_RESTORE, A_RESIZE];

const IMAGE_FILE: &str = "image";
const RESTORED_PREFIX: &str = "restored-";

/// Read-only archive daemon context; per-volume mutability lives in `vols`.
pub struct ArchiveCtx {
    pub node_id: String,
    pub base_dir: PathBuf,
    pub vols: VolMap<VolState>,
}

impl ArchiveCtx {
    pub fn new(node_id: String, base_dir: PathBuf) -> Self {
        Self {
            node_id,
            base_dir,
            vols: VolMap::new(),
        }
    }

    pub fn volume_dir(&self, vol_id: &str) -> VolumeDir {
        VolumeDir::new(&self.base_dir, vol_id)
    }

    /// Per-volume state, rehydrated from the volume directory on first
    /// touch.
    pub fn vol_state(&self, vol_id: &str) -> Arc<VolState> {
        self.vols.get_or_create(vol_id, |id| {
            let vs = VolState::new(id, TRANSITION_TBL, S_CLEAR);
            let vol = VolumeDir::new(&self.base_dir, id);
            if vol.exists() {
                let mut guard = vs.mu.lock();
                match vol.get_state() {
                    Ok(state) => {
                        if let Err(e) = guard.sm.set(&state) {
                            warn!(vol_id = id, error = %e, "bad persisted state");
                        }
                    }
                    Err(e) => warn!(vol_id = id, error = %e, "failed to read state file"),
                }
                if let Err(e) = vol.reload(&mut guard.diff_mgr) {
                    warn!(vol_id = id, error = %e, "failed to reload wdiffs");
                }
            }
            vs
        })
    }

    fn image_path(&self, vol_id: &str) -> PathBuf {
        self.volume_dir(vol_id).path().join(IMAGE_FILE)
    }

    fn restored_path(&self, vol_id: &str, gid: Gid) -> PathBuf {
        self.volume_dir(vol_id)
            .path()
            .join(format!("{RESTORED_PREFIX}{gid}"))
    }
}

fn verify_not_stopping(vol: &VolState) -> Result<()> {
    if vol.stop.is_stopping() {
        return Err(DaemonError::Stopped);
    }
    Ok(())
}

fn parse_params(p: &mut ServerParams, min: usize) -> Result<Vec<String>> {
    let v = p.pkt.read_str_vec()?;
    if v.len() < min || v.iter().any(|s| s.is_empty()) {
        return Err(DaemonError::BadRequest(format!(
            "expected at least {min} non-empty parameters"
        )));
    }
    Ok(v)
}

/// Open a merger over the given diffs of a volume.
fn open_merger(
    vol_dir: &VolumeDir,
    diffs: &[MetaDiff],
    validate_uuid: bool,
) -> Result<DiffMerger<File>> {
    let mut merger = DiffMerger::new();
    merger.set_validate_uuid(validate_uuid);
    for diff in diffs {
        let file = File::open(vol_dir.wdiff_path(diff))?;
        merger.add_source(DiffReader::new(file)?, *diff)?;
    }
    merger.prepare()?;
    Ok(merger)
}

// ---------------------------------------------------------------------------
// Control commands
// ---------------------------------------------------------------------------

fn c2a_status(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = p.pkt.read_str_vec()?;
    let mut lines = Vec::new();
    if params.is_empty() {
        for vol_id in ctx.vols.keys() {
            let vs = ctx.vol_state(&vol_id);
            lines.push(format!("{vol_id} {}", vs.state()));
        }
        lines.sort();
    } else {
        let vol_id = &params[0];
        let vs = ctx.vol_state(vol_id);
        let vol = ctx.volume_dir(vol_id);
        let guard = vs.mu.lock();
        lines.push(format!("state {}", guard.sm.get()));
        if vol.exists() {
            if let Ok(st) = vol.get_meta_state() {
                lines.push(format!("base {st}"));
                lines.push(format!("latest {}", guard.diff_mgr.get_latest_snapshot(&st)));
            }
            if let Ok(uuid) = vol.get_uuid() {
                lines.push(format!("uuid {uuid}"));
            }
            let diffs = guard.diff_mgr.all();
            lines.push(format!("num-wdiff {}", diffs.len()));
            lines.push(format!("wdiff-size {}", vol.total_wdiff_size(&diffs)));
            if let Ok(meta) = fs::metadata(ctx.image_path(vol_id)) {
                lines.push(format!("image-size-lb {}", meta.len() / LOGICAL_BLOCK_SIZE as u64));
            }
        }
        for (name, value) in guard.ac.values(ALL_ACTIONS) {
            if value > 0 {
                lines.push(format!("action {name} {value}"));
            }
        }
    }
    p.pkt.write_str(MSG_OK)?;
    p.pkt.write_str_vec(&lines)?;
    p.pkt.flush()?;
    Ok(())
}

fn c2a_init_vol(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 1)?;
    let vol_id = &params[0];

    let vs = ctx.vol_state(vol_id);
    let mut guard = vs.mu.lock();
    verify_no_action_running(&guard.ac, ALL_ACTIONS)?;
    let tran = SmTransaction::begin_locked(&vs, &mut guard, S_CLEAR, T_INIT_VOL)?;
    drop(guard);

    let vol = ctx.volume_dir(vol_id);
    vol.create()?;
    vol.set_state(S_SYNC_READY)?;
    vol.set_meta_state(&MetaState::new(MetaSnap::clean(0), now_unix()))?;
    tran.commit(S_SYNC_READY)?;

    p.pkt.write_ack()?;
    info!(vol_id, "volume initialized");
    Ok(())
}

fn c2a_clear_vol(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 1)?;
    let vol_id = &params[0];

    let vs = ctx.vol_state(vol_id);
    let mut guard = vs.mu.lock();
    verify_no_action_running(&guard.ac, ALL_ACTIONS)?;
    let tran = SmTransaction::begin_locked_from(
        &vs,
        &mut guard,
        &[S_STOPPED, S_SYNC_READY],
        T_CLEAR_VOL,
    )?;
    guard.diff_mgr.clear();
    drop(guard);

    ctx.volume_dir(vol_id).remove()?;
    tran.commit(S_CLEAR)?;

    p.pkt.write_ack()?;
    info!(vol_id, "volume cleared");
    Ok(())
}

fn c2a_reset_vol(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 1)?;
    let vol_id = &params[0];
    let gid: Gid = params.get(1).map(|s| s.parse()).transpose().map_err(|_| {
        DaemonError::BadRequest("bad gid parameter".into())
    })?.unwrap_or(0);

    let vs = ctx.vol_state(vol_id);
    let mut guard = vs.mu.lock();
    verify_no_action_running(&guard.ac, ALL_ACTIONS)?;
    let tran = SmTransaction::begin_locked(&vs, &mut guard, S_STOPPED, T_RESET_VOL)?;
    drop(guard);

    let vol = ctx.volume_dir(vol_id);
    for diff in vol.scan_wdiffs()? {
        vol.remove_wdiff(&diff)?;
    }
    vol.set_meta_state(&MetaState::new(MetaSnap::clean(gid), now_unix()))?;
    vol.set_state(S_SYNC_READY)?;

    let mut guard = vs.mu.lock();
    guard.diff_mgr.clear();
    drop(guard);
    tran.commit(S_SYNC_READY)?;

    p.pkt.write_ack()?;
    info!(vol_id, gid, "volume reset");
    Ok(())
}

fn c2a_start(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 1)?;
    let vol_id = &params[0];

    let vs = ctx.vol_state(vol_id);
    let mut guard = vs.mu.lock();
    verify_no_action_running(&guard.ac, ALL_ACTIONS)?;
    let tran = SmTransaction::begin_locked(&vs, &mut guard, S_STOPPED, T_START)?;
    drop(guard);

    let vol = ctx.volume_dir(vol_id);
    let persisted = vol.get_state()?;
    if persisted != S_STOPPED {
        return Err(DaemonError::State(format!(
            "persisted state is {persisted}, not {S_STOPPED}"
        )));
    }
    vol.set_state(S_ARCHIVED)?;
    tran.commit(S_ARCHIVED)?;

    p.pkt.write_ack()?;
    Ok(())
}

fn c2a_stop(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = params[0].clone();
    let force = params[1] != "0";

    let vs = ctx.vol_state(&vol_id);
    p.pkt.write_ack()?;

    let Some(_stopper) = Stopper::new(&vs, force) else {
        return Ok(());
    };

    // Wait while any counted action runs or the state is transient.
    vs.wait_until(Duration::from_secs(600), |inner| {
        let stable = matches!(
            inner.sm.get(),
            S_CLEAR | S_SYNC_READY | S_ARCHIVED | S_STOPPED
        );
        stable && inner.ac.is_all_zero(ALL_ACTIONS)
    })?;

    let state = vs.state();
    info!(vol_id, state, "tasks quiesced for stop");
    if state != S_ARCHIVED {
        return Ok(());
    }

    let tran = SmTransaction::begin(&vs, S_ARCHIVED, T_STOP)?;
    let vol = ctx.volume_dir(&vol_id);
    vol.set_state(S_STOPPED)?;
    tran.commit(S_STOPPED)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Full sync (server side)
// ---------------------------------------------------------------------------

fn x2a_dirty_full_sync(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let host_type = p.pkt.read_str()?;
    if host_type != HT_STORAGE && host_type != HT_ARCHIVE {
        return Err(DaemonError::BadRequest(format!("bad host type {host_type}")));
    }
    let vol_id = p.pkt.read_str()?;
    let uuid = p.pkt.read_uuid()?;
    let size_lb = p.pkt.read_u64()?;
    let cur_time = p.pkt.read_u64()?;
    let bulk_lb = p.pkt.read_u64()?;
    if bulk_lb == 0 {
        let msg = "bulkLb is zero";
        p.pkt.write_str(msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::BadRequest(msg.into()));
    }

    let vs = ctx.vol_state(&vol_id);
    let mut guard = vs.mu.lock();
    verify_no_action_running(&guard.ac, ALL_ACTIONS)?;
    if vs.stop.is_stopping() {
        let msg = format!("stopping {vol_id}");
        p.pkt.write_str(&msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::Stopped);
    }
    let tran = SmTransaction::begin_locked(&vs, &mut guard, S_SYNC_READY, T_FULL_SYNC)?;
    drop(guard);

    let vol = ctx.volume_dir(&vol_id);
    let persisted = vol.get_state()?;
    if persisted != S_SYNC_READY {
        return Err(DaemonError::State(format!(
            "persisted state is {persisted}, not {S_SYNC_READY}"
        )));
    }

    // Create the target image of the announced size.
    let image = File::create(ctx.image_path(&vol_id))?;
    image.set_len(size_lb * LOGICAL_BLOCK_SIZE as u64)?;
    let mut out = BufWriter::new(image);

    p.pkt.write_str(MSG_OK)?;
    p.pkt.flush()?;

    let mut remaining_lb = size_lb;
    let mut chunks = 0u64;
    while remaining_lb > 0 {
        if vs.stop.is_force() || p.ps.is_force_shutdown() {
            warn!(vol_id, "full sync force-stopped");
            return Ok(()); // transaction rolls back, nothing is announced
        }
        let lb = bulk_lb.min(remaining_lb);
        let expected = lb as usize * LOGICAL_BLOCK_SIZE;
        let enc = p.pkt.read_bytes()?;
        if enc.is_empty() {
            return Err(DaemonError::BadRequest("empty sync chunk".into()));
        }
        let raw = codec::uncompress(CodecKind::Snappy, &enc, expected)?;
        out.write_all(&raw)?;
        remaining_lb -= lb;
        chunks += 1;
    }
    out.flush()?;
    out.get_ref().sync_data()?;
    info!(vol_id, chunks, "full sync data received");

    let gid_b = p.pkt.read_u64()?;
    let gid_e = p.pkt.read_u64()?;
    vol.set_meta_state(&MetaState::new(MetaSnap::new(gid_b, gid_e)?, cur_time))?;
    vol.set_uuid(uuid)?;
    vol.set_state(S_ARCHIVED)?;
    tran.commit(S_ARCHIVED)?;

    p.pkt.write_ack()?;
    info!(vol_id, size_lb, "full sync done");
    Ok(())
}

// ---------------------------------------------------------------------------
// Hash sync (server side)
// ---------------------------------------------------------------------------

fn x2a_dirty_hash_sync(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let vol_id = p.pkt.read_str()?;
    let uuid = p.pkt.read_uuid()?;
    let size_lb = p.pkt.read_u64()?;
    let bulk_lb = p.pkt.read_u64()?;
    let gid_b = p.pkt.read_u64()?;
    let gid_e = p.pkt.read_u64()?;
    if bulk_lb == 0 {
        let msg = "bulkLb is zero";
        p.pkt.write_str(msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::BadRequest(msg.into()));
    }

    let vs = ctx.vol_state(&vol_id);
    let vol = ctx.volume_dir(&vol_id);

    let mut guard = vs.mu.lock();
    if !vol.exists() {
        p.pkt.write_str(MSG_ARCHIVE_NOT_FOUND)?;
        p.pkt.flush()?;
        return Ok(());
    }
    verify_no_action_running(&guard.ac, ALL_ACTIONS)?;
    if vs.stop.is_stopping() {
        p.pkt.write_str(MSG_STOPPED)?;
        p.pkt.flush()?;
        return Ok(());
    }
    let base = vol.get_meta_state()?;
    let latest = guard.diff_mgr.get_latest_snapshot(&base);
    if !latest.is_clean() {
        let msg = "latest snapshot is dirty";
        p.pkt.write_str(msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::State(msg.into()));
    }
    if gid_b <= latest.gid_b {
        p.pkt.write_str(TAG_TOO_NEW)?; // the archive is ahead of the client
        p.pkt.flush()?;
        return Ok(());
    }
    let image_lb = fs::metadata(ctx.image_path(&vol_id))?.len() / LOGICAL_BLOCK_SIZE as u64;
    if size_lb != image_lb {
        let msg = format!("size mismatch: client {size_lb}, archive {image_lb}");
        p.pkt.write_str(&msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::State(msg));
    }
    let diffs = guard
        .diff_mgr
        .get_applicable_diff_list(&base, latest.gid_b);
    let tran = SmTransaction::begin_locked(&vs, &mut guard, S_ARCHIVED, T_HASH_SYNC)?;
    drop(guard);

    p.pkt.write_str(MSG_OK)?;
    p.pkt.flush()?;

    // Stream a salted hash per bulk of the latest restorable image.
    let salt = now_unix() as u32;
    p.pkt.write_u32(salt)?;
    {
        let base_file = File::open(ctx.image_path(&vol_id))?;
        let merger = if diffs.is_empty() {
            None
        } else {
            Some(open_merger(&vol, &diffs, true)?)
        };
        let mut reader = VirtualFullReader::new(SeekableBase::new(base_file), merger);
        let mut buf = vec![0u8; bulk_lb as usize * LOGICAL_BLOCK_SIZE];
        let mut remaining_lb = size_lb;
        while remaining_lb > 0 {
            if vs.stop.is_force() || p.ps.is_force_shutdown() {
                warn!(vol_id, "hash sync force-stopped");
                return Ok(());
            }
            let lb = bulk_lb.min(remaining_lb);
            let chunk = &mut buf[..lb as usize * LOGICAL_BLOCK_SIZE];
            reader.read_exact(chunk)?;
            p.pkt.write_u32(checksum(chunk, salt))?;
            remaining_lb -= lb;
        }
        p.pkt.flush()?;
    }

    // Receive the differing bulks and write them into a fresh wdiff.
    let diff = MetaDiff::new(latest, MetaSnap::new(gid_b, gid_e)?)?
        .with_timestamp(now_unix());
    let tmp = vol.create_tmp_file()?;
    let header = DiffFileHeader::new(uuid, walship_format::wdiff::DEFAULT_MAX_IO_BLOCKS, salt);
    let mut writer = DiffWriter::new(tmp.as_file().try_clone()?);
    writer.write_header(&header)?;
    let mut received = 0u64;
    loop {
        match p.pkt.read_ctrl()? {
            StreamCtl::Next => {
                let addr = p.pkt.read_u64()?;
                let enc = p.pkt.read_bytes()?;
                let lb = bulk_lb.min(size_lb.saturating_sub(addr));
                let raw =
                    codec::uncompress(CodecKind::Snappy, &enc, lb as usize * LOGICAL_BLOCK_SIZE)?;
                writer.push(
                    DiffRecordKind::Normal,
                    addr,
                    lb as u32,
                    CodecKind::Snappy,
                    &raw,
                )?;
                received += 1;
            }
            StreamCtl::End => break,
            StreamCtl::Error => {
                return Err(DaemonError::Net(walship_net::NetError::Peer(
                    "peer aborted hash sync".into(),
                )))
            }
        }
    }
    writer.close()?;
    tmp.as_file().sync_data()?;
    tmp.persist(vol.wdiff_path(&diff))
        .map_err(|e| DaemonError::Io(e.error))?;

    let mut guard = vs.mu.lock();
    guard.diff_mgr.add(diff)?;
    drop(guard);
    tran.commit(S_ARCHIVED)?;

    p.pkt.write_ack()?;
    info!(vol_id, received, gid = gid_b, "hash sync done");
    Ok(())
}

// ---------------------------------------------------------------------------
// Wdiff transfer (server side)
// ---------------------------------------------------------------------------

fn x2a_wdiff_transfer(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let vol_id = p.pkt.read_str()?;
    if vol_id.is_empty() {
        return Err(DaemonError::BadRequest("empty volId".into()));
    }
    let client_type = p.pkt.read_str()?;
    if client_type != HT_PROXY && client_type != HT_ARCHIVE {
        return Err(DaemonError::BadRequest(format!(
            "bad client type {client_type}"
        )));
    }
    let uuid = p.pkt.read_uuid()?;
    let max_io_blocks = p.pkt.read_u32()?;
    let salt = p.pkt.read_u32()?;
    let diff = read_meta_diff(&mut p.pkt)?;

    let vs = ctx.vol_state(&vol_id);
    let vol = ctx.volume_dir(&vol_id);
    let mut guard = vs.mu.lock();
    verify_not_stopping(&vs)?;

    if !vol.exists() {
        info!(vol_id, reply = MSG_ARCHIVE_NOT_FOUND, "wdiff refused");
        p.pkt.write_str(MSG_ARCHIVE_NOT_FOUND)?;
        p.pkt.flush()?;
        return Ok(());
    }
    if guard.sm.get() == S_STOPPED {
        info!(vol_id, reply = MSG_STOPPED, "wdiff refused");
        p.pkt.write_str(MSG_STOPPED)?;
        p.pkt.flush()?;
        return Ok(());
    }
    if client_type == HT_PROXY && vol.get_uuid()? != uuid {
        info!(vol_id, reply = MSG_DIFFERENT_UUID, "wdiff refused");
        p.pkt.write_str(MSG_DIFFERENT_UUID)?;
        p.pkt.flush()?;
        return Ok(());
    }
    let base = vol.get_meta_state()?;
    let latest = guard.diff_mgr.get_latest_snapshot(&base);
    let rel = guard.diff_mgr.get_relation(latest, &diff);
    if rel != Relation::Applicable {
        info!(vol_id, reply = rel.as_tag(), %diff, %latest, "wdiff refused");
        p.pkt.write_str(rel.as_tag())?;
        p.pkt.flush()?;
        return Ok(());
    }
    let tran = SmTransaction::begin_locked(&vs, &mut guard, S_ARCHIVED, T_WDIFF_RECV)?;
    drop(guard);

    p.pkt.write_str(MSG_OK)?;
    p.pkt.flush()?;

    let tmp = vol.create_tmp_file()?;
    let header = DiffFileHeader::new(uuid, max_io_blocks, salt);
    let mut writer = DiffWriter::new(tmp.as_file().try_clone()?);
    writer.write_header(&header)?;
    let complete = recv_diff_file_with(&mut p.pkt, &mut writer, salt, || {
        !(vs.stop.is_force() || p.ps.is_force_shutdown())
    })?;
    if !complete {
        warn!(vol_id, "wdiff receive force-stopped");
        return Ok(()); // temp file vanishes, transaction rolls back
    }
    writer.close()?;
    tmp.as_file().sync_data()?;
    tmp.persist(vol.wdiff_path(&diff))
        .map_err(|e| DaemonError::Io(e.error))?;

    let mut guard = vs.mu.lock();
    guard.diff_mgr.add(diff)?;
    drop(guard);
    tran.commit(S_ARCHIVED)?;

    p.pkt.write_ack()?;
    info!(vol_id, %diff, "wdiff received");
    Ok(())
}

// ---------------------------------------------------------------------------
// Restore / apply / merge / resize
// ---------------------------------------------------------------------------

fn c2a_restore(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = params[0].clone();
    let gid: Gid = params[1]
        .parse()
        .map_err(|_| DaemonError::BadRequest("bad gid".into()))?;

    let vs = ctx.vol_state(&vol_id);
    let vol = ctx.volume_dir(&vol_id);
    let mut guard = vs.mu.lock();
    verify_not_stopping(&vs)?;
    let cur = guard.sm.get();
    if !matches!(cur, S_ARCHIVED | T_HASH_SYNC | T_WDIFF_RECV) {
        let msg = format!("restore not possible in state {cur}");
        p.pkt.write_str(&msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::State(msg));
    }
    if let Err(e) = verify_no_action_running(&guard.ac, &[A_APPLY, A_MERGE, A_RESIZE]) {
        p.pkt.write_str(&e.to_string())?;
        p.pkt.flush()?;
        return Err(e);
    }
    let base = vol.get_meta_state()?;
    if !guard.diff_mgr.get_restorable_gids(&base).contains(&gid) {
        let msg = format!("gid {gid} is not restorable");
        p.pkt.write_str(&msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::BadRequest(msg));
    }
    let diffs = guard.diff_mgr.get_applicable_diff_list(&base, gid);
    let _token = ActionToken::begin_locked(&vs, &mut guard, A_RESTORE);
    drop(guard);

    let out_path = ctx.restored_path(&vol_id, gid);
    if out_path.exists() {
        let msg = format!("gid {gid} is already restored");
        p.pkt.write_str(&msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::BadRequest(msg));
    }

    // Clone the base image and replay the applicable diffs through the
    // virtual full reader into a fresh target.
    let base_file = File::open(ctx.image_path(&vol_id))?;
    let merger = if diffs.is_empty() {
        None
    } else {
        Some(open_merger(&vol, &diffs, true)?)
    };
    let mut reader = VirtualFullReader::new(SeekableBase::new(base_file), merger);
    let tmp = vol.create_tmp_file()?;
    {
        let mut out = BufWriter::new(tmp.as_file().try_clone()?);
        let mut buf = vec![0u8; 1024 * LOGICAL_BLOCK_SIZE];
        loop {
            if vs.stop.is_force() || p.ps.is_force_shutdown() {
                warn!(vol_id, gid, "restore force-stopped");
                return Err(DaemonError::Stopped);
            }
            let n = reader.read_some(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
        }
        out.flush()?;
    }
    tmp.as_file().sync_data()?;
    tmp.persist(&out_path).map_err(|e| DaemonError::Io(e.error))?;

    p.pkt.write_str(MSG_OK)?;
    p.pkt.flush()?;
    info!(vol_id, gid, "restored");
    Ok(())
}

fn c2a_del_restored(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = &params[0];
    let gid: Gid = params[1]
        .parse()
        .map_err(|_| DaemonError::BadRequest("bad gid".into()))?;
    let path = ctx.restored_path(vol_id, gid);
    if !path.exists() {
        return Err(DaemonError::BadRequest(format!(
            "no restored image for gid {gid}"
        )));
    }
    fs::remove_file(path)?;
    p.pkt.write_ack()?;
    info!(vol_id, gid, "restored image deleted");
    Ok(())
}

fn c2a_list_restored(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 1)?;
    let vol_id = &params[0];
    let mut gids = restored_gids(ctx, vol_id)?;
    gids.sort_unstable();
    let lines: Vec<String> = gids.into_iter().map(|g| g.to_string()).collect();
    p.pkt.write_str(MSG_OK)?;
    p.pkt.write_str_vec(&lines)?;
    p.pkt.flush()?;
    Ok(())
}

fn restored_gids(ctx: &Arc<ArchiveCtx>, vol_id: &str) -> Result<Vec<Gid>> {
    let mut out = Vec::new();
    let dir = ctx.volume_dir(vol_id);
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir.path())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(rest) = name.strip_prefix(RESTORED_PREFIX) {
            if let Ok(gid) = rest.parse() {
                out.push(gid);
            }
        }
    }
    Ok(out)
}

fn c2a_apply(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = params[0].clone();
    let gid: Gid = params[1]
        .parse()
        .map_err(|_| DaemonError::BadRequest("bad gid".into()))?;

    let vs = ctx.vol_state(&vol_id);
    let vol = ctx.volume_dir(&vol_id);
    let mut guard = vs.mu.lock();
    verify_not_stopping(&vs)?;
    if guard.sm.get() != S_ARCHIVED {
        let msg = format!("apply not possible in state {}", guard.sm.get());
        p.pkt.write_str(&msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::State(msg));
    }
    if let Err(e) = verify_no_action_running(&guard.ac, ALL_ACTIONS) {
        p.pkt.write_str(&e.to_string())?;
        p.pkt.flush()?;
        return Err(e);
    }
    let base = vol.get_meta_state()?;
    let diffs = guard.diff_mgr.get_applicable_diff_list(&base, gid);
    let reaches = diffs
        .last()
        .map(|d| d.snap_e == MetaSnap::clean(gid))
        .unwrap_or(base.snap == MetaSnap::clean(gid));
    if !reaches {
        let msg = format!("gid {gid} is not reachable for apply");
        p.pkt.write_str(&msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::BadRequest(msg));
    }
    let _token = ActionToken::begin_locked(&vs, &mut guard, A_APPLY);
    drop(guard);

    if diffs.is_empty() {
        p.pkt.write_str(MSG_OK)?;
        p.pkt.flush()?;
        return Ok(());
    }

    // Mark the apply in progress, then write diff records into the image in
    // place. Overwrites are idempotent, so a crash mid-apply is repaired by
    // applying again.
    vol.set_meta_state(&MetaState {
        snap: base.snap,
        pending: Some(MetaSnap::clean(gid)),
        timestamp: now_unix(),
    })?;

    let mut merger = open_merger(&vol, &diffs, true)?;
    let mut image = OpenOptions::new()
        .read(true)
        .write(true)
        .open(ctx.image_path(&vol_id))?;
    let mut written = 0u64;
    while let Some(rec_io) = merger.pop()? {
        if vs.stop.is_force() || p.ps.is_force_shutdown() {
            warn!(vol_id, gid, "apply force-stopped; pending state kept");
            return Err(DaemonError::Stopped);
        }
        let offset = rec_io.rec.io_address * LOGICAL_BLOCK_SIZE as u64;
        image.seek(SeekFrom::Start(offset))?;
        match rec_io.rec.kind {
            DiffRecordKind::Normal => image.write_all(&rec_io.data)?,
            DiffRecordKind::AllZero | DiffRecordKind::Discard => {
                let zeros = vec![0u8; rec_io.rec.io_blocks as usize * LOGICAL_BLOCK_SIZE];
                image.write_all(&zeros)?;
            }
        }
        written += rec_io.rec.io_blocks as u64;
    }
    image.sync_data()?;

    vol.set_meta_state(&MetaState::new(MetaSnap::clean(gid), now_unix()))?;
    let mut guard = vs.mu.lock();
    for diff in &diffs {
        guard.diff_mgr.remove(diff);
    }
    drop(guard);
    for diff in &diffs {
        vol.remove_wdiff(diff)?;
    }

    p.pkt.write_str(MSG_OK)?;
    p.pkt.flush()?;
    info!(vol_id, gid, written_lb = written, applied = diffs.len(), "apply done");
    Ok(())
}

fn c2a_merge(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 3)?;
    let vol_id = params[0].clone();
    let gid_b: Gid = params[1]
        .parse()
        .map_err(|_| DaemonError::BadRequest("bad gidB".into()))?;
    let gid_e: Gid = params[2]
        .parse()
        .map_err(|_| DaemonError::BadRequest("bad gidE".into()))?;
    let max_size_mb: u64 = params
        .get(3)
        .map(|s| s.parse())
        .transpose()
        .map_err(|_| DaemonError::BadRequest("bad maxSizeMb".into()))?
        .unwrap_or(0);

    let vs = ctx.vol_state(&vol_id);
    let vol = ctx.volume_dir(&vol_id);
    let mut guard = vs.mu.lock();
    verify_not_stopping(&vs)?;
    if let Err(e) = verify_no_action_running(&guard.ac, ALL_ACTIONS) {
        p.pkt.write_str(&e.to_string())?;
        p.pkt.flush()?;
        return Err(e);
    }
    let mut diffs = guard.diff_mgr.get_mergeable_diff_list(gid_b, gid_e);
    if max_size_mb > 0 {
        let mut total = 0u64;
        let limit = max_size_mb << 20;
        diffs.retain(|d| {
            total += vol.total_wdiff_size(&[*d]);
            total <= limit
        });
    }
    if diffs.len() < 2 {
        let msg = format!("nothing to merge at gid {gid_b}");
        p.pkt.write_str(&msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::BadRequest(msg));
    }
    let _token = ActionToken::begin_locked(&vs, &mut guard, A_MERGE);
    drop(guard);

    let mut merger = open_merger(&vol, &diffs, true)?;
    let merged = merger.merged_meta()?.with_timestamp(now_unix());
    let uuid = merger.uuid().unwrap_or_else(Uuid::nil);
    let salt = now_unix() as u32;

    let tmp = vol.create_tmp_file()?;
    let mut writer = DiffWriter::new(tmp.as_file().try_clone()?);
    writer.write_header(&DiffFileHeader::new(uuid, merger.max_io_blocks(), salt))?;
    while let Some(rec_io) = merger.pop()? {
        if vs.stop.is_force() || p.ps.is_force_shutdown() {
            warn!(vol_id, "merge force-stopped");
            return Err(DaemonError::Stopped);
        }
        writer.push(
            rec_io.rec.kind,
            rec_io.rec.io_address,
            rec_io.rec.io_blocks,
            CodecKind::Snappy,
            &rec_io.data,
        )?;
    }
    writer.close()?;
    tmp.as_file().sync_data()?;
    tmp.persist(vol.wdiff_path(&merged))
        .map_err(|e| DaemonError::Io(e.error))?;

    // Install atomically: the composite replaces its inputs.
    let mut guard = vs.mu.lock();
    for diff in &diffs {
        guard.diff_mgr.remove(diff);
    }
    guard.diff_mgr.add(merged)?;
    drop(guard);
    for diff in &diffs {
        vol.remove_wdiff(diff)?;
    }

    p.pkt.write_str(MSG_OK)?;
    p.pkt.flush()?;
    info!(vol_id, %merged, inputs = diffs.len(), "merge done");
    Ok(())
}

fn c2a_resize(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = params[0].clone();
    let new_size_lb = walship_core::util::parse_size_lb(&params[1])?;

    let vs = ctx.vol_state(&vol_id);
    let mut guard = vs.mu.lock();
    verify_not_stopping(&vs)?;
    if let Err(e) = verify_no_action_running(&guard.ac, ALL_ACTIONS) {
        p.pkt.write_str(&e.to_string())?;
        p.pkt.flush()?;
        return Err(e);
    }
    let _token = ActionToken::begin_locked(&vs, &mut guard, A_RESIZE);
    drop(guard);

    let image_path = ctx.image_path(&vol_id);
    let cur_lb = fs::metadata(&image_path)?.len() / LOGICAL_BLOCK_SIZE as u64;
    if new_size_lb < cur_lb {
        p.pkt.write_str(MSG_SMALLER_LV_SIZE)?;
        p.pkt.flush()?;
        return Err(DaemonError::BadRequest(format!(
            "cannot shrink volume from {cur_lb} to {new_size_lb} blocks"
        )));
    }
    let image = OpenOptions::new().write(true).open(&image_path)?;
    image.set_len(new_size_lb * LOGICAL_BLOCK_SIZE as u64)?;
    image.sync_data()?;

    p.pkt.write_str(MSG_OK)?;
    p.pkt.flush()?;
    info!(vol_id, new_size_lb, "resized");
    Ok(())
}

// ---------------------------------------------------------------------------
// Get command
// ---------------------------------------------------------------------------

fn c2a_get(ctx: &Arc<ArchiveCtx>, p: &mut ServerParams) -> Result<()> {
    use walship_net::proto::*;

    let params = parse_params(p, 1)?;
    let target = params[0].as_str();
    let need_vol = |i: usize| -> Result<String> {
        params
            .get(i)
            .cloned()
            .ok_or_else(|| DaemonError::BadRequest("missing volId".into()))
    };

    let lines: Vec<String> = match target {
        TN_HOST_TYPE => vec![HT_ARCHIVE.to_string()],
        TN_VOL => {
            let mut v = ctx.vols.keys();
            v.sort();
            v
        }
        TN_STATE => {
            let vs = ctx.vol_state(&need_vol(1)?);
            vec![vs.state().to_string()]
        }
        TN_UUID => {
            let vol = ctx.volume_dir(&need_vol(1)?);
            vec![vol.get_uuid()?.to_string()]
        }
        TN_BASE => {
            let vol = ctx.volume_dir(&need_vol(1)?);
            vec![vol.get_meta_state()?.to_string()]
        }
        TN_DIFF => {
            let vs = ctx.vol_state(&need_vol(1)?);
            let guard = vs.mu.lock();
            guard.diff_mgr.all().iter().map(|d| d.to_string()).collect()
        }
        TN_RESTORABLE => {
            let vol_id = need_vol(1)?;
            let vs = ctx.vol_state(&vol_id);
            let vol = ctx.volume_dir(&vol_id);
            let base = vol.get_meta_state()?;
            let guard = vs.mu.lock();
            guard
                .diff_mgr
                .get_restorable_gids(&base)
                .into_iter()
                .map(|g| g.to_string())
                .collect()
        }
        TN_RESTORED => {
            let mut gids = restored_gids(ctx, &need_vol(1)?)?;
            gids.sort_unstable();
            gids.into_iter().map(|g| g.to_string()).collect()
        }
        TN_VOL_SIZE => {
            let vol_id = need_vol(1)?;
            let lb = fs::metadata(ctx.image_path(&vol_id))?.len() / LOGICAL_BLOCK_SIZE as u64;
            vec![lb.to_string()]
        }
        TN_NUM_ACTION => {
            let vs = ctx.vol_state(&need_vol(1)?);
            let guard = vs.mu.lock();
            guard
                .ac
                .values(ALL_ACTIONS)
                .into_iter()
                .map(|(n, v)| format!("{n} {v}"))
                .collect()
        }
        _ => {
            return Err(DaemonError::BadRequest(format!(
                "no such get target: {target}"
            )))
        }
    };

    p.pkt.write_str(MSG_OK)?;
    p.pkt.write_str_vec(&lines)?;
    p.pkt.write_ack()?;
    Ok(())
}

/// The archive daemon's protocol dispatch table.
pub fn archive_handlers() -> HashMap<&'static str, Handler<ArchiveCtx>> {
    use walship_net::proto::*;

    let mut m: HashMap<&'static str, Handler<ArchiveCtx>> = HashMap::new();
    m.insert(CN_STATUS, c2a_status);
    m.insert(CN_INIT_VOL, c2a_init_vol);
    m.insert(CN_CLEAR_VOL, c2a_clear_vol);
    m.insert(CN_RESET_VOL, c2a_reset_vol);
    m.insert(CN_START, c2a_start);
    m.insert(CN_STOP, c2a_stop);
    m.insert(CN_RESTORE, c2a_restore);
    m.insert(CN_DEL_RESTORED, c2a_del_restored);
    m.insert(CN_LIST_RESTORED, c2a_list_restored);
    m.insert(CN_APPLY, c2a_apply);
    m.insert(CN_MERGE, c2a_merge);
    m.insert(CN_RESIZE, c2a_resize);
    m.insert(CN_GET, c2a_get);
    m.insert(PROTO_FULL_SYNC, x2a_dirty_full_sync);
    m.insert(PROTO_HASH_SYNC, x2a_dirty_hash_sync);
    m.insert(PROTO_WDIFF_TRANSFER, x2a_wdiff_transfer);
    m
}
