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

//! The storage daemon: drives full and hash backups of each protected
//! volume against the archive, and ships WAL packs to the proxies.
//!
//! A protected volume is a data device plus its WAL ring device; the ring
//! lives at `<wdevPath>.wal` (the kernel pairing of data view and log
//! device, expressed as a sibling-path convention for file-backed setups).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use uuid::Uuid;

use walship_core::block_io::{BlockDevice, SeqBlockReader};
use walship_core::codec::{self, CodecKind};
use walship_core::throughput::ThroughputStabilizer;
use walship_core::util::{now_unix, persist_file, read_text_file};
use walship_core::{checksum, LOGICAL_BLOCK_SIZE};
use walship_format::wlog::{LogPackBuilder, LogPackIter, SuperBlock};
use walship_format::{Gid, MetaDiff, VolumeDir};
use walship_net::packet::StreamCtl;
use walship_net::proto::{write_meta_diff, HT_STORAGE, MSG_OK, PROTO_FULL_SYNC, PROTO_HASH_SYNC,
    PROTO_WLOG_TRANSFER, SocketParams};
use walship_net::transport::LogSender;

use crate::error::{DaemonError, Result};
use crate::server::{connect_and_negotiate, Handler, ProcessStatus, ServerParams};
use crate::state_machine::{SmTransaction, VolState};
use crate::stop::Stopper;
use crate::task_queue::TaskQueue;
use crate::vol_map::VolMap;

// Stable states.
pub const S_CLEAR: &str = "Clear";
pub const S_SYNC_READY: &str = "SyncReady";
pub const S_STOPPED: &str = "Stopped";
pub const S_MASTER: &str = "Master";
pub const S_SLAVE: &str = "Slave";

// Transient states.
const T_INIT_VOL: &str = "InitVol";
const T_CLEAR_VOL: &str = "ClearVol";
const T_RESET: &str = "Reset";
const T_FULL_SYNC: &str = "FullSync";
const T_HASH_SYNC: &str = "HashSync";
const T_START_MASTER: &str = "StartMaster";
const T_STOP_MASTER: &str = "StopMaster";
const T_START_SLAVE: &str = "StartSlave";
const T_STOP_SLAVE: &str = "StopSlave";
const T_WLOG_SEND: &str = "WlogSend";
const T_WLOG_REMOVE: &str = "WlogRemove";

const TRANSITION_TBL: &[(&str, &str)] = &[
    (S_CLEAR, T_INIT_VOL),
    (T_INIT_VOL, S_SYNC_READY),
    (S_SYNC_READY, T_CLEAR_VOL),
    (T_CLEAR_VOL, S_CLEAR),
    (S_SYNC_READY, T_START_SLAVE),
    (T_START_SLAVE, S_SLAVE),
    (S_SLAVE, T_STOP_SLAVE),
    (T_STOP_SLAVE, S_SYNC_READY),
    (S_SLAVE, T_WLOG_REMOVE),
    (T_WLOG_REMOVE, S_SLAVE),
    (S_SYNC_READY, T_FULL_SYNC),
    (T_FULL_SYNC, S_STOPPED),
    (S_SYNC_READY, T_HASH_SYNC),
    (T_HASH_SYNC, S_STOPPED),
    (S_STOPPED, T_RESET),
    (T_RESET, S_SYNC_READY),
    (S_STOPPED, T_START_MASTER),
    (T_START_MASTER, S_MASTER),
    (S_MASTER, T_STOP_MASTER),
    (T_STOP_MASTER, S_STOPPED),
    (S_MASTER, T_WLOG_SEND),
    (T_WLOG_SEND, S_MASTER),
];

const STABLE_STATES: &[&str] = &[S_CLEAR, S_SYNC_READY, S_STOPPED, S_MASTER, S_SLAVE];

const WDEV_PATH_FILE: &str = "wdev_path";
const NEXT_GID_FILE: &str = "next_gid";

/// Interval between WAL polls of a master volume.
const WLOG_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Retry backoff when a proxy is unreachable.
const WLOG_RETRY_DELAY: Duration = Duration::from_secs(10);

pub struct StorageCtx {
    pub node_id: String,
    pub base_dir: PathBuf,
    pub archive_addr: String,
    pub proxies: Vec<String>,
    pub vols: VolMap<VolState>,
    pub queue: TaskQueue<String>,
    pub ps: Arc<ProcessStatus>,
    pub sock_params: SocketParams,
    /// Bulk sync rate cap [logical blocks per second]; 0 disables.
    pub max_sync_lb_per_sec: u64,
}

impl StorageCtx {
    pub fn new(
        node_id: String,
        base_dir: PathBuf,
        archive_addr: String,
        proxies: Vec<String>,
        ps: Arc<ProcessStatus>,
        sock_params: SocketParams,
    ) -> Self {
        Self {
            node_id,
            base_dir,
            archive_addr,
            proxies,
            vols: VolMap::new(),
            queue: TaskQueue::new(),
            ps,
            sock_params,
            max_sync_lb_per_sec: 0,
        }
    }

    pub fn volume_dir(&self, vol_id: &str) -> VolumeDir {
        VolumeDir::new(&self.base_dir, vol_id)
    }

    pub fn vol_state(&self, vol_id: &str) -> Arc<VolState> {
        self.vols.get_or_create(vol_id, |id| {
            let vs = VolState::new(id, TRANSITION_TBL, S_CLEAR);
            let vol = VolumeDir::new(&self.base_dir, id);
            if vol.exists() {
                match vol.get_state() {
                    Ok(state) => {
                        if let Err(e) = vs.mu.lock().sm.set(&state) {
                            warn!(vol_id = id, error = %e, "bad persisted state");
                        }
                    }
                    Err(e) => warn!(vol_id = id, error = %e, "failed to read state file"),
                }
            }
            vs
        })
    }
}

/// Storage-specific files inside the volume directory.
fn wdev_path(vol: &VolumeDir) -> Result<PathBuf> {
    Ok(PathBuf::from(read_text_file(
        &vol.path().join(WDEV_PATH_FILE),
    )?))
}

fn wlog_path(wdev: &Path) -> PathBuf {
    let mut s = wdev.as_os_str().to_os_string();
    s.push(".wal");
    PathBuf::from(s)
}

fn get_next_gid(vol: &VolumeDir) -> Result<Gid> {
    let text = read_text_file(&vol.path().join(NEXT_GID_FILE))?;
    text.parse()
        .map_err(|_| DaemonError::Other(format!("bad next_gid file: {text}")))
}

fn set_next_gid(vol: &VolumeDir, gid: Gid) -> Result<()> {
    persist_file(vol.path(), NEXT_GID_FILE, format!("{gid}\n").as_bytes())?;
    Ok(())
}

/// Reset the WAL ring: everything before `written_lsid` is dropped. An
/// unformatted ring device is formatted first.
fn reset_wlog(wdev: &Path) -> Result<()> {
    let path = wlog_path(wdev);
    if !path.exists() {
        return Ok(());
    }
    let mut dev = BlockDevice::open_rw(&path)?;
    let mut sb = match SuperBlock::read_from(&mut dev) {
        Ok(sb) => sb,
        Err(_) => {
            let salt = (SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0))
                ^ 0x5eed;
            LogPackBuilder::format(&mut dev, 4096, salt)?
        }
    };
    sb.oldest_lsid = sb.written_lsid;
    sb.write_to(&mut dev)?;
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

// ---------------------------------------------------------------------------
// Control commands
// ---------------------------------------------------------------------------

fn c2s_status(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
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
        lines.push(format!("state {}", vs.state()));
        if vol.exists() {
            if let Ok(path) = wdev_path(&vol) {
                lines.push(format!("wdev-path {}", path.display()));
                if let Ok(meta) = fs::metadata(&path) {
                    lines.push(format!("size-lb {}", meta.len() / LOGICAL_BLOCK_SIZE as u64));
                }
            }
            if let Ok(uuid) = vol.get_uuid() {
                lines.push(format!("uuid {uuid}"));
            }
            if let Ok(gid) = get_next_gid(&vol) {
                lines.push(format!("next-gid {gid}"));
            }
        }
    }
    p.pkt.write_str(MSG_OK)?;
    p.pkt.write_str_vec(&lines)?;
    p.pkt.flush()?;
    Ok(())
}

fn c2s_init_vol(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = &params[0];
    let wdev = &params[1];

    let vs = ctx.vol_state(vol_id);
    let tran = SmTransaction::begin(&vs, S_CLEAR, T_INIT_VOL)?;

    let vol = ctx.volume_dir(vol_id);
    vol.create()?;
    persist_file(vol.path(), WDEV_PATH_FILE, format!("{wdev}\n").as_bytes())?;
    vol.set_uuid(Uuid::new_v4())?;
    set_next_gid(&vol, 0)?;
    vol.set_state(S_SYNC_READY)?;
    tran.commit(S_SYNC_READY)?;

    p.pkt.write_ack()?;
    info!(vol_id, wdev, "volume initialized");
    Ok(())
}

fn c2s_clear_vol(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 1)?;
    let vol_id = &params[0];

    let vs = ctx.vol_state(vol_id);
    let tran = SmTransaction::begin(&vs, S_SYNC_READY, T_CLEAR_VOL)?;
    ctx.volume_dir(vol_id).remove()?;
    tran.commit(S_CLEAR)?;

    p.pkt.write_ack()?;
    info!(vol_id, "volume cleared");
    Ok(())
}

fn c2s_reset_vol(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 1)?;
    let vol_id = &params[0];
    let gid: Option<Gid> = params
        .get(1)
        .map(|s| s.parse())
        .transpose()
        .map_err(|_| DaemonError::BadRequest("bad gid".into()))?;

    let vs = ctx.vol_state(vol_id);
    let tran = SmTransaction::begin(&vs, S_STOPPED, T_RESET)?;

    let vol = ctx.volume_dir(vol_id);
    reset_wlog(&wdev_path(&vol)?)?;
    if let Some(gid) = gid {
        set_next_gid(&vol, gid)?;
    }
    vol.set_state(S_SYNC_READY)?;
    tran.commit(S_SYNC_READY)?;

    p.pkt.write_ack()?;
    info!(vol_id, "volume reset");
    Ok(())
}

fn c2s_start(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = params[0].clone();
    let is_master = params[1] == "master";

    let vs = ctx.vol_state(&vol_id);
    let vol = ctx.volume_dir(&vol_id);
    if is_master {
        let tran = SmTransaction::begin(&vs, S_STOPPED, T_START_MASTER)?;
        vol.set_state(S_MASTER)?;
        tran.commit(S_MASTER)?;
        ctx.queue.push(vol_id.clone(), Duration::ZERO);
    } else {
        let tran = SmTransaction::begin(&vs, S_SYNC_READY, T_START_SLAVE)?;
        vol.set_state(S_SLAVE)?;
        tran.commit(S_SLAVE)?;
    }
    p.pkt.write_ack()?;
    info!(vol_id, master = is_master, "started");
    Ok(())
}

fn c2s_stop(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = params[0].clone();
    let force = params[1] != "0";

    let vs = ctx.vol_state(&vol_id);
    let Some(_stopper) = Stopper::new(&vs, force) else {
        p.pkt.write_ack()?;
        return Ok(());
    };

    // Wait while any transient state is live.
    vs.wait_until(Duration::from_secs(600), |inner| {
        STABLE_STATES.contains(&inner.sm.get())
    })?;

    let vol = ctx.volume_dir(&vol_id);
    match vs.state() {
        S_MASTER => {
            let tran = SmTransaction::begin(&vs, S_MASTER, T_STOP_MASTER)?;
            vol.set_state(S_STOPPED)?;
            tran.commit(S_STOPPED)?;
        }
        S_SLAVE => {
            let tran = SmTransaction::begin(&vs, S_SLAVE, T_STOP_SLAVE)?;
            vol.set_state(S_SYNC_READY)?;
            tran.commit(S_SYNC_READY)?;
        }
        _ => {} // nothing to stop for SyncReady / Stopped / Clear
    }

    p.pkt.write_ack()?;
    info!(vol_id, force, "stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Full backup (client side against the archive)
// ---------------------------------------------------------------------------

fn c2s_full_bkp(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = params[0].clone();
    let bulk_lb: u64 = params[1]
        .parse()
        .map_err(|_| DaemonError::BadRequest("bad bulkLb".into()))?;
    if bulk_lb == 0 {
        let msg = "bulkLb is zero";
        p.pkt.write_str(msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::BadRequest(msg.into()));
    }

    let vs = ctx.vol_state(&vol_id);
    if vs.stop.is_stopping() {
        let msg = format!("stopping {vol_id}");
        p.pkt.write_str(&msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::Stopped);
    }
    let tran = SmTransaction::begin(&vs, S_SYNC_READY, T_FULL_SYNC)?;

    let vol = ctx.volume_dir(&vol_id);
    let wdev = wdev_path(&vol)?;
    reset_wlog(&wdev)?;
    let dev = BlockDevice::open_read(&wdev)?;
    let size_lb = dev.size_lb();
    let uuid = vol.get_uuid()?;
    let cur_time = now_unix();

    let (_stream, mut apkt) = connect_and_negotiate(
        &ctx.archive_addr,
        &ctx.node_id,
        PROTO_FULL_SYNC,
        &ctx.sock_params,
    )?;
    apkt.write_str(HT_STORAGE)?;
    apkt.write_str(&vol_id)?;
    apkt.write_uuid(&uuid)?;
    apkt.write_u64(size_lb)?;
    apkt.write_u64(cur_time)?;
    apkt.write_u64(bulk_lb)?;
    apkt.flush()?;
    let res = apkt.read_str()?;
    if res != MSG_OK {
        p.pkt.write_str(&res)?;
        p.pkt.flush()?;
        return Err(DaemonError::Other(format!("archive refused full sync: {res}")));
    }

    // The controller's part is done once the archive accepted.
    p.pkt.write_str(MSG_OK)?;
    p.pkt.flush()?;

    let mut reader = SeqBlockReader::new(dev, 0, SeqBlockReader::DEFAULT_BUFFER_SIZE)?;
    let mut stabilizer = ThroughputStabilizer::new(ctx.max_sync_lb_per_sec);
    let mut buf = vec![0u8; bulk_lb as usize * LOGICAL_BLOCK_SIZE];
    let mut remaining_lb = size_lb;
    while remaining_lb > 0 {
        if vs.stop.is_force() || ctx.ps.is_force_shutdown() {
            warn!(vol_id, "full backup force-stopped");
            return Ok(()); // roll back to SyncReady
        }
        let lb = bulk_lb.min(remaining_lb);
        let chunk = &mut buf[..lb as usize * LOGICAL_BLOCK_SIZE];
        reader.read(chunk)?;
        let enc = codec::compress(CodecKind::Snappy, 0, chunk)?;
        apkt.write_bytes(&enc)?;
        remaining_lb -= lb;
        stabilizer.add_and_sleep_if_necessary(
            lb,
            Duration::from_millis(10),
            Duration::from_millis(1000),
        );
    }
    apkt.flush()?;

    // Name the initial snapshot.
    apkt.write_u64(0)?;
    apkt.write_u64(0)?;
    apkt.flush()?;
    apkt.read_ack()?;

    set_next_gid(&vol, 1)?;
    vol.set_state(S_STOPPED)?;
    tran.commit(S_STOPPED)?;

    let tran = SmTransaction::begin(&vs, S_STOPPED, T_START_MASTER)?;
    vol.set_state(S_MASTER)?;
    tran.commit(S_MASTER)?;
    ctx.queue.push(vol_id.clone(), Duration::ZERO);

    info!(vol_id, size_lb, "full backup done");
    Ok(())
}

// ---------------------------------------------------------------------------
// Hash backup (client side against the archive)
// ---------------------------------------------------------------------------

fn c2s_hash_bkp(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = params[0].clone();
    let bulk_lb: u64 = params[1]
        .parse()
        .map_err(|_| DaemonError::BadRequest("bad bulkLb".into()))?;
    if bulk_lb == 0 {
        let msg = "bulkLb is zero";
        p.pkt.write_str(msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::BadRequest(msg.into()));
    }

    let vs = ctx.vol_state(&vol_id);
    if vs.stop.is_stopping() {
        let msg = format!("stopping {vol_id}");
        p.pkt.write_str(&msg)?;
        p.pkt.flush()?;
        return Err(DaemonError::Stopped);
    }
    let tran = SmTransaction::begin(&vs, S_SYNC_READY, T_HASH_SYNC)?;

    let vol = ctx.volume_dir(&vol_id);
    let wdev = wdev_path(&vol)?;
    reset_wlog(&wdev)?;
    let dev = BlockDevice::open_read(&wdev)?;
    let size_lb = dev.size_lb();
    let uuid = vol.get_uuid()?;
    let gid = get_next_gid(&vol)?;

    let (_stream, mut apkt) = connect_and_negotiate(
        &ctx.archive_addr,
        &ctx.node_id,
        PROTO_HASH_SYNC,
        &ctx.sock_params,
    )?;
    apkt.write_str(&vol_id)?;
    apkt.write_uuid(&uuid)?;
    apkt.write_u64(size_lb)?;
    apkt.write_u64(bulk_lb)?;
    apkt.write_u64(gid)?;
    apkt.write_u64(gid)?;
    apkt.flush()?;
    let res = apkt.read_str()?;
    if res != MSG_OK {
        p.pkt.write_str(&res)?;
        p.pkt.flush()?;
        return Err(DaemonError::Other(format!("archive refused hash sync: {res}")));
    }
    p.pkt.write_str(MSG_OK)?;
    p.pkt.flush()?;

    // Collect the archive's hash for every bulk, then send differing bulks.
    let salt = apkt.read_u32()?;
    let n_bulks = size_lb.div_ceil(bulk_lb);
    let mut hashes = Vec::with_capacity(n_bulks as usize);
    for _ in 0..n_bulks {
        hashes.push(apkt.read_u32()?);
    }

    let mut reader = SeqBlockReader::new(dev, 0, SeqBlockReader::DEFAULT_BUFFER_SIZE)?;
    let mut buf = vec![0u8; bulk_lb as usize * LOGICAL_BLOCK_SIZE];
    let mut addr = 0u64;
    let mut sent = 0u64;
    for remote in hashes {
        if vs.stop.is_force() || ctx.ps.is_force_shutdown() {
            warn!(vol_id, "hash backup force-stopped");
            apkt.write_ctrl(StreamCtl::Error)?;
            return Ok(());
        }
        let lb = bulk_lb.min(size_lb - addr);
        let chunk = &mut buf[..lb as usize * LOGICAL_BLOCK_SIZE];
        reader.read(chunk)?;
        if checksum(chunk, salt) != remote {
            apkt.write_ctrl(StreamCtl::Next)?;
            apkt.write_u64(addr)?;
            apkt.write_bytes(&codec::compress(CodecKind::Snappy, 0, chunk)?)?;
            sent += 1;
        }
        addr += lb;
    }
    apkt.write_ctrl(StreamCtl::End)?;
    apkt.flush()?;
    apkt.read_ack()?;

    set_next_gid(&vol, gid + 1)?;
    vol.set_state(S_STOPPED)?;
    tran.commit(S_STOPPED)?;

    let tran = SmTransaction::begin(&vs, S_STOPPED, T_START_MASTER)?;
    vol.set_state(S_MASTER)?;
    tran.commit(S_MASTER)?;
    ctx.queue.push(vol_id.clone(), Duration::ZERO);

    info!(vol_id, gid, bulks_sent = sent, "hash backup done");
    Ok(())
}

// ---------------------------------------------------------------------------
// Snapshot and wlog shipping
// ---------------------------------------------------------------------------

fn c2s_snapshot(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 1)?;
    let vol_id = params[0].clone();

    let vs = ctx.vol_state(&vol_id);
    if vs.state() != S_MASTER {
        return Err(DaemonError::State(format!(
            "snapshot requires {S_MASTER} state"
        )));
    }
    let vol = ctx.volume_dir(&vol_id);
    let gid = get_next_gid(&vol)?;
    ctx.queue.push(vol_id.clone(), Duration::ZERO);

    p.pkt.write_str(MSG_OK)?;
    p.pkt.write_str_vec(&[gid.to_string()])?;
    p.pkt.write_ack()?;
    info!(vol_id, gid, "snapshot requested");
    Ok(())
}

fn c2s_kick(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
    for vol_id in ctx.vols.keys() {
        let vs = ctx.vol_state(&vol_id);
        if vs.state() == S_MASTER {
            ctx.queue.push(vol_id, Duration::ZERO);
        }
    }
    p.pkt.write_ack()?;
    Ok(())
}

fn c2s_get(ctx: &Arc<StorageCtx>, p: &mut ServerParams) -> Result<()> {
    use walship_net::proto::*;

    let params = parse_params(p, 1)?;
    let target = params[0].as_str();
    let lines: Vec<String> = match target {
        TN_HOST_TYPE => vec![HT_STORAGE.to_string()],
        TN_VOL => {
            let mut v = ctx.vols.keys();
            v.sort();
            v
        }
        TN_STATE => {
            let vol_id = params
                .get(1)
                .ok_or_else(|| DaemonError::BadRequest("missing volId".into()))?;
            vec![ctx.vol_state(vol_id).state().to_string()]
        }
        TN_UUID => {
            let vol_id = params
                .get(1)
                .ok_or_else(|| DaemonError::BadRequest("missing volId".into()))?;
            vec![ctx.volume_dir(vol_id).get_uuid()?.to_string()]
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

/// One shipping round for a master volume: read `[oldest, written)` off the
/// WAL ring, convert the gid range into a diff, send to every proxy, then
/// advance the ring's oldest lsid.
fn ship_wlog_once(ctx: &Arc<StorageCtx>, vol_id: &str) -> Result<bool> {
    let vs = ctx.vol_state(vol_id);
    let tran = SmTransaction::begin(&vs, S_MASTER, T_WLOG_SEND)?;

    let vol = ctx.volume_dir(vol_id);
    let wdev = wdev_path(&vol)?;
    let wlog = wlog_path(&wdev);
    if !wlog.exists() {
        tran.commit(S_MASTER)?;
        return Ok(false);
    }
    let mut dev = BlockDevice::open_rw(&wlog)?;
    let sb = SuperBlock::read_from(&mut dev)?;
    if sb.written_lsid <= sb.oldest_lsid {
        tran.commit(S_MASTER)?;
        return Ok(false);
    }
    let (begin, end) = (sb.oldest_lsid, sb.written_lsid);
    let size_lb = BlockDevice::open_read(&wdev)?.size_lb();
    let uuid = vol.get_uuid()?;
    // next_gid is the end gid of the next diff to create; the begin gid is
    // the volume's current snapshot.
    let gid_e = get_next_gid(&vol)?;
    if gid_e == 0 {
        return Err(DaemonError::State("volume has no initial snapshot".into()));
    }
    let diff = MetaDiff::clean_step(gid_e - 1, gid_e)?
        .with_mergeable(true)
        .with_timestamp(now_unix());

    for proxy in &ctx.proxies {
        if vs.stop.is_force() || ctx.ps.is_force_shutdown() {
            return Err(DaemonError::Stopped);
        }
        let (stream, mut ppkt) = connect_and_negotiate(
            proxy,
            &ctx.node_id,
            PROTO_WLOG_TRANSFER,
            &ctx.sock_params,
        )?;
        ppkt.write_str(vol_id)?;
        ppkt.write_uuid(&uuid)?;
        ppkt.write_u32(sb.pbs)?;
        ppkt.write_u32(sb.salt)?;
        ppkt.write_u64(size_lb)?;
        write_meta_diff(&mut ppkt, &diff)?;
        ppkt.flush()?;
        let res = ppkt.read_str()?;
        if res != MSG_OK {
            return Err(DaemonError::Other(format!(
                "proxy {proxy} refused wlog transfer: {res}"
            )));
        }

        let log_dev = BlockDevice::open_read(&wlog)?;
        let mut iter = LogPackIter::new(log_dev, sb, begin, end)?;
        let sender = LogSender::start(stream.try_clone()?, sb.pbs, sb.salt);
        let mut aborted = false;
        while let Some((header, ios)) = iter.next_pack()? {
            if vs.stop.is_force() || ctx.ps.is_force_shutdown() {
                aborted = true;
                break;
            }
            sender.push_header(&header)?;
            for (rec, io) in header.records.iter().zip(&ios) {
                sender.push_io(rec, &io.data)?;
            }
        }
        if aborted {
            sender.fail();
            return Err(DaemonError::Stopped);
        }
        sender.sync()?;
        ppkt.read_ack()?;
    }

    // All proxies took the range: advance the ring and the gid counter.
    // Re-read the super block first; the log producer owns written_lsid
    // and may have advanced it meanwhile.
    let mut sb = SuperBlock::read_from(&mut dev)?;
    sb.oldest_lsid = end;
    sb.write_to(&mut dev)?;
    set_next_gid(&vol, gid_e + 1)?;
    tran.commit(S_MASTER)?;
    info!(vol_id, begin, end, gid = gid_e, "wlog range shipped");
    Ok(true)
}

/// Background worker: polls master volumes and ships their WAL ranges.
pub fn run_wlog_worker(ctx: Arc<StorageCtx>) {
    while ctx.ps.is_running() {
        let Some(vol_id) = ctx.queue.pop_wait() else {
            return;
        };
        let vs = ctx.vol_state(&vol_id);
        if vs.state() != S_MASTER || vs.stop.is_stopping() {
            continue; // re-queued by the next start
        }
        match ship_wlog_once(&ctx, &vol_id) {
            Ok(_) => ctx.queue.push(vol_id, WLOG_POLL_INTERVAL),
            Err(DaemonError::Stopped) => {
                info!(vol_id, "wlog shipping stopped");
            }
            Err(e) => {
                warn!(vol_id, error = %e, "wlog shipping failed, will retry");
                ctx.queue.push(vol_id, WLOG_RETRY_DELAY);
            }
        }
    }
}

/// The storage daemon's protocol dispatch table.
pub fn storage_handlers() -> HashMap<&'static str, Handler<StorageCtx>> {
    use walship_net::proto::*;

    let mut m: HashMap<&'static str, Handler<StorageCtx>> = HashMap::new();
    m.insert(CN_STATUS, c2s_status);
    m.insert(CN_INIT_VOL, c2s_init_vol);
    m.insert(CN_CLEAR_VOL, c2s_clear_vol);
    m.insert(CN_RESET_VOL, c2s_reset_vol);
    m.insert(CN_START, c2s_start);
    m.insert(CN_STOP, c2s_stop);
    m.insert(CN_FULL_BKP, c2s_full_bkp);
    m.insert(CN_HASH_BKP, c2s_hash_bkp);
    m.insert(CN_SNAPSHOT, c2s_snapshot);
    m.insert(CN_KICK, c2s_kick);
    m.insert(CN_GET, c2s_get);
    m
}
