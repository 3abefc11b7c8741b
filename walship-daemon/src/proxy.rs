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

//! The proxy daemon: receives WAL pack streams from storage daemons,
//! aggregates them into per-snapshot wdiff files, and forwards those to
//! every configured archive with per-archive compression and delay.
//!
//! Layout per volume: `<base>/<volId>/{state, uuid, archive_info}` plus one
//! queue directory per archive id holding the wdiffs still to send. A
//! received wdiff is written once and hard-linked into every queue.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use walship_core::codec::CodecKind;
use walship_core::util::persist_file;
use walship_core::LOGICAL_BLOCK_SIZE;
use walship_format::meta::TAG_TOO_OLD;
use walship_format::wdiff::{
    DiffFileHeader, DiffReader, DiffRecordKind, DiffWriter, DEFAULT_MAX_IO_BLOCKS,
};
use walship_format::{MetaDiff, VolumeDir};
use walship_net::proto::{
    write_meta_diff, SocketParams, HT_PROXY, MSG_ARCHIVE_NOT_FOUND, MSG_OK, MSG_STOPPED,
    PROTO_WDIFF_TRANSFER,
};
use walship_net::transport::{send_diff_file, LogReceiver};

use crate::error::{DaemonError, Result};
use crate::server::{connect_and_negotiate, Handler, ProcessStatus, ServerParams};
use crate::state_machine::{SmTransaction, VolState};
use crate::stop::Stopper;
use crate::task_queue::TaskQueue;
use crate::vol_map::VolMap;

// Stable states.
pub const S_CLEAR: &str = "Clear";
pub const S_STOPPED: &str = "Stopped";
pub const S_STARTED: &str = "Started";

// Transient states.
const T_ADD_ARCHIVE_INFO: &str = "AddArchiveInfo";
const T_DELETE_ARCHIVE_INFO: &str = "DeleteArchiveInfo";
const T_START: &str = "Start";
const T_STOP: &str = "Stop";
const T_CLEAR_VOL: &str = "ClearVol";
const T_WLOG_RECV: &str = "WlogRecv";

const TRANSITION_TBL: &[(&str, &str)] = &[
    (S_CLEAR, T_ADD_ARCHIVE_INFO),
    (T_ADD_ARCHIVE_INFO, S_STOPPED),
    (S_STOPPED, T_ADD_ARCHIVE_INFO),
    (S_STOPPED, T_DELETE_ARCHIVE_INFO),
    (T_DELETE_ARCHIVE_INFO, S_STOPPED),
    (T_DELETE_ARCHIVE_INFO, S_CLEAR),
    (S_STOPPED, T_START),
    (T_START, S_STARTED),
    (S_STARTED, T_STOP),
    (T_STOP, S_STOPPED),
    (S_STOPPED, T_CLEAR_VOL),
    (T_CLEAR_VOL, S_CLEAR),
    (S_STARTED, T_WLOG_RECV),
    (T_WLOG_RECV, S_STARTED),
];

const STABLE_STATES: &[&str] = &[S_CLEAR, S_STOPPED, S_STARTED];

const ARCHIVE_INFO_FILE: &str = "archive_info";

/// Retry backoff when an archive refuses or is unreachable.
const SEND_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Per-archive forwarding settings, persisted as one JSON file per volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub addr: String,
    /// `<kind>:<level>:<nCpu>`, e.g. `snappy:0:1`.
    pub cmpr: String,
    pub delay_sec: u64,
}

impl ArchiveInfo {
    pub fn codec(&self) -> Result<(CodecKind, u32)> {
        let mut it = self.cmpr.split(':');
        let kind = CodecKind::parse(it.next().unwrap_or("snappy"))
            .map_err(|e| DaemonError::BadRequest(e.to_string()))?;
        let level: u32 = it
            .next()
            .unwrap_or("0")
            .parse()
            .map_err(|_| DaemonError::BadRequest(format!("bad cmpr string: {}", self.cmpr)))?;
        Ok((kind, level))
    }
}

type ArchiveInfoMap = BTreeMap<String, ArchiveInfo>;

pub struct ProxyCtx {
    pub node_id: String,
    pub base_dir: PathBuf,
    pub vols: VolMap<VolState>,
    pub queue: TaskQueue<(String, String)>,
    pub ps: Arc<ProcessStatus>,
    pub sock_params: SocketParams,
}

impl ProxyCtx {
    pub fn new(
        node_id: String,
        base_dir: PathBuf,
        ps: Arc<ProcessStatus>,
        sock_params: SocketParams,
    ) -> Self {
        Self {
            node_id,
            base_dir,
            vols: VolMap::new(),
            queue: TaskQueue::new(),
            ps,
            sock_params,
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

    fn archive_dir(&self, vol_id: &str, archive_id: &str) -> PathBuf {
        self.volume_dir(vol_id).path().join(archive_id)
    }

    fn load_archive_info(&self, vol_id: &str) -> Result<ArchiveInfoMap> {
        let path = self.volume_dir(vol_id).path().join(ARCHIVE_INFO_FILE);
        if !path.exists() {
            return Ok(ArchiveInfoMap::new());
        }
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| DaemonError::Other(format!("bad archive info file: {e}")))
    }

    fn save_archive_info(&self, vol_id: &str, map: &ArchiveInfoMap) -> Result<()> {
        let text = serde_json::to_string_pretty(map)
            .map_err(|e| DaemonError::Other(format!("archive info encode: {e}")))?;
        persist_file(
            self.volume_dir(vol_id).path(),
            ARCHIVE_INFO_FILE,
            text.as_bytes(),
        )?;
        Ok(())
    }

    /// Queue a send task for every archive of a volume.
    pub fn kick_volume(&self, vol_id: &str) -> Result<()> {
        for archive_id in self.load_archive_info(vol_id)?.keys() {
            self.queue
                .push((vol_id.to_string(), archive_id.clone()), Duration::ZERO);
        }
        Ok(())
    }

    /// Rehydrate volumes found on disk and requeue their pending sends.
    pub fn bootstrap(&self) -> Result<()> {
        if !self.base_dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(vol_id) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let vs = self.vol_state(&vol_id);
            if vs.state() == S_STARTED {
                self.kick_volume(&vol_id)?;
            }
        }
        Ok(())
    }
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

fn c2p_status(ctx: &Arc<ProxyCtx>, p: &mut ServerParams) -> Result<()> {
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
        lines.push(format!("state {}", vs.state()));
        for (id, inf) in ctx.load_archive_info(vol_id)? {
            let pending = pending_wdiffs(ctx, vol_id, &id)?.len();
            lines.push(format!(
                "archive {id} {} {} delay {} pending {pending}",
                inf.addr, inf.cmpr, inf.delay_sec
            ));
        }
    }
    p.pkt.write_str(MSG_OK)?;
    p.pkt.write_str_vec(&lines)?;
    p.pkt.flush()?;
    Ok(())
}

fn c2p_archive_info(ctx: &Arc<ProxyCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let subcmd = params[0].as_str();
    let vol_id = params[1].clone();

    match subcmd {
        "add" | "update" => {
            let archive_id = params
                .get(2)
                .cloned()
                .ok_or_else(|| DaemonError::BadRequest("missing archiveId".into()))?;
            let addr = params
                .get(3)
                .cloned()
                .ok_or_else(|| DaemonError::BadRequest("missing addr:port".into()))?;
            let cmpr = params.get(4).cloned().unwrap_or_else(|| "snappy:0:1".into());
            let delay_sec: u64 = params
                .get(5)
                .map(|s| s.parse())
                .transpose()
                .map_err(|_| DaemonError::BadRequest("bad delay".into()))?
                .unwrap_or(0);
            let info = ArchiveInfo {
                addr,
                cmpr,
                delay_sec,
            };
            info.codec()?; // validate early

            let vs = ctx.vol_state(&vol_id);
            let tran = SmTransaction::begin_locked_from(
                &vs,
                &mut vs.mu.lock(),
                &[S_CLEAR, S_STOPPED],
                T_ADD_ARCHIVE_INFO,
            )?;
            let vol = ctx.volume_dir(&vol_id);
            vol.create()?;
            let mut map = ctx.load_archive_info(&vol_id)?;
            if subcmd == "update" && !map.contains_key(&archive_id) {
                return Err(DaemonError::BadRequest(format!(
                    "unknown archive id {archive_id}"
                )));
            }
            fs::create_dir_all(ctx.archive_dir(&vol_id, &archive_id))?;
            map.insert(archive_id.clone(), info);
            ctx.save_archive_info(&vol_id, &map)?;
            vol.set_state(S_STOPPED)?;
            tran.commit(S_STOPPED)?;
            p.pkt.write_ack()?;
            info!(vol_id, archive_id, "archive info saved");
        }
        "delete" => {
            let archive_id = params
                .get(2)
                .cloned()
                .ok_or_else(|| DaemonError::BadRequest("missing archiveId".into()))?;
            let vs = ctx.vol_state(&vol_id);
            let tran = SmTransaction::begin_locked(
                &vs,
                &mut vs.mu.lock(),
                S_STOPPED,
                T_DELETE_ARCHIVE_INFO,
            )?;
            let mut map = ctx.load_archive_info(&vol_id)?;
            if map.remove(&archive_id).is_none() {
                return Err(DaemonError::BadRequest(format!(
                    "unknown archive id {archive_id}"
                )));
            }
            let dir = ctx.archive_dir(&vol_id, &archive_id);
            if dir.is_dir() {
                fs::remove_dir_all(dir)?;
            }
            ctx.save_archive_info(&vol_id, &map)?;
            if map.is_empty() {
                ctx.volume_dir(&vol_id).remove()?;
                tran.commit(S_CLEAR)?;
            } else {
                tran.commit(S_STOPPED)?;
            }
            p.pkt.write_ack()?;
            info!(vol_id, archive_id, "archive info deleted");
        }
        "get" => {
            let archive_id = params
                .get(2)
                .ok_or_else(|| DaemonError::BadRequest("missing archiveId".into()))?;
            let map = ctx.load_archive_info(&vol_id)?;
            let inf = map.get(archive_id).ok_or_else(|| {
                DaemonError::BadRequest(format!("unknown archive id {archive_id}"))
            })?;
            p.pkt.write_str(MSG_OK)?;
            p.pkt
                .write_str_vec(&[format!("{} {} {}", inf.addr, inf.cmpr, inf.delay_sec)])?;
            p.pkt.flush()?;
        }
        "list" => {
            let map = ctx.load_archive_info(&vol_id)?;
            let ids: Vec<String> = map.keys().cloned().collect();
            p.pkt.write_str(MSG_OK)?;
            p.pkt.write_str_vec(&ids)?;
            p.pkt.flush()?;
        }
        _ => {
            return Err(DaemonError::BadRequest(format!(
                "bad archive-info subcommand {subcmd}"
            )))
        }
    }
    Ok(())
}

fn c2p_start(ctx: &Arc<ProxyCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 1)?;
    let vol_id = params[0].clone();

    let vs = ctx.vol_state(&vol_id);
    let tran = SmTransaction::begin(&vs, S_STOPPED, T_START)?;
    ctx.volume_dir(&vol_id).set_state(S_STARTED)?;
    tran.commit(S_STARTED)?;
    ctx.kick_volume(&vol_id)?;

    p.pkt.write_ack()?;
    info!(vol_id, "started");
    Ok(())
}

fn c2p_stop(ctx: &Arc<ProxyCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 2)?;
    let vol_id = params[0].clone();
    let force = params[1] != "0";

    let vs = ctx.vol_state(&vol_id);
    let Some(_stopper) = Stopper::new(&vs, force) else {
        p.pkt.write_ack()?;
        return Ok(());
    };

    vs.wait_until(Duration::from_secs(600), |inner| {
        STABLE_STATES.contains(&inner.sm.get())
    })?;

    if vs.state() == S_STARTED {
        let tran = SmTransaction::begin(&vs, S_STARTED, T_STOP)?;
        ctx.volume_dir(&vol_id).set_state(S_STOPPED)?;
        tran.commit(S_STOPPED)?;
    }

    p.pkt.write_ack()?;
    info!(vol_id, force, "stopped");
    Ok(())
}

fn c2p_clear_vol(ctx: &Arc<ProxyCtx>, p: &mut ServerParams) -> Result<()> {
    let params = parse_params(p, 1)?;
    let vol_id = &params[0];

    let vs = ctx.vol_state(vol_id);
    let tran = SmTransaction::begin(&vs, S_STOPPED, T_CLEAR_VOL)?;
    ctx.volume_dir(vol_id).remove()?;
    tran.commit(S_CLEAR)?;

    p.pkt.write_ack()?;
    info!(vol_id, "volume cleared");
    Ok(())
}

fn c2p_kick(ctx: &Arc<ProxyCtx>, p: &mut ServerParams) -> Result<()> {
    for vol_id in ctx.vols.keys() {
        if ctx.vol_state(&vol_id).state() == S_STARTED {
            ctx.kick_volume(&vol_id)?;
        }
    }
    p.pkt.write_ack()?;
    Ok(())
}

fn c2p_get(ctx: &Arc<ProxyCtx>, p: &mut ServerParams) -> Result<()> {
    use walship_net::proto::*;

    let params = parse_params(p, 1)?;
    let target = params[0].as_str();
    let lines: Vec<String> = match target {
        TN_HOST_TYPE => vec![HT_PROXY.to_string()],
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

// ---------------------------------------------------------------------------
// Wlog receive and conversion
// ---------------------------------------------------------------------------

fn s2p_wlog_transfer(ctx: &Arc<ProxyCtx>, p: &mut ServerParams) -> Result<()> {
    let vol_id = p.pkt.read_str()?;
    let uuid = p.pkt.read_uuid()?;
    let pbs = p.pkt.read_u32()?;
    let salt = p.pkt.read_u32()?;
    let _size_lb = p.pkt.read_u64()?;
    let diff = walship_net::proto::read_meta_diff(&mut p.pkt)?;

    let vs = ctx.vol_state(&vol_id);
    let vol = ctx.volume_dir(&vol_id);
    let archives = ctx.load_archive_info(&vol_id)?;
    let mut guard = vs.mu.lock();
    if !vol.exists() || archives.is_empty() {
        p.pkt.write_str(MSG_ARCHIVE_NOT_FOUND)?;
        p.pkt.flush()?;
        return Ok(());
    }
    if guard.sm.get() != S_STARTED || vs.stop.is_stopping() {
        p.pkt.write_str(MSG_STOPPED)?;
        p.pkt.flush()?;
        return Ok(());
    }
    let tran = SmTransaction::begin_locked(&vs, &mut guard, S_STARTED, T_WLOG_RECV)?;
    drop(guard);

    vol.set_uuid(uuid)?;
    p.pkt.write_str(MSG_OK)?;
    p.pkt.flush()?;

    // Convert the log pack stream into one wdiff file.
    let tmp = vol.create_tmp_file()?;
    let header = DiffFileHeader::new(uuid, DEFAULT_MAX_IO_BLOCKS, salt);
    let mut writer = DiffWriter::new(tmp.as_file().try_clone()?);
    writer.write_header(&header)?;

    let mut receiver = LogReceiver::start(p.stream.try_clone()?, pbs, salt);
    let mut n_records = 0u64;
    loop {
        if vs.stop.is_force() || p.ps.is_force_shutdown() {
            warn!(vol_id, "wlog receive force-stopped");
            receiver.fail();
            return Ok(()); // rollback; storage retries the range
        }
        let Some(pack) = receiver.pop_header()? else {
            break;
        };
        for rec in &pack.records {
            let data = receiver.pop_io(rec)?;
            if rec.is_padding() {
                continue;
            }
            if rec.is_discard() {
                writer.push(
                    DiffRecordKind::Discard,
                    rec.io_address_lb,
                    rec.io_size_lb,
                    CodecKind::AsIs,
                    &[],
                )?;
            } else {
                debug_assert_eq!(data.len(), rec.io_size_lb as usize * LOGICAL_BLOCK_SIZE);
                writer.push(
                    DiffRecordKind::Normal,
                    rec.io_address_lb,
                    rec.io_size_lb,
                    CodecKind::Snappy,
                    &data,
                )?;
            }
            n_records += 1;
        }
    }
    writer.close()?;
    tmp.as_file().sync_data()?;

    // One file, hard-linked into every archive queue.
    let name = diff.file_name();
    for archive_id in archives.keys() {
        let dst = ctx.archive_dir(&vol_id, archive_id).join(&name);
        fs::hard_link(tmp.path(), &dst).or_else(|_| fs::copy(tmp.path(), &dst).map(|_| ()))?;
    }
    for (archive_id, inf) in &archives {
        ctx.queue.push(
            (vol_id.clone(), archive_id.clone()),
            Duration::from_secs(inf.delay_sec),
        );
    }

    tran.commit(S_STARTED)?;
    p.pkt.write_ack()?;
    info!(vol_id, %diff, n_records, "wlog converted to wdiff");
    Ok(())
}

// ---------------------------------------------------------------------------
// Wdiff forwarding
// ---------------------------------------------------------------------------

fn pending_wdiffs(ctx: &Arc<ProxyCtx>, vol_id: &str, archive_id: &str) -> Result<Vec<MetaDiff>> {
    let dir = ctx.archive_dir(vol_id, archive_id);
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Ok(diff) = MetaDiff::parse_file_name(name) {
            out.push(diff);
        }
    }
    out.sort_by_key(|d| d.key());
    Ok(out)
}

/// Re-encode a wdiff with another codec before sending, when the archive's
/// setting differs from the stored one.
fn transcode_wdiff(
    src: &std::path::Path,
    vol: &VolumeDir,
    kind: CodecKind,
    level: u32,
) -> Result<tempfile::NamedTempFile> {
    let mut reader = DiffReader::new(File::open(src)?)?;
    let header = *reader.header();
    let tmp = vol.create_tmp_file()?;
    let mut writer = DiffWriter::new(tmp.as_file().try_clone()?);
    writer.set_level(level);
    writer.write_header(&header)?;
    while let Some(rec_io) = reader.next_rec_io()? {
        writer.push(
            rec_io.rec.kind,
            rec_io.rec.io_address,
            rec_io.rec.io_blocks,
            if rec_io.rec.has_payload() {
                kind
            } else {
                CodecKind::AsIs
            },
            &rec_io.data,
        )?;
    }
    writer.close()?;
    Ok(tmp)
}

/// Send the oldest pending wdiff of (volume, archive). Returns `true` when
/// another send should be scheduled immediately.
fn send_one_wdiff(ctx: &Arc<ProxyCtx>, vol_id: &str, archive_id: &str) -> Result<bool> {
    let archives = ctx.load_archive_info(vol_id)?;
    let Some(inf) = archives.get(archive_id) else {
        return Ok(false);
    };
    let pending = pending_wdiffs(ctx, vol_id, archive_id)?;
    let Some(diff) = pending.first() else {
        return Ok(false);
    };
    let vol = ctx.volume_dir(vol_id);
    let path = ctx.archive_dir(vol_id, archive_id).join(diff.file_name());
    let (kind, level) = inf.codec()?;

    // Transcode if the archive wants a different codec than the file holds.
    let stored_kind = {
        let mut reader = DiffReader::new(File::open(&path)?)?;
        reader
            .next_pack_raw()?
            .and_then(|(pack, _)| pack.records.iter().find(|r| r.has_payload()).map(|r| r.codec))
            .unwrap_or(kind)
    };
    let transcoded = if stored_kind != kind {
        Some(transcode_wdiff(&path, &vol, kind, level)?)
    } else {
        None
    };
    let send_path = transcoded
        .as_ref()
        .map(|t| t.path().to_path_buf())
        .unwrap_or_else(|| path.clone());

    let mut reader = DiffReader::new(File::open(&send_path)?)?;
    let header = *reader.header();

    let (_stream, mut apkt) = connect_and_negotiate(
        &inf.addr,
        &ctx.node_id,
        PROTO_WDIFF_TRANSFER,
        &ctx.sock_params,
    )?;
    apkt.write_str(vol_id)?;
    apkt.write_str(HT_PROXY)?;
    apkt.write_uuid(&header.uuid)?;
    apkt.write_u32(header.max_io_blocks)?;
    apkt.write_u32(header.salt)?;
    write_meta_diff(&mut apkt, diff)?;
    apkt.flush()?;

    let res = apkt.read_str()?;
    match res.as_str() {
        MSG_OK => {
            send_diff_file(&mut apkt, &mut reader)?;
            apkt.read_ack()?;
            fs::remove_file(&path)?;
            info!(vol_id, archive_id, %diff, "wdiff sent");
            Ok(pending.len() > 1)
        }
        TAG_TOO_OLD => {
            // Already applied at the archive; drop it.
            fs::remove_file(&path)?;
            info!(vol_id, archive_id, %diff, "wdiff already applied, dropped");
            Ok(pending.len() > 1)
        }
        other => Err(DaemonError::Other(format!(
            "archive {archive_id} refused wdiff: {other}"
        ))),
    }
}

/// Background worker draining the send queue.
pub fn run_wdiff_send_worker(ctx: Arc<ProxyCtx>) {
    while ctx.ps.is_running() {
        let Some((vol_id, archive_id)) = ctx.queue.pop_wait() else {
            return;
        };
        let vs = ctx.vol_state(&vol_id);
        if vs.state() != S_STARTED {
            continue; // requeued on the next start
        }
        match send_one_wdiff(&ctx, &vol_id, &archive_id) {
            Ok(true) => ctx.queue.push((vol_id, archive_id), Duration::ZERO),
            Ok(false) => {}
            Err(e) => {
                warn!(vol_id, archive_id, error = %e, "wdiff send failed, will retry");
                ctx.queue.push((vol_id, archive_id), SEND_RETRY_DELAY);
            }
        }
    }
}

/// The proxy daemon's protocol dispatch table.
pub fn proxy_handlers() -> HashMap<&'static str, Handler<ProxyCtx>> {
    use walship_net::proto::*;

    let mut m: HashMap<&'static str, Handler<ProxyCtx>> = HashMap::new();
    m.insert(CN_STATUS, c2p_status);
    m.insert(CN_ARCHIVE_INFO, c2p_archive_info);
    m.insert(CN_START, c2p_start);
    m.insert(CN_STOP, c2p_stop);
    m.insert(CN_CLEAR_VOL, c2p_clear_vol);
    m.insert(CN_KICK, c2p_kick);
    m.insert(CN_GET, c2p_get);
    m.insert(PROTO_WLOG_TRANSFER, s2p_wlog_transfer);
    m
}
