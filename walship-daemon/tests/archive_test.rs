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

//! Archive daemon protocol tests: an in-process server driven by a real
//! TCP client speaking the wire protocol.

use std::fs;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tempfile::tempdir;
use uuid::Uuid;

use walship_core::codec::{self, CodecKind};
use walship_core::{checksum, LOGICAL_BLOCK_SIZE};
use walship_daemon::action_counter::ActionToken;
use walship_daemon::archive::{archive_handlers, ArchiveCtx, A_MERGE};
use walship_daemon::stop::Stopper;
use walship_daemon::server::{run_server, ProcessStatus};
use walship_format::wdiff::{DiffFileHeader, DiffReader, DiffRecordKind, DiffWriter};
use walship_format::{MetaDiff, MetaSnap};
use walship_net::packet::{StreamCtl, TcpPacket};
use walship_net::proto::{
    negotiate_as_client, write_meta_diff, HT_PROXY, HT_STORAGE, MSG_OK, PROTO_FULL_SYNC,
    PROTO_WDIFF_TRANSFER, SocketParams,
};
use walship_net::transport::send_diff_file;

struct TestArchive {
    ctx: Arc<ArchiveCtx>,
    ps: Arc<ProcessStatus>,
    addr: String,
    _dir: tempfile::TempDir,
}

impl Drop for TestArchive {
    fn drop(&mut self) {
        self.ps.set_force_shutdown();
    }
}

fn start_archive() -> TestArchive {
    let dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let ctx = Arc::new(ArchiveCtx::new(
        "archive-test".to_string(),
        dir.path().to_path_buf(),
    ));
    let ps = Arc::new(ProcessStatus::new());
    {
        let ctx = Arc::clone(&ctx);
        let ps = Arc::clone(&ps);
        std::thread::spawn(move || {
            run_server(
                listener,
                "archive-test".to_string(),
                ctx,
                Arc::new(archive_handlers()),
                ps,
                SocketParams::default(),
            )
            .unwrap();
        });
    }
    TestArchive {
        ctx,
        ps,
        addr,
        _dir: dir,
    }
}

fn client(addr: &str, protocol: &str) -> TcpPacket {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    let mut pkt = TcpPacket::from_stream(&stream).unwrap();
    negotiate_as_client(&mut pkt, "test-ctl", protocol).unwrap();
    pkt
}

fn command_ack(addr: &str, protocol: &str, params: &[&str]) {
    let mut pkt = client(addr, protocol);
    let params: Vec<String> = params.iter().map(|s| s.to_string()).collect();
    pkt.write_str_vec(&params).unwrap();
    pkt.flush().unwrap();
    pkt.read_ack().unwrap();
}

fn command_ok(addr: &str, protocol: &str, params: &[&str]) -> Result<(), String> {
    let mut pkt = client(addr, protocol);
    let params: Vec<String> = params.iter().map(|s| s.to_string()).collect();
    pkt.write_str_vec(&params).unwrap();
    pkt.flush().unwrap();
    let res = pkt.read_str().map_err(|e| e.to_string())?;
    if res == MSG_OK {
        Ok(())
    } else {
        Err(res)
    }
}

/// Run the client half of a full sync.
fn full_sync(addr: &str, vol_id: &str, uuid: Uuid, image: &[u8], bulk_lb: u64) {
    let size_lb = (image.len() / LOGICAL_BLOCK_SIZE) as u64;
    let mut pkt = client(addr, PROTO_FULL_SYNC);
    pkt.write_str(HT_STORAGE).unwrap();
    pkt.write_str(vol_id).unwrap();
    pkt.write_uuid(&uuid).unwrap();
    pkt.write_u64(size_lb).unwrap();
    pkt.write_u64(100).unwrap(); // timestamp
    pkt.write_u64(bulk_lb).unwrap();
    pkt.flush().unwrap();
    assert_eq!(pkt.read_str().unwrap(), MSG_OK);

    let bulk = bulk_lb as usize * LOGICAL_BLOCK_SIZE;
    for chunk in image.chunks(bulk) {
        let enc = codec::compress(CodecKind::Snappy, 0, chunk).unwrap();
        pkt.write_bytes(&enc).unwrap();
    }
    pkt.flush().unwrap();
    pkt.write_u64(0).unwrap();
    pkt.write_u64(0).unwrap();
    pkt.flush().unwrap();
    pkt.read_ack().unwrap();
}

/// Build a wdiff in memory and ship it over the wdiff-transfer protocol.
fn send_wdiff(
    addr: &str,
    vol_id: &str,
    uuid: Uuid,
    diff: MetaDiff,
    recs: &[(DiffRecordKind, u64, u32, u8)],
) -> String {
    let salt = 0x1357;
    let mut file = Vec::new();
    {
        let mut w = DiffWriter::new(&mut file);
        w.write_header(&DiffFileHeader::new(uuid, 1 << 16, salt)).unwrap();
        for &(kind, addr_lb, blocks, seed) in recs {
            let data = if kind == DiffRecordKind::Normal {
                vec![seed; blocks as usize * LOGICAL_BLOCK_SIZE]
            } else {
                Vec::new()
            };
            w.push(kind, addr_lb, blocks, CodecKind::Snappy, &data).unwrap();
        }
        w.close().unwrap();
    }

    let mut pkt = client(addr, PROTO_WDIFF_TRANSFER);
    pkt.write_str(vol_id).unwrap();
    pkt.write_str(HT_PROXY).unwrap();
    pkt.write_uuid(&uuid).unwrap();
    pkt.write_u32(1 << 16).unwrap();
    pkt.write_u32(salt).unwrap();
    write_meta_diff(&mut pkt, &diff).unwrap();
    pkt.flush().unwrap();
    let res = pkt.read_str().unwrap();
    if res == MSG_OK {
        let mut reader = DiffReader::new(&file[..]).unwrap();
        send_diff_file(&mut pkt, &mut reader).unwrap();
        pkt.read_ack().unwrap();
    }
    res
}

fn get_values(addr: &str, params: &[&str]) -> Vec<String> {
    let mut pkt = client(addr, "get");
    let params: Vec<String> = params.iter().map(|s| s.to_string()).collect();
    pkt.write_str_vec(&params).unwrap();
    pkt.flush().unwrap();
    assert_eq!(pkt.read_str().unwrap(), MSG_OK);
    let v = pkt.read_str_vec().unwrap();
    pkt.read_ack().unwrap();
    v
}

fn random_image(blocks: usize) -> Vec<u8> {
    let mut data = vec![0u8; blocks * LOGICAL_BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn restored_content(ar: &TestArchive, vol_id: &str, gid: u64) -> Vec<u8> {
    let path = ar
        .ctx
        .volume_dir(vol_id)
        .path()
        .join(format!("restored-{gid}"));
    fs::read(path).unwrap()
}

/// Apply diff records onto a byte image, in order.
fn apply_recs(image: &mut [u8], recs: &[(DiffRecordKind, u64, u32, u8)]) {
    for &(kind, addr, blocks, seed) in recs {
        let start = addr as usize * LOGICAL_BLOCK_SIZE;
        let len = blocks as usize * LOGICAL_BLOCK_SIZE;
        match kind {
            DiffRecordKind::Normal => image[start..start + len].fill(seed),
            DiffRecordKind::AllZero | DiffRecordKind::Discard => image[start..start + len].fill(0),
        }
    }
}

#[test]
fn test_full_sync_and_restore_gid0() {
    // Full-sync 1024 blocks with bulk 16 and random payload, then
    // restore(0) yields the same bytes.
    let ar = start_archive();
    let uuid = Uuid::new_v4();
    let image = random_image(1024);

    command_ack(&ar.addr, "init-vol", &["vol0"]);
    full_sync(&ar.addr, "vol0", uuid, &image, 16);
    assert_eq!(get_values(&ar.addr, &["state", "vol0"]), vec!["Archived"]);

    command_ok(&ar.addr, "restore", &["vol0", "0"]).unwrap();
    assert_eq!(restored_content(&ar, "vol0", 0), image);
}

#[test]
fn test_wdiff_chain_and_restore() {
    // Receive wdiffs (0,0)->(1,1) and (1,1)->(2,2); restore(2) equals
    // sequential application.
    let ar = start_archive();
    let uuid = Uuid::new_v4();
    let image = random_image(256);

    command_ack(&ar.addr, "init-vol", &["vol0"]);
    full_sync(&ar.addr, "vol0", uuid, &image, 32);

    let recs1 = [
        (DiffRecordKind::Normal, 10u64, 8u32, 0xaau8),
        (DiffRecordKind::AllZero, 100, 4, 0),
    ];
    let recs2 = [
        (DiffRecordKind::Normal, 12, 4, 0xbb),
        (DiffRecordKind::Normal, 200, 2, 0xcc),
    ];
    let d1 = MetaDiff::clean_step(0, 1).unwrap();
    let d2 = MetaDiff::clean_step(1, 2).unwrap();
    assert_eq!(send_wdiff(&ar.addr, "vol0", uuid, d1, &recs1), MSG_OK);
    assert_eq!(send_wdiff(&ar.addr, "vol0", uuid, d2, &recs2), MSG_OK);

    assert_eq!(
        get_values(&ar.addr, &["restorable", "vol0"]),
        vec!["0", "1", "2"]
    );

    command_ok(&ar.addr, "restore", &["vol0", "2"]).unwrap();
    let mut expected = image.clone();
    apply_recs(&mut expected, &recs1);
    apply_recs(&mut expected, &recs2);
    assert_eq!(restored_content(&ar, "vol0", 2), expected);
}

#[test]
fn test_too_new_diff_refused() {
    // A diff beginning at (5,5) against latest (3,3) draws "too-new-diff"
    // and leaves the state untouched.
    let ar = start_archive();
    let uuid = Uuid::new_v4();
    let image = random_image(64);

    command_ack(&ar.addr, "init-vol", &["vol0"]);
    full_sync(&ar.addr, "vol0", uuid, &image, 16);
    for (b, e) in [(0, 1), (1, 2), (2, 3)] {
        let d = MetaDiff::clean_step(b, e).unwrap();
        let recs = [(DiffRecordKind::Normal, b, 1u32, b as u8 + 1)];
        assert_eq!(send_wdiff(&ar.addr, "vol0", uuid, d, &recs), MSG_OK);
    }

    let too_new = MetaDiff::clean_step(5, 6).unwrap();
    let recs = [(DiffRecordKind::Normal, 0u64, 1u32, 0xffu8)];
    assert_eq!(
        send_wdiff(&ar.addr, "vol0", uuid, too_new, &recs),
        "too-new-diff"
    );
    assert_eq!(get_values(&ar.addr, &["state", "vol0"]), vec!["Archived"]);
}

#[test]
fn test_full_sync_zero_bulk_rejected_before_state_change() {
    let ar = start_archive();
    command_ack(&ar.addr, "init-vol", &["vol0"]);

    let mut pkt = client(&ar.addr, PROTO_FULL_SYNC);
    pkt.write_str(HT_STORAGE).unwrap();
    pkt.write_str("vol0").unwrap();
    pkt.write_uuid(&Uuid::new_v4()).unwrap();
    pkt.write_u64(64).unwrap();
    pkt.write_u64(100).unwrap();
    pkt.write_u64(0).unwrap(); // bulkLb == 0
    pkt.flush().unwrap();
    let res = pkt.read_str().unwrap();
    assert_ne!(res, MSG_OK);

    assert_eq!(get_values(&ar.addr, &["state", "vol0"]), vec!["SyncReady"]);
}

#[test]
fn test_apply_moves_base_and_drops_diffs() {
    let ar = start_archive();
    let uuid = Uuid::new_v4();
    let image = random_image(128);

    command_ack(&ar.addr, "init-vol", &["vol0"]);
    full_sync(&ar.addr, "vol0", uuid, &image, 32);

    let recs1 = [(DiffRecordKind::Normal, 5u64, 4u32, 0x11u8)];
    let recs2 = [(DiffRecordKind::AllZero, 7u64, 4u32, 0u8)];
    send_wdiff(
        &ar.addr,
        "vol0",
        uuid,
        MetaDiff::clean_step(0, 1).unwrap(),
        &recs1,
    );
    send_wdiff(
        &ar.addr,
        "vol0",
        uuid,
        MetaDiff::clean_step(1, 2).unwrap(),
        &recs2,
    );

    command_ok(&ar.addr, "apply", &["vol0", "2"]).unwrap();

    // Base advanced to (2,2) and the applied diffs are gone.
    let base = get_values(&ar.addr, &["base", "vol0"]);
    assert_eq!(base, vec!["<|2|>"]);
    assert!(get_values(&ar.addr, &["diff", "vol0"]).is_empty());

    // The image content equals sequential application.
    let mut expected = image.clone();
    apply_recs(&mut expected, &recs1);
    apply_recs(&mut expected, &recs2);
    let on_disk = fs::read(ar.ctx.volume_dir("vol0").path().join("image")).unwrap();
    assert_eq!(on_disk, expected);

    // And restore of the applied gid still works from the new base.
    command_ok(&ar.addr, "restore", &["vol0", "2"]).unwrap();
    assert_eq!(restored_content(&ar, "vol0", 2), expected);
}

#[test]
fn test_merge_collapses_run() {
    let ar = start_archive();
    let uuid = Uuid::new_v4();
    let image = random_image(128);

    command_ack(&ar.addr, "init-vol", &["vol0"]);
    full_sync(&ar.addr, "vol0", uuid, &image, 32);

    let all_recs = [
        [(DiffRecordKind::Normal, 0u64, 4u32, 0x21u8)],
        [(DiffRecordKind::Normal, 2, 4, 0x22)],
        [(DiffRecordKind::Normal, 50, 2, 0x23)],
    ];
    for (i, recs) in all_recs.iter().enumerate() {
        let d = MetaDiff::clean_step(i as u64, i as u64 + 1)
            .unwrap()
            .with_mergeable(i > 0);
        assert_eq!(send_wdiff(&ar.addr, "vol0", uuid, d, recs), MSG_OK);
    }

    command_ok(&ar.addr, "merge", &["vol0", "0", "3"]).unwrap();

    let diffs = get_values(&ar.addr, &["diff", "vol0"]);
    assert_eq!(diffs.len(), 1);
    assert!(diffs[0].contains("|0|-->|3|"), "got {diffs:?}");

    // The collapsed history still restores correctly.
    command_ok(&ar.addr, "restore", &["vol0", "3"]).unwrap();
    let mut expected = image.clone();
    for recs in &all_recs {
        apply_recs(&mut expected, recs);
    }
    assert_eq!(restored_content(&ar, "vol0", 3), expected);
}

#[test]
fn test_merge_refused_while_action_running() {
    // A second destructive action is refused while one is counted.
    let ar = start_archive();
    let uuid = Uuid::new_v4();
    let image = random_image(64);

    command_ack(&ar.addr, "init-vol", &["vol0"]);
    full_sync(&ar.addr, "vol0", uuid, &image, 16);
    for (b, e) in [(0, 1), (1, 2)] {
        let d = MetaDiff::clean_step(b, e).unwrap().with_mergeable(b > 0);
        let recs = [(DiffRecordKind::Normal, b, 1u32, 1u8)];
        send_wdiff(&ar.addr, "vol0", uuid, d, &recs);
    }

    let vs = ar.ctx.vol_state("vol0");
    let token = {
        let mut guard = vs.mu.lock();
        ActionToken::begin_locked(&vs, &mut guard, A_MERGE)
    };
    let err = command_ok(&ar.addr, "merge", &["vol0", "0", "2"]).unwrap_err();
    assert!(err.contains("running"), "got {err}");
    drop(token);

    command_ok(&ar.addr, "merge", &["vol0", "0", "2"]).unwrap();
}

#[test]
fn test_stop_and_start_cycle() {
    let ar = start_archive();
    let uuid = Uuid::new_v4();
    let image = random_image(64);

    command_ack(&ar.addr, "init-vol", &["vol0"]);
    full_sync(&ar.addr, "vol0", uuid, &image, 16);

    command_ack(&ar.addr, "stop", &["vol0", "0"]);
    // Stop is acknowledged immediately; wait for the transition.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if get_values(&ar.addr, &["state", "vol0"]) == vec!["Stopped"] {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "stop did not land");
        std::thread::sleep(Duration::from_millis(50));
    }

    // A wdiff against a stopped volume draws "stopped".
    let d = MetaDiff::clean_step(0, 1).unwrap();
    let recs = [(DiffRecordKind::Normal, 0u64, 1u32, 9u8)];
    assert_eq!(send_wdiff(&ar.addr, "vol0", uuid, d, &recs), "stopped");

    command_ack(&ar.addr, "start", &["vol0"]);
    assert_eq!(get_values(&ar.addr, &["state", "vol0"]), vec!["Archived"]);
    assert_eq!(send_wdiff(&ar.addr, "vol0", uuid, d, &recs), MSG_OK);
}

#[test]
fn test_resize_grows_but_never_shrinks() {
    let ar = start_archive();
    let uuid = Uuid::new_v4();
    let image = random_image(64);

    command_ack(&ar.addr, "init-vol", &["vol0"]);
    full_sync(&ar.addr, "vol0", uuid, &image, 16);

    command_ok(&ar.addr, "resize", &["vol0", "64k"]).unwrap();
    assert_eq!(get_values(&ar.addr, &["vol-size", "vol0"]), vec!["128"]);

    let err = command_ok(&ar.addr, "resize", &["vol0", "16k"]).unwrap_err();
    assert_eq!(err, "smaller-lv-size");
    assert_eq!(get_values(&ar.addr, &["vol-size", "vol0"]), vec!["128"]);
}

#[test]
fn test_force_stop_during_full_sync_keeps_sync_ready() {
    // Force-stop mid-stream: the connection dies, the volume returns to
    // SyncReady, and no partial content is announced as Archived.
    let ar = start_archive();
    let image = random_image(1024);
    command_ack(&ar.addr, "init-vol", &["vol0"]);

    let mut pkt = client(&ar.addr, PROTO_FULL_SYNC);
    pkt.write_str(HT_STORAGE).unwrap();
    pkt.write_str("vol0").unwrap();
    pkt.write_uuid(&Uuid::new_v4()).unwrap();
    pkt.write_u64(1024).unwrap();
    pkt.write_u64(100).unwrap();
    pkt.write_u64(16).unwrap();
    pkt.flush().unwrap();
    assert_eq!(pkt.read_str().unwrap(), MSG_OK);

    let bulk = 16 * LOGICAL_BLOCK_SIZE;
    let mut chunks = image.chunks(bulk);
    for chunk in chunks.by_ref().take(2) {
        let enc = codec::compress(CodecKind::Snappy, 0, chunk).unwrap();
        pkt.write_bytes(&enc).unwrap();
    }
    pkt.flush().unwrap();

    // Force the stop while the server waits for the next chunk; it bails
    // at the next chunk boundary.
    let vs = ar.ctx.vol_state("vol0");
    let stopper = Stopper::new(&vs, true).unwrap();
    for chunk in chunks {
        let enc = codec::compress(CodecKind::Snappy, 0, chunk).unwrap();
        if pkt.write_bytes(&enc).is_err() || pkt.flush().is_err() {
            break;
        }
    }
    let _ = pkt.write_u64(0);
    let _ = pkt.write_u64(0);
    let _ = pkt.flush();
    assert!(pkt.read_ack().is_err(), "sync must not complete");

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if get_values(&ar.addr, &["state", "vol0"]) == vec!["SyncReady"] {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "state did not roll back");
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stopper);
}

#[test]
fn test_wdiff_payload_checksums_verified() {
    // Receive path integrity: a tampered payload never lands as a wdiff.
    let ar = start_archive();
    let uuid = Uuid::new_v4();
    let image = random_image(64);

    command_ack(&ar.addr, "init-vol", &["vol0"]);
    full_sync(&ar.addr, "vol0", uuid, &image, 16);

    let salt = 0x2468u32;
    let diff = MetaDiff::clean_step(0, 1).unwrap();
    let data = vec![7u8; LOGICAL_BLOCK_SIZE];
    let good = codec::compress(CodecKind::Snappy, 0, &data).unwrap();
    let rec = walship_format::wdiff::DiffRecord {
        io_address: 0,
        io_blocks: 1,
        kind: DiffRecordKind::Normal,
        codec: CodecKind::Snappy,
        data_offset: 0,
        data_size: good.len() as u32,
        checksum: checksum(&good, salt),
    };
    let pack = walship_format::wdiff::DiffPack {
        records: vec![rec],
        total_data_size: good.len() as u32,
    };

    let mut pkt = client(&ar.addr, PROTO_WDIFF_TRANSFER);
    pkt.write_str("vol0").unwrap();
    pkt.write_str(HT_PROXY).unwrap();
    pkt.write_uuid(&uuid).unwrap();
    pkt.write_u32(1 << 16).unwrap();
    pkt.write_u32(salt).unwrap();
    write_meta_diff(&mut pkt, &diff).unwrap();
    pkt.flush().unwrap();
    assert_eq!(pkt.read_str().unwrap(), MSG_OK);

    // Flip a payload byte: the archive must reject the stream.
    let mut bad = good.clone();
    bad[0] ^= 0x80;
    pkt.write_ctrl(StreamCtl::Next).unwrap();
    pkt.write_bytes(&pack.encode(salt)).unwrap();
    pkt.write_bytes(&bad).unwrap();
    pkt.write_ctrl(StreamCtl::End).unwrap();
    pkt.flush().unwrap();
    assert!(pkt.read_ack().is_err());

    // Nothing was installed; the volume recovered to Archived.
    assert_eq!(get_values(&ar.addr, &["diff", "vol0"]), Vec::<String>::new());
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if get_values(&ar.addr, &["state", "vol0"]) == vec!["Archived"] {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "state did not recover");
        std::thread::sleep(Duration::from_millis(50));
    }

    let d = MetaDiff::clean_step(0, 1).unwrap();
    let recs = [(DiffRecordKind::Normal, 0u64, 1u32, 1u8)];
    assert_eq!(send_wdiff(&ar.addr, "vol0", uuid, d, &recs), MSG_OK);
}
