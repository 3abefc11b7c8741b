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

//! End-to-end pipeline: storage full backup, WAL shipping through the
//! proxy, diff application and restore at the archive, then a hash backup
//! after an unprotected gap.
//!
//! All three daemons run in-process; the WAL ring is written the way the
//! kernel driver would write it.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use tempfile::tempdir;

use walship_core::block_io::BlockDevice;
use walship_core::LOGICAL_BLOCK_SIZE;
use walship_daemon::archive::{archive_handlers, ArchiveCtx};
use walship_daemon::proxy::{proxy_handlers, run_wdiff_send_worker, ProxyCtx};
use walship_daemon::server::{run_server, ProcessStatus};
use walship_daemon::storage::{run_wlog_worker, storage_handlers, StorageCtx};
use walship_format::wlog::{LogIoSpec, LogPackBuilder, SuperBlock};
use walship_net::packet::TcpPacket;
use walship_net::proto::{negotiate_as_client, SocketParams, MSG_OK};

const PBS: u32 = 4096;
const VOL: &str = "vol0";
const SIZE_LB: usize = 256;
const DEADLINE: Duration = Duration::from_secs(60);

struct Cluster {
    archive: Arc<ArchiveCtx>,
    archive_addr: String,
    proxy_addr: String,
    storage_addr: String,
    ps: Vec<Arc<ProcessStatus>>,
    _dirs: Vec<tempfile::TempDir>,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for ps in &self.ps {
            ps.set_force_shutdown();
        }
    }
}

fn bind_local() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

fn start_cluster() -> Cluster {
    let sock = SocketParams::default();

    // Archive.
    let a_dir = tempdir().unwrap();
    let (a_listener, a_addr) = bind_local();
    let a_ctx = Arc::new(ArchiveCtx::new("arch".into(), a_dir.path().to_path_buf()));
    let a_ps = Arc::new(ProcessStatus::new());
    {
        let (ctx, ps) = (Arc::clone(&a_ctx), Arc::clone(&a_ps));
        std::thread::spawn(move || {
            run_server(a_listener, "arch".into(), ctx, Arc::new(archive_handlers()), ps, sock)
                .unwrap()
        });
    }

    // Proxy.
    let p_dir = tempdir().unwrap();
    let (p_listener, p_addr) = bind_local();
    let p_ps = Arc::new(ProcessStatus::new());
    let p_ctx = Arc::new(ProxyCtx::new(
        "prox".into(),
        p_dir.path().to_path_buf(),
        Arc::clone(&p_ps),
        sock,
    ));
    {
        let ctx = Arc::clone(&p_ctx);
        std::thread::spawn(move || run_wdiff_send_worker(ctx));
    }
    {
        let (ctx, ps) = (Arc::clone(&p_ctx), Arc::clone(&p_ps));
        std::thread::spawn(move || {
            run_server(p_listener, "prox".into(), ctx, Arc::new(proxy_handlers()), ps, sock)
                .unwrap()
        });
    }

    // Storage.
    let s_dir = tempdir().unwrap();
    let (s_listener, s_addr) = bind_local();
    let s_ps = Arc::new(ProcessStatus::new());
    let s_ctx = Arc::new(StorageCtx::new(
        "stor".into(),
        s_dir.path().to_path_buf(),
        a_addr.clone(),
        vec![p_addr.clone()],
        Arc::clone(&s_ps),
        sock,
    ));
    {
        let ctx = Arc::clone(&s_ctx);
        std::thread::spawn(move || run_wlog_worker(ctx));
    }
    {
        let (ctx, ps) = (Arc::clone(&s_ctx), Arc::clone(&s_ps));
        std::thread::spawn(move || {
            run_server(s_listener, "stor".into(), ctx, Arc::new(storage_handlers()), ps, sock)
                .unwrap()
        });
    }

    Cluster {
        archive: a_ctx,
        archive_addr: a_addr,
        proxy_addr: p_addr,
        storage_addr: s_addr,
        ps: vec![a_ps, p_ps, s_ps],
        _dirs: vec![a_dir, p_dir, s_dir],
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

fn wait_for(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Create the data device and its WAL ring sibling.
fn make_devices(dir: &Path) -> (PathBuf, Vec<u8>) {
    let data_path = dir.join("wdev0");
    let mut content = vec![0u8; SIZE_LB * LOGICAL_BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut content);
    fs::write(&data_path, &content).unwrap();

    let wal_path = dir.join("wdev0.wal");
    fs::write(&wal_path, vec![0u8; 64 * PBS as usize]).unwrap();
    let mut dev = BlockDevice::open_rw(&wal_path).unwrap();
    LogPackBuilder::format(&mut dev, PBS, 0xface).unwrap();
    (data_path, content)
}

/// What the kernel driver does on writes: append a pack to the ring,
/// advance written_lsid, and write the data through to the device.
fn write_through(data_path: &Path, writes: &[(u64, Vec<u8>)]) {
    let wal_path = {
        let mut s = data_path.as_os_str().to_os_string();
        s.push(".wal");
        PathBuf::from(s)
    };
    let mut dev = BlockDevice::open_rw(&wal_path).unwrap();
    let sb = SuperBlock::read_from(&mut dev).unwrap();
    let mut builder = LogPackBuilder::new(dev, sb);
    let lsid = sb.written_lsid;
    let ios: Vec<LogIoSpec> = writes
        .iter()
        .map(|(addr, data)| LogIoSpec::Data {
            io_address_lb: *addr,
            data: data.clone(),
        })
        .collect();
    let next = builder.append_pack(lsid, &ios).unwrap();
    builder.set_written_lsid(next).unwrap();

    let mut file = OpenOptions::new().write(true).open(data_path).unwrap();
    for (addr, data) in writes {
        file.seek(SeekFrom::Start(addr * LOGICAL_BLOCK_SIZE as u64))
            .unwrap();
        file.write_all(data).unwrap();
    }
    file.sync_data().unwrap();
}

fn apply_writes(image: &mut [u8], writes: &[(u64, Vec<u8>)]) {
    for (addr, data) in writes {
        let start = *addr as usize * LOGICAL_BLOCK_SIZE;
        image[start..start + data.len()].copy_from_slice(data);
    }
}

fn restored_content(cluster: &Cluster, gid: u64) -> Vec<u8> {
    let path = cluster
        .archive
        .volume_dir(VOL)
        .path()
        .join(format!("restored-{gid}"));
    fs::read(path).unwrap()
}

#[test]
fn test_full_pipeline() {
    let cluster = start_cluster();
    let dev_dir = tempdir().unwrap();
    let (data_path, mut expected) = make_devices(dev_dir.path());
    let data_path_str = data_path.to_str().unwrap();

    // Hook up the pipeline.
    command_ack(&cluster.archive_addr, "init-vol", &[VOL]);
    command_ack(
        &cluster.proxy_addr,
        "archive-info",
        &["add", VOL, "a0", &cluster.archive_addr],
    );
    command_ack(&cluster.proxy_addr, "start", &[VOL]);

    command_ack(&cluster.storage_addr, "init-vol", &[VOL, data_path_str]);
    command_ok(&cluster.storage_addr, "full-bkp", &[VOL, "64"]).unwrap();

    // The archive reaches Archived once the stream lands.
    wait_for("full sync", || {
        get_values(&cluster.archive_addr, &["state", VOL]) == vec!["Archived"]
    });
    command_ok(&cluster.archive_addr, "restore", &[VOL, "0"]).unwrap();
    assert_eq!(restored_content(&cluster, 0), expected);

    // Write through the device; the wlog worker ships the range as diff
    // (0 -> 1) via the proxy.
    let writes1 = vec![
        (10u64, vec![0xa1u8; 4 * LOGICAL_BLOCK_SIZE]),
        (50, vec![0xa2; 2 * LOGICAL_BLOCK_SIZE]),
    ];
    write_through(&data_path, &writes1);
    apply_writes(&mut expected, &writes1);

    wait_for("first diff", || {
        get_values(&cluster.archive_addr, &["restorable", VOL]).contains(&"1".to_string())
    });
    command_ok(&cluster.archive_addr, "restore", &[VOL, "1"]).unwrap();
    assert_eq!(restored_content(&cluster, 1), expected);

    // A second round, then apply at the archive.
    let writes2 = vec![(100u64, vec![0xb7u8; 8 * LOGICAL_BLOCK_SIZE])];
    write_through(&data_path, &writes2);
    apply_writes(&mut expected, &writes2);

    wait_for("second diff", || {
        get_values(&cluster.archive_addr, &["restorable", VOL]).contains(&"2".to_string())
    });
    command_ok(&cluster.archive_addr, "apply", &[VOL, "2"]).unwrap();
    assert_eq!(
        get_values(&cluster.archive_addr, &["base", VOL]),
        vec!["<|2|>"]
    );
    command_ok(&cluster.archive_addr, "restore", &[VOL, "2"]).unwrap();
    assert_eq!(restored_content(&cluster, 2), expected);

    // Stop protection, mutate the device unprotected, then hash-backup the
    // gap back into the chain.
    command_ack(&cluster.storage_addr, "stop", &[VOL, "0"]);
    wait_for("storage stopped", || {
        get_values(&cluster.storage_addr, &["state", VOL]) == vec!["Stopped"]
    });
    command_ack(&cluster.storage_addr, "reset-vol", &[VOL]);

    let gap = vec![(200u64, vec![0xc9u8; 4 * LOGICAL_BLOCK_SIZE])];
    {
        let mut file = OpenOptions::new().write(true).open(&data_path).unwrap();
        for (addr, data) in &gap {
            file.seek(SeekFrom::Start(addr * LOGICAL_BLOCK_SIZE as u64))
                .unwrap();
            file.write_all(data).unwrap();
        }
        file.sync_data().unwrap();
    }
    apply_writes(&mut expected, &gap);

    command_ok(&cluster.storage_addr, "hash-bkp", &[VOL, "64"]).unwrap();
    wait_for("hash sync diff", || {
        get_values(&cluster.archive_addr, &["restorable", VOL]).contains(&"3".to_string())
    });
    command_ok(&cluster.archive_addr, "restore", &[VOL, "3"]).unwrap();
    assert_eq!(restored_content(&cluster, 3), expected);
}
