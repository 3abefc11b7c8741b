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

//! Protocol names, reply tags, and the initial negotiation.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{NetError, Result};
use crate::packet::Packet;

/// Wire protocol version exchanged during negotiation.
pub const PROTOCOL_VERSION: u32 = 1;

// Reply messages.
pub const MSG_OK: &str = "ok";
pub const MSG_ACCEPT: &str = "accept";
pub const MSG_STOPPED: &str = "stopped";
pub const MSG_DIFFERENT_UUID: &str = "different-uuid";
pub const MSG_ARCHIVE_NOT_FOUND: &str = "archive-not-found";
pub const MSG_SMALLER_LV_SIZE: &str = "smaller-lv-size";
pub const MSG_WDIFF_RECV: &str = "wdiff-recv";
pub const MSG_SYNCING: &str = "syncing";

// Host types.
pub const HT_CONTROLLER: &str = "controller";
pub const HT_STORAGE: &str = "storage";
pub const HT_PROXY: &str = "proxy";
pub const HT_ARCHIVE: &str = "archive";

// Command names, doubling as protocol names on the wire.
pub const CN_STATUS: &str = "status";
pub const CN_INIT_VOL: &str = "init-vol";
pub const CN_CLEAR_VOL: &str = "clear-vol";
pub const CN_RESET_VOL: &str = "reset-vol";
pub const CN_START: &str = "start";
pub const CN_STOP: &str = "stop";
pub const CN_FULL_BKP: &str = "full-bkp";
pub const CN_HASH_BKP: &str = "hash-bkp";
pub const CN_SNAPSHOT: &str = "snapshot";
pub const CN_ARCHIVE_INFO: &str = "archive-info";
pub const CN_RESTORE: &str = "restore";
pub const CN_DEL_RESTORED: &str = "del-restored";
pub const CN_LIST_RESTORED: &str = "list-restored";
pub const CN_APPLY: &str = "apply";
pub const CN_MERGE: &str = "merge";
pub const CN_RESIZE: &str = "resize";
pub const CN_SHUTDOWN: &str = "shutdown";
pub const CN_KICK: &str = "kick";
pub const CN_GET: &str = "get";

// Targets of the `get` command.
pub const TN_STATE: &str = "state";
pub const TN_HOST_TYPE: &str = "host-type";
pub const TN_VOL: &str = "vol";
pub const TN_UUID: &str = "uuid";
pub const TN_DIFF: &str = "diff";
pub const TN_RESTORABLE: &str = "restorable";
pub const TN_RESTORED: &str = "restored";
pub const TN_VOL_SIZE: &str = "vol-size";
pub const TN_BASE: &str = "base";
pub const TN_NUM_ACTION: &str = "num-action";

// Inter-daemon protocol names.
pub const PROTO_FULL_SYNC: &str = "dirty-full-sync";
pub const PROTO_HASH_SYNC: &str = "dirty-hash-sync";
pub const PROTO_WLOG_TRANSFER: &str = "wlog-transfer";
pub const PROTO_WDIFF_TRANSFER: &str = "wdiff-transfer";

/// What the server learns from the first negotiation.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub client_id: String,
    pub protocol: String,
    pub version: u32,
}

/// Client side of the initial negotiation. Returns the server id once the
/// server replied with the `"ok"` preamble.
pub fn negotiate_as_client<R: Read, W: Write>(
    pkt: &mut Packet<R, W>,
    client_id: &str,
    protocol: &str,
) -> Result<String> {
    pkt.write_str(client_id)?;
    pkt.write_str(protocol)?;
    pkt.write_u32(PROTOCOL_VERSION)?;
    pkt.flush()?;
    let server_id = pkt.read_str()?;
    let msg = pkt.read_str()?;
    if msg != MSG_OK {
        return Err(NetError::Peer(msg));
    }
    Ok(server_id)
}

/// Server side of the initial negotiation. The `"ok"` preamble is written by
/// the dispatcher once it has resolved a handler, so protocol errors can
/// still reach the peer as text.
pub fn negotiate_as_server<R: Read, W: Write>(
    pkt: &mut Packet<R, W>,
    server_id: &str,
) -> Result<Greeting> {
    let client_id = pkt.read_str()?;
    let protocol = pkt.read_str()?;
    let version = pkt.read_u32()?;
    pkt.write_str(server_id)?;
    pkt.flush()?;
    if version != PROTOCOL_VERSION {
        return Err(NetError::VersionMismatch {
            client: version,
            server: PROTOCOL_VERSION,
        });
    }
    Ok(Greeting {
        client_id,
        protocol,
        version,
    })
}

/// Write a diff description: four gids, a flag byte, a timestamp.
pub fn write_meta_diff<R: Read, W: Write>(
    pkt: &mut Packet<R, W>,
    diff: &walship_format::MetaDiff,
) -> Result<()> {
    pkt.write_u64(diff.snap_b.gid_b)?;
    pkt.write_u64(diff.snap_b.gid_e)?;
    pkt.write_u64(diff.snap_e.gid_b)?;
    pkt.write_u64(diff.snap_e.gid_e)?;
    let mut flags = 0u8;
    if diff.is_mergeable {
        flags |= 1;
    }
    if diff.is_comp_diff {
        flags |= 2;
    }
    pkt.write_u8(flags)?;
    pkt.write_u64(diff.timestamp)?;
    Ok(())
}

/// Inverse of [`write_meta_diff`].
pub fn read_meta_diff<R: Read, W: Write>(
    pkt: &mut Packet<R, W>,
) -> Result<walship_format::MetaDiff> {
    use walship_format::{MetaDiff, MetaSnap};

    let b0 = pkt.read_u64()?;
    let b1 = pkt.read_u64()?;
    let e0 = pkt.read_u64()?;
    let e1 = pkt.read_u64()?;
    let flags = pkt.read_u8()?;
    let timestamp = pkt.read_u64()?;
    let mut diff = MetaDiff::new(MetaSnap::new(b0, b1)?, MetaSnap::new(e0, e1)?)?;
    diff.is_mergeable = flags & 1 != 0;
    diff.is_comp_diff = flags & 2 != 0;
    diff.timestamp = timestamp;
    Ok(diff)
}

/// TCP keep-alive settings; when enabled, socket-level timeouts are off.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAliveParams {
    pub enabled: bool,
    pub idle: u32,
    pub intvl: u32,
    pub cnt: u32,
}

/// Socket tuning shared by daemons and the controller.
#[derive(Debug, Clone, Copy)]
pub struct SocketParams {
    pub timeout: Duration,
    pub keep_alive: KeepAliveParams,
}

impl Default for SocketParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            keep_alive: KeepAliveParams::default(),
        }
    }
}

/// Apply timeouts or keep-alive to a connected socket.
pub fn setup_socket(stream: &TcpStream, params: &SocketParams) -> Result<()> {
    if params.keep_alive.enabled {
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        enable_keep_alive(stream, &params.keep_alive)?;
    } else {
        let t = if params.timeout.is_zero() {
            None
        } else {
            Some(params.timeout)
        };
        stream.set_read_timeout(t)?;
        stream.set_write_timeout(t)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn enable_keep_alive(stream: &TcpStream, ka: &KeepAliveParams) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let set = |level: i32, name: i32, value: i32| -> Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(NetError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    };
    set(libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    set(libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, ka.idle as i32)?;
    set(libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, ka.intvl as i32)?;
    set(libc::IPPROTO_TCP, libc::TCP_KEEPCNT, ka.cnt as i32)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enable_keep_alive(_stream: &TcpStream, _ka: &KeepAliveParams) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_negotiation_round_trip() {
        // Client writes its half into a buffer ...
        let mut client_out = Packet::new(Cursor::new(Vec::new()), Vec::new());
        client_out.write_str("ctl-1").unwrap();
        client_out.write_str("status").unwrap();
        client_out.write_u32(PROTOCOL_VERSION).unwrap();
        client_out.flush().unwrap();
        let client_bytes = client_out.into_writer();

        // ... which the server consumes.
        let mut server = Packet::new(Cursor::new(client_bytes), Vec::new());
        let greeting = negotiate_as_server(&mut server, "archive-0").unwrap();
        assert_eq!(greeting.client_id, "ctl-1");
        assert_eq!(greeting.protocol, "status");
    }

    #[test]
    fn test_meta_diff_wire_round_trip() {
        use walship_format::{MetaDiff, MetaSnap};

        let mut diff = MetaDiff::new(
            MetaSnap::new(3, 5).unwrap(),
            MetaSnap::new(8, 8).unwrap(),
        )
        .unwrap()
        .with_mergeable(true)
        .with_timestamp(123456);
        diff.is_comp_diff = true;

        let mut tx = Packet::new(Cursor::new(Vec::new()), Vec::new());
        write_meta_diff(&mut tx, &diff).unwrap();
        tx.flush().unwrap();
        let bytes = tx.into_writer();

        let mut rx = Packet::new(Cursor::new(bytes), Vec::new());
        assert_eq!(read_meta_diff(&mut rx).unwrap(), diff);
    }

    #[test]
    fn test_version_mismatch_detected() {
        let mut client_out = Packet::new(Cursor::new(Vec::new()), Vec::new());
        client_out.write_str("ctl-1").unwrap();
        client_out.write_str("status").unwrap();
        client_out.write_u32(PROTOCOL_VERSION + 5).unwrap();
        client_out.flush().unwrap();
        let client_bytes = client_out.into_writer();

        let mut server = Packet::new(Cursor::new(client_bytes), Vec::new());
        let err = negotiate_as_server(&mut server, "archive-0");
        assert!(matches!(err, Err(NetError::VersionMismatch { .. })));
    }
}
