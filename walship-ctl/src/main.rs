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

//! walship controller CLI.
//!
//! Drives the storage, proxy and archive daemons over the common protocol.
//! Exit code 0 on success, 1 on any command or connection error.

use std::net::TcpStream;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use walship_net::packet::TcpPacket;
use walship_net::proto::{
    negotiate_as_client, setup_socket, SocketParams, CN_APPLY, CN_ARCHIVE_INFO,
    CN_CLEAR_VOL, CN_DEL_RESTORED, CN_FULL_BKP, CN_GET, CN_HASH_BKP, CN_INIT_VOL, CN_KICK,
    CN_LIST_RESTORED, CN_MERGE, CN_RESET_VOL, CN_RESIZE, CN_RESTORE, CN_SHUTDOWN, CN_SNAPSHOT,
    CN_START, CN_STATUS, CN_STOP, MSG_ACCEPT, MSG_OK, TN_HOST_TYPE,
};

/// Default bulk size for full and hash backups [logical blocks].
const DEFAULT_BULK_LB: u64 = 128;

/// walship controller
#[derive(Parser, Debug)]
#[command(name = "walship-ctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon host
    #[arg(short, long, global = true, default_value = "localhost")]
    addr: String,

    /// Daemon port
    #[arg(short, long, global = true, default_value = "10200")]
    port: u16,

    /// Client id shown to the daemon
    #[arg(long, global = true, default_value = "ctl")]
    id: String,

    /// Connection timeout [sec]
    #[arg(long, global = true, default_value = "60")]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a volume (storage needs the device path)
    InitVol {
        vol_id: String,
        wdev_path: Option<String>,
    },
    /// Remove a volume and all its data
    ClearVol { vol_id: String },
    /// Reset a stopped volume back to SyncReady
    ResetVol { vol_id: String, gid: Option<u64> },
    /// Start a volume (storage takes master|slave)
    Start {
        vol_id: String,
        role: Option<String>,
    },
    /// Stop a volume; force is 0 or 1
    Stop {
        vol_id: String,
        #[arg(default_value = "0")]
        force: String,
    },
    /// Run a full backup of a volume to the archive
    FullBkp { vol_id: String, bulk_lb: Option<u64> },
    /// Run a hash backup of a volume to the archive
    HashBkp { vol_id: String, bulk_lb: Option<u64> },
    /// Take a snapshot; prints the gid it will be visible as
    Snapshot { vol_id: String },
    /// Manage proxy archive forwarding (list|get|add|update|delete)
    ArchiveInfo {
        subcmd: String,
        vol_id: String,
        args: Vec<String>,
    },
    /// Restore a clean snapshot into a new image
    Restore { vol_id: String, gid: u64 },
    /// Delete a restored image
    DelRestored { vol_id: String, gid: u64 },
    /// List restored images
    ListRestored { vol_id: String },
    /// Apply diffs up to a gid into the base image
    Apply { vol_id: String, gid: u64 },
    /// Merge a mergeable diff run into one composite diff
    Merge {
        vol_id: String,
        gid_b: u64,
        gid_e: u64,
        max_size_mb: Option<u64>,
    },
    /// Grow a volume image (sizes take k/m/g/t suffixes)
    Resize { vol_id: String, size: String },
    /// Show daemon or volume status
    Status { vol_id: Option<String> },
    /// Print the daemon's host type
    HostType,
    /// Query a daemon value (state, uuid, diff, restorable, ...)
    Get { args: Vec<String> },
    /// Wake the daemon's background tasks
    Kick,
    /// Shut the daemon down; force is 0 or 1
    Shutdown {
        #[arg(default_value = "0")]
        force: String,
    },
}

/// How a command's reply is framed.
enum Reply {
    Ack,
    OkStr,
    OkStrVec,
    OkStrVecAck,
}

fn connect(cli: &Cli, protocol: &str) -> Result<TcpPacket, String> {
    let sock_params = SocketParams {
        timeout: Duration::from_secs(cli.timeout),
        keep_alive: Default::default(),
    };
    let stream = TcpStream::connect((cli.addr.as_str(), cli.port))
        .map_err(|e| format!("connect {}:{}: {e}", cli.addr, cli.port))?;
    setup_socket(&stream, &sock_params).map_err(|e| e.to_string())?;
    let mut pkt = TcpPacket::from_stream(&stream).map_err(|e| e.to_string())?;
    negotiate_as_client(&mut pkt, &cli.id, protocol).map_err(|e| e.to_string())?;
    Ok(pkt)
}

fn run_simple(cli: &Cli, protocol: &str, params: Vec<String>, reply: Reply) -> Result<(), String> {
    let mut pkt = connect(cli, protocol)?;
    pkt.write_str_vec(&params).map_err(|e| e.to_string())?;
    pkt.flush().map_err(|e| e.to_string())?;
    match reply {
        Reply::Ack => {
            pkt.read_ack().map_err(|e| e.to_string())?;
        }
        Reply::OkStr => {
            let res = pkt.read_str().map_err(|e| e.to_string())?;
            if res != MSG_OK {
                return Err(res);
            }
        }
        Reply::OkStrVec | Reply::OkStrVecAck => {
            let res = pkt.read_str().map_err(|e| e.to_string())?;
            if res != MSG_OK {
                return Err(res);
            }
            let lines = pkt.read_str_vec().map_err(|e| e.to_string())?;
            if matches!(reply, Reply::OkStrVecAck) {
                pkt.read_ack().map_err(|e| e.to_string())?;
            }
            for line in lines {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn run_shutdown(cli: &Cli, force: &str) -> Result<(), String> {
    let mut pkt = connect(cli, CN_SHUTDOWN)?;
    pkt.write_u8(if force != "0" { 1 } else { 0 })
        .map_err(|e| e.to_string())?;
    pkt.flush().map_err(|e| e.to_string())?;
    let res = pkt.read_str().map_err(|e| e.to_string())?;
    if res != MSG_ACCEPT {
        return Err(res);
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<(), String> {
    match &cli.command {
        Command::InitVol { vol_id, wdev_path } => {
            let mut params = vec![vol_id.clone()];
            if let Some(wdev) = wdev_path {
                params.push(wdev.clone());
            }
            run_simple(cli, CN_INIT_VOL, params, Reply::Ack)
        }
        Command::ClearVol { vol_id } => {
            run_simple(cli, CN_CLEAR_VOL, vec![vol_id.clone()], Reply::Ack)
        }
        Command::ResetVol { vol_id, gid } => {
            let mut params = vec![vol_id.clone()];
            if let Some(gid) = gid {
                params.push(gid.to_string());
            }
            run_simple(cli, CN_RESET_VOL, params, Reply::Ack)
        }
        Command::Start { vol_id, role } => {
            let mut params = vec![vol_id.clone()];
            if let Some(role) = role {
                params.push(role.clone());
            }
            run_simple(cli, CN_START, params, Reply::Ack)
        }
        Command::Stop { vol_id, force } => run_simple(
            cli,
            CN_STOP,
            vec![vol_id.clone(), force.clone()],
            Reply::Ack,
        ),
        Command::FullBkp { vol_id, bulk_lb } => run_simple(
            cli,
            CN_FULL_BKP,
            vec![
                vol_id.clone(),
                bulk_lb.unwrap_or(DEFAULT_BULK_LB).to_string(),
            ],
            Reply::OkStr,
        ),
        Command::HashBkp { vol_id, bulk_lb } => run_simple(
            cli,
            CN_HASH_BKP,
            vec![
                vol_id.clone(),
                bulk_lb.unwrap_or(DEFAULT_BULK_LB).to_string(),
            ],
            Reply::OkStr,
        ),
        Command::Snapshot { vol_id } => {
            run_simple(cli, CN_SNAPSHOT, vec![vol_id.clone()], Reply::OkStrVecAck)
        }
        Command::ArchiveInfo {
            subcmd,
            vol_id,
            args,
        } => {
            let mut params = vec![subcmd.clone(), vol_id.clone()];
            params.extend(args.iter().cloned());
            let reply = if subcmd == "get" || subcmd == "list" {
                Reply::OkStrVec
            } else {
                Reply::Ack
            };
            run_simple(cli, CN_ARCHIVE_INFO, params, reply)
        }
        Command::Restore { vol_id, gid } => run_simple(
            cli,
            CN_RESTORE,
            vec![vol_id.clone(), gid.to_string()],
            Reply::OkStr,
        ),
        Command::DelRestored { vol_id, gid } => run_simple(
            cli,
            CN_DEL_RESTORED,
            vec![vol_id.clone(), gid.to_string()],
            Reply::Ack,
        ),
        Command::ListRestored { vol_id } => run_simple(
            cli,
            CN_LIST_RESTORED,
            vec![vol_id.clone()],
            Reply::OkStrVec,
        ),
        Command::Apply { vol_id, gid } => run_simple(
            cli,
            CN_APPLY,
            vec![vol_id.clone(), gid.to_string()],
            Reply::OkStr,
        ),
        Command::Merge {
            vol_id,
            gid_b,
            gid_e,
            max_size_mb,
        } => {
            let mut params = vec![vol_id.clone(), gid_b.to_string(), gid_e.to_string()];
            if let Some(mb) = max_size_mb {
                params.push(mb.to_string());
            }
            run_simple(cli, CN_MERGE, params, Reply::OkStr)
        }
        Command::Resize { vol_id, size } => run_simple(
            cli,
            CN_RESIZE,
            vec![vol_id.clone(), size.clone()],
            Reply::OkStr,
        ),
        Command::Status { vol_id } => {
            let params = vol_id.iter().cloned().collect();
            run_simple(cli, CN_STATUS, params, Reply::OkStrVec)
        }
        Command::HostType => run_simple(
            cli,
            CN_GET,
            vec![TN_HOST_TYPE.to_string()],
            Reply::OkStrVecAck,
        ),
        Command::Get { args } => {
            if args.is_empty() {
                return Err("get needs a target".into());
            }
            run_simple(cli, CN_GET, args.clone(), Reply::OkStrVecAck)
        }
        Command::Kick => run_simple(cli, CN_KICK, Vec::new(), Reply::Ack),
        Command::Shutdown { force } => run_shutdown(cli, force),
    }
}

fn protocol_name(command: &Command) -> &'static str {
    match command {
        Command::InitVol { .. } => CN_INIT_VOL,
        Command::ClearVol { .. } => CN_CLEAR_VOL,
        Command::ResetVol { .. } => CN_RESET_VOL,
        Command::Start { .. } => CN_START,
        Command::Stop { .. } => CN_STOP,
        Command::FullBkp { .. } => CN_FULL_BKP,
        Command::HashBkp { .. } => CN_HASH_BKP,
        Command::Snapshot { .. } => CN_SNAPSHOT,
        Command::ArchiveInfo { .. } => CN_ARCHIVE_INFO,
        Command::Restore { .. } => CN_RESTORE,
        Command::DelRestored { .. } => CN_DEL_RESTORED,
        Command::ListRestored { .. } => CN_LIST_RESTORED,
        Command::Apply { .. } => CN_APPLY,
        Command::Merge { .. } => CN_MERGE,
        Command::Resize { .. } => CN_RESIZE,
        Command::Status { .. } => CN_STATUS,
        Command::HostType | Command::Get { .. } => CN_GET,
        Command::Kick => CN_KICK,
        Command::Shutdown { .. } => CN_SHUTDOWN,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{}: {msg}", protocol_name(&cli.command));
            ExitCode::FAILURE
        }
    }
}
