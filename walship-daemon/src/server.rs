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

//! Request-worker server loop shared by the three daemons.
//!
//! One thread per accepted connection: negotiate, resolve the handler by
//! protocol name, write the `"ok"` preamble, run the handler. A uniform
//! guard logs failures with the connection's client id and protocol name
//! and forwards the error text to the peer only when the preamble has not
//! been sent yet.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use walship_net::packet::TcpPacket;
use walship_net::proto::{
    self, negotiate_as_server, setup_socket, SocketParams, CN_SHUTDOWN, MSG_ACCEPT, MSG_OK,
};

use crate::error::Result;

/// Process-wide run state.
#[derive(Debug)]
pub struct ProcessStatus(AtomicU8);

const RUNNING: u8 = 0;
const GRACEFUL_SHUTDOWN: u8 = 1;
const FORCE_SHUTDOWN: u8 = 2;

impl ProcessStatus {
    pub fn new() -> Self {
        Self(AtomicU8::new(RUNNING))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_force_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire) == FORCE_SHUTDOWN
    }

    pub fn set_graceful_shutdown(&self) {
        self.0.store(GRACEFUL_SHUTDOWN, Ordering::Release);
    }

    pub fn set_force_shutdown(&self) {
        self.0.store(FORCE_SHUTDOWN, Ordering::Release);
    }
}

impl Default for ProcessStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// What a handler gets to work with.
pub struct ServerParams {
    pub pkt: TcpPacket,
    pub stream: TcpStream,
    pub client_id: String,
    pub protocol: String,
    pub ps: Arc<ProcessStatus>,
}

pub type Handler<C> = fn(&Arc<C>, &mut ServerParams) -> Result<()>;

/// Serve until a shutdown command arrives. `ctx` is the daemon's read-only
/// context; per-volume mutability lives behind its volume map.
pub fn run_server<C: Send + Sync + 'static>(
    listener: TcpListener,
    node_id: String,
    ctx: Arc<C>,
    handlers: Arc<HashMap<&'static str, Handler<C>>>,
    ps: Arc<ProcessStatus>,
    sock_params: SocketParams,
) -> Result<()> {
    listener.set_nonblocking(true)?;
    info!(node_id, addr = %listener.local_addr()?, "serving");

    while ps.is_running() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    error!(%peer, error = %e, "failed to configure socket");
                    continue;
                }
                if let Err(e) = setup_socket(&stream, &sock_params) {
                    error!(%peer, error = %e, "failed to configure socket");
                    continue;
                }
                let node_id = node_id.clone();
                let ctx = Arc::clone(&ctx);
                let handlers = Arc::clone(&handlers);
                let ps = Arc::clone(&ps);
                std::thread::spawn(move || {
                    request_worker(stream, node_id, ctx, handlers, ps);
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
    info!(node_id, "server loop exiting");
    Ok(())
}

fn request_worker<C: Send + Sync + 'static>(
    stream: TcpStream,
    node_id: String,
    ctx: Arc<C>,
    handlers: Arc<HashMap<&'static str, Handler<C>>>,
    ps: Arc<ProcessStatus>,
) {
    let mut pkt = match TcpPacket::from_stream(&stream) {
        Ok(pkt) => pkt,
        Err(e) => {
            error!(error = %e, "failed to set up connection");
            return;
        }
    };

    let mut sent_preamble = false;
    let mut client_id = String::new();
    let mut protocol = String::new();

    let outcome: Result<()> = (|| {
        let greeting = negotiate_as_server(&mut pkt, &node_id)?;
        client_id = greeting.client_id.clone();
        protocol = greeting.protocol.clone();

        if protocol == CN_SHUTDOWN {
            pkt.write_str(MSG_OK)?;
            pkt.flush()?;
            sent_preamble = true;
            return shutdown_server(&mut pkt, &ps, &client_id);
        }

        let handler = handlers.get(protocol.as_str()).copied().ok_or_else(|| {
            crate::error::DaemonError::BadRequest(format!("bad protocol: {protocol}"))
        })?;

        pkt.write_str(MSG_OK)?;
        pkt.flush()?;
        sent_preamble = true;

        let mut params = ServerParams {
            pkt: TcpPacket::from_stream(&stream)?,
            stream: stream.try_clone()?,
            client_id: greeting.client_id,
            protocol: greeting.protocol,
            ps: Arc::clone(&ps),
        };
        handler(&ctx, &mut params)
    })();

    if let Err(e) = outcome {
        error!(client_id, protocol, error = %e, "request failed");
        if !sent_preamble {
            let _ = pkt.write_str(&e.to_string());
            let _ = pkt.flush();
        }
    }
    // The socket closes when the worker returns.
}

fn shutdown_server(pkt: &mut TcpPacket, ps: &ProcessStatus, client_id: &str) -> Result<()> {
    let force = pkt.read_u8()? != 0;
    if force {
        ps.set_force_shutdown();
    } else {
        ps.set_graceful_shutdown();
    }
    info!(client_id, force, "shutdown requested");
    pkt.write_str(MSG_ACCEPT)?;
    pkt.flush()?;
    Ok(())
}

/// Client-side helper: connect, negotiate, and hand back the stream with a
/// packet over it.
pub fn connect_and_negotiate(
    addr: &str,
    node_id: &str,
    protocol: &str,
    sock_params: &SocketParams,
) -> Result<(TcpStream, TcpPacket)> {
    let stream = TcpStream::connect(addr)?;
    setup_socket(&stream, sock_params)?;
    let mut pkt = TcpPacket::from_stream(&stream)?;
    proto::negotiate_as_client(&mut pkt, node_id, protocol)?;
    Ok((stream, pkt))
}
