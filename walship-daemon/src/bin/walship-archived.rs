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

//! walship archive daemon.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use walship_daemon::archive::{archive_handlers, ArchiveCtx};
use walship_daemon::server::{run_server, ProcessStatus};
use walship_net::proto::{KeepAliveParams, SocketParams};

/// walship archive daemon - stores and materializes volume history
#[derive(Parser, Debug)]
#[command(name = "walship-archived")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base directory for volume data
    #[arg(short, long, default_value = "./walship-archive")]
    base_dir: PathBuf,

    /// Listen port
    #[arg(short, long, default_value = "10202")]
    port: u16,

    /// Listen address
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    addr: String,

    /// Log file path ("-" logs to stderr)
    #[arg(short, long, default_value = "-")]
    log_file: String,

    /// Node id shown to peers
    #[arg(long, default_value = "archive-0")]
    id: String,

    /// Socket timeout [sec]; 0 disables
    #[arg(long, default_value = "60")]
    timeout: u64,

    /// Enable TCP keep-alive (disables socket timeouts)
    #[arg(long)]
    ka: bool,

    /// TCP keep-alive idle time [sec]
    #[arg(long, default_value = "60")]
    ka_idle: u32,

    /// TCP keep-alive interval [sec]
    #[arg(long, default_value = "10")]
    ka_intvl: u32,

    /// TCP keep-alive probe count
    #[arg(long, default_value = "6")]
    ka_cnt: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    walship_daemon::logger::init_logging(&args.log_file, &args.log_level);

    if let Err(e) = std::fs::create_dir_all(&args.base_dir) {
        error!(error = %e, "failed to create base directory");
        std::process::exit(1);
    }

    let sock_params = SocketParams {
        timeout: std::time::Duration::from_secs(args.timeout),
        keep_alive: KeepAliveParams {
            enabled: args.ka,
            idle: args.ka_idle,
            intvl: args.ka_intvl,
            cnt: args.ka_cnt,
        },
    };

    let ctx = Arc::new(ArchiveCtx::new(args.id.clone(), args.base_dir));
    let handlers = Arc::new(archive_handlers());
    let ps = Arc::new(ProcessStatus::new());

    let listener = match TcpListener::bind((args.addr.as_str(), args.port)) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_server(listener, args.id, ctx, handlers, ps, sock_params) {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
