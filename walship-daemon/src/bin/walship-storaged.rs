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

//! walship storage daemon.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use walship_daemon::server::{run_server, ProcessStatus};
use walship_daemon::storage::{run_wlog_worker, storage_handlers, StorageCtx};
use walship_net::proto::{KeepAliveParams, SocketParams};

/// walship storage daemon - ships volume writes off-box
#[derive(Parser, Debug)]
#[command(name = "walship-storaged")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base directory for volume metadata
    #[arg(short, long, default_value = "./walship-storage")]
    base_dir: PathBuf,

    /// Listen port
    #[arg(short, long, default_value = "10200")]
    port: u16,

    /// Listen address
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    addr: String,

    /// Archive daemon address (host:port)
    #[arg(long)]
    archive: String,

    /// Proxy daemon addresses (host:port), repeatable
    #[arg(long = "proxy", required = true)]
    proxies: Vec<String>,

    /// Log file path ("-" logs to stderr)
    #[arg(short, long, default_value = "-")]
    log_file: String,

    /// Node id shown to peers
    #[arg(long, default_value = "storage-0")]
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

    /// Bulk sync rate cap [logical blocks per second]; 0 disables
    #[arg(long, default_value = "0")]
    max_sync_lb_per_sec: u64,
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

    let ps = Arc::new(ProcessStatus::new());
    let mut ctx = StorageCtx::new(
        args.id.clone(),
        args.base_dir,
        args.archive,
        args.proxies,
        Arc::clone(&ps),
        sock_params,
    );
    ctx.max_sync_lb_per_sec = args.max_sync_lb_per_sec;
    let ctx = Arc::new(ctx);

    let worker = {
        let ctx = Arc::clone(&ctx);
        std::thread::spawn(move || run_wlog_worker(ctx))
    };

    let handlers = Arc::new(storage_handlers());
    let listener = match TcpListener::bind((args.addr.as_str(), args.port)) {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let result = run_server(listener, args.id, Arc::clone(&ctx), handlers, ps, sock_params);
    ctx.queue.close();
    let _ = worker.join();
    if let Err(e) = result {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
