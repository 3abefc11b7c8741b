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

//! The walship daemons.
//!
//! Three daemons share one request-worker server loop and one per-volume
//! concurrency model:
//!
//! - **storage** reads the WAL device of each protected volume and ships
//!   log packs to the proxies; it also drives full and hash backups.
//! - **proxy** converts received log packs into wdiff files and forwards
//!   them to each configured archive.
//! - **archive** persists wdiffs per volume and materializes restorable
//!   images by applying, merging and restoring.
//!
//! Per volume, one mutex owns the named state machine, the action counters
//! and the in-memory diff manager; a condition variable serializes stop
//! handshakes; long operations run outside the lock and re-acquire it to
//! commit.

pub mod action_counter;
pub mod archive;
pub mod error;
pub mod logger;
pub mod proxy;
pub mod server;
pub mod state_machine;
pub mod stop;
pub mod storage;
pub mod task_queue;
pub mod vol_map;

pub use error::{DaemonError, Result};
pub use server::{run_server, Handler, ProcessStatus, ServerParams};
pub use state_machine::{SmTransaction, StateMachine, VolState};
