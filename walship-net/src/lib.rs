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

//! walship wire protocol.
//!
//! Every message is length-prefixed. Bulk streams (log packs, wdiff packs)
//! carry a one-byte stream-control marker (next/end/error) before each
//! message so either side can drain cleanly when the other fails.

pub mod error;
pub mod packet;
pub mod proto;
pub mod transport;

pub use error::{NetError, Result};
pub use packet::{Packet, StreamCtl, TcpPacket};
pub use transport::{Frame, LogReceiver, LogSender};
