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

//! Error types for the wire layer.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Core(#[from] walship_core::CoreError),

    #[error(transparent)]
    Format(#[from] walship_format::FormatError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer reported an error: {0}")]
    Peer(String),

    #[error("protocol version mismatch: client {client}, server {server}")]
    VersionMismatch { client: u32, server: u32 },

    #[error("stream failed: {0}")]
    Stream(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
