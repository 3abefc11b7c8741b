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

//! Daemon-level error types.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Core(#[from] walship_core::CoreError),

    #[error(transparent)]
    Format(#[from] walship_format::FormatError),

    #[error(transparent)]
    Net(#[from] walship_net::NetError),

    #[error("state error: {0}")]
    State(String),

    #[error("operation stopped")]
    Stopped,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
