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

//! Error types shared by the core primitives.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unaligned access: {0}")]
    Unaligned(String),

    #[error("queue closed")]
    QueueClosed,

    #[error("queue failed: {0}")]
    QueueFailed(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
