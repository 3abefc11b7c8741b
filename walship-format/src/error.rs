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

//! Error types for the format layer.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Core(#[from] walship_core::CoreError),

    #[error("corrupt log: {0}")]
    CorruptLog(String),

    #[error("corrupt diff: {0}")]
    CorruptDiff(String),

    #[error("bad metadata: {0}")]
    BadMeta(String),

    #[error("diffs are not mergeable: {0}")]
    NotMergeable(String),

    #[error("base image is not aligned to the logical block size")]
    BaseNotAligned,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, FormatError>;
