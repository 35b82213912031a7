// Copyright 2024 Tio contributors
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

//! Client-facing error kinds. Internal setup/IO failures use `anyhow::Error`
//! freely; anything that crosses the dispatcher boundary and needs to be
//! turned into an `answer error` line (or a binary error code) goes through
//! [`TioError`] instead, so handlers can match on kind.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TioError {
    /// Unknown command name, or a line/frame that didn't parse.
    BadCommand(String),
    /// A handle the session doesn't have registered.
    BadHandle(u32),
    /// The ACL collaborator denied the command or object access.
    AccessDenied,
    /// `create` named a container type the registry doesn't know how to
    /// construct.
    TypeUnknown(String),
    /// `create`-only semantics requested a name that already exists.
    NameConflict(String),
    /// `open`/lookup failed to find the named container (or group).
    NotFound(String),
    /// Container exists but isn't the requested type.
    TypeMismatch { expected: String, found: String },
    /// An index/position argument was out of bounds.
    OutOfRange,
    /// A binary frame declared a field larger than the configured cap.
    OversizeFrame(u32),
    /// Command isn't applicable to this container's type (e.g. `push_back`
    /// on a map).
    Unsupported(String),
    /// Anything else — wraps an internal failure that the client only
    /// needs to know failed, not why.
    InternalError(String),
}

impl TioError {
    /// The binary protocol's `ERROR_MESSAGE` field carries an integer code
    /// alongside the text; this is that code.
    pub fn code(&self) -> u16 {
        match self {
            TioError::BadCommand(_) => 1,
            TioError::BadHandle(_) => 2,
            TioError::AccessDenied => 3,
            TioError::TypeUnknown(_) => 4,
            TioError::NameConflict(_) => 5,
            TioError::NotFound(_) => 6,
            TioError::TypeMismatch { .. } => 7,
            TioError::OutOfRange => 8,
            TioError::OversizeFrame(_) => 9,
            TioError::Unsupported(_) => 10,
            TioError::InternalError(_) => 11,
        }
    }
}

impl fmt::Display for TioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TioError::BadCommand(s) => write!(f, "bad_command: {s}"),
            TioError::BadHandle(h) => write!(f, "bad_handle: {h}"),
            TioError::AccessDenied => write!(f, "access_denied"),
            TioError::TypeUnknown(t) => write!(f, "type_unknown: {t}"),
            TioError::NameConflict(name) => write!(f, "name_conflict: {name}"),
            TioError::NotFound(name) => write!(f, "not_found: {name}"),
            TioError::TypeMismatch { expected, found } => {
                write!(f, "type_mismatch: expected {expected}, found {found}")
            }
            TioError::OutOfRange => write!(f, "out_of_range"),
            TioError::OversizeFrame(n) => write!(f, "oversize_frame: {n} bytes"),
            TioError::Unsupported(cmd) => write!(f, "unsupported: {cmd}"),
            TioError::InternalError(msg) => write!(f, "internal_error: {msg}"),
        }
    }
}

impl std::error::Error for TioError {}

impl From<anyhow::Error> for TioError {
    fn from(e: anyhow::Error) -> Self {
        TioError::InternalError(e.to_string())
    }
}

pub type TioResult<T> = Result<T, TioError>;
