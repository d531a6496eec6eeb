// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! [`Error`] and [`Result`] types used throughout the crate.

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

use arrow::error::ArrowError;

/// Result type with the crate's [`Error`] as the default error.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Errors surfaced by the sort buffer and its collaborators.
///
/// Nothing is retried locally. State violations are fatal to the query;
/// everything else leaves the operator in a terminal state and
/// propagates to the caller.
#[derive(Debug)]
pub enum Error {
    /// Error returned by arrow during extraction, gather-copy or IPC.
    Arrow(Box<ArrowError>),
    /// I/O failure while writing or reading spill runs.
    Io(io::Error),
    /// An operation was invoked in the wrong phase, or with invalid
    /// construction arguments.
    PreconditionViolated(String),
    /// `spill` was requested but no spill configuration exists.
    Unconfigured(String),
    /// Reservation growth failed and spilling was disabled or already
    /// exhausted.
    ResourcesExhausted(String),
    /// The memory pool aborted the query; the operator has released
    /// its resources.
    Aborted(String),
    /// Invariant breach that indicates a bug in this crate.
    Internal(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Error::Arrow(e) => write!(f, "Arrow error: {e}"),
            Error::Io(e) => write!(f, "Spill IO error: {e}"),
            Error::PreconditionViolated(msg) => {
                write!(f, "Precondition violated: {msg}")
            }
            Error::Unconfigured(msg) => write!(f, "Unconfigured: {msg}"),
            Error::ResourcesExhausted(msg) => {
                write!(f, "Resources exhausted: {msg}")
            }
            Error::Aborted(msg) => write!(f, "Aborted: {msg}"),
            Error::Internal(msg) => write!(
                f,
                "Internal error: {msg}. This was likely caused by a bug in \
                 sort-buffer's code and we would welcome that you file a bug report"
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Arrow(e) => Some(e.as_ref()),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ArrowError> for Error {
    fn from(e: ArrowError) -> Self {
        Error::Arrow(Box::new(e))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Construct an `Err(Error::PreconditionViolated)` from a format string.
#[macro_export]
macro_rules! precondition_err {
    ($($arg:tt)*) => {
        Err($crate::error::Error::PreconditionViolated(format!($($arg)*)))
    };
}

/// Construct an `Err(Error::Unconfigured)` from a format string.
#[macro_export]
macro_rules! unconfigured_err {
    ($($arg:tt)*) => {
        Err($crate::error::Error::Unconfigured(format!($($arg)*)))
    };
}

/// Construct an `Err(Error::ResourcesExhausted)` from a format string.
#[macro_export]
macro_rules! resources_err {
    ($($arg:tt)*) => {
        Err($crate::error::Error::ResourcesExhausted(format!($($arg)*)))
    };
}

/// Construct an `Err(Error::Aborted)` from a format string.
#[macro_export]
macro_rules! aborted_err {
    ($($arg:tt)*) => {
        Err($crate::error::Error::Aborted(format!($($arg)*)))
    };
}

/// Construct an `Err(Error::Internal)` from a format string.
#[macro_export]
macro_rules! internal_err {
    ($($arg:tt)*) => {
        Err($crate::error::Error::Internal(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e: Error = ArrowError::ComputeError("divide by zero".to_string()).into();
        assert_eq!(
            e.to_string(),
            "Arrow error: Compute error: divide by zero"
        );

        let e =
            Error::PreconditionViolated("add_input called after no_more_input".to_string());
        assert_eq!(
            e.to_string(),
            "Precondition violated: add_input called after no_more_input"
        );
    }

    #[test]
    fn error_source() {
        use std::error::Error as _;
        let e: Error = io::Error::new(io::ErrorKind::Other, "disk full").into();
        assert!(e.source().is_some());
        let e = Error::Aborted("pool aborted".to_string());
        assert!(e.source().is_none());
    }
}
