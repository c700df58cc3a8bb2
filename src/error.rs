//! Error taxonomy for the ingest path

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A message could not be framed or decoded. The connection is closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("connection closed before delimiter")]
    Unterminated,

    #[error("frame exceeds {0} bytes without delimiter")]
    TooLong(usize),

    #[error("empty message")]
    Empty,

    #[error("message is not valid ASCII/UTF-8")]
    Encoding,

    #[error("unknown message kind <{0}>")]
    UnknownKind(String),

    #[error("missing field <{0}>")]
    MissingField(&'static str),

    #[error("bad value for <{field}>: {value}")]
    BadValue { field: &'static str, value: String },

    #[error("unsafe path <{0}>")]
    UnsafePath(String),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("bytes received<{received}> is greater than file size<{declared}>")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("storage I/O failed on <{}>: {source}", path.display())]
    StorageIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no volume has enough free capacity")]
    CapacityExhausted,

    #[error("metadata registration failed: {0}")]
    Registration(String),

    #[error("connection lost: {0}")]
    ConnectionLost(#[source] io::Error),
}

impl IngestError {
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        IngestError::StorageIo {
            path: path.into(),
            source,
        }
    }
}
