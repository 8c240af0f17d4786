//! Error taxonomy of the engine.
//!
//! Every public operation returns one of these kinds so callers can tell
//! a busy lock from a missing key from a corrupt image. `Eof` and
//! `NotFound` are ordinary end-of-iteration / lookup-miss outcomes and
//! are routinely matched on, not just propagated.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    Nomem,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("another process or thread holds the requested lock")]
    Busy,

    #[error("operation not permitted in the current state: {0}")]
    Locked(&'static str),

    #[error("read-only database")]
    ReadOnly,

    #[error("corrupt database image: {0}")]
    Corrupt(&'static str),

    /// Per-page free space exhausted. Internal to the hash engine:
    /// triggers a split or an overflow chain, never surfaced.
    #[error("page is full")]
    Full,

    #[error("no such record")]
    NotFound,

    #[error("end of iteration")]
    Eof,

    #[error("method not implemented by this storage engine")]
    NotImplemented,

    #[error("limit reached: {0}")]
    Limit(&'static str),

    #[error("operation aborted by consumer callback")]
    Abort,

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("permission denied")]
    Perm,
}

impl Error {
    /// Is this a benign lookup / iteration outcome rather than a failure?
    #[inline]
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::NotFound | Error::Eof)
    }
}

pub(crate) fn from_io(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::PermissionDenied => Error::Perm,
        io::ErrorKind::WouldBlock => Error::Busy,
        io::ErrorKind::OutOfMemory => Error::Nomem,
        _ => Error::Io(e),
    }
}
