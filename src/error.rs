//! Crate-wide error type.
//!
//! One `thiserror`-derived enum covers every failure surface described in
//! the design: RDMA verb failures, malformed control/data-plane protocol,
//! session and ring capacity exhaustion, and the file-service result codes
//! that get forwarded verbatim into response frames.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A verbs call failed, a CQ entry carried a non-success status, or
    /// torn metadata persisted past the retry budget.
    #[error("rdma error during {op}: {code}")]
    Rdma { op: &'static str, code: i32 },

    /// Unknown `MsgId`, a mismatched `ClientId` on terminate/release, or
    /// an unrecognized CM event.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No free session slot at `CONNECT_REQUEST`. Rejects the new
    /// connection; existing sessions are unaffected.
    #[error("no free session slot")]
    NoFreeSlot,

    /// A response-ring allocation would overflow the ring. This is a
    /// backend bug: callers must treat it as fatal to the process, not
    /// retry it.
    #[error("response ring overflow: {0}")]
    RingOverflow(String),

    /// File-service surfaced result codes, forwarded verbatim in `Result`.
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("io error: {0}")]
    Io(String),

    /// CM address-resolution timeout (the only timeout in this system).
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Configuration load/validation failure.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors that are fatal to the whole backend process rather
    /// than to a single session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::RingOverflow(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
