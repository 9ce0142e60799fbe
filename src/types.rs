//! Identifiers and small value types shared across the control and data
//! planes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into the fixed-size client slot array. Drawn from
/// `[0, MaxClients)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Backend-assigned identifier for a file, scoped to the file service's
/// namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// Per-request identifier chosen by the host, echoed unchanged in the
/// matching response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Result code carried in both control acknowledgements and data-plane
/// response frames. `IoPending` is the sentinel the completion scanner
/// looks for; it is never a terminal value observed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    IoPending = 1,
    NotFound = 2,
    AlreadyExists = 3,
    Io = 4,
    CapacityError = 5,
    ProtocolError = 6,
}

impl TryFrom<u32> for ResultCode {
    type Error = crate::error::Error;

    fn try_from(v: u32) -> std::result::Result<Self, Self::Error> {
        Ok(match v {
            0 => ResultCode::Success,
            1 => ResultCode::IoPending,
            2 => ResultCode::NotFound,
            3 => ResultCode::AlreadyExists,
            4 => ResultCode::Io,
            5 => ResultCode::CapacityError,
            6 => ResultCode::ProtocolError,
            other => return Err(crate::error::Error::Protocol(format!("unknown ResultCode {other}"))),
        })
    }
}

impl From<&crate::error::Error> for ResultCode {
    fn from(e: &crate::error::Error) -> Self {
        use crate::error::Error as E;
        match e {
            E::NotFound => ResultCode::NotFound,
            E::AlreadyExists => ResultCode::AlreadyExists,
            E::Io(_) => ResultCode::Io,
            E::NoFreeSlot | E::RingOverflow(_) => ResultCode::CapacityError,
            E::Protocol(_) => ResultCode::ProtocolError,
            E::Rdma { .. } | E::Timeout(_) | E::Config(_) => ResultCode::Io,
        }
    }
}

/// File attributes returned by `GetFileInfo`/`GetFileAttr`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FileAttr {
    pub size: u64,
    pub is_directory: bool,
    pub created_at_unix_secs: u64,
    pub modified_at_unix_secs: u64,
}
