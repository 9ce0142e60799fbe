//! RDMA transport primitives.
//!
//! Device open, protection domain, completion queue, queue pair, memory
//! registration, and the post/poll verbs. Every call here is non-blocking
//! except [`Verbs::wait_for_completion`]; failures surface as
//! [`crate::error::Error::Rdma`] and this layer never retries.
//!
//! The verbs are expressed as the [`Verbs`] trait rather than bound
//! directly to a kernel driver so the rest of the crate — and its tests —
//! can run against [`loopback::SoftwareLoopback`], an in-process stand-in
//! that performs the same copy-on-read/copy-on-write semantics a real
//! NIC's DMA engine would, without requiring RDMA hardware.

pub mod loopback;
pub mod verbs;

pub use verbs::{
    AccessFlags, CompletionQueueHandle, MemoryRegionHandle, OpCode, ProtectionDomainHandle,
    QueuePairHandle, ScatterGatherEntry, SendWorkRequest, Verbs, WorkCompletion, WorkCompletionStatus,
};

/// A device name as passed to [`Verbs::open_device`], e.g. `"mlx5_0"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceName(pub String);

impl From<&str> for DeviceName {
    fn from(s: &str) -> Self {
        DeviceName(s.to_string())
    }
}

/// Depths requested when creating a queue pair: configurable send/recv
/// depths and SGE counts.
#[derive(Debug, Clone, Copy)]
pub struct QueuePairCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

impl Default for QueuePairCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 256,
            max_recv_wr: 256,
            max_send_sge: 4,
            max_recv_sge: 4,
        }
    }
}
