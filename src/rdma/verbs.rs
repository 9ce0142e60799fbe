//! The [`Verbs`] trait: the seam between the rest of the crate and an
//! actual RDMA device. Everything above this trait (ring polling, session
//! teardown, the data-plane pipeline) only ever calls through it, which is
//! what lets tests substitute [`super::loopback::SoftwareLoopback`] for
//! real hardware.

use crate::error::{Error, Result};
use crate::rdma::{DeviceName, QueuePairCaps};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtectionDomainHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionQueueHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueuePairHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegionHandle(pub u32);

bitflags::bitflags! {
    /// Access rights granted on memory registration:
    /// `{LocalWrite, RemoteRead, RemoteWrite}`.
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE  = 0b001;
        const REMOTE_READ  = 0b010;
        const REMOTE_WRITE = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Send,
    Recv,
    RdmaRead,
    RdmaWrite,
    RdmaWriteWithImm,
}

/// One scatter-gather element: a local address/length pair plus the
/// memory region it was registered under.
#[derive(Debug, Clone, Copy)]
pub struct ScatterGatherEntry {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// A posted work request. `remote_addr`/`rkey` are only meaningful for
/// `RdmaRead`/`RdmaWrite`.
#[derive(Debug, Clone)]
pub struct SendWorkRequest {
    pub wr_id: u64,
    pub opcode: OpCode,
    pub sge: Vec<ScatterGatherEntry>,
    pub remote_addr: u64,
    pub rkey: u32,
    pub immediate: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkCompletionStatus {
    Success,
    Error(i32),
}

#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WorkCompletionStatus,
    pub opcode: OpCode,
    pub byte_len: u32,
    pub imm_data: Option<u32>,
}

impl WorkCompletion {
    pub fn is_success(&self) -> bool {
        matches!(self.status, WorkCompletionStatus::Success)
    }
}

/// The full set of operations this crate requires of the transport layer.
pub trait Verbs: Send + Sync {
    fn open_device(&self, name: &DeviceName) -> Result<()>;
    fn alloc_pd(&self) -> Result<ProtectionDomainHandle>;
    fn create_cq(&self, depth: u32) -> Result<CompletionQueueHandle>;
    fn create_qp(
        &self,
        pd: ProtectionDomainHandle,
        cq: CompletionQueueHandle,
        caps: QueuePairCaps,
    ) -> Result<QueuePairHandle>;

    /// Register `len` bytes starting at `addr` (host virtual address cast
    /// to `u64`) for local and/or remote access.
    fn reg_mr(
        &self,
        pd: ProtectionDomainHandle,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegionHandle>;
    fn dereg_mr(&self, mr: MemoryRegionHandle) -> Result<()>;

    /// The local and remote keys for a registered region.
    fn mr_lkey(&self, mr: MemoryRegionHandle) -> Result<u32>;
    fn mr_rkey(&self, mr: MemoryRegionHandle) -> Result<u32>;

    fn post_send(&self, qp: QueuePairHandle, wr: SendWorkRequest) -> Result<()>;
    fn post_recv(&self, qp: QueuePairHandle, wr: SendWorkRequest) -> Result<()>;

    /// Non-blocking: returns up to `max` ready completions, possibly zero.
    fn poll_cq(&self, cq: CompletionQueueHandle, max: usize) -> Result<Vec<WorkCompletion>>;

    /// The only blocking call permitted anywhere in this transport, used
    /// solely during CM negotiation.
    fn wait_for_completion(
        &self,
        cq: CompletionQueueHandle,
        timeout: std::time::Duration,
    ) -> Result<WorkCompletion>;
}

pub(crate) fn rdma_err(op: &'static str, code: i32) -> Error {
    Error::Rdma { op, code }
}
