//! An in-process software implementation of [`Verbs`], standing in for a
//! real RDMA NIC in tests and examples, where no physical hardware is
//! available in CI.
//!
//! Completions are queued synchronously when a work request is posted: a
//! `Send`/`Recv` pair is matched FIFO, and `RdmaRead`/`RdmaWrite` perform
//! an immediate `memcpy` between the two sides' registered regions, since
//! both live in the same address space here. The *ordering* behavior this
//! crate depends on (posts complete in program order, RDMA Writes to
//! metadata are visible only after the data they describe) falls out for
//! free in-process; the point of the loopback is to exercise the ring and
//! session state machines, not to model NIC completion reordering.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::rdma::verbs::{
    rdma_err, AccessFlags, CompletionQueueHandle, MemoryRegionHandle, OpCode,
    ProtectionDomainHandle, QueuePairHandle, SendWorkRequest, Verbs, WorkCompletion,
    WorkCompletionStatus,
};
use crate::rdma::{DeviceName, QueuePairCaps};

struct Region {
    addr: u64,
    len: usize,
    access: AccessFlags,
}

/// Software loopback transport. One instance is shared by both "sides" of
/// a connection in tests, since each side's registered memory is just a
/// region of this process's address space.
pub struct SoftwareLoopback {
    next_id: AtomicU32,
    regions: Mutex<HashMap<u32, Region>>,
    cqs: Mutex<HashMap<u32, VecDeque<WorkCompletion>>>,
    recv_queues: Mutex<HashMap<u32, VecDeque<SendWorkRequest>>>,
    qp_cq: Mutex<HashMap<u32, u32>>,
    peer_of: Mutex<HashMap<u32, u32>>,
}

impl Default for SoftwareLoopback {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            regions: Mutex::new(HashMap::new()),
            cqs: Mutex::new(HashMap::new()),
            recv_queues: Mutex::new(HashMap::new()),
            qp_cq: Mutex::new(HashMap::new()),
            peer_of: Mutex::new(HashMap::new()),
        }
    }
}

impl SoftwareLoopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link two queue pairs as loopback peers, so a `Send` posted on one
    /// is matched against a `Recv` posted on the other. Mirrors what the
    /// connection-manager handshake would otherwise establish against a
    /// real peer NIC.
    pub fn connect(&self, a: QueuePairHandle, b: QueuePairHandle) {
        self.peer_of.lock().insert(a.0, b.0);
        self.peer_of.lock().insert(b.0, a.0);
    }

    fn fresh_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn push_completion(&self, cq: u32, wc: WorkCompletion) {
        self.cqs.lock().entry(cq).or_default().push_back(wc);
    }

    /// # Safety
    /// Both `src` and `dst` must name live, non-overlapping byte ranges
    /// for the duration of the call; callers (the ring/session layers)
    /// guarantee this via memory-region registration bookkeeping, exactly
    /// as a real DMA engine relies on pinned pages staying resident.
    unsafe fn copy(src: u64, dst: u64, len: usize) {
        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
    }
}

impl Verbs for SoftwareLoopback {
    fn open_device(&self, _name: &DeviceName) -> Result<()> {
        Ok(())
    }

    fn alloc_pd(&self) -> Result<ProtectionDomainHandle> {
        Ok(ProtectionDomainHandle(self.fresh_id()))
    }

    fn create_cq(&self, _depth: u32) -> Result<CompletionQueueHandle> {
        let id = self.fresh_id();
        self.cqs.lock().insert(id, VecDeque::new());
        Ok(CompletionQueueHandle(id))
    }

    fn create_qp(
        &self,
        _pd: ProtectionDomainHandle,
        cq: CompletionQueueHandle,
        _caps: QueuePairCaps,
    ) -> Result<QueuePairHandle> {
        let id = self.fresh_id();
        self.qp_cq.lock().insert(id, cq.0);
        self.recv_queues.lock().insert(id, VecDeque::new());
        Ok(QueuePairHandle(id))
    }

    fn reg_mr(
        &self,
        _pd: ProtectionDomainHandle,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegionHandle> {
        let id = self.fresh_id();
        self.regions
            .lock()
            .insert(id, Region { addr, len, access });
        Ok(MemoryRegionHandle(id))
    }

    fn dereg_mr(&self, mr: MemoryRegionHandle) -> Result<()> {
        self.regions.lock().remove(&mr.0);
        Ok(())
    }

    fn mr_lkey(&self, mr: MemoryRegionHandle) -> Result<u32> {
        Ok(mr.0)
    }

    fn mr_rkey(&self, mr: MemoryRegionHandle) -> Result<u32> {
        Ok(mr.0)
    }

    fn post_send(&self, qp: QueuePairHandle, wr: SendWorkRequest) -> Result<()> {
        let cq = *self
            .qp_cq
            .lock()
            .get(&qp.0)
            .ok_or_else(|| rdma_err("post_send", 1))?;

        match wr.opcode {
            OpCode::RdmaRead | OpCode::RdmaWrite | OpCode::RdmaWriteWithImm => {
                let regions = self.regions.lock();
                let remote = regions
                    .get(&wr.rkey)
                    .ok_or_else(|| rdma_err("post_send:rkey", 2))?;
                let needed = if wr.opcode == OpCode::RdmaRead {
                    AccessFlags::REMOTE_READ
                } else {
                    AccessFlags::REMOTE_WRITE
                };
                if !remote.access.contains(needed) {
                    return Err(rdma_err("post_send:access", 5));
                }
                let mut total = 0u32;
                for sge in &wr.sge {
                    let (src, dst) = if wr.opcode == OpCode::RdmaRead {
                        (wr.remote_addr + total as u64, sge.addr)
                    } else {
                        (sge.addr, wr.remote_addr + total as u64)
                    };
                    if (dst - (wr.remote_addr)) as usize + sge.length as usize > remote.len
                        && wr.opcode != OpCode::RdmaRead
                    {
                        return Err(rdma_err("post_send:overflow", 3));
                    }
                    unsafe { Self::copy(src, dst, sge.length as usize) };
                    total += sge.length;
                }
                self.push_completion(
                    cq,
                    WorkCompletion {
                        wr_id: wr.wr_id,
                        status: WorkCompletionStatus::Success,
                        opcode: wr.opcode,
                        byte_len: total,
                        imm_data: wr.immediate,
                    },
                );
            }
            OpCode::Send => {
                let peer = *self
                    .peer_of
                    .lock()
                    .get(&qp.0)
                    .ok_or_else(|| rdma_err("post_send:unconnected", 4))?;
                let mut recv_queues = self.recv_queues.lock();
                if let Some(recv_wr) = recv_queues.entry(peer).or_default().pop_front() {
                    let peer_cq = *self.qp_cq.lock().get(&peer).unwrap_or(&cq);
                    let len: u32 = wr.sge.iter().map(|s| s.length).sum();
                    let mut offset = 0u64;
                    for sge in &wr.sge {
                        if let Some(dst) = recv_wr.sge.first() {
                            unsafe { Self::copy(sge.addr, dst.addr + offset, sge.length as usize) };
                        }
                        offset += sge.length as u64;
                    }
                    self.push_completion(
                        peer_cq,
                        WorkCompletion {
                            wr_id: recv_wr.wr_id,
                            status: WorkCompletionStatus::Success,
                            opcode: OpCode::Recv,
                            byte_len: len,
                            imm_data: None,
                        },
                    );
                }
                self.push_completion(
                    cq,
                    WorkCompletion {
                        wr_id: wr.wr_id,
                        status: WorkCompletionStatus::Success,
                        opcode: OpCode::Send,
                        byte_len: wr.sge.iter().map(|s| s.length).sum(),
                        imm_data: None,
                    },
                );
            }
            OpCode::Recv => unreachable!("post_recv goes through post_recv, not post_send"),
        }
        Ok(())
    }

    fn post_recv(&self, qp: QueuePairHandle, wr: SendWorkRequest) -> Result<()> {
        self.recv_queues
            .lock()
            .entry(qp.0)
            .or_default()
            .push_back(wr);
        Ok(())
    }

    fn poll_cq(&self, cq: CompletionQueueHandle, max: usize) -> Result<Vec<WorkCompletion>> {
        let mut cqs = self.cqs.lock();
        let q = cqs.entry(cq.0).or_default();
        let n = max.min(q.len());
        Ok(q.drain(..n).collect())
    }

    fn wait_for_completion(
        &self,
        cq: CompletionQueueHandle,
        timeout: std::time::Duration,
    ) -> Result<WorkCompletion> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(wc) = self.poll_cq(cq, 1)?.into_iter().next() {
                return Ok(wc);
            }
            if std::time::Instant::now() >= deadline {
                return Err(crate::error::Error::Timeout(timeout));
            }
            std::thread::yield_now();
        }
    }
}
