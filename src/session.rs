//! Connection Registry: a fixed-size array of client slots, each
//! tracking a control session and a buffer session, driven by the RDMA
//! Connection-Manager event state machine.
//!
//! Slots live in an arena indexed by `ClientId`; the `cm_id → slot`
//! mapping is a linear scan over that array. `MaxClients` is small
//! enough that this beats a hash map.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::rdma::verbs::{
    AccessFlags, CompletionQueueHandle, MemoryRegionHandle, OpCode, ProtectionDomainHandle,
    QueuePairHandle, ScatterGatherEntry, SendWorkRequest, Verbs,
};
use crate::rdma::QueuePairCaps;
use crate::ring::{RingStorage, SplitState};
use crate::types::{ClientId, RequestId};

/// Which kind of channel a `CONNECT_REQUEST`'s private data names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Buffer,
}

impl ChannelKind {
    pub fn from_priv_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(ChannelKind::Control),
            1 => Ok(ChannelKind::Buffer),
            _ => Err(Error::Protocol(format!("unrecognized connection private data byte {b}"))),
        }
    }
}

/// Connection-Manager events the backend's event channel surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    AddrResolved,
    RouteResolved,
    ConnectRequest,
    Established,
    Disconnected,
    AddrError,
    RouteError,
    ConnectError,
    Unreachable,
    Rejected,
    DeviceRemoval,
}

impl CmEvent {
    /// Whether this event is one of the terminal error events that are
    /// acknowledged and surfaced rather than driving a state transition
    /// transition.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CmEvent::AddrError
                | CmEvent::RouteError
                | CmEvent::ConnectError
                | CmEvent::Unreachable
                | CmEvent::Rejected
                | CmEvent::DeviceRemoval
        )
    }
}

/// A client slot's lifecycle: `Available`, `Occupied` (handshake in
/// progress), `Connected`, or tearing down back to `Available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Available,
    Occupied,
    Connected,
}

/// One outstanding typed control request: idle is modelled as `None`.
#[derive(Debug, Clone)]
pub struct PendingControlRequest {
    pub request_id: RequestId,
    pub msg_id: u16,
}

/// Control session: bidirectional typed messages, at most one
/// outstanding request.
pub struct ControlSession {
    pub send_buf: Vec<u8>,
    pub recv_buf: Vec<u8>,
    pub pending: Option<PendingControlRequest>,

    /// The RDMA transport backing this session, present once the
    /// session was created against a live [`Verbs`] implementation
    /// (`None` for the bare wire-protocol unit tests in `control.rs`).
    pub qp: Option<QueuePairHandle>,
    pub cq: Option<CompletionQueueHandle>,
    pub send_mr: Option<MemoryRegionHandle>,
    pub recv_mr: Option<MemoryRegionHandle>,
}

impl ControlSession {
    pub fn new(ctrl_msg_size: usize) -> Self {
        Self {
            send_buf: vec![0u8; ctrl_msg_size],
            recv_buf: vec![0u8; ctrl_msg_size],
            pending: None,
            qp: None,
            cq: None,
            send_mr: None,
            recv_mr: None,
        }
    }

    /// Build a control session with a real queue pair: allocates a CQ
    /// and QP under `pd`, registers the send/recv staging buffers, and
    /// arms the first receive so the first inbound `Send` from the peer
    /// has somewhere to land.
    pub fn new_with_verbs(verbs: &dyn Verbs, pd: ProtectionDomainHandle, ctrl_msg_size: usize) -> Result<Self> {
        let mut session = Self::new(ctrl_msg_size);
        let cq = verbs.create_cq(64)?;
        let qp = verbs.create_qp(pd, cq, QueuePairCaps::default())?;
        let send_mr = verbs.reg_mr(pd, session.send_buf.as_mut_ptr() as u64, session.send_buf.len(), AccessFlags::LOCAL_WRITE)?;
        let recv_mr = verbs.reg_mr(pd, session.recv_buf.as_mut_ptr() as u64, session.recv_buf.len(), AccessFlags::LOCAL_WRITE)?;
        session.qp = Some(qp);
        session.cq = Some(cq);
        session.send_mr = Some(send_mr);
        session.recv_mr = Some(recv_mr);
        session.post_recv(verbs)?;
        Ok(session)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// (Re-)arm a receive for the next inbound control `Send`. Called
    /// once at session creation and again every time a message is
    /// consumed out of `recv_buf`.
    pub fn post_recv(&self, verbs: &dyn Verbs) -> Result<()> {
        let (Some(qp), Some(recv_mr)) = (self.qp, self.recv_mr) else { return Ok(()) };
        let lkey = verbs.mr_lkey(recv_mr)?;
        verbs.post_recv(
            qp,
            SendWorkRequest {
                wr_id: 0,
                opcode: OpCode::Recv,
                sge: vec![ScatterGatherEntry { addr: self.recv_buf.as_ptr() as u64, length: self.recv_buf.len() as u32, lkey }],
                remote_addr: 0,
                rkey: 0,
                immediate: None,
            },
        )
    }

    /// Post the current contents of `send_buf` as a control response.
    pub fn post_send(&self, verbs: &dyn Verbs) -> Result<()> {
        let (Some(qp), Some(send_mr)) = (self.qp, self.send_mr) else { return Ok(()) };
        let lkey = verbs.mr_lkey(send_mr)?;
        verbs.post_send(
            qp,
            SendWorkRequest {
                wr_id: 1,
                opcode: OpCode::Send,
                sge: vec![ScatterGatherEntry { addr: self.send_buf.as_ptr() as u64, length: self.send_buf.len() as u32, lkey }],
                remote_addr: 0,
                rkey: 0,
                immediate: None,
            },
        )
    }
}

/// One slot of the outstanding-request table: the context a
/// batch-parsed frame carries from parse through completion scan
/// through response transmit.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub file_id: u32,
    pub offset: u64,
    pub bytes: u32,
    pub is_read: bool,
    pub response_slot_start: u32,
    pub response_slot_len: u32,
}

/// The host-addressed locations the backend needs to drive a buffer
/// session's data plane: the request ring's data region and producer
/// tail word, and the response ring's data region and consumer head
/// word. Learned from the host via `MsgId::F2bBindBufferRing` rather
/// than CM private data, since it doesn't fit in one byte.
#[derive(Debug, Clone, Copy)]
pub struct BufferRemote {
    pub request_data_addr: u64,
    pub request_data_rkey: u32,
    pub request_tail_addr: u64,
    pub request_tail_rkey: u32,
    pub response_data_addr: u64,
    pub response_data_rkey: u32,
    pub response_head_addr: u64,
    pub response_head_rkey: u32,
}

/// Buffer session: the local mirrors of the remote request/response
/// rings, per-ring split-state, and the rolling outstanding-request
/// array.
pub struct BufferSession {
    pub request_mirror: RingStorage,
    pub response_staging: RingStorage,

    pub request_split: SplitState,
    pub response_split: SplitState,

    /// Consumer-side cursor into the request ring.
    pub head: u32,
    /// Last producer tail observed via RDMA Read.
    pub tail_seen: u32,

    /// Last host consumer head observed for the response ring.
    /// Updated when the host's response-ring metadata read completes;
    /// used to compute how much free space the host has made available
    /// before the backend's distance to TailC.
    pub response_head: u32,

    /// Parse / completion / transmit tails into the response ring:
    /// `head <= tail_c <= tail_b <= tail_a`.
    pub tail_a: u32,
    pub tail_b: u32,
    pub tail_c: u32,

    pub pending: Vec<Option<RequestContext>>,
    pub next_request_context: usize,

    /// Size of the batch currently awaiting completion, set when a
    /// parse batch closes.
    pub pending_batch_total: Option<u32>,
    /// Ring position of an unconsumed batch-header word, set by
    /// `execute_batch` when `response_batching` is on; `completion_scan`
    /// skips exactly `RESP_ALIGN` bytes at `TailB` the first time it
    /// sees this, instead of parsing it as a response slot.
    pub pending_batch_header: Option<u32>,

    /// Whether `execute_batch` prefixes each batch with an on-wire
    /// total-size word (`RingConfig::response_batching`).
    pub response_batching: bool,
    /// Whether the final transmit segment of a batch uses
    /// `RdmaWriteWithImm` instead of a plain signalled write
    /// (`RingConfig::use_immediate_write`).
    pub use_immediate_write: bool,

    /// RDMA transport for this session, present once bound against a
    /// live [`Verbs`] implementation.
    pub qp: Option<QueuePairHandle>,
    pub cq: Option<CompletionQueueHandle>,
    pub mirror_mr: Option<MemoryRegionHandle>,
    pub staging_mr: Option<MemoryRegionHandle>,

    /// Scratch landing buffer for the request ring's producer tail
    /// word, read twice per poll tick (into `[0..4]` and `[4..8]`) so
    /// `dataplane::evaluate_poll` can detect a read that raced a write.
    pub tail_scratch: Vec<u8>,
    pub tail_scratch_mr: Option<MemoryRegionHandle>,
    /// Scratch landing buffer for the response ring's consumer head.
    pub head_scratch: Vec<u8>,
    pub head_scratch_mr: Option<MemoryRegionHandle>,

    /// The host's ring addressing, bound by `F2bBindBufferRing`.
    pub remote: Option<BufferRemote>,
}

impl BufferSession {
    pub fn new(request_ring_bytes: usize, response_ring_bytes: usize, max_outstanding_io: usize) -> Self {
        Self {
            request_mirror: RingStorage::new(request_ring_bytes),
            response_staging: RingStorage::new(response_ring_bytes),
            request_split: SplitState::NotSplit,
            response_split: SplitState::NotSplit,
            head: 0,
            tail_seen: 0,
            response_head: 0,
            tail_a: 0,
            tail_b: 0,
            tail_c: 0,
            pending: vec![None; max_outstanding_io],
            next_request_context: 0,
            pending_batch_total: None,
            pending_batch_header: None,
            response_batching: false,
            use_immediate_write: false,
            qp: None,
            cq: None,
            mirror_mr: None,
            staging_mr: None,
            tail_scratch: vec![0u8; 8],
            tail_scratch_mr: None,
            head_scratch: vec![0u8; 4],
            head_scratch_mr: None,
            remote: None,
        }
    }

    /// Build a buffer session with a real queue pair: allocates a CQ
    /// and QP under `pd` and registers the mirror/staging rings plus
    /// the metadata scratch buffers for local access. The remote side's
    /// addressing isn't known yet; it arrives later via
    /// [`BufferSession::bind_remote`].
    #[allow(clippy::too_many_arguments)]
    pub fn new_with_verbs(
        verbs: &dyn Verbs,
        pd: ProtectionDomainHandle,
        request_ring_bytes: usize,
        response_ring_bytes: usize,
        max_outstanding_io: usize,
        response_batching: bool,
        use_immediate_write: bool,
    ) -> Result<Self> {
        let mut session = Self::new(request_ring_bytes, response_ring_bytes, max_outstanding_io);
        session.response_batching = response_batching;
        session.use_immediate_write = use_immediate_write;

        let cq = verbs.create_cq(64)?;
        let qp = verbs.create_qp(pd, cq, QueuePairCaps::default())?;
        let mirror_mr = verbs.reg_mr(pd, session.request_mirror.as_mut_ptr(), request_ring_bytes, AccessFlags::LOCAL_WRITE)?;
        let staging_mr = verbs.reg_mr(pd, session.response_staging.as_mut_ptr(), response_ring_bytes, AccessFlags::LOCAL_WRITE)?;
        let tail_scratch_mr = verbs.reg_mr(pd, session.tail_scratch.as_mut_ptr() as u64, session.tail_scratch.len(), AccessFlags::LOCAL_WRITE)?;
        let head_scratch_mr = verbs.reg_mr(pd, session.head_scratch.as_mut_ptr() as u64, session.head_scratch.len(), AccessFlags::LOCAL_WRITE)?;

        session.qp = Some(qp);
        session.cq = Some(cq);
        session.mirror_mr = Some(mirror_mr);
        session.staging_mr = Some(staging_mr);
        session.tail_scratch_mr = Some(tail_scratch_mr);
        session.head_scratch_mr = Some(head_scratch_mr);
        Ok(session)
    }

    pub fn bind_remote(&mut self, remote: BufferRemote) {
        self.remote = Some(remote);
    }

    /// Record a parsed frame's context at the rolling cursor, advancing
    /// it modulo the outstanding-request table's size.
    pub fn record_context(&mut self, ctx: RequestContext) {
        let slot = self.next_request_context;
        self.pending[slot] = Some(ctx);
        self.next_request_context = (slot + 1) % self.pending.len();
    }

    /// Invariant check used by tests and the event loop's debug assertions
    /// (`Head <= TailC <= TailB <= TailA` must always hold).
    pub fn tails_ordered(&self, capacity: u32) -> bool {
        let d = |from: u32, to: u32| to.wrapping_sub(from) & (capacity - 1);
        d(self.head, self.tail_c) <= capacity
            && d(self.tail_c, self.tail_b) <= capacity
            && d(self.tail_b, self.tail_a) <= capacity
    }
}

/// One client slot: a `ClientId`-indexed pair of optional control/buffer
/// sessions plus the CM ids bound to each.
pub struct ClientSlot {
    pub state: SlotState,
    pub control_cm_id: Option<u64>,
    pub buffer_cm_id: Option<u64>,
    pub control: Option<ControlSession>,
    pub buffer: Option<BufferSession>,
}

impl ClientSlot {
    fn empty() -> Self {
        Self {
            state: SlotState::Available,
            control_cm_id: None,
            buffer_cm_id: None,
            control: None,
            buffer: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::empty();
    }
}

/// The fixed-size session registry.
pub struct ConnectionRegistry {
    slots: Vec<ClientSlot>,
    ctrl_msg_size: usize,
    request_ring_bytes: usize,
    response_ring_bytes: usize,
    max_outstanding_io: usize,
    response_batching: bool,
    use_immediate_write: bool,
    verbs: Arc<dyn Verbs>,
    pd: ProtectionDomainHandle,
}

impl ConnectionRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_clients: usize,
        ctrl_msg_size: usize,
        request_ring_bytes: usize,
        response_ring_bytes: usize,
        max_outstanding_io: usize,
        response_batching: bool,
        use_immediate_write: bool,
        verbs: Arc<dyn Verbs>,
    ) -> Result<Self> {
        let pd = verbs.alloc_pd()?;
        Ok(Self {
            slots: (0..max_clients).map(|_| ClientSlot::empty()).collect(),
            ctrl_msg_size,
            request_ring_bytes,
            response_ring_bytes,
            max_outstanding_io,
            response_batching,
            use_immediate_write,
            verbs,
            pd,
        })
    }

    pub fn verbs(&self) -> &Arc<dyn Verbs> {
        &self.verbs
    }

    pub fn max_clients(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, id: ClientId) -> &ClientSlot {
        &self.slots[id.0 as usize]
    }

    pub fn slot_mut(&mut self, id: ClientId) -> &mut ClientSlot {
        &mut self.slots[id.0 as usize]
    }

    fn first_available(&self) -> Option<ClientId> {
        self.slots
            .iter()
            .position(|s| s.state == SlotState::Available)
            .map(|i| ClientId(i as u32))
    }

    /// Find the slot bound to `cm_id`, if any; a linear scan over the
    /// slot array.
    pub fn find_by_cm_id(&self, cm_id: u64) -> Option<ClientId> {
        self.slots.iter().position(|s| s.control_cm_id == Some(cm_id) || s.buffer_cm_id == Some(cm_id)).map(|i| ClientId(i as u32))
    }

    /// `CONNECT_REQUEST` handling: allocate the first `Available` slot,
    /// bind the relevant child session, mark `Occupied`. Returns the
    /// bound `ClientId`, or `Error::NoFreeSlot` if every slot is
    /// occupied, which must not disturb existing sessions.
    pub fn accept_connect_request(&mut self, cm_id: u64, kind: ChannelKind) -> Result<ClientId> {
        // A buffer channel binds to the slot already `Occupied` by its
        // sibling control channel handshake, identified by having a
        // control_cm_id bound but no buffer session yet; a control
        // channel always opens a fresh slot.
        let id = match kind {
            ChannelKind::Control => self.first_available().ok_or(Error::NoFreeSlot)?,
            ChannelKind::Buffer => self
                .slots
                .iter()
                .position(|s| s.state == SlotState::Occupied && s.buffer.is_none() && s.control.is_some())
                .map(|i| ClientId(i as u32))
                .ok_or(Error::NoFreeSlot)?,
        };

        let slot = &mut self.slots[id.0 as usize];
        match kind {
            ChannelKind::Control => {
                slot.control_cm_id = Some(cm_id);
                slot.control = Some(ControlSession::new_with_verbs(self.verbs.as_ref(), self.pd, self.ctrl_msg_size)?);
            }
            ChannelKind::Buffer => {
                slot.buffer_cm_id = Some(cm_id);
                slot.buffer = Some(BufferSession::new_with_verbs(
                    self.verbs.as_ref(),
                    self.pd,
                    self.request_ring_bytes,
                    self.response_ring_bytes,
                    self.max_outstanding_io,
                    self.response_batching,
                    self.use_immediate_write,
                )?);
            }
        }
        slot.state = SlotState::Occupied;
        Ok(id)
    }

    /// `ESTABLISHED`: promote the slot to fully connected.
    pub fn mark_established(&mut self, id: ClientId) {
        self.slots[id.0 as usize].state = SlotState::Connected;
    }

    /// `DISCONNECTED` or a host-initiated terminate: tear down and
    /// return the slot to `Available`, ready to accept a fresh
    /// handshake.
    pub fn teardown(&mut self, id: ClientId) {
        self.slots[id.0 as usize].reset();
    }

    /// Iterate over slots currently `Connected`, for the event loop's
    /// data-plane scan.
    pub fn connected_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Connected)
            .map(|(i, _)| ClientId(i as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::loopback::SoftwareLoopback;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(4, 256, 4096, 4096, 16, true, false, Arc::new(SoftwareLoopback::new())).unwrap()
    }

    #[test]
    fn handshake_binds_control_then_buffer_to_same_slot() {
        let mut r = registry();
        let id = r.accept_connect_request(1, ChannelKind::Control).unwrap();
        assert_eq!(id, ClientId(0));
        let id2 = r.accept_connect_request(2, ChannelKind::Buffer).unwrap();
        assert_eq!(id2, id);
        r.mark_established(id);
        assert_eq!(r.slot(id).state, SlotState::Connected);
    }

    #[test]
    fn full_registry_rejects_without_disturbing_existing() {
        let mut r = registry();
        for i in 0..4u64 {
            r.accept_connect_request(i, ChannelKind::Control).unwrap();
        }
        let err = r.accept_connect_request(99, ChannelKind::Control);
        assert!(matches!(err, Err(Error::NoFreeSlot)));
        assert_eq!(r.find_by_cm_id(0), Some(ClientId(0)));
    }

    #[test]
    fn teardown_frees_slot_for_reuse() {
        let mut r = registry();
        let id = r.accept_connect_request(1, ChannelKind::Control).unwrap();
        r.mark_established(id);
        r.teardown(id);
        assert_eq!(r.slot(id).state, SlotState::Available);
        let id2 = r.accept_connect_request(5, ChannelKind::Control).unwrap();
        assert_eq!(id2, id);
    }
}
