//! Backend Event Loop: a single polling thread, optionally pinned to a
//! dedicated core, running a weighted round-robin over the connection
//! registry's control and data planes. Control-plane progress is
//! sampled `1/DATA_PLANE_WEIGHT` as often as data-plane progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, error, warn};

use crate::cache::{CuckooTable, FileMetaEntry};
use crate::config::EventLoopConfig;
use crate::control::{dispatch, ControlRequest, ControlResponse, MsgId};
use crate::dataplane;
use crate::error::Error;
use crate::file_service::FileService;
use crate::rdma::verbs::{OpCode, ScatterGatherEntry, SendWorkRequest, Verbs};
use crate::session::{BufferRemote, ChannelKind, CmEvent, ConnectionRegistry};
use crate::types::RequestId;

/// The only blocking call this loop makes: the backend posts a work
/// request and waits on its own completion queue, same convention as
/// [`crate::host::HostClient`]'s control/data-plane posts. A short
/// timeout keeps one slow peer from starving the rest of the poll loop.
const RDMA_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Pins the calling thread to `core`. Failure is logged and non-fatal:
/// there is no hard requirement that pinning succeed, only that it's
/// attempted when configured.
#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!(core, "sched_setaffinity failed, continuing unpinned");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(core: usize) {
    warn!(core, "core pinning is only implemented on linux; ignoring");
}

/// Shared stop flag, set by [`crate::backend::stop_file_backend`] and
/// polled once per iteration.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A `RingOverflow` (or any other error `Error::is_fatal` flags) means the
/// backend's own bookkeeping has gone wrong in a way no retry fixes;
/// crash loudly rather than keep serving a corrupted session.
fn abort_if_fatal(e: &Error) {
    if e.is_fatal() {
        error!(%e, "fatal error, aborting process");
        std::process::abort();
    }
}

/// Drives the event loop to completion (until `stop` is set). Exposed as
/// a free function rather than a struct method so the polling body can
/// be unit-tested by running a bounded number of iterations directly.
pub fn run(
    registry: &mut ConnectionRegistry,
    fs: &dyn FileService,
    cache: &mut CuckooTable<FileMetaEntry>,
    cfg: &EventLoopConfig,
    cm_events: &mut dyn Iterator<Item = (u64, CmEvent, Option<u8>)>,
    stop: &StopFlag,
) {
    if let Some(core) = cfg.pinned_core {
        pin_to_core(core);
    }

    let verbs = Arc::clone(registry.verbs());
    let mut dp = 0u32;
    let weight = cfg.data_plane_weight.max(1);

    while !stop.is_stopped() {
        if dp == 0 {
            poll_cm_event(registry, cm_events);
            scan_control_plane(registry, fs, cache, verbs.as_ref());
        }
        scan_data_plane(registry, fs, verbs.as_ref());
        dp = (dp + 1) % weight;
    }
}

fn poll_cm_event(registry: &mut ConnectionRegistry, cm_events: &mut dyn Iterator<Item = (u64, CmEvent, Option<u8>)>) {
    let Some((cm_id, event, priv_data)) = cm_events.next() else {
        return;
    };
    match event {
        CmEvent::AddrResolved | CmEvent::RouteResolved => {
            debug!(cm_id, ?event, "CM route negotiation step");
        }
        CmEvent::ConnectRequest => {
            let kind = priv_data
                .ok_or(Error::Protocol("CONNECT_REQUEST missing private data".into()))
                .and_then(ChannelKind::from_priv_byte);
            match kind.and_then(|k| registry.accept_connect_request(cm_id, k).map(|id| (id, k))) {
                Ok((id, kind)) => debug!(cm_id, ?kind, client_id = id.0, "accepted connection request"),
                Err(e) => warn!(cm_id, %e, "rejecting connection request"),
            }
        }
        CmEvent::Established => {
            if let Some(id) = registry.find_by_cm_id(cm_id) {
                registry.mark_established(id);
            }
        }
        CmEvent::Disconnected => {
            if let Some(id) = registry.find_by_cm_id(cm_id) {
                registry.teardown(id);
            }
        }
        other if other.is_error() => {
            warn!(cm_id, ?other, "CM error event");
            if let Some(id) = registry.find_by_cm_id(cm_id) {
                registry.teardown(id);
            }
        }
        _ => {}
    }
}

/// Drains inbound `Recv` completions on a control session's CQ, decoding
/// each arriving message's header into the session's single pending
/// slot and re-arming the receive. `F2bBindBufferRing` binds the buffer
/// session's remote addressing directly and replies in place;
/// everything else is left for the dispatch pass below, matching the
/// synchronous-FileService assumption that a request parked here this
/// tick is also completed this tick.
fn scan_control_plane(registry: &mut ConnectionRegistry, fs: &dyn FileService, cache: &mut CuckooTable<FileMetaEntry>, verbs: &dyn Verbs) {
    for id in registry.connected_ids().collect::<Vec<_>>() {
        let slot = registry.slot_mut(id);
        let Some(control) = slot.control.as_mut() else { continue };

        if let Some(cq) = control.cq {
            match verbs.poll_cq(cq, 8) {
                Ok(completions) => {
                    for wc in completions {
                        if wc.opcode != OpCode::Recv {
                            continue;
                        }
                        if !wc.is_success() {
                            warn!(client_id = id.0, "control recv completion carried a non-success status");
                            continue;
                        }
                        let msg_id_raw = LittleEndian::read_u16(&control.recv_buf[0..2]);
                        if let Err(e) = crate::control::record_pending(control, RequestId(0), msg_id_raw) {
                            warn!(client_id = id.0, %e, "dropping control message, session already has one pending");
                        }
                        if let Err(e) = control.post_recv(verbs) {
                            warn!(client_id = id.0, %e, "failed to re-arm control recv");
                        }
                    }
                }
                Err(e) => warn!(client_id = id.0, %e, "control CQ poll failed"),
            }
        }

        let Some(pending) = control.pending.clone() else { continue };

        // The session has at most one outstanding control op. With a
        // synchronous FileService the result is ready the instant it's
        // submitted, so this scan both "submits" and "completes" it in
        // the same pass; a disk-backed service would instead find it
        // still IO_PENDING on most ticks.
        if pending.msg_id == MsgId::F2bRequestId as u16 {
            let resp = ControlResponse::RespondId { client_id: id.0 };
            resp.encode(&mut control.send_buf);
            control.pending = None;
            if let Err(e) = control.post_send(verbs) {
                warn!(client_id = id.0, %e, "failed to post control response");
            }
            continue;
        }
        if pending.msg_id == MsgId::F2bTerminate as u16 {
            control.pending = None;
            drop(slot);
            registry.teardown(id);
            continue;
        }

        let req = match ControlRequest::decode(&control.recv_buf) {
            Ok(r) => r,
            Err(e) => {
                warn!(client_id = id.0, %e, "dropping unrecognized control message");
                control.pending = None;
                continue;
            }
        };

        if let ControlRequest::BindBufferRing {
            request_data_addr,
            request_data_rkey,
            request_tail_addr,
            request_tail_rkey,
            response_data_addr,
            response_data_rkey,
            response_head_addr,
            response_head_rkey,
        } = req
        {
            if let Some(buffer) = slot.buffer.as_mut() {
                buffer.bind_remote(BufferRemote {
                    request_data_addr,
                    request_data_rkey,
                    request_tail_addr,
                    request_tail_rkey,
                    response_data_addr,
                    response_data_rkey,
                    response_head_addr,
                    response_head_rkey,
                });
            } else {
                warn!(client_id = id.0, "BindBufferRing arrived before the buffer channel was accepted");
            }
            ControlResponse::AckBindBufferRing { result: crate::types::ResultCode::Success }.encode(&mut control.send_buf);
            control.pending = None;
            if let Err(e) = control.post_send(verbs) {
                warn!(client_id = id.0, %e, "failed to post BindBufferRing ack");
            }
            continue;
        }

        let resp = dispatch(fs, cache, &req);
        resp.encode(&mut control.send_buf);
        control.pending = None;
        if let Err(e) = control.post_send(verbs) {
            warn!(client_id = id.0, %e, "failed to post control response");
        }
    }
}

/// Issue an RDMA Read of `remote[0..len)` into `local[0..len)` and block
/// for its completion, the same post-then-wait shape as every other
/// posted operation in this crate.
#[allow(clippy::too_many_arguments)]
fn rdma_read(
    verbs: &dyn Verbs,
    qp: crate::rdma::verbs::QueuePairHandle,
    cq: crate::rdma::verbs::CompletionQueueHandle,
    local_addr: u64,
    lkey: u32,
    remote_addr: u64,
    rkey: u32,
    len: u32,
    wr_id: u64,
) -> crate::error::Result<()> {
    verbs.post_send(
        qp,
        SendWorkRequest {
            wr_id,
            opcode: OpCode::RdmaRead,
            sge: vec![ScatterGatherEntry { addr: local_addr, length: len, lkey }],
            remote_addr,
            rkey,
            immediate: None,
        },
    )?;
    verbs.wait_for_completion(cq, RDMA_WAIT_TIMEOUT)?;
    Ok(())
}

/// Issue an RDMA Write of `local[0..len)` to `remote[0..len)`, optionally
/// with an immediate value on the final segment of a transmit, and block
/// for its completion.
#[allow(clippy::too_many_arguments)]
fn rdma_write(
    verbs: &dyn Verbs,
    qp: crate::rdma::verbs::QueuePairHandle,
    cq: crate::rdma::verbs::CompletionQueueHandle,
    local_addr: u64,
    lkey: u32,
    remote_addr: u64,
    rkey: u32,
    len: u32,
    immediate: Option<u32>,
    wr_id: u64,
) -> crate::error::Result<()> {
    let opcode = if immediate.is_some() { OpCode::RdmaWriteWithImm } else { OpCode::RdmaWrite };
    verbs.post_send(
        qp,
        SendWorkRequest {
            wr_id,
            opcode,
            sge: vec![ScatterGatherEntry { addr: local_addr, length: len, lkey }],
            remote_addr,
            rkey,
            immediate,
        },
    )?;
    verbs.wait_for_completion(cq, RDMA_WAIT_TIMEOUT)?;
    Ok(())
}

/// Drives one buffer session through a full poll → fetch → execute →
/// completion-scan → transmit tick. Skips sessions that haven't yet
/// learned their host's remote ring addressing (the handshake hasn't
/// finished) or that aren't backed by a live RDMA transport (the
/// wire-protocol-only unit tests in `dataplane`/`control` construct bare
/// [`crate::session::BufferSession`]s directly).
fn scan_data_plane(registry: &mut ConnectionRegistry, fs: &dyn FileService, verbs: &dyn Verbs) {
    for id in registry.connected_ids().collect::<Vec<_>>() {
        let slot = registry.slot_mut(id);
        let Some(buffer) = slot.buffer.as_mut() else { continue };
        let (Some(qp), Some(cq), Some(remote)) = (buffer.qp, buffer.cq, buffer.remote) else { continue };

        if let Err(e) = drive_buffer_session(buffer, qp, cq, remote, fs, verbs) {
            warn!(client_id = id.0, %e, "data-plane tick failed");
            abort_if_fatal(&e);
        }
    }
}

fn drive_buffer_session(
    buffer: &mut crate::session::BufferSession,
    qp: crate::rdma::verbs::QueuePairHandle,
    cq: crate::rdma::verbs::CompletionQueueHandle,
    remote: BufferRemote,
    fs: &dyn FileService,
    verbs: &dyn Verbs,
) -> crate::error::Result<()> {
    let (Some(tail_scratch_mr), Some(mirror_mr)) = (buffer.tail_scratch_mr, buffer.mirror_mr) else {
        return Ok(());
    };
    let tail_scratch_lkey = verbs.mr_lkey(tail_scratch_mr)?;
    let tail_scratch_base = buffer.tail_scratch.as_mut_ptr() as u64;

    // Two independent reads of the same remote word, landing in separate
    // halves of `tail_scratch`, so `evaluate_poll` can tell a genuine new
    // tail from one caught mid-write.
    rdma_read(verbs, qp, cq, tail_scratch_base, tail_scratch_lkey, remote.request_tail_addr, remote.request_tail_rkey, 4, 100)?;
    rdma_read(verbs, qp, cq, tail_scratch_base + 4, tail_scratch_lkey, remote.request_tail_addr, remote.request_tail_rkey, 4, 101)?;

    let tail_mirror = LittleEndian::read_u32(&buffer.tail_scratch[0..4]);
    let tail_check = LittleEndian::read_u32(&buffer.tail_scratch[4..8]);
    let tail = match dataplane::evaluate_poll(tail_mirror, tail_check, buffer.head) {
        dataplane::PollOutcome::Idle => return Ok(()),
        dataplane::PollOutcome::Ready { tail } => tail,
    };

    let capacity = buffer.request_mirror.capacity();
    let plan = dataplane::plan_fetch(buffer.head, tail, capacity);
    let mirror_lkey = verbs.mr_lkey(mirror_mr)?;
    let mirror_base = buffer.request_mirror.as_mut_ptr();
    rdma_read(
        verbs,
        qp,
        cq,
        mirror_base + plan.first.start as u64,
        mirror_lkey,
        remote.request_data_addr + plan.first.start as u64,
        remote.request_data_rkey,
        plan.first.end - plan.first.start,
        102,
    )?;
    if let Some(second) = &plan.second {
        rdma_read(
            verbs,
            qp,
            cq,
            mirror_base + second.start as u64,
            mirror_lkey,
            remote.request_data_addr + second.start as u64,
            remote.request_data_rkey,
            second.end - second.start,
            103,
        )?;
    }

    let avail = crate::ring::avail(buffer.head, tail, capacity);
    let region = buffer.request_mirror.read_at(buffer.head, avail);
    dataplane::execute_batch(buffer, &region, &region, fs)?;
    buffer.head = tail;
    buffer.tail_seen = tail;

    if let Some(head_scratch_mr) = buffer.head_scratch_mr {
        let head_scratch_lkey = verbs.mr_lkey(head_scratch_mr)?;
        let head_scratch_base = buffer.head_scratch.as_mut_ptr() as u64;
        rdma_read(verbs, qp, cq, head_scratch_base, head_scratch_lkey, remote.response_head_addr, remote.response_head_rkey, 4, 104)?;
        buffer.response_head = LittleEndian::read_u32(&buffer.head_scratch[0..4]);
    }

    let Some(total) = dataplane::completion_scan(buffer) else { return Ok(()) };
    if !dataplane::ready_to_transmit(buffer) {
        return Ok(());
    }

    let Some(staging_mr) = buffer.staging_mr else { return Ok(()) };
    let staging_lkey = verbs.mr_lkey(staging_mr)?;
    let staging_base = buffer.response_staging.as_mut_ptr();
    let (first, second) = dataplane::plan_transmit(buffer);
    let use_immediate = buffer.use_immediate_write;

    match &second {
        None => {
            let immediate = use_immediate.then_some(total);
            rdma_write(
                verbs,
                qp,
                cq,
                staging_base + first.start as u64,
                staging_lkey,
                remote.response_data_addr + first.start as u64,
                remote.response_data_rkey,
                first.end - first.start,
                immediate,
                110,
            )?;
        }
        Some(second) => {
            rdma_write(
                verbs,
                qp,
                cq,
                staging_base + first.start as u64,
                staging_lkey,
                remote.response_data_addr + first.start as u64,
                remote.response_data_rkey,
                first.end - first.start,
                None,
                110,
            )?;
            let immediate = use_immediate.then_some(total);
            rdma_write(
                verbs,
                qp,
                cq,
                staging_base + second.start as u64,
                staging_lkey,
                remote.response_data_addr + second.start as u64,
                remote.response_data_rkey,
                second.end - second.start,
                immediate,
                111,
            )?;
        }
    }

    dataplane::advance_after_transmit(buffer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::OccupancyMode;
    use crate::config::EventLoopConfig;
    use crate::file_service::InMemoryFileService;
    use crate::rdma::loopback::SoftwareLoopback;
    use crate::rdma::verbs::AccessFlags;
    use crate::session::ChannelKind;

    fn cache() -> CuckooTable<FileMetaEntry> {
        CuckooTable::new(16, 4, OccupancyMode::PerItem)
    }

    /// Drives a full handshake, a control-plane `RequestId` round trip,
    /// and a single data-plane write through the live event loop against
    /// the software loopback transport, exercising the real RDMA posts
    /// end to end rather than calling the `dataplane`/`control` helpers
    /// directly.
    #[test]
    fn live_event_loop_drives_control_and_data_plane_over_loopback() {
        let verbs = Arc::new(SoftwareLoopback::new());
        let mut registry = ConnectionRegistry::new(4, 256, 4096, 4096, 16, false, false, verbs.clone()).unwrap();
        let fs = InMemoryFileService::new(1 << 20);
        let file = fs.create_file("/f").unwrap();
        let mut cache = cache();
        let cfg = EventLoopConfig { data_plane_weight: 1, pinned_core: None };
        let stop = StopFlag::new();

        let id = registry.accept_connect_request(1, ChannelKind::Control).unwrap();
        registry.accept_connect_request(2, ChannelKind::Buffer).unwrap();
        registry.mark_established(id);

        let control_qp = registry.slot(id).control.as_ref().unwrap().qp.unwrap();
        let buffer_qp = registry.slot(id).buffer.as_ref().unwrap().qp.unwrap();

        // A host-side loopback peer for the control channel: a bare QP
        // this test drives directly to send `RequestId` and read back
        // the backend's response, standing in for `HostClient`.
        let host_pd = verbs.alloc_pd().unwrap();
        let host_cq = verbs.create_cq(16).unwrap();
        let host_qp = verbs.create_qp(host_pd, host_cq, crate::rdma::QueuePairCaps::default()).unwrap();
        verbs.connect(control_qp, host_qp);

        let mut host_send = vec![0u8; 256];
        let mut host_recv = vec![0u8; 256];
        let host_send_mr = verbs.reg_mr(host_pd, host_send.as_mut_ptr() as u64, host_send.len(), AccessFlags::LOCAL_WRITE).unwrap();
        let host_recv_mr = verbs.reg_mr(host_pd, host_recv.as_mut_ptr() as u64, host_recv.len(), AccessFlags::LOCAL_WRITE).unwrap();
        let recv_lkey = verbs.mr_lkey(host_recv_mr).unwrap();
        verbs
            .post_recv(
                host_qp,
                SendWorkRequest {
                    wr_id: 0,
                    opcode: OpCode::Recv,
                    sge: vec![ScatterGatherEntry { addr: host_recv.as_ptr() as u64, length: host_recv.len() as u32, lkey: recv_lkey }],
                    remote_addr: 0,
                    rkey: 0,
                    immediate: None,
                },
            )
            .unwrap();

        ControlRequest::RequestId.encode(&mut host_send);
        let send_lkey = verbs.mr_lkey(host_send_mr).unwrap();
        verbs
            .post_send(
                host_qp,
                SendWorkRequest {
                    wr_id: 1,
                    opcode: OpCode::Send,
                    sge: vec![ScatterGatherEntry { addr: host_send.as_ptr() as u64, length: host_send.len() as u32, lkey: send_lkey }],
                    remote_addr: 0,
                    rkey: 0,
                    immediate: None,
                },
            )
            .unwrap();

        scan_control_plane(&mut registry, &fs, &mut cache, verbs.as_ref());
        verbs.wait_for_completion(host_cq, RDMA_WAIT_TIMEOUT).unwrap();
        let resp = ControlResponse::decode(&host_recv, &ControlRequest::RequestId).unwrap();
        assert!(matches!(resp, ControlResponse::RespondId { client_id } if client_id == id.0));

        // Bind the buffer ring directly (what `F2bBindBufferRing` would
        // otherwise drive through the same control channel) and publish
        // one write frame from a host-side mirror ring.
        let mut host_ring = crate::ring::RingStorage::new(4096);
        let host_pd2 = host_pd;
        let ring_mr = verbs
            .reg_mr(host_pd2, host_ring.as_mut_ptr(), 4096, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ)
            .unwrap();
        let ring_rkey = verbs.mr_rkey(ring_mr).unwrap();

        let mut tail_word = vec![0u8; 4];
        let tail_mr = verbs.reg_mr(host_pd2, tail_word.as_mut_ptr() as u64, 4, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ).unwrap();
        let tail_rkey = verbs.mr_rkey(tail_mr).unwrap();

        let mut response_ring = crate::ring::RingStorage::new(4096);
        let resp_ring_mr = verbs
            .reg_mr(host_pd2, response_ring.as_mut_ptr(), 4096, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE)
            .unwrap();
        let resp_ring_rkey = verbs.mr_rkey(resp_ring_mr).unwrap();

        let mut head_word = vec![0u8; 4];
        let head_mr = verbs.reg_mr(host_pd2, head_word.as_mut_ptr() as u64, 4, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ).unwrap();
        let head_rkey = verbs.mr_rkey(head_mr).unwrap();

        {
            let buffer = registry.slot_mut(id).buffer.as_mut().unwrap();
            buffer.bind_remote(BufferRemote {
                request_data_addr: host_ring.as_ptr(),
                request_data_rkey: ring_rkey,
                request_tail_addr: tail_word.as_ptr() as u64,
                request_tail_rkey: tail_rkey,
                response_data_addr: response_ring.as_ptr(),
                response_data_rkey: resp_ring_rkey,
                response_head_addr: head_word.as_ptr() as u64,
                response_head_rkey: head_rkey,
            });
        }

        let payload = vec![0x42u8; 256];
        let header = crate::ring::ReqHeader { request_id: 7, file_id: file.0, offset: 0, bytes: payload.len() as u32, flags: 0 };
        let frame_len = crate::ring::FRAME_LEN_FIELD as u32 + crate::ring::REQ_HEADER_LEN as u32 + payload.len() as u32;
        let mut frame = vec![0u8; frame_len as usize];
        byteorder::LittleEndian::write_u32(&mut frame[0..4], frame_len);
        header.encode(&mut frame[4..4 + crate::ring::REQ_HEADER_LEN]);
        frame[4 + crate::ring::REQ_HEADER_LEN..].copy_from_slice(&payload);
        host_ring.write_at(0, &frame);
        byteorder::LittleEndian::write_u32(&mut tail_word, frame_len);

        let _ = buffer_qp;
        scan_data_plane(&mut registry, &fs, verbs.as_ref());

        let mut read_back = vec![0u8; 256];
        fs.read(file, 0, &mut read_back).unwrap();
        assert_eq!(read_back, payload);

        let hdr_bytes = response_ring.read_at(0, crate::ring::RESP_HEADER_LEN as u32);
        let hdr = crate::ring::RespHeader::decode(&hdr_bytes);
        assert_eq!(hdr.result, crate::types::ResultCode::Success as u32);

        let _ = cfg;
        let _ = stop;
    }
}
