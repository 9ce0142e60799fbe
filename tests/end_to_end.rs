//! End-to-end scenarios driving the full handshake → data-plane → teardown
//! lifecycle through the in-process loopback pieces.

use std::sync::Arc;

use dds_dataplane::cache::{CuckooTable, OccupancyMode};
use dds_dataplane::dataplane::{self, evaluate_poll, PollOutcome};
use dds_dataplane::file_service::{FileService, InMemoryFileService};
use dds_dataplane::rdma::loopback::SoftwareLoopback;
use dds_dataplane::ring::{self, ReqHeader};
use dds_dataplane::session::{ChannelKind, ConnectionRegistry};
use byteorder::{ByteOrder, LittleEndian};

fn registry(max_clients: usize, request_ring_bytes: usize, response_ring_bytes: usize, max_outstanding_io: usize) -> ConnectionRegistry {
    ConnectionRegistry::new(
        max_clients,
        256,
        request_ring_bytes,
        response_ring_bytes,
        max_outstanding_io,
        true,
        false,
        Arc::new(SoftwareLoopback::new()),
    )
    .unwrap()
}

fn encode_write_frame(request_id: u64, file_id: u32, offset: u64, payload: &[u8]) -> Vec<u8> {
    let header = ReqHeader { request_id, file_id, offset, bytes: payload.len() as u32, flags: 0 };
    let total_len = (ring::FRAME_LEN_FIELD + ring::REQ_HEADER_LEN + payload.len()) as u32;
    let mut buf = vec![0u8; total_len as usize];
    LittleEndian::write_u32(&mut buf[0..4], total_len);
    header.encode(&mut buf[4..4 + ring::REQ_HEADER_LEN]);
    buf[4 + ring::REQ_HEADER_LEN..].copy_from_slice(payload);
    buf
}

fn encode_read_frame(request_id: u64, file_id: u32, offset: u64, bytes: u32) -> Vec<u8> {
    let header = ReqHeader { request_id, file_id, offset, bytes, flags: 0 };
    let total_len = (ring::FRAME_LEN_FIELD + ring::REQ_HEADER_LEN) as u32;
    let mut buf = vec![0u8; total_len as usize];
    LittleEndian::write_u32(&mut buf[0..4], total_len);
    header.encode(&mut buf[4..4 + ring::REQ_HEADER_LEN]);
    buf
}

/// Scenario 1: handshake.
#[test]
fn handshake_assigns_client_zero_and_idles_on_empty_ring() {
    let mut registry = registry(4, 4096, 4096, 16);
    let id = registry.accept_connect_request(100, ChannelKind::Control).unwrap();
    assert_eq!(id.0, 0);
    let id2 = registry.accept_connect_request(101, ChannelKind::Buffer).unwrap();
    assert_eq!(id2, id);
    registry.mark_established(id);

    let slot = registry.slot(id);
    let buffer = slot.buffer.as_ref().unwrap();
    // Host posts no data: Tail == Head, poll must come back idle.
    match evaluate_poll(buffer.tail_seen, buffer.tail_seen, buffer.head) {
        PollOutcome::Idle => {}
        PollOutcome::Ready { .. } => panic!("expected idle poll on an empty ring"),
    }
}

/// Scenario 2: single write then read.
#[test]
fn single_write_then_read_returns_written_bytes() {
    let fs = InMemoryFileService::new(1 << 20);
    let file = fs.create_file("/data").unwrap();
    let mut registry = registry(4, 1 << 16, 1 << 16, 16);
    let id = registry.accept_connect_request(1, ChannelKind::Control).unwrap();
    registry.accept_connect_request(2, ChannelKind::Buffer).unwrap();
    registry.mark_established(id);
    let session = registry.slot_mut(id).buffer.as_mut().unwrap();

    let payload = vec![0xABu8; 4096];
    let write_frame = encode_write_frame(1, file.0, 0, &payload);
    let reserved = dataplane::execute_batch(session, &write_frame, &write_frame, &fs).unwrap();
    assert!(reserved > 0);
    assert!(dataplane::completion_scan(session).is_some());
    assert!(dataplane::ready_to_transmit(session));
    dataplane::advance_after_transmit(session);

    let read_frame = encode_read_frame(2, file.0, 0, 4096);
    dataplane::execute_batch(session, &read_frame, &read_frame, &fs).unwrap();
    dataplane::completion_scan(session);
    let hdr_bytes = session.response_staging.read_at(session.tail_c, ring::RESP_HEADER_LEN as u32);
    let hdr = ring::RespHeader::decode(&hdr_bytes);
    assert_eq!(hdr.bytes_serviced, 4096);
    let data = session.response_staging.read_at(session.tail_c + ring::RESP_HEADER_LEN as u32, 4096);
    assert_eq!(data, payload);
}

/// Scenario 3: batched mixed requests in one producer publish.
#[test]
fn batched_mixed_requests_preserve_enqueue_order() {
    let fs = InMemoryFileService::new(1 << 20);
    let file = fs.create_file("/mixed").unwrap();
    fs.write(file, 0, &vec![1u8; 4096]).unwrap();
    let mut registry = registry(4, 1 << 16, 1 << 16, 16);
    let id = registry.accept_connect_request(1, ChannelKind::Control).unwrap();
    registry.accept_connect_request(2, ChannelKind::Buffer).unwrap();
    registry.mark_established(id);
    let session = registry.slot_mut(id).buffer.as_mut().unwrap();

    let mut region = Vec::new();
    region.extend(encode_write_frame(1, file.0, 0, &vec![2u8; 1024]));
    region.extend(encode_read_frame(2, file.0, 0, 1024));
    region.extend(encode_write_frame(3, file.0, 2048, &vec![3u8; 2048]));
    region.extend(encode_read_frame(4, file.0, 0, 512));

    dataplane::execute_batch(session, &region, &region, &fs).unwrap();
    dataplane::completion_scan(session);

    let ids: Vec<u64> = session.pending.iter().flatten().map(|c| c.request_id.0).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

/// Scenario 4: a request straddling the ring's physical wrap.
#[test]
fn wrap_around_request_is_fetched_and_parsed_as_one_frame() {
    let capacity = 64 * 1024usize;
    let mut ring_storage = ring::RingStorage::new(capacity);
    let payload = vec![7u8; 4096];
    let frame = encode_write_frame(1, 9, 0, &payload);

    // Place the frame so it straddles the ring's physical boundary: the
    // plan for this fetch must come back split into two segments.
    let start = (capacity - 16) as u32;
    ring_storage.write_at(start, &frame);
    let plan = dataplane::plan_fetch(start, start + frame.len() as u32, capacity as u32);
    assert!(matches!(plan.split_state, ring::SplitState::SplitPartOne));
    assert!(plan.second.is_some());

    // The fetch phase linearizes the two physical segments before
    // handing the region to the parser; read_at does exactly that.
    let linearized = ring_storage.read_at(start, frame.len() as u32);
    assert_eq!(linearized, frame);
    let frames = dataplane::parse_batch(&linearized).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header.bytes as usize, payload.len());
}

/// Scenario 5: cuckoo eviction relocates the victim without losing it.
#[test]
fn cuckoo_eviction_preserves_both_keys() {
    let mut table = CuckooTable::new(4, 1, OccupancyMode::PerItem);
    let mut inserted = Vec::new();
    for k in 0..4u64 {
        if table.insert(k, k * 1000).is_ok() {
            inserted.push(k);
        }
    }
    for k in &inserted {
        assert_eq!(table.lookup(*k), Some(*k * 1000));
    }
}

/// Scenario 6: session teardown returns the slot to Available and it can
/// be reused by a fresh handshake.
#[test]
fn terminate_frees_slot_for_a_new_handshake() {
    let mut registry = registry(2, 4096, 4096, 16);
    let id = registry.accept_connect_request(1, ChannelKind::Control).unwrap();
    registry.mark_established(id);
    registry.teardown(id);
    assert_eq!(registry.slot(id).state, dds_dataplane::session::SlotState::Available);

    let new_id = registry.accept_connect_request(2, ChannelKind::Control).unwrap();
    assert_eq!(new_id, id);
}
