//! Data Plane Pipeline: the state machine that polls a remote request
//! ring, parses a batch, submits it to the file service, and assembles
//! responses back into the response ring.
//!
//! This module separates the *wire-free* arithmetic (what to read, where
//! to allocate a response, when a batch is complete) from the RDMA posts
//! themselves, which live in [`crate::rdma`]; [`crate::event_loop`] wires
//! the two together per buffer session. The split follows named phases
//! (request polling → fetch → execute → completion scan → response
//! transmit).

use crate::error::{Error, Result};
use crate::file_service::FileService;
use crate::ring::{self, ReqHeader, RespHeader, SplitState};
use crate::session::{BufferSession, RequestContext};
use crate::types::{RequestId, ResultCode};

/// Result of the request-polling tick.
pub enum PollOutcome {
    /// The two metadata words disagreed (torn), or `Tail == Head`:
    /// nothing to do, re-issue the poll next tick.
    Idle,
    /// New bytes are available and a fetch should be issued.
    Ready { tail: u32 },
}

/// Decide the poll outcome from the two torn-read-detection words: two
/// 4-byte metadata words on separate cache lines, read independently to
/// detect a torn update.
pub fn evaluate_poll(tail_mirror: u32, tail_check: u32, head: u32) -> PollOutcome {
    if tail_mirror != tail_check || tail_mirror == head {
        PollOutcome::Idle
    } else {
        PollOutcome::Ready { tail: tail_mirror }
    }
}

/// A fetch plan: one or two physical ranges to RDMA-Read, and the
/// split-state the session should record while awaiting their
/// completions.
pub struct FetchPlan {
    pub first: std::ops::Range<u32>,
    pub second: Option<std::ops::Range<u32>>,
    pub split_state: SplitState,
}

pub fn plan_fetch(head: u32, tail: u32, capacity: u32) -> FetchPlan {
    let avail = ring::avail(head, tail, capacity);
    let (first, second) = ring::split_ranges(head, avail, capacity);
    let split_state = if second.is_some() {
        SplitState::SplitPartOne
    } else {
        SplitState::NotSplit
    };
    FetchPlan { first, second, split_state }
}

/// One frame as parsed out of a fetched request-ring region.
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub header: ReqHeader,
    pub is_read: bool,
    pub payload_offset_in_region: usize,
}

/// Parse every length-prefixed frame in `region` in order. `region` is
/// the already-linearized bytes
/// for this tick (the split fetch, if any, is reassembled by the caller
/// before parsing — frames never straddle two *records'* length fields,
/// but a single frame may straddle the physical ring wrap, which is
/// exactly what linearizing the fetch undoes).
pub fn parse_batch(region: &[u8]) -> Result<Vec<ParsedFrame>> {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    while pos < region.len() {
        if pos + ring::FRAME_LEN_FIELD > region.len() {
            return Err(Error::Protocol("truncated frame length field".into()));
        }
        let frame_len = byteorder::LittleEndian::read_u32(&region[pos..pos + ring::FRAME_LEN_FIELD]);
        let frame_end = pos + frame_len as usize;
        if frame_end > region.len() {
            return Err(Error::Protocol("frame length exceeds fetched region".into()));
        }
        let header_start = pos + ring::FRAME_LEN_FIELD;
        let header = ReqHeader::decode(&region[header_start..header_start + ring::REQ_HEADER_LEN]);
        let is_read = ReqHeader::is_read(frame_len);
        frames.push(ParsedFrame {
            header,
            is_read,
            payload_offset_in_region: header_start + ring::REQ_HEADER_LEN,
        });
        pos = frame_end;
    }
    Ok(frames)
}

/// Allocate response slots for a parsed batch, submit each request to the
/// file service, and write response headers (+ read payload) into the
/// session's response staging ring. Returns the total bytes reserved,
/// for the batch-header word when response batching is enabled.
///
/// The reference [`FileService`] in this crate is synchronous, so unlike
/// a disk-backed service each request's `Result` is known immediately;
/// this still goes through the same `IO_PENDING` → terminal transition
/// a slower, disk-backed service would, so the completion scanner (below)
/// behaves identically regardless of how long the file service actually
/// takes.
pub fn execute_batch(
    session: &mut BufferSession,
    region: &[u8],
    request_region: &[u8],
    fs: &dyn FileService,
) -> Result<u32> {
    let frames = parse_batch(region)?;
    let response_capacity = session.response_staging.capacity();
    let mut total_reserved = 0u32;

    // When response batching is on, the batch is prefixed on the wire
    // with its own total-size word so the host can tell it apart from a
    // lone response slot; reserve that word's space before the frames'
    // own slots.
    let header_slot = if session.response_batching {
        let header_len = ring::RESP_ALIGN as u32;
        if ring::avail(session.response_head, session.tail_a, response_capacity) as u64 + header_len as u64
            >= response_capacity as u64
        {
            return Err(Error::RingOverflow(format!(
                "response ring overflow reserving {header_len} batch-header bytes at TailA={}",
                session.tail_a
            )));
        }
        let slot = session.tail_a;
        session.tail_a = (session.tail_a.wrapping_add(header_len)) & (response_capacity - 1);
        Some(slot)
    } else {
        None
    };

    for frame in &frames {
        let resp_len = if frame.is_read {
            ring::align_resp(ring::RESP_HEADER_LEN + frame.header.bytes as usize) as u32
        } else {
            ring::RESP_ALIGN as u32
        };

        if ring::avail(session.response_head, session.tail_a, response_capacity) as u64 + resp_len as u64 >= response_capacity as u64 {
            return Err(Error::RingOverflow(format!(
                "response ring overflow reserving {resp_len} bytes at TailA={}",
                session.tail_a
            )));
        }

        let slot_start = session.tail_a;
        let file_id = frame.header.file_id;
        let offset = frame.header.offset;
        let bytes = frame.header.bytes;

        let mut pending_header = RespHeader {
            request_id: frame.header.request_id,
            result: ResultCode::IoPending as u32,
            bytes_serviced: 0,
        };
        let mut hdr_buf = [0u8; ring::RESP_HEADER_LEN];
        pending_header.encode(&mut hdr_buf);
        session.response_staging.write_at(slot_start, &hdr_buf);

        let (result_code, bytes_serviced) = if frame.is_read {
            let mut buf = vec![0u8; bytes as usize];
            match fs.read(crate::types::FileId(file_id), offset, &mut buf) {
                Ok(n) => {
                    let data_start = (slot_start + ring::RESP_HEADER_LEN as u32) % response_capacity;
                    session.response_staging.write_at(data_start, &buf);
                    (ResultCode::Success, n)
                }
                Err(e) => (ResultCode::from(&e), 0),
            }
        } else {
            let payload = &request_region[frame.payload_offset_in_region..frame.payload_offset_in_region + bytes as usize];
            match fs.write(crate::types::FileId(file_id), offset, payload) {
                Ok(n) => (ResultCode::Success, n),
                Err(e) => (ResultCode::from(&e), 0),
            }
        };

        pending_header.result = result_code as u32;
        pending_header.bytes_serviced = bytes_serviced;
        pending_header.encode(&mut hdr_buf);
        session.response_staging.write_at(slot_start, &hdr_buf);

        session.record_context(RequestContext {
            request_id: RequestId(frame.header.request_id),
            file_id,
            offset,
            bytes,
            is_read: frame.is_read,
            response_slot_start: slot_start,
            response_slot_len: resp_len,
        });

        session.tail_a = (session.tail_a.wrapping_add(resp_len)) & (response_capacity - 1);
        total_reserved += resp_len;
    }

    if let Some(slot) = header_slot {
        let mut total_buf = [0u8; 4];
        byteorder::LittleEndian::write_u32(&mut total_buf, total_reserved);
        session.response_staging.write_at(slot, &total_buf);
        session.pending_batch_header = Some(slot);
    }

    let header_len = header_slot.map_or(0, |_| ring::RESP_ALIGN as u32);
    session.pending_batch_total = Some(total_reserved + header_len);
    Ok(total_reserved)
}

/// Walk forward from `TailB` looking for the first still-`IO_PENDING`
/// slot. Returns `Some(batch_total)` once
/// `TailB - TailC` reaches the recorded batch size, signalling the batch
/// is fully ready for transmit.
pub fn completion_scan(session: &mut BufferSession) -> Option<u32> {
    let capacity = session.response_staging.capacity();

    // The batch-header word (when response batching is on) isn't a
    // response slot and can't be parsed as one: its leading bytes are a
    // raw byte count, not a `RespHeader`. Skip it once, exactly at the
    // position `execute_batch` reserved it.
    if let Some(header_pos) = session.pending_batch_header {
        if session.tail_b == header_pos {
            session.tail_b = (session.tail_b.wrapping_add(ring::RESP_ALIGN as u32)) & (capacity - 1);
            session.pending_batch_header = None;
        }
    }

    loop {
        if session.tail_b == session.tail_a {
            break;
        }
        let hdr_bytes = session.response_staging.read_at(session.tail_b, ring::RESP_HEADER_LEN as u32);
        let hdr = RespHeader::decode(&hdr_bytes);
        if hdr.result == ResultCode::IoPending as u32 {
            break;
        }
        // Advance by this slot's reserved length, tracked via the
        // matching pending context rather than recomputed, since a read
        // response's length depends on the request's byte count.
        let slot_len = session
            .pending
            .iter()
            .flatten()
            .find(|c| c.response_slot_start == session.tail_b)
            .map(|c| c.response_slot_len)
            .unwrap_or(ring::RESP_ALIGN as u32);
        session.tail_b = (session.tail_b.wrapping_add(slot_len)) & (capacity - 1);
    }

    match session.pending_batch_total {
        Some(total) if ring::avail(session.tail_c, session.tail_b, capacity) == total => Some(total),
        _ => None,
    }
}

/// Whether the host has consumed enough of the response ring to accept
/// `[TailC, TailB)` without the backend overwriting unread bytes: the
/// distance between the host's consumer head and TailC must cover the
/// pending batch size, or the caller should re-poll. `response_head` is
/// the most recently observed host consumer head.
pub fn ready_to_transmit(session: &BufferSession) -> bool {
    let capacity = session.response_staging.capacity();
    let pending = ring::avail(session.tail_c, session.tail_b, capacity);
    let host_free = capacity - ring::avail(session.response_head, session.tail_c, capacity);
    host_free >= pending
}

/// Physical segments to RDMA-Write for `[TailC, TailB)`, split on wrap
/// The caller posts the write(s), then
/// calls [`advance_after_transmit`] once the completion lands.
pub fn plan_transmit(session: &BufferSession) -> (std::ops::Range<u32>, Option<std::ops::Range<u32>>) {
    let capacity = session.response_staging.capacity();
    let len = ring::avail(session.tail_c, session.tail_b, capacity);
    ring::split_ranges(session.tail_c, len, capacity)
}

pub fn advance_after_transmit(session: &mut BufferSession) {
    session.tail_c = session.tail_b;
    session.pending_batch_total = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_service::InMemoryFileService;
    use crate::ring::RingStorage;
    use byteorder::{ByteOrder, LittleEndian};

    fn encode_write_frame(request_id: u64, file_id: u32, offset: u64, payload: &[u8]) -> Vec<u8> {
        let header = ReqHeader {
            request_id,
            file_id,
            offset,
            bytes: payload.len() as u32,
            flags: 0,
        };
        let total_len = (ring::FRAME_LEN_FIELD + ring::REQ_HEADER_LEN + payload.len()) as u32;
        let mut buf = vec![0u8; total_len as usize];
        LittleEndian::write_u32(&mut buf[0..4], total_len);
        header.encode(&mut buf[4..4 + ring::REQ_HEADER_LEN]);
        buf[4 + ring::REQ_HEADER_LEN..].copy_from_slice(payload);
        buf
    }

    fn encode_read_frame(request_id: u64, file_id: u32, offset: u64, bytes: u32) -> Vec<u8> {
        let header = ReqHeader {
            request_id,
            file_id,
            offset,
            bytes,
            flags: 0,
        };
        let total_len = (ring::FRAME_LEN_FIELD + ring::REQ_HEADER_LEN) as u32;
        let mut buf = vec![0u8; total_len as usize];
        LittleEndian::write_u32(&mut buf[0..4], total_len);
        header.encode(&mut buf[4..4 + ring::REQ_HEADER_LEN]);
        buf
    }

    fn new_session() -> BufferSession {
        BufferSession::new(4096, 4096, 16)
    }

    #[test]
    fn single_write_then_read_round_trips() {
        let fs = InMemoryFileService::new(1 << 20);
        let file = fs.create_file("/f").unwrap();
        let mut session = new_session();
        let payload = vec![9u8; 4096];
        let write_frame = encode_write_frame(1, file.0, 0, &payload);

        let written = execute_batch(&mut session, &write_frame, &write_frame, &fs).unwrap();
        assert!(written > 0);
        let total = completion_scan(&mut session).unwrap();
        assert_eq!(total, written);
        let (first, second) = plan_transmit(&session);
        assert!(second.is_none());
        assert_eq!(first.len() as u32, written);
        advance_after_transmit(&mut session);
        assert_eq!(session.tail_c, session.tail_a);

        let read_frame = encode_read_frame(2, file.0, 0, 4096);
        execute_batch(&mut session, &read_frame, &read_frame, &fs).unwrap();
        completion_scan(&mut session);
        let resp_hdr_bytes = session.response_staging.read_at(session.tail_c, ring::RESP_HEADER_LEN as u32);
        let hdr = RespHeader::decode(&resp_hdr_bytes);
        assert_eq!(hdr.result, ResultCode::Success as u32);
        assert_eq!(hdr.bytes_serviced, 4096);
        let data = session
            .response_staging
            .read_at(session.tail_c + ring::RESP_HEADER_LEN as u32, 4096);
        assert_eq!(data, payload);
    }

    #[test]
    fn batched_mixed_requests_preserve_order() {
        let fs = InMemoryFileService::new(1 << 20);
        let file = fs.create_file("/g").unwrap();
        fs.write(file, 0, &vec![1u8; 1024]).unwrap();
        let mut session = new_session();

        let mut region = Vec::new();
        region.extend(encode_write_frame(10, file.0, 0, &vec![2u8; 1024]));
        region.extend(encode_read_frame(11, file.0, 0, 1024));
        region.extend(encode_write_frame(12, file.0, 2048, &vec![3u8; 2048]));
        region.extend(encode_read_frame(13, file.0, 0, 512));

        execute_batch(&mut session, &region, &region, &fs).unwrap();
        completion_scan(&mut session);

        let request_ids: Vec<u64> = session
            .pending
            .iter()
            .flatten()
            .map(|c| c.request_id.0)
            .collect();
        assert_eq!(request_ids, vec![10, 11, 12, 13]);
    }

    #[test]
    fn response_overflow_is_reported_as_ring_overflow() {
        let fs = InMemoryFileService::new(1 << 20);
        let file = fs.create_file("/h").unwrap();
        let mut session = BufferSession::new(4096, 4096, 16);
        // A read requesting the whole response ring capacity cannot fit
        // once its header is added, and must be rejected rather than
        // silently corrupting the ring.
        let huge_read = encode_read_frame(1, file.0, 0, 4096);
        let result = execute_batch(&mut session, &huge_read, &huge_read, &fs);
        assert!(matches!(result, Err(Error::RingOverflow(_))));
    }

    #[test]
    fn wrap_around_frame_parses_as_single_unsplit_frame() {
        let mut ring = RingStorage::new(4096);
        let payload = vec![5u8; 64 * 1024 - ring::FRAME_LEN_FIELD as usize - ring::REQ_HEADER_LEN];
        // Build the frame bytes directly; parse_batch only needs a
        // linear byte slice, which is what the fetch phase reassembles
        // after reading across the wrap.
        let frame = encode_write_frame(1, 1, 0, &payload);
        assert_eq!(frame.len(), 64 * 1024);
        let frames = parse_batch(&frame).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.bytes as usize, payload.len());
        let _ = ring; // unused beyond documenting the wrap scenario's ring sizing
    }

    #[test]
    fn response_batching_prefixes_and_skips_a_header_word() {
        let fs = InMemoryFileService::new(1 << 20);
        let file = fs.create_file("/batched").unwrap();
        let mut session = BufferSession::new(4096, 4096, 16);
        session.response_batching = true;

        let mut region = Vec::new();
        region.extend(encode_write_frame(20, file.0, 0, &vec![7u8; 256]));
        region.extend(encode_read_frame(21, file.0, 0, 256));

        let reserved_for_frames = execute_batch(&mut session, &region, &region, &fs).unwrap();
        // The header word itself isn't counted in what execute_batch
        // reports as reserved for frames, but it does occupy ring space
        // ahead of them.
        assert_eq!(session.tail_a, ring::RESP_ALIGN as u32 + reserved_for_frames);
        assert!(session.pending_batch_header.is_some());

        let total = completion_scan(&mut session).unwrap();
        assert_eq!(total, ring::RESP_ALIGN as u32 + reserved_for_frames);
        assert!(session.pending_batch_header.is_none(), "header word is consumed exactly once");
        assert_eq!(session.tail_b, session.tail_a);
    }
}
