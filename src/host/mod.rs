//! Host Client Library. Opens a control channel and a buffer channel
//! against a backend, then exposes the file-like namespace operations
//! over the control wire plus offset-addressed read/write over the
//! data-plane ring.
//!
//! The host may be driven from multiple threads; per-session control
//! operations are serialized with a `parking_lot::Mutex` rather than the
//! standard library's, matching this crate's pattern of wrapping shared
//! mutable state behind `parking_lot` elsewhere.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::HostConfig;
use crate::control::{ControlRequest, ControlResponse};
use crate::error::{Error, Result};
use crate::rdma::verbs::{
    AccessFlags, OpCode, ScatterGatherEntry, SendWorkRequest, Verbs,
};
use crate::ring::{self, ReqHeader, RespHeader};
use crate::types::{ClientId, FileAttr, FileId, RequestId, ResultCode};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

struct ChannelEndpoint {
    qp: crate::rdma::verbs::QueuePairHandle,
    cq: crate::rdma::verbs::CompletionQueueHandle,
}

/// One connected client: a control channel for typed requests and a
/// buffer channel for the RDMA ring transport.
pub struct HostClient {
    verbs: Arc<dyn Verbs>,
    ctrl: ChannelEndpoint,
    buf: ChannelEndpoint,

    ctrl_send_mr: crate::rdma::verbs::MemoryRegionHandle,
    ctrl_recv_mr: crate::rdma::verbs::MemoryRegionHandle,
    ctrl_send_buf: Vec<u8>,
    ctrl_recv_buf: Vec<u8>,

    request_ring: ring::RingStorage,
    request_mr: crate::rdma::verbs::MemoryRegionHandle,
    response_ring: ring::RingStorage,
    response_mr: crate::rdma::verbs::MemoryRegionHandle,

    /// The producer tail word the backend RDMA-reads to learn about new
    /// request frames, kept separate from `request_ring` itself so a
    /// torn read of it can never land mid-frame.
    tail_word: Vec<u8>,
    tail_word_mr: crate::rdma::verbs::MemoryRegionHandle,
    /// The consumer head word the backend RDMA-reads to learn how much
    /// response-ring space has been freed.
    head_word: Vec<u8>,
    head_word_mr: crate::rdma::verbs::MemoryRegionHandle,

    tail: u32,
    head: u32,

    client_id: ClientId,
    next_request_id: AtomicU64,
    serialize: Mutex<()>,
}

impl HostClient {
    /// Opens the control channel (the backend assigns a `ClientId`),
    /// then the buffer channel under the same id.
    pub fn connect(verbs: Arc<dyn Verbs>, cfg: &HostConfig) -> Result<Self> {
        let pd = verbs.alloc_pd()?;
        let ctrl_cq = verbs.create_cq(64)?;
        let ctrl_qp = verbs.create_qp(pd, ctrl_cq, crate::rdma::QueuePairCaps::default())?;
        let buf_cq = verbs.create_cq(64)?;
        let buf_qp = verbs.create_qp(pd, buf_cq, crate::rdma::QueuePairCaps::default())?;

        let mut ctrl_send_buf = vec![0u8; cfg.ctrl_msg_size];
        let mut ctrl_recv_buf = vec![0u8; cfg.ctrl_msg_size];
        let ctrl_send_mr = verbs.reg_mr(pd, ctrl_send_buf.as_mut_ptr() as u64, ctrl_send_buf.len(), AccessFlags::LOCAL_WRITE)?;
        let ctrl_recv_mr = verbs.reg_mr(pd, ctrl_recv_buf.as_mut_ptr() as u64, ctrl_recv_buf.len(), AccessFlags::LOCAL_WRITE)?;

        let mut request_ring = ring::RingStorage::new(cfg.request_ring_bytes);
        let request_mr = verbs.reg_mr(
            pd,
            request_ring.as_mut_ptr(),
            cfg.request_ring_bytes,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ,
        )?;
        let mut response_ring = ring::RingStorage::new(cfg.response_ring_bytes);
        let response_mr = verbs.reg_mr(
            pd,
            response_ring.as_mut_ptr(),
            cfg.response_ring_bytes,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        )?;

        let mut tail_word = vec![0u8; 4];
        let tail_word_mr = verbs.reg_mr(pd, tail_word.as_mut_ptr() as u64, tail_word.len(), AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ)?;
        let mut head_word = vec![0u8; 4];
        let head_word_mr = verbs.reg_mr(pd, head_word.as_mut_ptr() as u64, head_word.len(), AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ)?;

        let mut client = Self {
            verbs,
            ctrl: ChannelEndpoint { qp: ctrl_qp, cq: ctrl_cq },
            buf: ChannelEndpoint { qp: buf_qp, cq: buf_cq },
            ctrl_send_mr,
            ctrl_recv_mr,
            ctrl_send_buf,
            ctrl_recv_buf,
            request_ring,
            request_mr,
            response_ring,
            response_mr,
            tail_word,
            tail_word_mr,
            head_word,
            head_word_mr,
            tail: 0,
            head: 0,
            client_id: ClientId(0),
            next_request_id: AtomicU64::new(1),
            serialize: Mutex::new(()),
        };

        let client_id = client.request_id()?;
        client.client_id = client_id;
        client.bind_buffer_ring()?;
        Ok(client)
    }

    /// Tells the backend where this client's rings and metadata words
    /// live, via the control channel rather than one-byte CM private
    /// data (four `(addr, rkey)` pairs don't fit in a byte).
    fn bind_buffer_ring(&mut self) -> Result<()> {
        let (request_data_addr, request_data_rkey) = self.request_ring_remote()?;
        let (response_data_addr, response_data_rkey) = self.response_ring_remote()?;
        let request_tail_addr = self.tail_word.as_ptr() as u64;
        let request_tail_rkey = self.verbs.mr_rkey(self.tail_word_mr)?;
        let response_head_addr = self.head_word.as_ptr() as u64;
        let response_head_rkey = self.verbs.mr_rkey(self.head_word_mr)?;
        match self.round_trip(ControlRequest::BindBufferRing {
            request_data_addr,
            request_data_rkey,
            request_tail_addr,
            request_tail_rkey,
            response_data_addr,
            response_data_rkey,
            response_head_addr,
            response_head_rkey,
        })? {
            ControlResponse::AckBindBufferRing { result } => result_to_unit(result),
            other => unexpected(other),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The `remote_addr`/`rkey` pair the backend needs to RDMA-Read this
    /// client's request ring: the host allocates and registers the ring,
    /// then hands the backend just enough to address it remotely. In a
    /// full deployment these are exchanged as connection private data or
    /// a dedicated control message during the handshake.
    pub fn request_ring_remote(&self) -> Result<(u64, u32)> {
        Ok((self.request_ring.as_ptr(), self.verbs.mr_rkey(self.request_mr)?))
    }

    /// The `remote_addr`/`rkey` pair the backend needs to RDMA-Write this
    /// client's response ring.
    pub fn response_ring_remote(&self) -> Result<(u64, u32)> {
        Ok((self.response_ring.as_ptr(), self.verbs.mr_rkey(self.response_mr)?))
    }

    fn post_ctrl_recv(&self) -> Result<()> {
        let lkey = self.verbs.mr_lkey(self.ctrl_recv_mr)?;
        self.verbs.post_recv(
            self.ctrl.qp,
            SendWorkRequest {
                wr_id: 0,
                opcode: OpCode::Recv,
                sge: vec![ScatterGatherEntry {
                    addr: self.ctrl_recv_buf.as_ptr() as u64,
                    length: self.ctrl_recv_buf.len() as u32,
                    lkey,
                }],
                remote_addr: 0,
                rkey: 0,
                immediate: None,
            },
        )
    }

    /// Send a control request and block for the matching response;
    /// control ops are synchronous from the host's point of view.
    fn round_trip(&mut self, req: ControlRequest) -> Result<ControlResponse> {
        let _guard = self.serialize.lock();
        self.post_ctrl_recv()?;
        req.encode(&mut self.ctrl_send_buf);
        let lkey = self.verbs.mr_lkey(self.ctrl_send_mr)?;
        self.verbs.post_send(
            self.ctrl.qp,
            SendWorkRequest {
                wr_id: 1,
                opcode: OpCode::Send,
                sge: vec![ScatterGatherEntry {
                    addr: self.ctrl_send_buf.as_ptr() as u64,
                    length: self.ctrl_send_buf.len() as u32,
                    lkey,
                }],
                remote_addr: 0,
                rkey: 0,
                immediate: None,
            },
        )?;
        self.verbs.wait_for_completion(self.ctrl.cq, WAIT_TIMEOUT)?;
        self.verbs.wait_for_completion(self.ctrl.cq, WAIT_TIMEOUT)?;
        ControlResponse::decode(&self.ctrl_recv_buf, &req)
    }

    fn request_id(&mut self) -> Result<ClientId> {
        match self.round_trip(ControlRequest::RequestId)? {
            ControlResponse::RespondId { client_id } => Ok(ClientId(client_id)),
            other => Err(Error::Protocol(format!("unexpected response to RequestId: {other:?}"))),
        }
    }

    pub fn terminate(&mut self) -> Result<()> {
        let _guard = self.serialize.lock();
        self.post_ctrl_recv()?;
        ControlRequest::Terminate { client_id: self.client_id.0 }.encode(&mut self.ctrl_send_buf);
        let lkey = self.verbs.mr_lkey(self.ctrl_send_mr)?;
        self.verbs.post_send(
            self.ctrl.qp,
            SendWorkRequest {
                wr_id: 2,
                opcode: OpCode::Send,
                sge: vec![ScatterGatherEntry {
                    addr: self.ctrl_send_buf.as_ptr() as u64,
                    length: self.ctrl_send_buf.len() as u32,
                    lkey,
                }],
                remote_addr: 0,
                rkey: 0,
                immediate: None,
            },
        )
    }

    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        match self.round_trip(ControlRequest::CreateDir { path: path.to_string() })? {
            ControlResponse::AckCreateDir { result } => result_to_unit(result),
            other => unexpected(other),
        }
    }

    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        match self.round_trip(ControlRequest::RemoveDir { path: path.to_string() })? {
            ControlResponse::AckRemoveDir { result } => result_to_unit(result),
            other => unexpected(other),
        }
    }

    pub fn create_file(&mut self, path: &str) -> Result<FileId> {
        match self.round_trip(ControlRequest::CreateFile { path: path.to_string() })? {
            ControlResponse::AckCreateFile { result, file } => {
                result_to_unit(result)?;
                Ok(file)
            }
            other => Err(unexpected_err(other)),
        }
    }

    pub fn delete_file(&mut self, file: FileId) -> Result<()> {
        match self.round_trip(ControlRequest::DeleteFile { file })? {
            ControlResponse::AckDeleteFile { result } => result_to_unit(result),
            other => unexpected(other),
        }
    }

    pub fn change_file_size(&mut self, file: FileId, new_size: u64) -> Result<()> {
        match self.round_trip(ControlRequest::ChangeFileSize { file, new_size })? {
            ControlResponse::AckChangeFileSize { result } => result_to_unit(result),
            other => unexpected(other),
        }
    }

    pub fn get_file_size(&mut self, file: FileId) -> Result<u64> {
        match self.round_trip(ControlRequest::GetFileSize { file })? {
            ControlResponse::AckGetFileSize { result, size } => {
                result_to_unit(result)?;
                Ok(size)
            }
            other => Err(unexpected_err(other)),
        }
    }

    pub fn get_file_info(&mut self, file: FileId) -> Result<FileAttr> {
        match self.round_trip(ControlRequest::GetFileInfo { file })? {
            ControlResponse::AckGetFileInfo { result, attr } => {
                result_to_unit(result)?;
                Ok(attr)
            }
            other => Err(unexpected_err(other)),
        }
    }

    pub fn get_file_attr(&mut self, file: FileId) -> Result<FileAttr> {
        match self.round_trip(ControlRequest::GetFileAttr { file })? {
            ControlResponse::AckGetFileAttr { result, attr } => {
                result_to_unit(result)?;
                Ok(attr)
            }
            other => Err(unexpected_err(other)),
        }
    }

    pub fn get_free_space(&mut self) -> Result<u64> {
        match self.round_trip(ControlRequest::GetFreeSpace)? {
            ControlResponse::AckGetFreeSpace { result, bytes } => {
                result_to_unit(result)?;
                Ok(bytes)
            }
            other => Err(unexpected_err(other)),
        }
    }

    pub fn move_file(&mut self, file: FileId, new_path: &str) -> Result<()> {
        match self.round_trip(ControlRequest::MoveFile { file, new_path: new_path.to_string() })? {
            ControlResponse::AckMoveFile { result } => result_to_unit(result),
            other => unexpected(other),
        }
    }

    /// Publish one frame into the request ring and advance the producer
    /// tail. Shared by [`HostClient::write`] and [`HostClient::read`];
    /// the difference is whether a payload follows the header.
    fn publish_frame(&mut self, request_id: u64, file_id: u32, offset: u64, bytes: u32, payload: Option<&[u8]>) -> Result<()> {
        let header = ReqHeader {
            request_id,
            file_id,
            offset,
            bytes,
            flags: 0,
        };
        let frame_len = ring::FRAME_LEN_FIELD as u32 + ring::REQ_HEADER_LEN as u32 + payload.map_or(0, |p| p.len() as u32);

        let mut frame = vec![0u8; frame_len as usize];
        byteorder::LittleEndian::write_u32(&mut frame[0..4], frame_len);
        header.encode(&mut frame[4..4 + ring::REQ_HEADER_LEN]);
        if let Some(p) = payload {
            frame[4 + ring::REQ_HEADER_LEN..].copy_from_slice(p);
        }

        let capacity = self.request_ring.capacity();
        if ring::avail(self.head, self.tail, capacity) as u64 + frame_len as u64 > capacity as u64 {
            return Err(Error::RingOverflow("request ring would overflow".into()));
        }
        self.request_ring.write_at(self.tail, &frame);
        self.tail = (self.tail.wrapping_add(frame_len)) & (capacity - 1);

        // The new tail only needs to land in local memory: it's the
        // backend that RDMA-reads `tail_word` from across the wire, not
        // the host that pushes it. No post on this side.
        byteorder::LittleEndian::write_u32(&mut self.tail_word, self.tail);
        Ok(())
    }

    /// Offset-addressed write: a write frame carries its payload inline.
    pub fn write(&mut self, file: FileId, offset: u64, data: &[u8]) -> Result<RequestId> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.publish_frame(request_id, file.0, offset, data.len() as u32, Some(data))?;
        Ok(RequestId(request_id))
    }

    /// Offset-addressed read: a read frame is identified by
    /// `length == sizeof(u32) + sizeof(Header)`, i.e. no payload.
    pub fn read(&mut self, file: FileId, offset: u64, len: u32) -> Result<RequestId> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.publish_frame(request_id, file.0, offset, len, None)?;
        Ok(RequestId(request_id))
    }

    /// Poll the response ring for the next fully-written response frame,
    /// advancing the host's consumer head; mirrors the request ring's
    /// polling with producer=backend / consumer=host roles. Returns
    /// `None` if nothing new has arrived yet.
    pub fn poll_response(&mut self) -> Result<Option<(RequestId, ResultCode, Vec<u8>)>> {
        let hdr_bytes = self.response_ring.read_at(self.head, ring::RESP_HEADER_LEN as u32);
        let hdr = RespHeader::decode(&hdr_bytes);
        if hdr.result == ResultCode::IoPending as u32 {
            return Ok(None);
        }
        let slot_len = ring::align_resp(ring::RESP_HEADER_LEN + hdr.bytes_serviced as usize) as u32;
        let payload = if hdr.bytes_serviced > 0 {
            self.response_ring.read_at(self.head + ring::RESP_HEADER_LEN as u32, hdr.bytes_serviced)
        } else {
            Vec::new()
        };
        self.head = (self.head.wrapping_add(slot_len)) & (self.response_ring.capacity() - 1);
        byteorder::LittleEndian::write_u32(&mut self.head_word, self.head);
        let result = ResultCode::try_from(hdr.result)?;
        Ok(Some((RequestId(hdr.request_id), result, payload)))
    }
}

fn result_to_unit(result: ResultCode) -> Result<()> {
    if result == ResultCode::Success {
        Ok(())
    } else {
        Err(result_to_error(result))
    }
}

fn result_to_error(result: ResultCode) -> Error {
    match result {
        ResultCode::NotFound => Error::NotFound,
        ResultCode::AlreadyExists => Error::AlreadyExists,
        ResultCode::CapacityError => Error::RingOverflow("backend reported capacity error".into()),
        ResultCode::ProtocolError => Error::Protocol("backend reported protocol error".into()),
        _ => Error::Io("backend reported an I/O error".into()),
    }
}

fn unexpected(resp: ControlResponse) -> Result<()> {
    Err(unexpected_err(resp))
}

fn unexpected_err(resp: ControlResponse) -> Error {
    Error::Protocol(format!("unexpected control response shape: {resp:?}"))
}
