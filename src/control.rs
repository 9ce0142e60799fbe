//! Control Message Handler: decodes typed control requests, forwards
//! them to the file service, and formats typed acknowledgements.
//!
//! Wire format: little-endian `MsgHeader{MsgId:u16}` followed by a
//! fixed-size payload per `MsgId`, no length prefix. Paths are
//! fixed-width, NUL-padded byte arrays so every payload has a size known
//! at compile time.

use byteorder::{ByteOrder, LittleEndian};

use crate::cache::{CuckooTable, FileMetaEntry};
use crate::error::{Error, Result};
use crate::file_service::FileService;
use crate::session::{ControlSession, PendingControlRequest};
use crate::types::{FileAttr, FileId, RequestId, ResultCode};

pub const PATH_MAX: usize = 256;
pub const MSG_HEADER_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgId {
    F2bRequestId = 1,
    F2bTerminate = 2,
    F2bReqCreateDir = 3,
    F2bReqRemoveDir = 4,
    F2bReqCreateFile = 5,
    F2bReqDeleteFile = 6,
    F2bReqChangeFileSize = 7,
    F2bReqGetFileSize = 8,
    F2bReqGetFileInfo = 9,
    F2bReqGetFileAttr = 10,
    F2bReqGetFreeSpace = 11,
    F2bReqMoveFile = 12,
    /// Host → backend handshake extension: binds the remote addressing
    /// of a just-opened buffer channel, carried as a control message
    /// rather than one-byte CM private data since four `(addr, rkey)`
    /// pairs don't fit in it.
    F2bBindBufferRing = 13,
}

impl MsgId {
    fn from_u16(v: u16) -> Result<Self> {
        Ok(match v {
            1 => MsgId::F2bRequestId,
            2 => MsgId::F2bTerminate,
            3 => MsgId::F2bReqCreateDir,
            4 => MsgId::F2bReqRemoveDir,
            5 => MsgId::F2bReqCreateFile,
            6 => MsgId::F2bReqDeleteFile,
            7 => MsgId::F2bReqChangeFileSize,
            8 => MsgId::F2bReqGetFileSize,
            9 => MsgId::F2bReqGetFileInfo,
            10 => MsgId::F2bReqGetFileAttr,
            11 => MsgId::F2bReqGetFreeSpace,
            12 => MsgId::F2bReqMoveFile,
            13 => MsgId::F2bBindBufferRing,
            other => return Err(Error::Protocol(format!("unknown MsgId {other}"))),
        })
    }
}

fn read_path(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn write_path(path: &str, out: &mut [u8; PATH_MAX]) {
    out.fill(0);
    let bytes = path.as_bytes();
    let n = bytes.len().min(PATH_MAX - 1);
    out[..n].copy_from_slice(&bytes[..n]);
}

/// A decoded control request, already matched to its payload shape.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    RequestId,
    Terminate { client_id: u32 },
    CreateDir { path: String },
    RemoveDir { path: String },
    CreateFile { path: String },
    DeleteFile { file: FileId },
    ChangeFileSize { file: FileId, new_size: u64 },
    GetFileSize { file: FileId },
    GetFileInfo { file: FileId },
    GetFileAttr { file: FileId },
    GetFreeSpace,
    MoveFile { file: FileId, new_path: String },
    BindBufferRing {
        request_data_addr: u64,
        request_data_rkey: u32,
        request_tail_addr: u64,
        request_tail_rkey: u32,
        response_data_addr: u64,
        response_data_rkey: u32,
        response_head_addr: u64,
        response_head_rkey: u32,
    },
}

impl ControlRequest {
    /// Encode into `out` (the host side of the wire, mirroring
    /// [`ControlRequest::decode`] on the backend side). `out` must be at
    /// least `ctrl_msg_size` bytes.
    pub fn encode(&self, out: &mut [u8]) {
        out.fill(0);
        let msg_id = self.msg_id();
        LittleEndian::write_u16(&mut out[0..2], msg_id as u16);
        let payload = &mut out[MSG_HEADER_LEN..];
        match self {
            ControlRequest::RequestId | ControlRequest::GetFreeSpace => {}
            ControlRequest::Terminate { client_id } => LittleEndian::write_u32(&mut payload[0..4], *client_id),
            ControlRequest::CreateDir { path } | ControlRequest::RemoveDir { path } | ControlRequest::CreateFile { path } => {
                let mut p = [0u8; PATH_MAX];
                write_path(path, &mut p);
                payload[..PATH_MAX].copy_from_slice(&p);
            }
            ControlRequest::DeleteFile { file } | ControlRequest::GetFileSize { file } | ControlRequest::GetFileInfo { file } | ControlRequest::GetFileAttr { file } => {
                LittleEndian::write_u32(&mut payload[0..4], file.0);
            }
            ControlRequest::ChangeFileSize { file, new_size } => {
                LittleEndian::write_u32(&mut payload[0..4], file.0);
                LittleEndian::write_u64(&mut payload[8..16], *new_size);
            }
            ControlRequest::MoveFile { file, new_path } => {
                LittleEndian::write_u32(&mut payload[0..4], file.0);
                let mut p = [0u8; PATH_MAX];
                write_path(new_path, &mut p);
                payload[8..8 + PATH_MAX].copy_from_slice(&p);
            }
            ControlRequest::BindBufferRing {
                request_data_addr,
                request_data_rkey,
                request_tail_addr,
                request_tail_rkey,
                response_data_addr,
                response_data_rkey,
                response_head_addr,
                response_head_rkey,
            } => {
                LittleEndian::write_u64(&mut payload[0..8], *request_data_addr);
                LittleEndian::write_u32(&mut payload[8..12], *request_data_rkey);
                LittleEndian::write_u64(&mut payload[12..20], *request_tail_addr);
                LittleEndian::write_u32(&mut payload[20..24], *request_tail_rkey);
                LittleEndian::write_u64(&mut payload[24..32], *response_data_addr);
                LittleEndian::write_u32(&mut payload[32..36], *response_data_rkey);
                LittleEndian::write_u64(&mut payload[36..44], *response_head_addr);
                LittleEndian::write_u32(&mut payload[44..48], *response_head_rkey);
            }
        }
    }

    fn msg_id(&self) -> MsgId {
        match self {
            ControlRequest::RequestId => MsgId::F2bRequestId,
            ControlRequest::Terminate { .. } => MsgId::F2bTerminate,
            ControlRequest::CreateDir { .. } => MsgId::F2bReqCreateDir,
            ControlRequest::RemoveDir { .. } => MsgId::F2bReqRemoveDir,
            ControlRequest::CreateFile { .. } => MsgId::F2bReqCreateFile,
            ControlRequest::DeleteFile { .. } => MsgId::F2bReqDeleteFile,
            ControlRequest::ChangeFileSize { .. } => MsgId::F2bReqChangeFileSize,
            ControlRequest::GetFileSize { .. } => MsgId::F2bReqGetFileSize,
            ControlRequest::GetFileInfo { .. } => MsgId::F2bReqGetFileInfo,
            ControlRequest::GetFileAttr { .. } => MsgId::F2bReqGetFileAttr,
            ControlRequest::GetFreeSpace => MsgId::F2bReqGetFreeSpace,
            ControlRequest::MoveFile { .. } => MsgId::F2bReqMoveFile,
            ControlRequest::BindBufferRing { .. } => MsgId::F2bBindBufferRing,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MSG_HEADER_LEN {
            return Err(Error::Protocol("control message shorter than its header".into()));
        }
        let msg_id = MsgId::from_u16(LittleEndian::read_u16(&buf[0..2]))?;
        let payload = &buf[MSG_HEADER_LEN..];
        Ok(match msg_id {
            MsgId::F2bRequestId => ControlRequest::RequestId,
            MsgId::F2bTerminate => ControlRequest::Terminate {
                client_id: LittleEndian::read_u32(&payload[0..4]),
            },
            MsgId::F2bReqCreateDir => ControlRequest::CreateDir { path: read_path(&payload[..PATH_MAX]) },
            MsgId::F2bReqRemoveDir => ControlRequest::RemoveDir { path: read_path(&payload[..PATH_MAX]) },
            MsgId::F2bReqCreateFile => ControlRequest::CreateFile { path: read_path(&payload[..PATH_MAX]) },
            MsgId::F2bReqDeleteFile => ControlRequest::DeleteFile {
                file: FileId(LittleEndian::read_u32(&payload[0..4])),
            },
            MsgId::F2bReqChangeFileSize => ControlRequest::ChangeFileSize {
                file: FileId(LittleEndian::read_u32(&payload[0..4])),
                new_size: LittleEndian::read_u64(&payload[8..16]),
            },
            MsgId::F2bReqGetFileSize => ControlRequest::GetFileSize {
                file: FileId(LittleEndian::read_u32(&payload[0..4])),
            },
            MsgId::F2bReqGetFileInfo => ControlRequest::GetFileInfo {
                file: FileId(LittleEndian::read_u32(&payload[0..4])),
            },
            MsgId::F2bReqGetFileAttr => ControlRequest::GetFileAttr {
                file: FileId(LittleEndian::read_u32(&payload[0..4])),
            },
            MsgId::F2bReqGetFreeSpace => ControlRequest::GetFreeSpace,
            MsgId::F2bReqMoveFile => ControlRequest::MoveFile {
                file: FileId(LittleEndian::read_u32(&payload[0..4])),
                new_path: read_path(&payload[8..8 + PATH_MAX]),
            },
            MsgId::F2bBindBufferRing => ControlRequest::BindBufferRing {
                request_data_addr: LittleEndian::read_u64(&payload[0..8]),
                request_data_rkey: LittleEndian::read_u32(&payload[8..12]),
                request_tail_addr: LittleEndian::read_u64(&payload[12..20]),
                request_tail_rkey: LittleEndian::read_u32(&payload[20..24]),
                response_data_addr: LittleEndian::read_u64(&payload[24..32]),
                response_data_rkey: LittleEndian::read_u32(&payload[32..36]),
                response_head_addr: LittleEndian::read_u64(&payload[36..44]),
                response_head_rkey: LittleEndian::read_u32(&payload[44..48]),
            },
        })
    }
}

/// A typed acknowledgement.
#[derive(Debug, Clone)]
pub enum ControlResponse {
    RespondId { client_id: u32 },
    AckCreateDir { result: ResultCode },
    AckRemoveDir { result: ResultCode },
    AckCreateFile { result: ResultCode, file: FileId },
    AckDeleteFile { result: ResultCode },
    AckChangeFileSize { result: ResultCode },
    AckGetFileSize { result: ResultCode, size: u64 },
    AckGetFileInfo { result: ResultCode, attr: FileAttr },
    AckGetFileAttr { result: ResultCode, attr: FileAttr },
    AckGetFreeSpace { result: ResultCode, bytes: u64 },
    AckMoveFile { result: ResultCode },
    AckBindBufferRing { result: ResultCode },
}

impl ControlResponse {
    /// Encode into `out`, which must be at least `ctrl_msg_size` bytes
    /// (the session's fixed send-staging region).
    pub fn encode(&self, out: &mut [u8]) {
        out.fill(0);
        match self {
            ControlResponse::RespondId { client_id } => LittleEndian::write_u32(&mut out[0..4], *client_id),
            ControlResponse::AckCreateDir { result }
            | ControlResponse::AckRemoveDir { result }
            | ControlResponse::AckDeleteFile { result }
            | ControlResponse::AckChangeFileSize { result }
            | ControlResponse::AckMoveFile { result }
            | ControlResponse::AckBindBufferRing { result } => {
                LittleEndian::write_u32(&mut out[0..4], *result as u32)
            }
            ControlResponse::AckCreateFile { result, file } => {
                LittleEndian::write_u32(&mut out[0..4], *result as u32);
                LittleEndian::write_u32(&mut out[4..8], file.0);
            }
            ControlResponse::AckGetFileSize { result, size } => {
                LittleEndian::write_u32(&mut out[0..4], *result as u32);
                LittleEndian::write_u64(&mut out[8..16], *size);
            }
            ControlResponse::AckGetFileInfo { result, attr } | ControlResponse::AckGetFileAttr { result, attr } => {
                LittleEndian::write_u32(&mut out[0..4], *result as u32);
                LittleEndian::write_u64(&mut out[8..16], attr.size);
                out[16] = attr.is_directory as u8;
                LittleEndian::write_u64(&mut out[24..32], attr.created_at_unix_secs);
                LittleEndian::write_u64(&mut out[32..40], attr.modified_at_unix_secs);
            }
            ControlResponse::AckGetFreeSpace { result, bytes } => {
                LittleEndian::write_u32(&mut out[0..4], *result as u32);
                LittleEndian::write_u64(&mut out[8..16], *bytes);
            }
        }
    }
}

impl ControlResponse {
    /// Decode a response buffer, using `for_request` to know which
    /// payload shape to expect: the wire format fixes payload size per
    /// `MsgId`, so the host already knows the shape of the reply to
    /// whatever it sent.
    pub fn decode(buf: &[u8], for_request: &ControlRequest) -> Result<Self> {
        let result = ResultCode::try_from(LittleEndian::read_u32(&buf[0..4]))?;
        Ok(match for_request {
            ControlRequest::RequestId => ControlResponse::RespondId {
                client_id: LittleEndian::read_u32(&buf[0..4]),
            },
            ControlRequest::Terminate { .. } => return Err(Error::Protocol("Terminate has no response".into())),
            ControlRequest::CreateDir { .. } => ControlResponse::AckCreateDir { result },
            ControlRequest::RemoveDir { .. } => ControlResponse::AckRemoveDir { result },
            ControlRequest::CreateFile { .. } => ControlResponse::AckCreateFile {
                result,
                file: FileId(LittleEndian::read_u32(&buf[4..8])),
            },
            ControlRequest::DeleteFile { .. } => ControlResponse::AckDeleteFile { result },
            ControlRequest::ChangeFileSize { .. } => ControlResponse::AckChangeFileSize { result },
            ControlRequest::GetFileSize { .. } => ControlResponse::AckGetFileSize {
                result,
                size: LittleEndian::read_u64(&buf[8..16]),
            },
            ControlRequest::GetFileInfo { .. } | ControlRequest::GetFileAttr { .. } => {
                let attr = FileAttr {
                    size: LittleEndian::read_u64(&buf[8..16]),
                    is_directory: buf[16] != 0,
                    created_at_unix_secs: LittleEndian::read_u64(&buf[24..32]),
                    modified_at_unix_secs: LittleEndian::read_u64(&buf[32..40]),
                };
                if matches!(for_request, ControlRequest::GetFileInfo { .. }) {
                    ControlResponse::AckGetFileInfo { result, attr }
                } else {
                    ControlResponse::AckGetFileAttr { result, attr }
                }
            }
            ControlRequest::GetFreeSpace => ControlResponse::AckGetFreeSpace {
                result,
                bytes: LittleEndian::read_u64(&buf[8..16]),
            },
            ControlRequest::MoveFile { .. } => ControlResponse::AckMoveFile { result },
            ControlRequest::BindBufferRing { .. } => ControlResponse::AckBindBufferRing { result },
        })
    }
}

fn meta_from_attr(file: FileId, attr: &FileAttr) -> FileMetaEntry {
    FileMetaEntry {
        file_id: file.0,
        size: attr.size,
        is_directory: attr.is_directory,
        modified_at_unix_secs: attr.modified_at_unix_secs,
    }
}

fn attr_from_meta(meta: &FileMetaEntry) -> FileAttr {
    FileAttr {
        size: meta.size,
        is_directory: meta.is_directory,
        created_at_unix_secs: 0,
        modified_at_unix_secs: meta.modified_at_unix_secs,
    }
}

/// Dispatches one decoded request against the file service, consulting
/// and maintaining `cache` for the metadata-bearing operations so a hit
/// can answer without a file-service round trip. The `F2B_REQUEST_ID`
/// path is handled synchronously by the caller (it needs the session's
/// own `ClientId`, which this free function doesn't have); every other
/// variant is a direct, blocking call into the in-process file service
/// reference implementation. There is no async completion to await here
/// because [`crate::file_service::FileService`] is synchronous; a real
/// disk-backed service would instead return `IO_PENDING` and complete
/// later, so callers already set `Result = IO_PENDING` before calling
/// this.
pub fn dispatch(fs: &dyn FileService, cache: &mut CuckooTable<FileMetaEntry>, req: &ControlRequest) -> ControlResponse {
    match req {
        ControlRequest::RequestId | ControlRequest::Terminate { .. } | ControlRequest::BindBufferRing { .. } => {
            unreachable!("RequestId/Terminate/BindBufferRing are handled by the session layer, not dispatch()")
        }
        ControlRequest::CreateDir { path } => ControlResponse::AckCreateDir {
            result: result_of(fs.create_dir(path)),
        },
        ControlRequest::RemoveDir { path } => ControlResponse::AckRemoveDir {
            result: result_of(fs.remove_dir(path)),
        },
        ControlRequest::CreateFile { path } => match fs.create_file(path) {
            Ok(file) => {
                if let Ok(attr) = fs.get_file_attr(file) {
                    let _ = cache.insert(file.0 as u64, meta_from_attr(file, &attr));
                }
                ControlResponse::AckCreateFile { result: ResultCode::Success, file }
            }
            Err(e) => ControlResponse::AckCreateFile { result: (&e).into(), file: FileId(0) },
        },
        ControlRequest::DeleteFile { file } => {
            let result = result_of(fs.delete_file(*file));
            if result == ResultCode::Success {
                cache.delete(file.0 as u64);
            }
            ControlResponse::AckDeleteFile { result }
        }
        ControlRequest::ChangeFileSize { file, new_size } => {
            let result = result_of(fs.change_file_size(*file, *new_size));
            if result == ResultCode::Success {
                // Stale after a size change; drop rather than patch so the
                // next read repopulates it from the file service.
                cache.delete(file.0 as u64);
            }
            ControlResponse::AckChangeFileSize { result }
        }
        ControlRequest::GetFileSize { file } => {
            if let Some(meta) = cache.lookup(file.0 as u64) {
                return ControlResponse::AckGetFileSize { result: ResultCode::Success, size: meta.size };
            }
            match fs.get_file_size(*file) {
                Ok(size) => ControlResponse::AckGetFileSize { result: ResultCode::Success, size },
                Err(e) => ControlResponse::AckGetFileSize { result: (&e).into(), size: 0 },
            }
        }
        ControlRequest::GetFileInfo { file } => {
            if let Some(meta) = cache.lookup(file.0 as u64) {
                return ControlResponse::AckGetFileInfo { result: ResultCode::Success, attr: attr_from_meta(&meta) };
            }
            match fs.get_file_info(*file) {
                Ok(attr) => {
                    let _ = cache.insert(file.0 as u64, meta_from_attr(*file, &attr));
                    ControlResponse::AckGetFileInfo { result: ResultCode::Success, attr }
                }
                Err(e) => ControlResponse::AckGetFileInfo { result: (&e).into(), attr: FileAttr::default() },
            }
        }
        ControlRequest::GetFileAttr { file } => {
            if let Some(meta) = cache.lookup(file.0 as u64) {
                return ControlResponse::AckGetFileAttr { result: ResultCode::Success, attr: attr_from_meta(&meta) };
            }
            match fs.get_file_attr(*file) {
                Ok(attr) => {
                    let _ = cache.insert(file.0 as u64, meta_from_attr(*file, &attr));
                    ControlResponse::AckGetFileAttr { result: ResultCode::Success, attr }
                }
                Err(e) => ControlResponse::AckGetFileAttr { result: (&e).into(), attr: FileAttr::default() },
            }
        }
        ControlRequest::GetFreeSpace => match fs.get_free_space() {
            Ok(bytes) => ControlResponse::AckGetFreeSpace { result: ResultCode::Success, bytes },
            Err(e) => ControlResponse::AckGetFreeSpace { result: (&e).into(), bytes: 0 },
        },
        ControlRequest::MoveFile { file, new_path } => {
            let result = result_of(fs.move_file(*file, new_path));
            if result == ResultCode::Success {
                cache.delete(file.0 as u64);
            }
            ControlResponse::AckMoveFile { result }
        }
    }
}

fn result_of(r: Result<()>) -> ResultCode {
    match r {
        Ok(()) => ResultCode::Success,
        Err(e) => (&e).into(),
    }
}

/// Sets a session's single pending slot, guaranteeing at most one
/// outstanding control op per session. Returns `Error::Protocol` if one
/// is already outstanding; the caller is expected to have checked
/// [`ControlSession::has_pending`] first, this only double-checks the
/// invariant rather than silently clobbering it.
pub fn record_pending(session: &mut ControlSession, request_id: RequestId, msg_id_raw: u16) -> Result<()> {
    if session.has_pending() {
        return Err(Error::Protocol("control session already has a pending request".into()));
    }
    session.pending = Some(PendingControlRequest {
        request_id,
        msg_id: msg_id_raw,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::OccupancyMode;
    use crate::file_service::InMemoryFileService;

    fn encode_create_file(path: &str) -> Vec<u8> {
        let mut buf = vec![0u8; MSG_HEADER_LEN + PATH_MAX];
        LittleEndian::write_u16(&mut buf[0..2], MsgId::F2bReqCreateFile as u16);
        let mut p = [0u8; PATH_MAX];
        write_path(path, &mut p);
        buf[MSG_HEADER_LEN..].copy_from_slice(&p);
        buf
    }

    fn cache() -> CuckooTable<FileMetaEntry> {
        CuckooTable::new(16, 4, OccupancyMode::PerItem)
    }

    #[test]
    fn create_file_round_trips_through_wire_and_dispatch() {
        let buf = encode_create_file("/hello");
        let req = ControlRequest::decode(&buf).unwrap();
        let fs = InMemoryFileService::new(1 << 20);
        let mut cache = cache();
        let resp = dispatch(&fs, &mut cache, &req);
        match resp {
            ControlResponse::AckCreateFile { result, file } => {
                assert_eq!(result, ResultCode::Success);
                assert_eq!(file, FileId(1));
            }
            other => panic!("unexpected response {other:?}"),
        }
        let meta = cache.lookup(1).expect("create_file populates the cache");
        assert_eq!(meta.file_id, 1);
        assert_eq!(meta.size, 0);
        assert!(!meta.is_directory);
    }

    #[test]
    fn get_file_size_serves_from_cache_once_populated() {
        let fs = InMemoryFileService::new(1 << 20);
        let mut cache = cache();
        let file = fs.create_file("/a").unwrap();
        let req = ControlRequest::GetFileSize { file };
        let resp = dispatch(&fs, &mut cache, &req);
        assert!(matches!(resp, ControlResponse::AckGetFileSize { result: ResultCode::Success, .. }));
        assert!(cache.lookup(file.0 as u64).is_none(), "GetFileSize alone doesn't populate the cache");

        let info_req = ControlRequest::GetFileInfo { file };
        dispatch(&fs, &mut cache, &info_req);
        assert!(cache.lookup(file.0 as u64).is_some());

        let resp = dispatch(&fs, &mut cache, &req);
        assert!(matches!(resp, ControlResponse::AckGetFileSize { result: ResultCode::Success, size: 0 }));
    }

    #[test]
    fn delete_file_invalidates_cache_entry() {
        let fs = InMemoryFileService::new(1 << 20);
        let mut cache = cache();
        let file = fs.create_file("/b").unwrap();
        dispatch(&fs, &mut cache, &ControlRequest::GetFileInfo { file });
        assert!(cache.lookup(file.0 as u64).is_some());

        dispatch(&fs, &mut cache, &ControlRequest::DeleteFile { file });
        assert!(cache.lookup(file.0 as u64).is_none());
    }

    #[test]
    fn unknown_msg_id_is_protocol_error() {
        let mut buf = vec![0u8; MSG_HEADER_LEN + 4];
        LittleEndian::write_u16(&mut buf[0..2], 0xFFFF);
        assert!(matches!(ControlRequest::decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn record_pending_rejects_second_outstanding_op() {
        let mut session = ControlSession::new(256);
        record_pending(&mut session, RequestId(1), MsgId::F2bReqGetFreeSpace as u16).unwrap();
        assert!(record_pending(&mut session, RequestId(2), MsgId::F2bReqGetFreeSpace as u16).is_err());
    }
}
