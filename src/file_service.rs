//! The file service: an external collaborator that the control and
//! data-plane handlers submit operations to. The actual block-device
//! driver behind it is out of scope; this module defines the trait
//! boundary and an in-memory reference implementation sufficient to
//! drive end-to-end tests.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::{FileAttr, FileId};

/// A single control-plane operation the file service executes
/// synchronously from the handler's point of view; the completion path
/// (IO_PENDING → terminal `Result`) is the caller's concern, not this
/// trait's.
pub trait FileService: Send + Sync {
    fn create_dir(&self, path: &str) -> Result<()>;
    fn remove_dir(&self, path: &str) -> Result<()>;
    fn create_file(&self, path: &str) -> Result<FileId>;
    fn delete_file(&self, file: FileId) -> Result<()>;
    fn change_file_size(&self, file: FileId, new_size: u64) -> Result<()>;
    fn get_file_size(&self, file: FileId) -> Result<u64>;
    fn get_file_info(&self, file: FileId) -> Result<FileAttr>;
    fn get_file_attr(&self, file: FileId) -> Result<FileAttr>;
    fn get_free_space(&self) -> Result<u64>;
    fn move_file(&self, file: FileId, new_path: &str) -> Result<()>;

    /// Data-plane read: fill `buf[..len]` starting at `offset`; returns
    /// the number of bytes actually serviced. Reading an unwritten hole
    /// returns zero-filled bytes rather than an error.
    fn read(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<u32>;

    /// Data-plane write: `data` at `offset`; returns bytes serviced.
    fn write(&self, file: FileId, offset: u64, data: &[u8]) -> Result<u32>;
}

struct Entry {
    is_directory: bool,
    data: Vec<u8>,
    created_at_unix_secs: u64,
    modified_at_unix_secs: u64,
}

/// In-memory reference implementation: a path→entry map plus a
/// `FileId→path` index, guarded by a single `RwLock` since this is a
/// test/demo collaborator, not the hot path a real, disk-backed service
/// running on its own thread(s) would be.
pub struct InMemoryFileService {
    inner: RwLock<Inner>,
    capacity_bytes: u64,
}

struct Inner {
    by_path: HashMap<String, Entry>,
    path_of: HashMap<u32, String>,
    next_id: u32,
}

impl InMemoryFileService {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_path: HashMap::new(),
                path_of: HashMap::new(),
                next_id: 1,
            }),
            capacity_bytes,
        }
    }

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn path_of(inner: &Inner, file: FileId) -> Result<String> {
        inner.path_of.get(&file.0).cloned().ok_or(Error::NotFound)
    }
}

impl FileService for InMemoryFileService {
    fn create_dir(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.by_path.contains_key(path) {
            return Err(Error::AlreadyExists);
        }
        let now = Self::now();
        inner.by_path.insert(
            path.to_string(),
            Entry {
                is_directory: true,
                data: Vec::new(),
                created_at_unix_secs: now,
                modified_at_unix_secs: now,
            },
        );
        Ok(())
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.by_path.get(path) {
            Some(e) if e.is_directory => {
                inner.by_path.remove(path);
                Ok(())
            }
            Some(_) => Err(Error::Protocol(format!("{path} is not a directory"))),
            None => Err(Error::NotFound),
        }
    }

    fn create_file(&self, path: &str) -> Result<FileId> {
        let mut inner = self.inner.write();
        if inner.by_path.contains_key(path) {
            return Err(Error::AlreadyExists);
        }
        let now = Self::now();
        inner.by_path.insert(
            path.to_string(),
            Entry {
                is_directory: false,
                data: Vec::new(),
                created_at_unix_secs: now,
                modified_at_unix_secs: now,
            },
        );
        let id = inner.next_id;
        inner.next_id += 1;
        inner.path_of.insert(id, path.to_string());
        Ok(FileId(id))
    }

    fn delete_file(&self, file: FileId) -> Result<()> {
        let mut inner = self.inner.write();
        let path = Self::path_of(&inner, file)?;
        inner.by_path.remove(&path);
        inner.path_of.remove(&file.0);
        Ok(())
    }

    fn change_file_size(&self, file: FileId, new_size: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let path = Self::path_of(&inner, file)?;
        let now = Self::now();
        let entry = inner.by_path.get_mut(&path).ok_or(Error::NotFound)?;
        entry.data.resize(new_size as usize, 0);
        entry.modified_at_unix_secs = now;
        Ok(())
    }

    fn get_file_size(&self, file: FileId) -> Result<u64> {
        let inner = self.inner.read();
        let path = Self::path_of(&inner, file)?;
        Ok(inner.by_path.get(&path).ok_or(Error::NotFound)?.data.len() as u64)
    }

    fn get_file_info(&self, file: FileId) -> Result<FileAttr> {
        self.get_file_attr(file)
    }

    fn get_file_attr(&self, file: FileId) -> Result<FileAttr> {
        let inner = self.inner.read();
        let path = Self::path_of(&inner, file)?;
        let e = inner.by_path.get(&path).ok_or(Error::NotFound)?;
        Ok(FileAttr {
            size: e.data.len() as u64,
            is_directory: e.is_directory,
            created_at_unix_secs: e.created_at_unix_secs,
            modified_at_unix_secs: e.modified_at_unix_secs,
        })
    }

    fn get_free_space(&self) -> Result<u64> {
        let inner = self.inner.read();
        let used: u64 = inner.by_path.values().map(|e| e.data.len() as u64).sum();
        Ok(self.capacity_bytes.saturating_sub(used))
    }

    fn move_file(&self, file: FileId, new_path: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let old_path = Self::path_of(&inner, file)?;
        if inner.by_path.contains_key(new_path) {
            return Err(Error::AlreadyExists);
        }
        let entry = inner.by_path.remove(&old_path).ok_or(Error::NotFound)?;
        inner.by_path.insert(new_path.to_string(), entry);
        inner.path_of.insert(file.0, new_path.to_string());
        Ok(())
    }

    fn read(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<u32> {
        let inner = self.inner.read();
        let path = Self::path_of(&inner, file)?;
        let entry = inner.by_path.get(&path).ok_or(Error::NotFound)?;
        let start = offset as usize;
        if start >= entry.data.len() {
            buf.fill(0);
            return Ok(0);
        }
        let n = buf.len().min(entry.data.len() - start);
        buf[..n].copy_from_slice(&entry.data[start..start + n]);
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(n as u32)
    }

    fn write(&self, file: FileId, offset: u64, data: &[u8]) -> Result<u32> {
        let mut inner = self.inner.write();
        let path = Self::path_of(&inner, file)?;
        let now = Self::now();
        let entry = inner.by_path.get_mut(&path).ok_or(Error::NotFound)?;
        let end = offset as usize + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[offset as usize..end].copy_from_slice(data);
        entry.modified_at_unix_secs = now;
        Ok(data.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get_file_info_round_trips() {
        let fs = InMemoryFileService::new(1 << 20);
        let id = fs.create_file("/a").unwrap();
        let attr = fs.get_file_info(id).unwrap();
        assert_eq!(attr.size, 0);
        assert!(!attr.is_directory);
    }

    #[test]
    fn delete_then_get_info_is_not_found() {
        let fs = InMemoryFileService::new(1 << 20);
        let id = fs.create_file("/b").unwrap();
        fs.delete_file(id).unwrap();
        assert!(matches!(fs.get_file_info(id), Err(Error::NotFound)));
    }

    #[test]
    fn write_then_read_same_offset_round_trips() {
        let fs = InMemoryFileService::new(1 << 20);
        let id = fs.create_file("/c").unwrap();
        let payload = vec![7u8; 4096];
        assert_eq!(fs.write(id, 0, &payload).unwrap(), 4096);
        let mut buf = vec![0u8; 4096];
        assert_eq!(fs.read(id, 0, &mut buf).unwrap(), 4096);
        assert_eq!(buf, payload);
    }

    #[test]
    fn read_unwritten_hole_returns_zero_bytes() {
        let fs = InMemoryFileService::new(1 << 20);
        let id = fs.create_file("/d").unwrap();
        let mut buf = vec![0xffu8; 64];
        let n = fs.read(id, 1000, &mut buf).unwrap();
        assert_eq!(n, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
