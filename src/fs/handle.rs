//! File handle management

use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An open file and its decrypted body
pub struct FileHandle {
    /// Inode number
    pub ino: u64,
    /// Open flags
    pub flags: i32,
    /// Plaintext content, loaded at open
    data: Mutex<Vec<u8>>,
}

impl FileHandle {
    pub fn new(ino: u64, flags: i32, data: Vec<u8>) -> Self {
        FileHandle {
            ino,
            flags,
            data: Mutex::new(data),
        }
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let mode = self.flags & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    /// Lock the content buffer
    pub fn data(&self) -> parking_lot::MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }
}

/// Manages open file handles
pub struct HandleManager {
    next_id: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
}

impl HandleManager {
    pub fn new() -> Self {
        HandleManager {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an open file and return its handle id
    pub fn open(&self, ino: u64, flags: i32, data: Vec<u8>) -> u64 {
        let fh = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles
            .write()
            .insert(fh, Arc::new(FileHandle::new(ino, flags, data)));
        fh
    }

    pub fn get(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.handles
            .read()
            .get(&fh)
            .cloned()
            .ok_or(Error::InvalidFileHandle(fh))
    }

    /// Drop a handle
    pub fn close(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.write().remove(&fh)
    }

    /// All open handles for an inode
    pub fn handles_for_ino(&self, ino: u64) -> Vec<Arc<FileHandle>> {
        self.handles
            .read()
            .values()
            .filter(|h| h.ino == ino)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}
