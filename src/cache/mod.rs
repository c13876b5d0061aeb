//! Process identity cache
//!
//! Maps a pid to the executable path it resolved to, so the access gate
//! does not inspect the process table on every filesystem call. Entries
//! expire after a TTL and the cache holds a bounded number of pids.

mod lru;

pub use lru::LruIndex;

use crate::config::GateConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// One cached resolution
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    /// Executable path the pid resolved to
    pub executable: PathBuf,
    /// When the resolution happened
    pub resolved_at: Instant,
}

struct Inner {
    entries: HashMap<u32, ProcessEntry>,
    lru: LruIndex<u32>,
}

/// Bounded, time-limited pid -> executable cache
pub struct ProcessCache {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl ProcessCache {
    /// Create a cache from gate configuration
    pub fn new(config: &GateConfig) -> Self {
        Self::with_limits(Duration::from_secs(config.cache_ttl_secs), config.cache_capacity)
    }

    /// Create a cache with explicit TTL and capacity
    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        ProcessCache {
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: LruIndex::new(capacity),
            }),
        }
    }

    /// Cached executable for `pid`, if present and not expired
    pub fn get(&self, pid: u32) -> Option<PathBuf> {
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(&pid) {
            Some(entry) => entry.resolved_at.elapsed() >= self.ttl,
            None => return None,
        };

        if expired {
            debug!("Process cache entry expired: pid={}", pid);
            inner.entries.remove(&pid);
            inner.lru.remove(&pid);
            return None;
        }

        inner.lru.touch(&pid);
        inner.entries.get(&pid).map(|e| e.executable.clone())
    }

    /// Record a fresh resolution, evicting the LRU pid when full
    pub fn insert(&self, pid: u32, executable: &Path) {
        let mut inner = self.inner.lock();

        if let Some(evicted) = inner.lru.insert(pid) {
            inner.entries.remove(&evicted);
            debug!("Process cache evicted pid={}", evicted);
        }
        inner.entries.insert(
            pid,
            ProcessEntry {
                executable: executable.to_path_buf(),
                resolved_at: Instant::now(),
            },
        );
    }

    /// Purge a pid (e.g. the process exited)
    pub fn remove(&self, pid: u32) {
        let mut inner = self.inner.lock();
        inner.entries.remove(&pid);
        inner.lru.remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
