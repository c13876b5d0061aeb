//! Tree snapshot persistence and content records
//!
//! Both live in the same [`KvStore`]: the serialized namespace under
//! [`SNAPSHOT_KEY`] and each regular file's encoded body under its path.

use crate::crypto::ContentCodec;
use crate::error::Result;
use crate::metadata::store::KvStore;
use crate::metadata::tree::Namespace;
use std::sync::Arc;
use tracing::{debug, info};

/// KV key of the namespace snapshot
pub const SNAPSHOT_KEY: &[u8] = b"-";

/// Loads and saves the whole namespace tree
pub trait TreePersistence: Send + Sync {
    /// The stored tree, or `None` on first mount
    fn load(&self) -> Result<Option<Namespace>>;

    /// Replace the stored tree
    fn persist(&self, tree: &Namespace) -> Result<()>;
}

/// Rewrites one JSON document per mutation
pub struct SnapshotPersistence {
    kv: Arc<KvStore>,
}

impl SnapshotPersistence {
    pub fn new(kv: Arc<KvStore>) -> Self {
        SnapshotPersistence { kv }
    }
}

impl TreePersistence for SnapshotPersistence {
    fn load(&self) -> Result<Option<Namespace>> {
        match self.kv.get(SNAPSHOT_KEY)? {
            Some(bytes) => {
                let tree = Namespace::deserialize(&bytes)?;
                info!("Loaded namespace snapshot: {} nodes", tree.len());
                Ok(Some(tree))
            }
            None => Ok(None),
        }
    }

    fn persist(&self, tree: &Namespace) -> Result<()> {
        let bytes = tree.serialize()?;
        self.kv.set(SNAPSHOT_KEY, &bytes)?;
        debug!("Persisted namespace snapshot: {} nodes, {} bytes", tree.len(), bytes.len());
        Ok(())
    }
}

/// Content records keyed by file path
pub struct ContentStore {
    kv: Arc<KvStore>,
    codec: ContentCodec,
}

impl ContentStore {
    pub fn new(kv: Arc<KvStore>, codec: ContentCodec) -> Self {
        ContentStore { kv, codec }
    }

    /// Decoded body of `path`; a file never written reads as empty
    pub fn load(&self, path: &str) -> Result<Vec<u8>> {
        match self.kv.get(path.as_bytes())? {
            Some(record) => self.codec.decode(&record),
            None => Ok(Vec::new()),
        }
    }

    /// Encode and store the whole body of `path`
    pub fn save(&self, path: &str, plaintext: &[u8]) -> Result<()> {
        let record = self.codec.encode(plaintext)?;
        self.kv.set(path.as_bytes(), &record)?;
        debug!("Stored content {}: {} bytes -> {} bytes", path, plaintext.len(), record.len());
        Ok(())
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        self.kv.delete(path.as_bytes())
    }

    /// Move the record of `from` to `to`; files never written have none
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        if self.kv.move_key(from.as_bytes(), to.as_bytes())? {
            debug!("Moved content {} -> {}", from, to);
        } else {
            self.kv.delete(to.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ContentEncoding, IvMode};
    use crate::metadata::node::NodeAttr;
    use crate::metadata::store::KvOptions;
    use crate::metadata::tree::ROOT_INO;
    use tempfile::TempDir;

    fn kv() -> Arc<KvStore> {
        Arc::new(
            KvStore::open(KvOptions {
                in_memory: true,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn content(kv: Arc<KvStore>) -> ContentStore {
        ContentStore::new(
            kv,
            ContentCodec::new([7u8; 16], ContentEncoding::Framed, IvMode::Fixed),
        )
    }

    #[test]
    fn test_snapshot_absent_on_first_mount() {
        let persistence = SnapshotPersistence::new(kv());
        assert!(persistence.load().unwrap().is_none());
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let options = KvOptions {
            path: dir.path().join("db"),
            encryption_key: Some([3u8; 32]),
            in_memory: false,
        };

        let mut tree = Namespace::new(NodeAttr::new_directory(0, 0, 0, 0o755));
        let a = tree.add_child(ROOT_INO, "a").unwrap();
        tree.get_mut(a).unwrap().attr = NodeAttr::new_directory(a, 0, 0, 0o700);
        let f = tree.add_child(a, "f").unwrap();
        tree.get_mut(f).unwrap().attr = NodeAttr::new_file(f, 0, 0, 0o600);

        {
            let kv = Arc::new(KvStore::open(options.clone()).unwrap());
            SnapshotPersistence::new(kv.clone()).persist(&tree).unwrap();
            kv.flush().unwrap();
        }

        let kv = Arc::new(KvStore::open(options).unwrap());
        let loaded = SnapshotPersistence::new(kv).load().unwrap().unwrap();
        assert_eq!(loaded.path(f).unwrap(), "/a/f");
        assert_eq!(loaded.get(a).unwrap().attr.perm(), 0o700);
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let kv = kv();
        kv.set(SNAPSHOT_KEY, b"garbage").unwrap();
        assert!(SnapshotPersistence::new(kv).load().is_err());
    }

    #[test]
    fn test_content_missing_reads_empty() {
        let store = content(kv());
        assert!(store.load("/never-written").unwrap().is_empty());
    }

    #[test]
    fn test_content_is_framed_on_disk() {
        let kv = kv();
        let store = content(kv.clone());

        store.save("/note", b"hello").unwrap();
        let record = kv.get(b"/note").unwrap().unwrap();
        assert_eq!(&record[..4], &[0, 0, 0, 5]);
        assert_eq!(record.len(), 4 + 16);
        assert_eq!(store.load("/note").unwrap(), b"hello");
    }

    #[test]
    fn test_content_rename_and_delete() {
        let kv = kv();
        let store = content(kv.clone());

        store.save("/a/old.txt", b"xyz").unwrap();
        store.save("/b/new.txt", b"overwritten").unwrap();
        store.rename("/a/old.txt", "/b/new.txt").unwrap();
        assert!(kv.get(b"/a/old.txt").unwrap().is_none());
        assert_eq!(store.load("/b/new.txt").unwrap(), b"xyz");

        store.rename("/empty", "/b/new.txt").unwrap();
        assert!(store.load("/b/new.txt").unwrap().is_empty());

        store.save("/gone", b"1").unwrap();
        store.delete("/gone").unwrap();
        assert!(kv.get(b"/gone").unwrap().is_none());
    }
}
