//! Filesystem verb semantics
//!
//! [`FsCore`] implements one method per filesystem verb, independent of
//! the kernel bridge. Each verb authorizes the caller through the access
//! gate, resolves or mutates the namespace tree and moves content through
//! the codec. Structural and attribute changes rewrite the tree snapshot.
//!
//! Lock order is handle buffer, then tree.

use crate::config::Config;
use crate::crypto::{ContentCodec, KeyMaterial};
use crate::error::{Error, Result};
use crate::fs::handle::HandleManager;
use crate::gate::{AccessGate, Policy, ProcessResolver};
use crate::metadata::{
    ContentStore, FileKind, KvOptions, KvStore, Namespace, NodeAttr, SnapshotPersistence,
    TreePersistence, ROOT_INO,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Identity of the process issuing a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Attribute changes requested by `setattr`
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    /// Open handle to truncate through
    pub fh: Option<u64>,
}

/// One `readdir` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileKind,
    pub name: String,
}

/// Gated, encrypted filesystem over a key-value store
pub struct FsCore {
    gate: AccessGate,
    tree: RwLock<Namespace>,
    persistence: Arc<dyn TreePersistence>,
    content: ContentStore,
    handles: HandleManager,
    kv: Arc<KvStore>,
}

impl FsCore {
    /// Assemble from already constructed parts
    pub fn new(
        gate: AccessGate,
        tree: Namespace,
        persistence: Arc<dyn TreePersistence>,
        content: ContentStore,
        kv: Arc<KvStore>,
    ) -> Self {
        FsCore {
            gate,
            tree: RwLock::new(tree),
            persistence,
            content,
            handles: HandleManager::new(),
            kv,
        }
    }

    /// Open the store described by `config` and load (or bootstrap) the tree
    pub fn mount(
        config: &Config,
        keys: &KeyMaterial,
        resolver: Arc<dyn ProcessResolver>,
    ) -> Result<Self> {
        let kv = Arc::new(KvStore::open(KvOptions {
            path: config.storage.path.clone(),
            encryption_key: config.storage.encrypt_store.then(|| *keys.store_key()),
            in_memory: config.storage.in_memory,
        })?);

        let persistence: Arc<dyn TreePersistence> = Arc::new(SnapshotPersistence::new(kv.clone()));
        let tree = match persistence.load()? {
            Some(tree) => tree,
            None => {
                info!("No namespace snapshot, bootstrapping from {:?}", config.mount.mount_point);
                let tree = Namespace::bootstrap(&config.mount.mount_point);
                persistence.persist(&tree)?;
                tree
            }
        };

        let codec = ContentCodec::new(
            *keys.content_key(),
            config.content.encoding,
            config.content.iv_mode,
        );
        let gate = AccessGate::new(Policy::from_config(&config.policy), &config.gate, resolver);

        Ok(FsCore::new(
            gate,
            tree,
            persistence,
            ContentStore::new(kv.clone(), codec),
            kv,
        ))
    }

    /// Number of nodes in the live tree
    pub fn node_count(&self) -> usize {
        self.tree.read().len()
    }

    /// Flush the key-value store
    pub fn flush(&self) -> Result<()> {
        self.kv.flush()
    }

    /// Tear down: persist the tree and close the store.
    ///
    /// Falls back to a flush when the store is still shared elsewhere.
    pub fn close(self) -> Result<()> {
        let FsCore {
            tree,
            persistence,
            content,
            kv,
            ..
        } = self;
        persistence.persist(&tree.read())?;
        drop(persistence);
        drop(content);

        match Arc::try_unwrap(kv) {
            Ok(kv) => kv.close(),
            Err(kv) => {
                warn!("Store still in use at close, flushing only");
                kv.flush()
            }
        }
    }

    fn persist(&self, tree: &Namespace) -> Result<()> {
        self.persistence.persist(tree)
    }

    pub fn getattr(&self, caller: Caller, ino: u64) -> Result<NodeAttr> {
        debug!("getattr: ino={}", ino);
        // The mount point itself stays stat-able for everyone
        if ino != ROOT_INO {
            self.gate.check("Getattr", caller.pid)?;
        }
        Ok(self.tree.read().get(ino)?.attr.clone())
    }

    pub fn setattr(&self, caller: Caller, ino: u64, changes: SetAttr) -> Result<NodeAttr> {
        debug!("setattr: ino={}, changes={:?}", ino, changes);
        self.gate.check("Setattr", caller.pid)?;

        if let Some(size) = changes.size {
            self.truncate(ino, size, changes.fh)?;
        }

        let mut tree = self.tree.write();
        let node = tree.get_mut(ino)?;
        let attr = &mut node.attr;
        if let Some(mode) = changes.mode {
            attr.set_perm(mode);
        }
        if let Some(uid) = changes.uid {
            attr.uid = uid;
        }
        if let Some(gid) = changes.gid {
            attr.gid = gid;
        }
        if let Some(size) = changes.size {
            attr.size = size;
            attr.mtime = SystemTime::now();
        }
        if let Some(atime) = changes.atime {
            attr.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            attr.mtime = mtime;
        }
        attr.ctime = SystemTime::now();

        let attr = attr.clone();
        self.persist(&tree)?;
        Ok(attr)
    }

    /// Resize a file's decrypted body and rewrite its record
    fn truncate(&self, ino: u64, size: u64, fh: Option<u64>) -> Result<()> {
        let size = usize::try_from(size)
            .map_err(|_| Error::InvalidArgument(format!("size {} too large", size)))?;

        // Handle buffer first, then the tree
        let buffered = match fh {
            Some(fh) => Some(self.handles.get(fh)?.data().clone()),
            None => None,
        };

        let body = {
            let tree = self.tree.read();
            let path = tree.path(ino)?;
            if tree.get(ino)?.is_dir() {
                return Err(Error::IsADirectory(path));
            }

            let mut body = match buffered {
                Some(body) => body,
                None => self.content.load(&path)?,
            };
            body.resize(size, 0);
            self.content.save(&path, &body)?;
            debug!("Truncated {} to {} bytes", path, size);
            body
        };

        for handle in self.handles.handles_for_ino(ino) {
            *handle.data() = body.clone();
        }
        Ok(())
    }

    /// Insert a new child; `AlreadyExists` if the name is taken
    fn insert_node(
        &self,
        tree: &mut Namespace,
        parent: u64,
        name: &str,
        attr: impl FnOnce(u64) -> NodeAttr,
    ) -> Result<NodeAttr> {
        match tree.lookup(parent, name) {
            Ok(existing) => {
                let path = tree.path(existing.ino())?;
                return Err(Error::AlreadyExists(path));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let ino = tree.add_child(parent, name)?;
        let node = tree.get_mut(ino)?;
        node.attr = attr(ino);
        let attr = node.attr.clone();
        tree.get_mut(parent)?.attr.touch();
        Ok(attr)
    }

    pub fn mkdir(&self, caller: Caller, parent: u64, name: &str, mode: u32) -> Result<NodeAttr> {
        debug!("mkdir: parent={}, name={}, mode={:o}", parent, name, mode);
        self.gate.check("Mkdir", caller.pid)?;

        let mut tree = self.tree.write();
        let attr = self.insert_node(&mut tree, parent, name, |ino| {
            NodeAttr::new_directory(ino, caller.uid, caller.gid, mode)
        })?;
        self.persist(&tree)?;
        Ok(attr)
    }

    /// Create a regular file and open it
    pub fn create(
        &self,
        caller: Caller,
        parent: u64,
        name: &str,
        mode: u32,
        flags: i32,
    ) -> Result<(NodeAttr, u64)> {
        debug!("create: parent={}, name={}, mode={:o}", parent, name, mode);
        self.gate.check("Create", caller.pid)?;

        let attr = {
            let mut tree = self.tree.write();
            let attr = self.insert_node(&mut tree, parent, name, |ino| {
                NodeAttr::new_file(ino, caller.uid, caller.gid, mode)
            })?;
            self.persist(&tree)?;
            attr
        };

        let fh = self.handles.open(attr.ino, flags, Vec::new());
        Ok((attr, fh))
    }

    pub fn unlink(&self, caller: Caller, parent: u64, name: &str) -> Result<()> {
        debug!("unlink: parent={}, name={}", parent, name);
        self.gate.check("Unlink", caller.pid)?;

        let mut tree = self.tree.write();
        let node = tree.lookup(parent, name)?;
        let path = tree.path(node.ino())?;
        if node.is_dir() {
            return Err(Error::IsADirectory(path));
        }

        tree.remove_child(parent, name)?;
        tree.get_mut(parent)?.attr.touch();
        self.persist(&tree)?;
        self.content.delete(&path)
    }

    pub fn rmdir(&self, caller: Caller, parent: u64, name: &str) -> Result<()> {
        debug!("rmdir: parent={}, name={}", parent, name);
        self.gate.check("Rmdir", caller.pid)?;

        let mut tree = self.tree.write();
        let node = tree.lookup(parent, name)?;
        if !node.is_dir() {
            return Err(Error::NotADirectory(tree.path(node.ino())?));
        }
        if node.has_children() {
            return Err(Error::DirectoryNotEmpty(tree.path(node.ino())?));
        }

        tree.remove_child(parent, name)?;
        tree.get_mut(parent)?.attr.touch();
        self.persist(&tree)
    }

    pub fn rename(
        &self,
        caller: Caller,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
        flags: u32,
    ) -> Result<()> {
        debug!(
            "rename: parent={}, name={}, newparent={}, newname={}",
            parent, name, new_parent, new_name
        );
        if flags != 0 {
            return Err(Error::InvalidArgument(format!("unsupported rename flags {:#x}", flags)));
        }
        self.gate.check("Rename", caller.pid)?;

        let mut tree = self.tree.write();
        let source = tree.lookup(parent, name)?;
        let ino = source.ino();
        let source_is_dir = source.is_dir();

        match tree.lookup(new_parent, new_name) {
            Ok(target) if target.ino() == ino => return Ok(()),
            Ok(target) => {
                let target_path = tree.path(target.ino())?;
                match (source_is_dir, target.is_dir()) {
                    (true, false) => return Err(Error::NotADirectory(target_path)),
                    (false, true) => return Err(Error::IsADirectory(target_path)),
                    (true, true) if target.has_children() => {
                        return Err(Error::DirectoryNotEmpty(target_path))
                    }
                    _ => {}
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let files = tree.files_under(ino)?;
        let old_paths = files
            .iter()
            .map(|&f| tree.path(f))
            .collect::<Result<Vec<_>>>()?;

        tree.rename(parent, name, new_parent, new_name)?;
        let now = SystemTime::now();
        tree.get_mut(ino)?.attr.ctime = now;
        tree.get_mut(parent)?.attr.touch();
        tree.get_mut(new_parent)?.attr.touch();
        self.persist(&tree)?;

        for (file, old_path) in files.iter().zip(old_paths) {
            let new_path = tree.path(*file)?;
            self.content.rename(&old_path, &new_path)?;
        }
        Ok(())
    }

    pub fn lookup(&self, caller: Caller, parent: u64, name: &str) -> Result<NodeAttr> {
        debug!("lookup: parent={}, name={}", parent, name);
        self.gate.check("Lookup", caller.pid)?;
        Ok(self.tree.read().lookup(parent, name)?.attr.clone())
    }

    /// `.`, `..` and the children in name order
    pub fn readdir(&self, caller: Caller, ino: u64) -> Result<Vec<DirEntry>> {
        debug!("readdir: ino={}", ino);
        self.gate.check("Readdir", caller.pid)?;

        let tree = self.tree.read();
        let node = tree.get(ino)?;
        if !node.is_dir() {
            return Err(Error::NotADirectory(tree.path(ino)?));
        }

        let mut entries = vec![
            DirEntry {
                ino,
                kind: FileKind::Directory,
                name: ".".to_string(),
            },
            DirEntry {
                ino: node.parent().unwrap_or(ino),
                kind: FileKind::Directory,
                name: "..".to_string(),
            },
        ];
        for (name, child) in node.children() {
            entries.push(DirEntry {
                ino: child,
                kind: tree.get(child)?.attr.kind(),
                name: name.to_string(),
            });
        }
        Ok(entries)
    }

    /// Decrypt the file's record into a new handle
    pub fn open(&self, caller: Caller, ino: u64, flags: i32) -> Result<u64> {
        debug!("open: ino={}, flags={:#x}", ino, flags);
        self.gate.check("Open", caller.pid)?;

        let data = {
            let tree = self.tree.read();
            let path = tree.path(ino)?;
            if tree.get(ino)?.is_dir() {
                return Err(Error::IsADirectory(path));
            }
            self.content.load(&path)?
        };
        Ok(self.handles.open(ino, flags, data))
    }

    pub fn read(&self, caller: Caller, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        debug!("read: fh={}, offset={}, size={}", fh, offset, size);
        self.gate.check("Read", caller.pid)?;

        let offset = checked_offset(offset)?;
        let handle = self.handles.get(fh)?;
        let data = handle.data();
        if offset >= data.len() {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(size as usize).min(data.len());
        Ok(data[offset..end].to_vec())
    }

    /// Splice `bytes` into the handle buffer and rewrite the record
    pub fn write(&self, caller: Caller, fh: u64, offset: i64, bytes: &[u8]) -> Result<u32> {
        debug!("write: fh={}, offset={}, size={}", fh, offset, bytes.len());
        self.gate.check("Write", caller.pid)?;

        let offset = checked_offset(offset)?;
        let written = u32::try_from(bytes.len())
            .map_err(|_| Error::InvalidArgument("write too large".to_string()))?;
        let handle = self.handles.get(fh)?;
        if !handle.is_writable() {
            return Err(Error::InvalidFileHandle(fh));
        }
        let mut data = handle.data();
        if offset > data.len() {
            return Err(Error::InvalidArgument(format!(
                "write offset {} past end of {}-byte file",
                offset,
                data.len()
            )));
        }

        let end = offset + bytes.len();
        if end > data.len() {
            data.truncate(offset);
            data.extend_from_slice(bytes);
        } else {
            data[offset..end].copy_from_slice(bytes);
        }

        // Held across the save so a concurrent rename cannot strand the record
        let mut tree = self.tree.write();
        let path = tree.path(handle.ino)?;
        self.content.save(&path, &data)?;

        let attr = &mut tree.get_mut(handle.ino)?.attr;
        attr.size = data.len() as u64;
        attr.touch();
        self.persist(&tree)?;
        Ok(written)
    }

    /// Re-encode the handle buffer and flush the store
    pub fn fsync(&self, caller: Caller, fh: u64) -> Result<()> {
        debug!("fsync: fh={}", fh);
        self.gate.check("Fsync", caller.pid)?;

        let handle = self.handles.get(fh)?;
        let data = handle.data();
        {
            let tree = self.tree.read();
            let path = tree.path(handle.ino)?;
            self.content.save(&path, &data)?;
        }
        self.kv.flush()
    }

    /// Drop a handle; only undoes an `open` the gate already allowed
    pub fn release(&self, fh: u64) -> Result<()> {
        debug!("release: fh={}", fh);
        match self.handles.close(fh) {
            Some(_) => Ok(()),
            None => {
                warn!("release of unknown handle {}", fh);
                Err(Error::InvalidFileHandle(fh))
            }
        }
    }
}

fn checked_offset(offset: i64) -> Result<usize> {
    usize::try_from(offset).map_err(|_| Error::InvalidArgument(format!("negative offset {}", offset)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GateConfig, PolicyConfig};
    use crate::crypto::{ContentEncoding, IvMode};
    use crate::gate::tests::FakeResolver;
    use crate::metadata::SNAPSHOT_KEY;
    use tempfile::TempDir;

    const LS: u32 = 100;
    const CURL: u32 = 200;
    const GHOST: u32 = 300;
    const CAT: u32 = 400;

    fn user(pid: u32) -> Caller {
        Caller {
            pid,
            uid: 1000,
            gid: 1000,
        }
    }

    fn policy(default_action: &str) -> PolicyConfig {
        PolicyConfig {
            default_action: default_action.to_string(),
            allow: vec!["/bin/ls".into()],
            deny: vec!["/usr/bin/curl".into()],
        }
    }

    fn core_with(default_action: &str) -> (FsCore, Arc<KvStore>) {
        let kv = Arc::new(
            KvStore::open(KvOptions {
                in_memory: true,
                ..Default::default()
            })
            .unwrap(),
        );
        let resolver = FakeResolver::with(&[
            (LS, "/bin/ls"),
            (CURL, "/usr/bin/curl"),
            (CAT, "/bin/cat"),
        ]);
        let gate = AccessGate::new(
            Policy::from_config(&policy(default_action)),
            &GateConfig::default(),
            resolver,
        )
        .with_self_pid(1);
        let keys = KeyMaterial::from_passphrase(b"correct horse").unwrap();
        let codec = ContentCodec::new(*keys.content_key(), ContentEncoding::Framed, IvMode::Fixed);
        let tree = Namespace::new(NodeAttr::new_directory(0, 0, 0, 0o755));

        let core = FsCore::new(
            gate,
            tree,
            Arc::new(SnapshotPersistence::new(kv.clone())),
            ContentStore::new(kv.clone(), codec),
            kv.clone(),
        );
        (core, kv)
    }

    fn core() -> (FsCore, Arc<KvStore>) {
        core_with("deny")
    }

    fn write_file(core: &FsCore, parent: u64, name: &str, body: &[u8]) -> u64 {
        let (attr, fh) = core.create(user(LS), parent, name, 0o644, libc::O_RDWR).unwrap();
        core.write(user(LS), fh, 0, body).unwrap();
        core.release(fh).unwrap();
        attr.ino
    }

    #[test]
    fn test_create_write_read_back() {
        let (core, kv) = core();
        let ino = write_file(&core, ROOT_INO, "hello.txt", b"hello");

        let record = kv.get(b"/hello.txt").unwrap().unwrap();
        assert_eq!(&record[..4], &[0, 0, 0, 5]);
        assert_eq!(record.len(), 20);

        let fh = core.open(user(LS), ino, libc::O_RDONLY).unwrap();
        assert_eq!(core.read(user(LS), fh, 0, 100).unwrap(), b"hello");
        assert_eq!(core.getattr(user(LS), ino).unwrap().size, 5);
    }

    #[test]
    fn test_nested_file_record_under_full_path() {
        let (core, kv) = core();
        let a = core.mkdir(user(LS), ROOT_INO, "a", 0o755).unwrap().ino;
        let ino = write_file(&core, a, "b.txt", b"hello");

        let record = kv.get(b"/a/b.txt").unwrap().unwrap();
        assert_eq!(&record[..4], &[0, 0, 0, 5]);
        assert_eq!(record.len(), 4 + 16);
        assert!(kv.get(b"/b.txt").unwrap().is_none());

        let fh = core.open(user(LS), ino, libc::O_RDONLY).unwrap();
        assert_eq!(core.read(user(LS), fh, 0, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_unlisted_executable_denied_getattr() {
        let (core, _) = core();
        let ino = write_file(&core, ROOT_INO, "secret", b"s");

        let err = core.getattr(user(CAT), ino).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied));
        assert_eq!(err.to_errno(), libc::EACCES);
        assert_eq!(core.getattr(user(LS), ino).unwrap().size, 1);
    }

    #[test]
    fn test_create_sets_owner_and_type() {
        let (core, _) = core();
        let (attr, _) = core
            .create(user(LS), ROOT_INO, "f", 0o640, libc::O_RDWR)
            .unwrap();
        assert_eq!(attr.kind(), FileKind::RegularFile);
        assert_eq!(attr.perm(), 0o640);
        assert_eq!((attr.uid, attr.gid), (1000, 1000));

        assert!(matches!(
            core.create(user(LS), ROOT_INO, "f", 0o640, libc::O_RDWR),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_denied_process_cannot_mkdir() {
        let (core, _) = core_with("pass");

        let err = core.mkdir(user(CURL), ROOT_INO, "x", 0o755).unwrap_err();
        assert_eq!(err.to_errno(), libc::EACCES);
        assert!(core.lookup(user(LS), ROOT_INO, "x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_default_deny_and_unresolvable_callers() {
        let (core, _) = core();
        assert!(matches!(
            core.readdir(user(GHOST), ROOT_INO),
            Err(Error::PermissionDenied)
        ));
        assert!(core.readdir(user(0), ROOT_INO).is_ok());
    }

    #[test]
    fn test_root_getattr_bypasses_gate() {
        let (core, _) = core();
        assert!(core.getattr(user(GHOST), ROOT_INO).unwrap().is_dir());

        let dir = core.mkdir(user(LS), ROOT_INO, "d", 0o755).unwrap();
        assert!(matches!(
            core.getattr(user(GHOST), dir.ino),
            Err(Error::PermissionDenied)
        ));
    }

    #[test]
    fn test_write_past_end_is_invalid() {
        let (core, _) = core();
        let ino = write_file(&core, ROOT_INO, "abc", b"abc");
        let fh = core.open(user(LS), ino, libc::O_RDWR).unwrap();

        let err = core.write(user(LS), fh, 10, b"x").unwrap_err();
        assert_eq!(err.to_errno(), libc::EINVAL);
        assert!(matches!(
            core.read(user(LS), fh, -1, 4),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(core.read(user(LS), fh, 0, 10).unwrap(), b"abc");
    }

    #[test]
    fn test_write_through_read_only_handle() {
        let (core, _) = core();
        let ino = write_file(&core, ROOT_INO, "ro", b"keep");
        let fh = core.open(user(LS), ino, libc::O_RDONLY).unwrap();

        let err = core.write(user(LS), fh, 0, b"lost").unwrap_err();
        assert_eq!(err.to_errno(), libc::EBADF);
        assert_eq!(core.read(user(LS), fh, 0, 8).unwrap(), b"keep");
    }

    #[test]
    fn test_overwrite_and_append() {
        let (core, _) = core();
        let ino = write_file(&core, ROOT_INO, "f", b"hello world");
        let fh = core.open(user(LS), ino, libc::O_RDWR).unwrap();

        core.write(user(LS), fh, 0, b"HELLO").unwrap();
        core.write(user(LS), fh, 11, b"!").unwrap();
        core.write(user(LS), fh, 6, b"there, you").unwrap();
        core.release(fh).unwrap();

        let fh = core.open(user(LS), ino, libc::O_RDONLY).unwrap();
        assert_eq!(core.read(user(LS), fh, 0, 64).unwrap(), b"HELLO there, you");
        assert_eq!(core.read(user(LS), fh, 100, 4).unwrap(), b"");
        assert_eq!(core.getattr(user(LS), ino).unwrap().size, 16);
    }

    #[test]
    fn test_missing_record_reads_empty() {
        let (core, _) = core();
        let (attr, fh) = core
            .create(user(LS), ROOT_INO, "empty", 0o644, libc::O_RDWR)
            .unwrap();
        core.release(fh).unwrap();

        let fh = core.open(user(LS), attr.ino, libc::O_RDONLY).unwrap();
        assert!(core.read(user(LS), fh, 0, 16).unwrap().is_empty());
    }

    #[test]
    fn test_truncate_grow_and_shrink() {
        let (core, _) = core();
        let ino = write_file(&core, ROOT_INO, "t", b"abcdef");

        let attr = core
            .setattr(user(LS), ino, SetAttr { size: Some(3), ..Default::default() })
            .unwrap();
        assert_eq!(attr.size, 3);
        let fh = core.open(user(LS), ino, libc::O_RDWR).unwrap();
        assert_eq!(core.read(user(LS), fh, 0, 10).unwrap(), b"abc");

        core.setattr(
            user(LS),
            ino,
            SetAttr {
                size: Some(5),
                fh: Some(fh),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(core.read(user(LS), fh, 0, 10).unwrap(), b"abc\0\0");
        core.release(fh).unwrap();

        let fh = core.open(user(LS), ino, libc::O_RDONLY).unwrap();
        assert_eq!(core.read(user(LS), fh, 0, 10).unwrap(), b"abc\0\0");
    }

    #[test]
    fn test_setattr_mode_keeps_type() {
        let (core, _) = core();
        let dir = core.mkdir(user(LS), ROOT_INO, "d", 0o755).unwrap();
        let attr = core
            .setattr(
                user(LS),
                dir.ino,
                SetAttr {
                    mode: Some(0o700),
                    uid: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.perm(), 0o700);
        assert_eq!(attr.uid, 0);
        assert!(matches!(
            core.setattr(user(LS), dir.ino, SetAttr { size: Some(0), ..Default::default() }),
            Err(Error::IsADirectory(_))
        ));
    }

    #[test]
    fn test_rename_moves_content() {
        let (core, kv) = core();
        let a = core.mkdir(user(LS), ROOT_INO, "a", 0o755).unwrap().ino;
        let b = core.mkdir(user(LS), ROOT_INO, "b", 0o755).unwrap().ino;
        let ino = write_file(&core, a, "old.txt", b"xyz");

        core.rename(user(LS), a, "old.txt", b, "new.txt", 0).unwrap();

        assert!(kv.get(b"/a/old.txt").unwrap().is_none());
        assert!(core.lookup(user(LS), a, "old.txt").unwrap_err().is_not_found());
        assert_eq!(core.lookup(user(LS), b, "new.txt").unwrap().ino, ino);
        let fh = core.open(user(LS), ino, libc::O_RDONLY).unwrap();
        assert_eq!(core.read(user(LS), fh, 0, 10).unwrap(), b"xyz");
    }

    #[test]
    fn test_writes_racing_rename_land_at_new_path() {
        let (core, kv) = core();
        let a = core.mkdir(user(LS), ROOT_INO, "a", 0o755).unwrap().ino;
        let b = core.mkdir(user(LS), ROOT_INO, "b", 0o755).unwrap().ino;

        for round in 0..50 {
            let body = format!("round {}", round);
            let (attr, fh) = core.create(user(LS), a, "f", 0o644, libc::O_RDWR).unwrap();

            std::thread::scope(|s| {
                s.spawn(|| {
                    for _ in 0..100 {
                        core.write(user(LS), fh, 0, body.as_bytes()).unwrap();
                    }
                });
                core.rename(user(LS), a, "f", b, "f", 0).unwrap();
            });
            core.release(fh).unwrap();

            assert!(kv.get(b"/a/f").unwrap().is_none(), "round {}", round);
            let fh = core.open(user(LS), attr.ino, libc::O_RDONLY).unwrap();
            assert_eq!(core.read(user(LS), fh, 0, 64).unwrap(), body.as_bytes());
            core.release(fh).unwrap();
            core.unlink(user(LS), b, "f").unwrap();
        }
    }

    #[test]
    fn test_rename_directory_moves_descendant_content() {
        let (core, kv) = core();
        let src = core.mkdir(user(LS), ROOT_INO, "src", 0o755).unwrap().ino;
        let inner = core.mkdir(user(LS), src, "inner", 0o755).unwrap().ino;
        write_file(&core, inner, "deep", b"deep data");

        core.rename(user(LS), ROOT_INO, "src", ROOT_INO, "dst", 0).unwrap();

        assert!(kv.get(b"/src/inner/deep").unwrap().is_none());
        assert!(kv.get(b"/dst/inner/deep").unwrap().is_some());
    }

    #[test]
    fn test_rename_rules() {
        let (core, _) = core();
        let d = core.mkdir(user(LS), ROOT_INO, "d", 0o755).unwrap().ino;
        write_file(&core, ROOT_INO, "f", b"1");
        write_file(&core, d, "inside", b"2");

        assert!(matches!(
            core.rename(user(LS), ROOT_INO, "f", ROOT_INO, "d", 0),
            Err(Error::IsADirectory(_))
        ));
        assert!(matches!(
            core.rename(user(LS), ROOT_INO, "d", ROOT_INO, "f", 0),
            Err(Error::NotADirectory(_))
        ));
        assert!(matches!(
            core.rename(user(LS), ROOT_INO, "f", ROOT_INO, "g", 1),
            Err(Error::InvalidArgument(_))
        ));

        write_file(&core, ROOT_INO, "g", b"replaced");
        core.rename(user(LS), ROOT_INO, "f", ROOT_INO, "g", 0).unwrap();
        let g = core.lookup(user(LS), ROOT_INO, "g").unwrap();
        assert_eq!(g.size, 1);
    }

    #[test]
    fn test_unlink_and_rmdir() {
        let (core, kv) = core();
        let d = core.mkdir(user(LS), ROOT_INO, "d", 0o755).unwrap().ino;
        write_file(&core, d, "f", b"data");

        assert!(matches!(
            core.rmdir(user(LS), ROOT_INO, "d"),
            Err(Error::DirectoryNotEmpty(_))
        ));
        assert!(matches!(
            core.unlink(user(LS), ROOT_INO, "d"),
            Err(Error::IsADirectory(_))
        ));

        core.unlink(user(LS), d, "f").unwrap();
        assert!(kv.get(b"/d/f").unwrap().is_none());
        assert!(matches!(
            core.rmdir(user(LS), d, "f"),
            Err(Error::PathNotFound(_))
        ));
        core.rmdir(user(LS), ROOT_INO, "d").unwrap();
        assert!(core.lookup(user(LS), ROOT_INO, "d").is_err());
    }

    #[test]
    fn test_readdir_lists_dot_entries_then_children() {
        let (core, _) = core();
        let d = core.mkdir(user(LS), ROOT_INO, "d", 0o755).unwrap().ino;
        write_file(&core, d, "b", b"");
        write_file(&core, d, "a", b"");

        let names: Vec<String> = core
            .readdir(user(LS), d)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", "..", "a", "b"]);

        let entries = core.readdir(user(LS), d).unwrap();
        assert_eq!(entries[1].ino, ROOT_INO);
        assert_eq!(entries[2].kind, FileKind::RegularFile);
    }

    #[test]
    fn test_open_directory_fails() {
        let (core, _) = core();
        let d = core.mkdir(user(LS), ROOT_INO, "d", 0o755).unwrap().ino;
        assert!(matches!(
            core.open(user(LS), d, libc::O_RDONLY),
            Err(Error::IsADirectory(_))
        ));
    }

    #[test]
    fn test_mutations_persist_snapshot() {
        let (core, kv) = core();
        core.mkdir(user(LS), ROOT_INO, "persisted", 0o755).unwrap();

        let snapshot = kv.get(SNAPSHOT_KEY).unwrap().unwrap();
        let tree = Namespace::deserialize(&snapshot).unwrap();
        assert!(tree.lookup(ROOT_INO, "persisted").is_ok());
    }

    #[test]
    fn test_fsync_and_release() {
        let (core, kv) = core();
        let (attr, fh) = core
            .create(user(LS), ROOT_INO, "s", 0o644, libc::O_RDWR)
            .unwrap();
        core.fsync(user(LS), fh).unwrap();
        assert_eq!(kv.get(b"/s").unwrap().unwrap().len(), 4 + 16);

        core.release(fh).unwrap();
        assert!(matches!(core.release(fh), Err(Error::InvalidFileHandle(_))));
        assert!(core.read(user(LS), fh, 0, 1).is_err());
        assert!(core.getattr(user(LS), attr.ino).is_ok());
    }

    #[test]
    fn test_close_releases_store() {
        let dir = TempDir::new().unwrap();
        let kv = Arc::new(
            KvStore::open(KvOptions {
                path: dir.path().join("store"),
                ..Default::default()
            })
            .unwrap(),
        );
        let keys = KeyMaterial::from_passphrase(b"pw").unwrap();
        let codec = ContentCodec::new(*keys.content_key(), ContentEncoding::Framed, IvMode::Fixed);
        let gate = AccessGate::new(
            Policy::from_config(&policy("deny")),
            &GateConfig::default(),
            FakeResolver::with(&[(LS, "/bin/ls")]),
        );
        let core = FsCore::new(
            gate,
            Namespace::new(NodeAttr::new_directory(0, 0, 0, 0o755)),
            Arc::new(SnapshotPersistence::new(kv.clone())),
            ContentStore::new(kv.clone(), codec),
            kv,
        );
        write_file(&core, ROOT_INO, "kept", b"data");
        core.close().unwrap();

        // sled holds a directory lock until every handle is gone
        let kv = KvStore::open(KvOptions {
            path: dir.path().join("store"),
            ..Default::default()
        })
        .unwrap();
        assert!(kv.get(SNAPSHOT_KEY).unwrap().is_some());
        assert!(kv.get(b"/kept").unwrap().is_some());
    }

    #[test]
    fn test_mount_reopens_existing_tree() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.mount.mount_point = dir.path().to_path_buf();
        config.storage.path = dir.path().join("store");
        config.storage.in_memory = false;
        config.policy.default_action = "pass".to_string();
        let keys = KeyMaterial::from_passphrase(b"pw").unwrap();

        let ino = {
            let core = FsCore::mount(&config, &keys, FakeResolver::with(&[(LS, "/bin/ls")])).unwrap();
            let ino = write_file(&core, ROOT_INO, "kept", b"survives");
            core.flush().unwrap();
            ino
        };

        let core = FsCore::mount(&config, &keys, FakeResolver::with(&[(LS, "/bin/ls")])).unwrap();
        assert_eq!(core.node_count(), 2);
        let attr = core.lookup(user(LS), ROOT_INO, "kept").unwrap();
        assert_eq!(attr.ino, ino);
        let fh = core.open(user(LS), ino, libc::O_RDONLY).unwrap();
        assert_eq!(core.read(user(LS), fh, 0, 64).unwrap(), b"survives");
    }
}
