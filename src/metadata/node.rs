//! Namespace node and its POSIX-like attributes

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;

/// File type, derived from the mode's type bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
}

impl FileKind {
    /// Convert to fuser file type
    pub fn to_fuser(self) -> fuser::FileType {
        match self {
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
        }
    }
}

/// Node attributes (POSIX-like)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttr {
    #[serde(default)]
    pub ino: u64,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Permission bits plus `S_IFDIR`/`S_IFREG`
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl NodeAttr {
    /// Empty attributes stamped with the current time
    pub fn empty(ino: u64) -> Self {
        let now = SystemTime::now();
        NodeAttr {
            ino,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            mode: 0,
            uid: 0,
            gid: 0,
        }
    }

    /// Attributes for a new regular file
    pub fn new_file(ino: u64, uid: u32, gid: u32, perm: u32) -> Self {
        NodeAttr {
            mode: S_IFREG | (perm & 0o7777),
            uid,
            gid,
            ..NodeAttr::empty(ino)
        }
    }

    /// Attributes for a new directory
    pub fn new_directory(ino: u64, uid: u32, gid: u32, perm: u32) -> Self {
        NodeAttr {
            mode: S_IFDIR | (perm & 0o7777),
            uid,
            gid,
            ..NodeAttr::empty(ino)
        }
    }

    pub fn kind(&self) -> FileKind {
        if self.mode & S_IFMT == S_IFDIR {
            FileKind::Directory
        } else {
            FileKind::RegularFile
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// Permission bits only
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    /// Replace permission bits, keeping the file type
    pub fn set_perm(&mut self, mode: u32) {
        self.mode = (self.mode & S_IFMT) | (mode & !S_IFMT);
    }

    /// Update modification and change time
    pub fn touch(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }

    /// Convert to fuser FileAttr
    pub fn to_fuser(&self) -> fuser::FileAttr {
        let kind = self.kind();
        fuser::FileAttr {
            ino: self.ino,
            size: self.size,
            blocks: (self.size + 511) / 512,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.ctime,
            kind: kind.to_fuser(),
            perm: self.perm(),
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

/// One entry in the namespace arena
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub attr: NodeAttr,
    /// Parent inode, `None` for the root
    pub(crate) parent: Option<u64>,
    /// Child name -> inode
    pub(crate) children: BTreeMap<String, u64>,
}

impl Node {
    pub(crate) fn new(name: String, attr: NodeAttr, parent: Option<u64>) -> Self {
        Node {
            name,
            attr,
            parent,
            children: BTreeMap::new(),
        }
    }

    pub fn ino(&self) -> u64 {
        self.attr.ino
    }

    pub fn parent(&self) -> Option<u64> {
        self.parent
    }

    pub fn is_dir(&self) -> bool {
        self.attr.is_dir()
    }

    /// Children as (name, inode) in name order
    pub fn children(&self) -> impl Iterator<Item = (&str, u64)> {
        self.children.iter().map(|(name, ino)| (name.as_str(), *ino))
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }
}
