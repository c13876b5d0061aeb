//! FUSE glue
//!
//! Translates `fuser` callbacks into [`FsCore`] verbs and errors into
//! errno replies.

use crate::config::MountConfig;
use crate::error::Error;
use crate::fs::core::{Caller, FsCore, SetAttr};

use fuser::{
    Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

/// The mounted filesystem
pub struct SealFs {
    core: Arc<FsCore>,
    attr_ttl: Duration,
    entry_ttl: Duration,
    unmounted: Option<Sender<()>>,
}

impl SealFs {
    pub fn new(core: Arc<FsCore>, mount: &MountConfig) -> Self {
        SealFs {
            core,
            attr_ttl: Duration::from_secs(mount.attr_ttl_secs),
            entry_ttl: Duration::from_secs(mount.entry_ttl_secs),
            unmounted: None,
        }
    }

    /// Signal `tx` once the kernel tears the session down
    pub fn notify_unmount(mut self, tx: Sender<()>) -> Self {
        self.unmounted = Some(tx);
        self
    }

    /// Mount options for this filesystem
    pub fn mount_options(mount: &MountConfig) -> Vec<fuser::MountOption> {
        let mut options = vec![
            fuser::MountOption::FSName(mount.fs_name.clone()),
            fuser::MountOption::Subtype("sealfs".to_string()),
            fuser::MountOption::NoDev,
            fuser::MountOption::NoSuid,
        ];
        if mount.allow_other {
            options.push(fuser::MountOption::AllowOther);
        }
        options
    }
}

fn caller(req: &Request<'_>) -> Caller {
    Caller {
        pid: req.pid(),
        uid: req.uid(),
        gid: req.gid(),
    }
}

fn utf8(name: &OsStr) -> Result<&str, libc::c_int> {
    name.to_str().ok_or(libc::EINVAL)
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Log a failed verb; gate denials are already logged by the gate
fn log_failure(verb: &str, e: &Error) -> libc::c_int {
    match e {
        Error::PermissionDenied => {}
        e if e.is_not_found() => debug!("{}: {}", verb, e),
        e => error!("{} error: {}", verb, e),
    }
    e.to_errno()
}

impl Filesystem for SealFs {
    fn destroy(&mut self) {
        match self.core.flush() {
            Ok(()) => info!("Filesystem unmounted, store flushed"),
            Err(e) => error!("Failed to flush store on unmount: {}", e),
        }
        if let Some(tx) = self.unmounted.take() {
            let _ = tx.send(());
        }
    }

    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match utf8(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };

        match self.core.lookup(caller(req), parent, name) {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr.to_fuser(), 0),
            Err(e) => reply.error(log_failure("lookup", &e)),
        }
    }

    fn getattr(&mut self, req: &Request, ino: u64, reply: ReplyAttr) {
        match self.core.getattr(caller(req), ino) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr.to_fuser()),
            Err(e) => reply.error(log_failure("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
            fh,
        };

        match self.core.setattr(caller(req), ino, changes) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr.to_fuser()),
            Err(e) => reply.error(log_failure("setattr", &e)),
        }
    }

    fn readdir(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.core.readdir(caller(req), ino) {
            Ok(entries) => entries,
            Err(e) => return reply.error(log_failure("readdir", &e)),
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, entry) in entries.iter().enumerate().skip(skip) {
            if reply.add(entry.ino, (i + 1) as i64, entry.kind.to_fuser(), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.core.open(caller(req), ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(log_failure("open", &e)),
        }
    }

    fn read(
        &mut self,
        req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        match self.core.read(caller(req), fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(log_failure("read", &e)),
        }
    }

    fn write(
        &mut self,
        req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.core.write(caller(req), fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(log_failure("write", &e)),
        }
    }

    fn fsync(&mut self, req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.core.fsync(caller(req), fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_failure("fsync", &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.core.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_failure("release", &e)),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match utf8(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };

        match self.core.create(caller(req), parent, name, mode & !umask, flags) {
            Ok((attr, fh)) => reply.created(&self.entry_ttl, &attr.to_fuser(), 0, fh, 0),
            Err(e) => reply.error(log_failure("create", &e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match utf8(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };

        match self.core.mkdir(caller(req), parent, name, mode & !umask) {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr.to_fuser(), 0),
            Err(e) => reply.error(log_failure("mkdir", &e)),
        }
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };

        match self.core.unlink(caller(req), parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_failure("unlink", &e)),
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };

        match self.core.rmdir(caller(req), parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_failure("rmdir", &e)),
        }
    }

    fn rename(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (utf8(name), utf8(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(libc::EINVAL),
        };

        match self.core.rename(caller(req), parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(log_failure("rename", &e)),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: fuser::ReplyStatfs) {
        let files = self.core.node_count() as u64;
        reply.statfs(
            1_000_000,           // blocks
            500_000,             // bfree
            500_000,             // bavail
            files + 1_000_000,   // files
            1_000_000,           // ffree
            4096,                // bsize
            255,                 // namelen
            4096,                // frsize
        );
    }
}
