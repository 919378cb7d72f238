//! FUSE callback shim.
//!
//! Bridges `fuser`'s inode-based callback surface onto the path-based
//! [`FtpFs`] adapter: inode↔path bookkeeping, attribute conversion and
//! errno replies live here, nothing else.

use crate::common::join_path;
use crate::fs::adapter::{Attr, FtpFs};
use crate::fs::handle::OpenMode;
use crate::ftp::conn::EntryKind;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};
use std::time::{Duration, SystemTime};

const TTL: Duration = Duration::from_secs(1);

const ROOT_INO: u64 = 1;

pub struct FtpFuse {
    fs: Arc<FtpFs>,
    inode_map: RwLock<HashMap<String, u64>>,
    reverse_map: RwLock<HashMap<u64, String>>,
    next_ino: AtomicU64,
}

impl FtpFuse {
    pub fn new(fs: Arc<FtpFs>) -> Self {
        let mut inode_map = HashMap::new();
        let mut reverse_map = HashMap::new();
        inode_map.insert(String::new(), ROOT_INO);
        reverse_map.insert(ROOT_INO, String::new());
        Self {
            fs,
            inode_map: RwLock::new(inode_map),
            reverse_map: RwLock::new(reverse_map),
            next_ino: AtomicU64::new(2),
        }
    }

    fn ensure_inode(&self, path: &str) -> u64 {
        if let Some(ino) = self.inode_map.read().unwrap().get(path) {
            return *ino;
        }
        let mut map = self.inode_map.write().unwrap();
        if let Some(ino) = map.get(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        map.insert(path.to_string(), ino);
        self.reverse_map
            .write()
            .unwrap()
            .insert(ino, path.to_string());
        ino
    }

    fn path_for_ino(&self, ino: u64) -> Option<String> {
        self.reverse_map.read().unwrap().get(&ino).cloned()
    }

    /// Point every inode under `old` at its path under `new`.
    fn remap_paths(&self, old: &str, new: &str) {
        let mut inode_map = self.inode_map.write().unwrap();
        let mut reverse_map = self.reverse_map.write().unwrap();
        let prefix = format!("{}/", old);
        let affected: Vec<(String, u64)> = inode_map
            .iter()
            .filter(|(p, _)| p.as_str() == old || p.starts_with(&prefix))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (path, ino) in affected {
            inode_map.remove(&path);
            let moved = if path == old {
                new.to_string()
            } else {
                format!("{}/{}", new, &path[prefix.len()..])
            };
            reverse_map.insert(ino, moved.clone());
            inode_map.insert(moved, ino);
        }
    }

    fn file_attr(&self, ino: u64, attr: &Attr, req: &Request<'_>) -> FileAttr {
        let is_dir = attr.kind == EntryKind::Dir;
        let kind = if is_dir {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let mtime = attr.mtime.unwrap_or_else(SystemTime::now);
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: if is_dir { 0o755 } else { 0o644 },
            nlink: if is_dir { 2 } else { 1 },
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent_path = self.path_for_ino(parent)?;
        join_path(&parent_path, &name.to_string_lossy()).ok()
    }
}

fn open_mode(flags: i32) -> OpenMode {
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => OpenMode::Write,
        libc::O_RDWR => OpenMode::ReadWrite,
        _ => OpenMode::Read,
    }
}

impl Filesystem for FtpFuse {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.ensure_inode(&path);
                reply.entry(&TTL, &self.file_attr(ino, &attr, req), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(ino, &attr, req)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        if let Some(new_size) = size {
            if let Err(e) = self.fs.truncate(&path, new_size) {
                reply.error(e.errno());
                return;
            }
        }
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(ino, &attr, req)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        let entries = match self.fs.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut all = Vec::with_capacity(entries.len() + 2);
        all.push((ino, FileType::Directory, ".".to_string()));
        all.push((ino, FileType::Directory, "..".to_string()));
        for entry in entries {
            let Ok(child) = join_path(&path, &entry.name) else {
                continue;
            };
            let child_ino = self.ensure_inode(&child);
            let kind = if entry.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            all.push((child_ino, kind, entry.name));
        }

        let start = if offset < 0 { 0 } else { offset as usize };
        for (i, (child_ino, kind, name)) in all.into_iter().enumerate().skip(start) {
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        if let Err(e) = self.fs.mkdir(&path) {
            reply.error(e.errno());
            return;
        }
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.ensure_inode(&path);
                reply.entry(&TTL, &self.file_attr(ino, &attr, req), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        let fh = match self.fs.create(&path) {
            Ok(fh) => fh,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let ino = self.ensure_inode(&path);
        let attr = Attr {
            kind: EntryKind::File,
            size: 0,
            mtime: None,
        };
        reply.created(&TTL, &self.file_attr(ino, &attr, req), 0, fh, 0);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.open(&path, open_mode(flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.fs.read(fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.fs.write(fh, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.rmdir(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                self.remap_paths(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}
