//! Filesystem adapter: maps path and handle operations onto FTP command
//! sequences over pooled connections, translating server replies into the
//! crate's error taxonomy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;

use crate::common::{self, ClientConfig, Error, Result};
use crate::fs::handle::{FileHandle, OpenMode};
use crate::ftp::conn::{Connector, DirEntry, EntryKind, FtpConnector, RemoteConn};
use crate::pool::{ConnPool, Outcome};

/// Attributes reported for one remote file or directory.
#[derive(Debug, Clone)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

/// The FTP-backed filesystem client. Safe to share across threads; every
/// kernel callback maps to one method here.
pub struct FtpFs {
    pool: Arc<ConnPool>,
    handles: Mutex<HashMap<u64, Arc<FileHandle>>>,
    next_fh: AtomicU64,
    cfg: ClientConfig,
    addr_change: Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for FtpFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpFs").finish_non_exhaustive()
    }
}

impl FtpFs {
    /// Connect to `addr` and return an adapter rooted at `remote_root`.
    /// Fails when the server cannot be reached or refuses the login.
    pub fn new(addr: SocketAddr, remote_root: &str, cfg: ClientConfig) -> Result<Arc<Self>> {
        let root = common::normalize_path(remote_root)?;
        let connector = FtpConnector::new(root, cfg.user.clone(), cfg.password.clone());
        Self::with_connector(addr, Box::new(connector), cfg)
    }

    /// Adapter over any connector implementation.
    pub(crate) fn with_connector(
        addr: SocketAddr,
        connector: Box<dyn Connector>,
        cfg: ClientConfig,
    ) -> Result<Arc<Self>> {
        let pool = ConnPool::new(connector, addr, cfg.pool_cap, cfg.idle_ttl(), cfg.op_timeout());
        // Probe so an unreachable or misconfigured server fails construction.
        match pool.lease(cfg.op_timeout()) {
            Ok(lease) => pool.release(lease, Outcome::Ok),
            Err(e) => {
                pool.close();
                return Err(e);
            }
        }
        tracing::info!("connected to {}", addr);
        Ok(Arc::new(Self {
            pool,
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            cfg,
            addr_change: Mutex::new(()),
            closed: AtomicBool::new(false),
        }))
    }

    /// Redirect all traffic to a new server address without unmounting.
    /// Concurrent calls are serialized; the last one wins.
    pub fn set_address(&self, addr: SocketAddr) -> Result<()> {
        let _guard = self.addr_change.lock().unwrap();
        tracing::info!("redirecting to {}", addr);
        self.pool.invalidate_all(Some(addr));
        // Probe the new server so a bad address surfaces here rather than
        // at the next kernel callback.
        let lease = self.pool.lease(self.cfg.op_timeout())?;
        self.pool.release(lease, Outcome::Ok);
        Ok(())
    }

    /// Drop all handles, invalidate the pool and stop its reaper.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<Arc<FileHandle>> = {
            let mut table = self.handles.lock().unwrap();
            table.drain().map(|(_, h)| h).collect()
        };
        for h in handles {
            let _ = h.release();
        }
        self.pool.close();
        tracing::info!("ftp client closed");
    }

    /// Connections currently pooled or leased. Exposed for tests.
    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Open handles. Exposed for tests.
    pub fn open_handles(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Lease, run one FTP exchange, release; marks the connection broken on
    /// transport faults and retries once before any byte was delivered.
    fn with_conn<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut dyn RemoteConn) -> Result<T>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let mut last = None;
        for attempt in 0..2 {
            let mut lease = self.pool.lease(self.cfg.op_timeout())?;
            match f(lease.conn()) {
                Ok(v) => {
                    self.pool.release(lease, Outcome::Ok);
                    return Ok(v);
                }
                Err(e) => {
                    let broken = e.is_transport();
                    self.pool
                        .release(lease, if broken { Outcome::Broken } else { Outcome::Ok });
                    if broken && attempt == 0 {
                        tracing::debug!("retrying after transport fault: {}", e);
                        last = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(last.expect("retry loop exited without error"))
    }

    /// Find the directory entry for `path` by listing its parent.
    fn lookup_entry(&self, path: &str) -> Result<DirEntry> {
        let parent = common::parent_path(path)
            .ok_or_else(|| Error::InvalidPath("remote root has no parent".to_string()))?
            .to_string();
        let name = common::file_name(path).to_string();
        self.with_conn(|conn| {
            let entries = conn.list(&parent)?;
            entries
                .into_iter()
                .find(|e| e.name == name)
                .ok_or_else(|| Error::NotFound(common::display_path(path)))
        })
    }

    pub fn getattr(&self, path: &str) -> Result<Attr> {
        let path = common::normalize_path(path)?;
        if path.is_empty() {
            return Ok(Attr {
                kind: EntryKind::Dir,
                size: 0,
                mtime: None,
            });
        }
        let entry = self.lookup_entry(&path)?;
        Ok(Attr {
            kind: entry.kind,
            size: entry.size,
            mtime: entry.mtime,
        })
    }

    pub fn lookup(&self, parent: &str, name: &str) -> Result<Attr> {
        let parent = common::normalize_path(parent)?;
        let path = common::join_path(&parent, name)?;
        self.getattr(&path)
    }

    /// The whole listing is returned; the kernel paginates.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = common::normalize_path(path)?;
        let entries = self.with_conn(|conn| conn.list(&path))?;
        if path.is_empty() {
            return Ok(entries);
        }
        // Listing a file yields the file itself as its only entry. A
        // directory holding one file of the same name looks identical, so
        // the parent listing gets the final say.
        let name = common::file_name(&path);
        if entries.len() == 1 && entries[0].name == name && entries[0].kind == EntryKind::File {
            let entry = self.lookup_entry(&path)?;
            if entry.kind == EntryKind::File {
                return Err(Error::NotDirectory(common::display_path(&path)));
            }
        }
        if entries.is_empty() {
            // Tell an empty directory apart from a missing path.
            let entry = self.lookup_entry(&path)?;
            if entry.kind == EntryKind::File {
                return Err(Error::NotDirectory(common::display_path(&path)));
            }
        }
        Ok(entries)
    }

    /// Lease a connection and allocate an idle handle; no stream is opened
    /// until the first read or write arrives.
    pub fn open(&self, path: &str, mode: OpenMode) -> Result<u64> {
        let path = common::normalize_path(path)?;
        let attr = self.getattr(&path)?;
        if attr.kind == EntryKind::Dir {
            return Err(Error::IsDirectory(common::display_path(&path)));
        }
        let lease = self.pool.lease(self.cfg.op_timeout())?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(FileHandle::open(
            fh,
            path.clone(),
            mode,
            self.pool.clone(),
            lease,
            attr.size,
            self.cfg.seek_threshold_bytes,
            self.cfg.op_timeout(),
        ));
        self.handles.lock().unwrap().insert(fh, handle);
        tracing::debug!(
            "fh {}: opened {} ({:?}, {} bytes)",
            fh,
            common::display_path(&path),
            mode,
            attr.size
        );
        Ok(fh)
    }

    /// Create (or overwrite) a file; the handle starts with an open `STOR`.
    pub fn create(&self, path: &str) -> Result<u64> {
        let path = common::normalize_path(path)?;
        if path.is_empty() {
            return Err(Error::IsDirectory("/".to_string()));
        }
        let parent = common::parent_path(&path).unwrap_or("").to_string();
        if !parent.is_empty() {
            let pattr = self.getattr(&parent)?;
            if pattr.kind != EntryKind::Dir {
                return Err(Error::NotDirectory(common::display_path(&parent)));
            }
        }
        match self.getattr(&path) {
            Ok(attr) if attr.kind == EntryKind::Dir => {
                return Err(Error::IsDirectory(common::display_path(&path)))
            }
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let mut last = None;
        for attempt in 0..2 {
            let lease = self.pool.lease(self.cfg.op_timeout())?;
            let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
            match FileHandle::create(
                fh,
                path.clone(),
                self.pool.clone(),
                lease,
                self.cfg.seek_threshold_bytes,
                self.cfg.op_timeout(),
            ) {
                Ok(handle) => {
                    self.handles.lock().unwrap().insert(fh, Arc::new(handle));
                    return Ok(fh);
                }
                Err(e) if e.is_transport() && attempt == 0 => {
                    tracing::debug!("create {}: retrying after {}", common::display_path(&path), e);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.expect("retry loop exited without error"))
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let path = common::normalize_path(path)?;
        if path.is_empty() {
            return Err(Error::AlreadyExists("/".to_string()));
        }
        match self.with_conn(|conn| conn.make_dir(&path)) {
            Ok(()) => Ok(()),
            Err(e) if !e.is_transport() => {
                // MKD failure replies rarely say why; a lookup tells an
                // existing file or directory apart from other causes.
                match self.lookup_entry(&path) {
                    Ok(_) => Err(Error::AlreadyExists(common::display_path(&path))),
                    Err(_) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let path = common::normalize_path(path)?;
        self.with_conn(|conn| conn.delete(&path))
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let path = common::normalize_path(path)?;
        self.with_conn(|conn| conn.remove_dir(&path))
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = common::normalize_path(from)?;
        let to = common::normalize_path(to)?;
        self.with_conn(|conn| conn.rename(&from, &to))
    }

    /// Route through an open handle for the path when one exists; otherwise
    /// run the truncation sequence on a transient handle.
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let path = common::normalize_path(path)?;
        let existing = {
            let table = self.handles.lock().unwrap();
            table.values().find(|h| h.path() == path).cloned()
        };
        if let Some(handle) = existing {
            return handle.truncate(size);
        }
        let attr = self.getattr(&path)?;
        if attr.kind == EntryKind::Dir {
            return Err(Error::IsDirectory(common::display_path(&path)));
        }
        if attr.size == size {
            return Ok(());
        }
        let lease = self.pool.lease(self.cfg.op_timeout())?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let handle = FileHandle::open(
            fh,
            path,
            OpenMode::Write,
            self.pool.clone(),
            lease,
            attr.size,
            self.cfg.seek_threshold_bytes,
            self.cfg.op_timeout(),
        );
        let res = handle.truncate(size);
        let released = handle.release();
        res.and(released)
    }

    pub fn read(&self, fh: u64, off: u64, len: u32) -> Result<Bytes> {
        self.handle(fh)?.read(off, len)
    }

    pub fn write(&self, fh: u64, off: u64, data: &[u8]) -> Result<usize> {
        self.handle(fh)?.write(off, data)
    }

    pub fn flush(&self, fh: u64) -> Result<()> {
        self.handle(fh)?.flush()
    }

    /// Drop the handle; its connection is finalized and returned (or quit).
    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handles.lock().unwrap().remove(&fh);
        match handle {
            Some(h) => h.release(),
            None => Ok(()),
        }
    }

    fn handle(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.handles
            .lock()
            .unwrap()
            .get(&fh)
            .cloned()
            .ok_or_else(|| Error::Io(format!("unknown file handle {}", fh)))
    }
}
