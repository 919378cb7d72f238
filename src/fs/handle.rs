//! Per-open-file transfer state machine.
//!
//! FTP offers sequential transfer streams; the kernel issues random-offset
//! reads and writes. A handle owns one leased connection and keeps at most
//! one data stream on it, consuming sequential traffic in place, discarding
//! small forward gaps, and reissuing `REST` + `RETR`/`STOR` for everything
//! else. The extra control-channel round-trips on direction changes are the
//! price for having no local file cache.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::common::{display_path, Error, Result};
use crate::pool::{ConnPool, Lease, Outcome};

const GAP_CHUNK: usize = 8 * 1024;
const ZERO_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    Reading { off: u64 },
    Writing { off: u64 },
    Closed,
}

struct HandleState {
    lease: Option<Lease>,
    stream: StreamState,
    /// Size as known at open, advanced by writes and corrected by stream EOF.
    size: u64,
    dirty: bool,
}

pub struct FileHandle {
    id: u64,
    path: String,
    mode: OpenMode,
    pool: Arc<ConnPool>,
    seek_threshold: u64,
    op_timeout: Duration,
    state: Mutex<HandleState>,
}

impl FileHandle {
    /// Handle for an existing file; no stream is opened yet.
    pub(crate) fn open(
        id: u64,
        path: String,
        mode: OpenMode,
        pool: Arc<ConnPool>,
        lease: Lease,
        size: u64,
        seek_threshold: u64,
        op_timeout: Duration,
    ) -> Self {
        Self {
            id,
            path,
            mode,
            pool,
            seek_threshold,
            op_timeout,
            state: Mutex::new(HandleState {
                lease: Some(lease),
                stream: StreamState::Idle,
                size,
                dirty: false,
            }),
        }
    }

    /// Handle for a newly created file, born with an open `STOR` at offset 0.
    pub(crate) fn create(
        id: u64,
        path: String,
        pool: Arc<ConnPool>,
        mut lease: Lease,
        seek_threshold: u64,
        op_timeout: Duration,
    ) -> Result<Self> {
        if let Err(e) = lease.conn().open_write(&path, 0) {
            let outcome = if e.is_transport() {
                Outcome::Broken
            } else {
                Outcome::Ok
            };
            pool.release(lease, outcome);
            return Err(e);
        }
        tracing::debug!("fh {}: STOR {} at 0 (create)", id, display_path(&path));
        Ok(Self {
            id,
            path,
            mode: OpenMode::ReadWrite,
            pool,
            seek_threshold,
            op_timeout,
            state: Mutex::new(HandleState {
                lease: Some(lease),
                stream: StreamState::Writing { off: 0 },
                size: 0,
                dirty: true,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn read(&self, off: u64, len: u32) -> Result<Bytes> {
        let mut st = self.state.lock().unwrap();
        self.check_open(&st)?;
        match self.read_inner(&mut st, off, len) {
            Err(e) if e.is_transport() => {
                // Nothing reached the kernel yet; one fresh connection attempt.
                tracing::debug!("fh {}: read at {} failed ({}), retrying", self.id, off, e);
                self.drop_broken(&mut st);
                self.read_inner(&mut st, off, len)
            }
            other => other,
        }
    }

    pub fn write(&self, off: u64, data: &[u8]) -> Result<usize> {
        if self.mode == OpenMode::Read {
            return Err(Error::PermissionDenied(display_path(&self.path)));
        }
        let mut st = self.state.lock().unwrap();
        self.check_open(&st)?;
        match self.write_inner(&mut st, off, data) {
            Err(e) if e.is_transport() => {
                // Rewriting the same bytes at the same offset is idempotent.
                tracing::debug!("fh {}: write at {} failed ({}), retrying", self.id, off, e);
                self.drop_broken(&mut st);
                self.write_inner(&mut st, off, data)
            }
            other => other,
        }
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_open(&st)?;
        match self.truncate_inner(&mut st, size) {
            Err(e) if e.is_transport() => {
                tracing::debug!("fh {}: truncate to {} failed ({}), retrying", self.id, size, e);
                self.drop_broken(&mut st);
                self.truncate_inner(&mut st, size)
            }
            other => other,
        }
    }

    /// Finalize any open stream; the handle stays usable.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.lease.is_none() || st.stream == StreamState::Closed {
            return Ok(());
        }
        if !self.lease_is_current(&st) {
            // The address changed; whatever stream existed died with it.
            self.drop_broken(&mut st);
            return Ok(());
        }
        match self.settle_stream(&mut st) {
            Ok(()) => {
                st.dirty = false;
                Ok(())
            }
            Err(e) => {
                self.drop_broken(&mut st);
                Err(e)
            }
        }
    }

    /// Finalize and give the connection back. Always closes the handle.
    pub fn release(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.stream == StreamState::Closed {
            return Ok(());
        }
        let current = self.lease_is_current(&st);
        let res = if current {
            self.settle_stream(&mut st)
        } else {
            Ok(())
        };
        if let Some(lease) = st.lease.take() {
            let outcome = if res.is_ok() && current {
                Outcome::Ok
            } else {
                Outcome::Broken
            };
            self.pool.release(lease, outcome);
        }
        tracing::debug!(
            "fh {}: released {} (dirty: {})",
            self.id,
            display_path(&self.path),
            st.dirty
        );
        st.stream = StreamState::Closed;
        res
    }

    fn check_open(&self, st: &HandleState) -> Result<()> {
        if st.stream == StreamState::Closed {
            Err(Error::Io(format!("fh {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    fn lease_is_current(&self, st: &HandleState) -> bool {
        st.lease
            .as_ref()
            .map(|l| l.epoch() == self.pool.epoch())
            .unwrap_or(false)
    }

    /// Make sure the handle holds a lease against the current address.
    fn ensure_conn(&self, st: &mut HandleState) -> Result<()> {
        match &st.lease {
            Some(lease) if lease.epoch() == self.pool.epoch() => return Ok(()),
            Some(lease) => {
                tracing::debug!(
                    "fh {}: lease epoch {} is stale, re-leasing",
                    self.id,
                    lease.epoch()
                );
            }
            None => {}
        }
        if let Some(mut lease) = st.lease.take() {
            let _ = lease.conn().abort();
            self.pool.release(lease, Outcome::Broken);
        }
        st.stream = StreamState::Idle;
        st.lease = Some(self.pool.lease(self.op_timeout)?);
        Ok(())
    }

    /// Close any open stream so the control channel accepts a new command.
    fn settle_stream(&self, st: &mut HandleState) -> Result<()> {
        let res = match st.stream {
            StreamState::Reading { .. } => st.lease.as_mut().unwrap().conn().abort(),
            StreamState::Writing { .. } => st.lease.as_mut().unwrap().conn().finalize(),
            _ => Ok(()),
        };
        st.stream = StreamState::Idle;
        res
    }

    fn drop_broken(&self, st: &mut HandleState) {
        if let Some(mut lease) = st.lease.take() {
            let _ = lease.conn().abort();
            self.pool.release(lease, Outcome::Broken);
        }
        st.stream = StreamState::Idle;
    }

    fn read_inner(&self, st: &mut HandleState, off: u64, len: u32) -> Result<Bytes> {
        self.ensure_conn(st)?;
        if off >= st.size {
            return Ok(Bytes::new());
        }
        match st.stream {
            StreamState::Reading { off: cur } if cur == off => {}
            StreamState::Reading { off: cur }
                if off > cur && off - cur <= self.seek_threshold =>
            {
                self.discard_gap(st, off - cur)?;
            }
            _ => {
                self.settle_stream(st)?;
                st.lease.as_mut().unwrap().conn().open_read(&self.path, off)?;
                tracing::debug!("fh {}: RETR {} at {}", self.id, display_path(&self.path), off);
                st.stream = StreamState::Reading { off };
            }
        }
        let StreamState::Reading { off: mut cur } = st.stream else {
            // The gap ran into end of stream.
            return Ok(Bytes::new());
        };

        let want = len as usize;
        let mut buf = BytesMut::zeroed(want);
        let mut filled = 0usize;
        while filled < want {
            let n = st.lease.as_mut().unwrap().conn().read_chunk(&mut buf[filled..])?;
            if n == 0 {
                // Transfer complete; the position is the authoritative size.
                let res = st.lease.as_mut().unwrap().conn().finalize();
                st.stream = StreamState::Idle;
                res?;
                st.size = cur;
                break;
            }
            filled += n;
            cur += n as u64;
            if let StreamState::Reading { off } = &mut st.stream {
                *off = cur;
            }
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }

    /// Consume and discard `gap` bytes from the open read stream.
    fn discard_gap(&self, st: &mut HandleState, mut gap: u64) -> Result<()> {
        let mut sink = [0u8; GAP_CHUNK];
        while gap > 0 {
            let want = sink.len().min(gap as usize);
            let n = st.lease.as_mut().unwrap().conn().read_chunk(&mut sink[..want])?;
            if n == 0 {
                let eof = match st.stream {
                    StreamState::Reading { off } => off,
                    _ => 0,
                };
                let res = st.lease.as_mut().unwrap().conn().finalize();
                st.stream = StreamState::Idle;
                res?;
                st.size = eof;
                return Ok(());
            }
            gap -= n as u64;
            if let StreamState::Reading { off } = &mut st.stream {
                *off += n as u64;
            }
        }
        Ok(())
    }

    fn write_inner(&self, st: &mut HandleState, off: u64, data: &[u8]) -> Result<usize> {
        self.ensure_conn(st)?;
        match st.stream {
            StreamState::Writing { off: cur } if cur == off => {}
            _ => {
                self.settle_stream(st)?;
                st.lease.as_mut().unwrap().conn().open_write(&self.path, off)?;
                tracing::debug!("fh {}: STOR {} at {}", self.id, display_path(&self.path), off);
                st.stream = StreamState::Writing { off };
            }
        }
        st.lease.as_mut().unwrap().conn().write_chunk(data)?;
        let end = off + data.len() as u64;
        st.stream = StreamState::Writing { off: end };
        st.dirty = true;
        if end > st.size {
            st.size = end;
        }
        Ok(data.len())
    }

    fn truncate_inner(&self, st: &mut HandleState, size: u64) -> Result<()> {
        self.ensure_conn(st)?;
        self.settle_stream(st)?;
        // STOR at the target offset, closed with no body, ends the file
        // there on servers that truncate at close.
        st.lease.as_mut().unwrap().conn().open_write(&self.path, size)?;
        st.lease.as_mut().unwrap().conn().finalize()?;
        if size > 0 {
            let actual = st.lease.as_mut().unwrap().conn().size(&self.path)?;
            if actual > size {
                // Seek-only server kept the tail; materialize the prefix.
                tracing::debug!(
                    "fh {}: {} still has {} bytes after truncate to {}, rewriting",
                    self.id,
                    display_path(&self.path),
                    actual,
                    size
                );
                self.rewrite_prefix(st, size)?;
            } else if actual < size {
                self.zero_extend(st, actual, size)?;
            }
        }
        st.size = size;
        st.dirty = true;
        Ok(())
    }

    /// Read `[0, size)` and write it back as the whole file.
    fn rewrite_prefix(&self, st: &mut HandleState, size: u64) -> Result<()> {
        st.lease.as_mut().unwrap().conn().open_read(&self.path, 0)?;
        let mut prefix = BytesMut::zeroed(size as usize);
        let mut filled = 0usize;
        while filled < size as usize {
            let n = st.lease.as_mut().unwrap().conn().read_chunk(&mut prefix[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        st.lease.as_mut().unwrap().conn().abort()?;
        prefix.truncate(filled);
        st.lease.as_mut().unwrap().conn().open_write(&self.path, 0)?;
        st.lease.as_mut().unwrap().conn().write_chunk(&prefix)?;
        st.lease.as_mut().unwrap().conn().finalize()?;
        Ok(())
    }

    fn zero_extend(&self, st: &mut HandleState, from: u64, to: u64) -> Result<()> {
        st.lease.as_mut().unwrap().conn().open_write(&self.path, from)?;
        let zeros = [0u8; ZERO_CHUNK];
        let mut remaining = to - from;
        while remaining > 0 {
            let n = zeros.len().min(remaining as usize);
            st.lease.as_mut().unwrap().conn().write_chunk(&zeros[..n])?;
            remaining -= n as u64;
        }
        st.lease.as_mut().unwrap().conn().finalize()
    }
}
