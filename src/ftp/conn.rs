//! FTP client seam.
//!
//! A [`RemoteConn`] is one authenticated control session with at most one
//! attached data transfer. The production implementation wraps the blocking
//! `suppaftp` client; tests substitute an in-memory fake. All paths are
//! server-relative and normalized (see `common::path`).

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};

use crate::common::{display_path, Error, Result};

/// Kind of a directory entry. Symbolic links are reported as files with the
/// listed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// One authenticated FTP control session plus at most one attached data
/// transfer. A connection with an attached transfer must not accept other
/// commands until the transfer is finalized or aborted.
pub trait RemoteConn: Send {
    fn list(&mut self, path: &str) -> Result<Vec<DirEntry>>;
    fn size(&mut self, path: &str) -> Result<u64>;
    fn make_dir(&mut self, path: &str) -> Result<()>;
    fn remove_dir(&mut self, path: &str) -> Result<()>;
    fn delete(&mut self, path: &str) -> Result<()>;
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    /// Attach a RETR transfer positioned at `offset`.
    fn open_read(&mut self, path: &str, offset: u64) -> Result<()>;
    /// Attach a STOR transfer positioned at `offset`.
    fn open_write(&mut self, path: &str, offset: u64) -> Result<()>;
    /// Read from the attached RETR transfer; 0 means end of stream.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Write to the attached STOR transfer.
    fn write_chunk(&mut self, data: &[u8]) -> Result<()>;
    /// Close the attached transfer and await the final server reply.
    fn finalize(&mut self) -> Result<()>;
    /// Abandon the attached transfer without draining remaining data.
    fn abort(&mut self) -> Result<()>;
    fn has_stream(&self) -> bool;

    /// Control-channel deadline applied to subsequent requests.
    fn set_deadline(&mut self, timeout: Option<Duration>) -> Result<()>;
    /// QUIT and drop the control session.
    fn quit(&mut self) -> Result<()>;
}

/// Factory producing authenticated connections against a given address.
pub trait Connector: Send + Sync {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<Box<dyn RemoteConn>>;
}

enum Transfer {
    Retr(Box<dyn Read + Send>),
    Stor(Box<dyn Write + Send>),
}

/// [`RemoteConn`] over a blocking `suppaftp` session.
pub struct FtpConn {
    ctrl: FtpStream,
    transfer: Option<Transfer>,
}

/// Connects, logs in, switches to binary mode and enters the remote root.
pub struct FtpConnector {
    root: String,
    user: String,
    password: String,
}

impl FtpConnector {
    pub fn new(root: String, user: String, password: String) -> Self {
        Self {
            root,
            user,
            password,
        }
    }
}

impl Connector for FtpConnector {
    fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<Box<dyn RemoteConn>> {
        // Refused, unreachable and rejected logins all surface as Unavailable.
        let mut ctrl = FtpStream::connect_timeout(addr, timeout)
            .map_err(|e| Error::Unavailable(format!("connect {}: {}", addr, e)))?;
        ctrl.get_ref()
            .set_read_timeout(Some(timeout))
            .and_then(|()| ctrl.get_ref().set_write_timeout(Some(timeout)))
            .map_err(|e| Error::Unavailable(format!("socket deadline: {}", e)))?;
        ctrl.login(&self.user, &self.password)
            .map_err(|e| Error::Unavailable(format!("login {}: {}", addr, e)))?;
        ctrl.transfer_type(FileType::Binary)
            .map_err(|e| Error::Unavailable(format!("TYPE I: {}", e)))?;
        if !self.root.is_empty() {
            ctrl.cwd(&self.root)
                .map_err(|e| Error::Unavailable(format!("CWD {}: {}", self.root, e)))?;
        }
        Ok(Box::new(FtpConn {
            ctrl,
            transfer: None,
        }))
    }
}

impl RemoteConn for FtpConn {
    fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let target = if path.is_empty() { None } else { Some(path) };
        let lines = self.ctrl.list(target).map_err(|e| map_ftp_err(e, path))?;
        let mut entries = Vec::with_capacity(lines.len());
        for line in &lines {
            // Unparseable lines (totals, banners) are skipped.
            let Ok(f) = ListEntry::try_from(line.as_str()) else {
                continue;
            };
            let name = f.name().to_string();
            if name == "." || name == ".." {
                continue;
            }
            entries.push(DirEntry {
                kind: if f.is_directory() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
                size: f.size() as u64,
                mtime: Some(f.modified()),
                name,
            });
        }
        Ok(entries)
    }

    fn size(&mut self, path: &str) -> Result<u64> {
        self.ctrl
            .size(path)
            .map(|s| s as u64)
            .map_err(|e| map_ftp_err(e, path))
    }

    fn make_dir(&mut self, path: &str) -> Result<()> {
        self.ctrl.mkdir(path).map_err(|e| map_ftp_err(e, path))
    }

    fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.ctrl.rmdir(path).map_err(|e| map_ftp_err(e, path))
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        self.ctrl.rm(path).map_err(|e| map_ftp_err(e, path))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.ctrl
            .rename(from, to)
            .map_err(|e| map_ftp_err(e, from))
    }

    fn open_read(&mut self, path: &str, offset: u64) -> Result<()> {
        if self.transfer.is_some() {
            return Err(Error::Io(format!(
                "transfer already attached on {}",
                display_path(path)
            )));
        }
        if offset > 0 {
            self.ctrl
                .resume_transfer(offset as usize)
                .map_err(|e| map_ftp_err(e, path))?;
        }
        let data = self
            .ctrl
            .retr_as_stream(path)
            .map_err(|e| map_ftp_err(e, path))?;
        self.transfer = Some(Transfer::Retr(Box::new(data)));
        Ok(())
    }

    fn open_write(&mut self, path: &str, offset: u64) -> Result<()> {
        if self.transfer.is_some() {
            return Err(Error::Io(format!(
                "transfer already attached on {}",
                display_path(path)
            )));
        }
        if offset > 0 {
            self.ctrl
                .resume_transfer(offset as usize)
                .map_err(|e| map_ftp_err(e, path))?;
        }
        let data = self
            .ctrl
            .put_with_stream(path)
            .map_err(|e| map_ftp_err(e, path))?;
        self.transfer = Some(Transfer::Stor(Box::new(data)));
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.transfer.as_mut() {
            Some(Transfer::Retr(r)) => r.read(buf).map_err(Error::from),
            _ => Err(Error::Io("no read transfer attached".to_string())),
        }
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        match self.transfer.as_mut() {
            Some(Transfer::Stor(w)) => w.write_all(data).map_err(Error::from),
            _ => Err(Error::Io("no write transfer attached".to_string())),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        match self.transfer.take() {
            Some(Transfer::Retr(r)) => self
                .ctrl
                .finalize_retr_stream(r)
                .map_err(|e| map_ftp_err(e, "")),
            Some(Transfer::Stor(w)) => self
                .ctrl
                .finalize_put_stream(w)
                .map_err(|e| map_ftp_err(e, "")),
            None => Ok(()),
        }
    }

    fn abort(&mut self) -> Result<()> {
        match self.transfer.take() {
            Some(Transfer::Retr(r)) => self.ctrl.abort(r).map_err(|e| map_ftp_err(e, "")),
            // There is no ABOR path for uploads; closing the data channel
            // and reading the reply is the only way out.
            Some(Transfer::Stor(w)) => self
                .ctrl
                .finalize_put_stream(w)
                .map_err(|e| map_ftp_err(e, "")),
            None => Ok(()),
        }
    }

    fn has_stream(&self) -> bool {
        self.transfer.is_some()
    }

    fn set_deadline(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.ctrl
            .get_ref()
            .set_read_timeout(timeout)
            .and_then(|()| self.ctrl.get_ref().set_write_timeout(timeout))
            .map_err(Error::from)
    }

    fn quit(&mut self) -> Result<()> {
        self.ctrl.quit().map_err(|e| map_ftp_err(e, ""))
    }
}

/// Translate an FTP reply into the adapter's error taxonomy.
pub(crate) fn map_ftp_err(err: FtpError, path: &str) -> Error {
    match err {
        FtpError::ConnectionError(e) => Error::from(e),
        FtpError::UnexpectedResponse(resp) => {
            let body = String::from_utf8_lossy(&resp.body).trim().to_string();
            match resp.status {
                Status::FileUnavailable => classify_file_unavailable(&body, path),
                Status::BadFilename => Error::AlreadyExists(display_path(path)),
                Status::NotLoggedIn | Status::InvalidCredentials => {
                    Error::PermissionDenied(display_path(path))
                }
                Status::NotAvailable
                | Status::CannotOpenDataConnection
                | Status::TransferAborted => Error::BrokenConnection(body),
                _ => Error::Io(body),
            }
        }
        other => Error::Io(other.to_string()),
    }
}

/// The 550 reply is overloaded; the server text tells the cases apart.
fn classify_file_unavailable(body: &str, path: &str) -> Error {
    let text = body.to_ascii_lowercase();
    if text.contains("not a directory") {
        Error::NotDirectory(display_path(path))
    } else if text.contains("is a directory") {
        Error::IsDirectory(display_path(path))
    } else if text.contains("not empty") {
        Error::DirNotEmpty(display_path(path))
    } else if text.contains("exists") {
        Error::AlreadyExists(display_path(path))
    } else if text.contains("permission") || text.contains("denied") || text.contains("access") {
        Error::PermissionDenied(display_path(path))
    } else {
        Error::NotFound(display_path(path))
    }
}
