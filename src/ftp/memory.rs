//! In-memory fake of the FTP seam for tests.
//!
//! Models a world of servers keyed by socket address, each with an up/down
//! switch, so pool, handle and adapter tests can exercise reconnects and
//! address changes without a network. Transfer semantics mirror a plain
//! file-backed server: `STOR` at offset 0 truncates at open, `REST` seeks,
//! and (configurably) the file is truncated at the final write position
//! when the transfer closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::conn::{Connector, DirEntry, EntryKind, RemoteConn};
use crate::common::{display_path, file_name, parent_path, Error, Result};

#[derive(Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// One fake server: a path → node map plus switches and counters.
pub(crate) struct MemoryServer {
    nodes: Mutex<HashMap<String, Node>>,
    up: AtomicBool,
    truncate_on_close: AtomicBool,
    pub connects: AtomicUsize,
    pub retr_opens: AtomicUsize,
    pub stor_opens: AtomicUsize,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            up: AtomicBool::new(true),
            truncate_on_close: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            retr_opens: AtomicUsize::new(0),
            stor_opens: AtomicUsize::new(0),
        })
    }

    /// Simulate a server crash: existing connections break, new ones refuse.
    pub fn stop(&self) {
        self.up.store(false, Ordering::SeqCst);
    }

    /// When false, closing a STOR transfer keeps any bytes past the final
    /// write position (the seek-only server family).
    pub fn set_truncate_on_close(&self, v: bool) {
        self.truncate_on_close.store(v, Ordering::SeqCst);
    }

    /// Pre-populate a file, creating parent directories as needed.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let mut nodes = self.nodes.lock().unwrap();
        let mut dir = parent_path(path);
        while let Some(d) = dir {
            if d.is_empty() {
                break;
            }
            nodes.entry(d.to_string()).or_insert(Node::Dir);
            dir = parent_path(d);
        }
        nodes.insert(path.to_string(), Node::File(data.to_vec()));
    }

    pub fn put_dir(&self, path: &str) {
        self.nodes
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::Dir);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn has(&self, path: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(path)
    }
}

enum MemTransfer {
    Retr { path: String, pos: u64 },
    Stor { path: String, pos: u64 },
}

struct MemoryConn {
    server: Arc<MemoryServer>,
    transfer: Option<MemTransfer>,
}

impl MemoryConn {
    fn check_up(&self) -> Result<()> {
        if self.server.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::BrokenConnection("server stopped".to_string()))
        }
    }
}

impl RemoteConn for MemoryConn {
    fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        self.check_up()?;
        let nodes = self.server.nodes.lock().unwrap();
        match nodes.get(path) {
            Some(Node::File(data)) => Ok(vec![DirEntry {
                name: file_name(path).to_string(),
                kind: EntryKind::File,
                size: data.len() as u64,
                mtime: None,
            }]),
            Some(Node::Dir) | None if path.is_empty() || nodes.contains_key(path) => {
                let mut entries = Vec::new();
                for (k, node) in nodes.iter() {
                    if parent_path(k) != Some(path) {
                        continue;
                    }
                    entries.push(match node {
                        Node::File(data) => DirEntry {
                            name: file_name(k).to_string(),
                            kind: EntryKind::File,
                            size: data.len() as u64,
                            mtime: None,
                        },
                        Node::Dir => DirEntry {
                            name: file_name(k).to_string(),
                            kind: EntryKind::Dir,
                            size: 0,
                            mtime: None,
                        },
                    });
                }
                Ok(entries)
            }
            _ => Err(Error::NotFound(display_path(path))),
        }
    }

    fn size(&mut self, path: &str) -> Result<u64> {
        self.check_up()?;
        match self.server.nodes.lock().unwrap().get(path) {
            Some(Node::File(data)) => Ok(data.len() as u64),
            Some(Node::Dir) => Err(Error::IsDirectory(display_path(path))),
            None => Err(Error::NotFound(display_path(path))),
        }
    }

    fn make_dir(&mut self, path: &str) -> Result<()> {
        self.check_up()?;
        let mut nodes = self.server.nodes.lock().unwrap();
        if nodes.contains_key(path) {
            return Err(Error::AlreadyExists(display_path(path)));
        }
        if let Some(parent) = parent_path(path) {
            if !parent.is_empty() {
                match nodes.get(parent) {
                    Some(Node::Dir) => {}
                    Some(Node::File(_)) => {
                        return Err(Error::NotDirectory(display_path(parent)))
                    }
                    None => return Err(Error::NotFound(display_path(parent))),
                }
            }
        }
        nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    fn remove_dir(&mut self, path: &str) -> Result<()> {
        self.check_up()?;
        let mut nodes = self.server.nodes.lock().unwrap();
        match nodes.get(path) {
            None => return Err(Error::NotFound(display_path(path))),
            Some(Node::File(_)) => return Err(Error::NotDirectory(display_path(path))),
            Some(Node::Dir) => {}
        }
        if nodes.keys().any(|k| parent_path(k) == Some(path)) {
            return Err(Error::DirNotEmpty(display_path(path)));
        }
        nodes.remove(path);
        Ok(())
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        self.check_up()?;
        let mut nodes = self.server.nodes.lock().unwrap();
        match nodes.get(path) {
            None => Err(Error::NotFound(display_path(path))),
            Some(Node::Dir) => Err(Error::IsDirectory(display_path(path))),
            Some(Node::File(_)) => {
                nodes.remove(path);
                Ok(())
            }
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.check_up()?;
        let mut nodes = self.server.nodes.lock().unwrap();
        let Some(node) = nodes.get(from).cloned() else {
            return Err(Error::NotFound(display_path(from)));
        };
        if let Some(parent) = parent_path(to) {
            if !parent.is_empty() && !matches!(nodes.get(parent), Some(Node::Dir)) {
                return Err(Error::NotFound(display_path(parent)));
            }
        }
        nodes.remove(from);
        nodes.insert(to.to_string(), node);
        let prefix = format!("{}/", from);
        let moved: Vec<String> = nodes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            let node = nodes.remove(&old).unwrap();
            let new = format!("{}/{}", to, &old[prefix.len()..]);
            nodes.insert(new, node);
        }
        Ok(())
    }

    fn open_read(&mut self, path: &str, offset: u64) -> Result<()> {
        self.check_up()?;
        match self.server.nodes.lock().unwrap().get(path) {
            Some(Node::File(_)) => {}
            Some(Node::Dir) => return Err(Error::NotFound(display_path(path))),
            None => return Err(Error::NotFound(display_path(path))),
        }
        self.server.retr_opens.fetch_add(1, Ordering::SeqCst);
        self.transfer = Some(MemTransfer::Retr {
            path: path.to_string(),
            pos: offset,
        });
        Ok(())
    }

    fn open_write(&mut self, path: &str, offset: u64) -> Result<()> {
        self.check_up()?;
        let mut nodes = self.server.nodes.lock().unwrap();
        if matches!(nodes.get(path), Some(Node::Dir)) {
            return Err(Error::IsDirectory(display_path(path)));
        }
        if let Some(parent) = parent_path(path) {
            if !parent.is_empty() && !matches!(nodes.get(parent), Some(Node::Dir)) {
                return Err(Error::NotFound(display_path(parent)));
            }
        }
        if offset == 0 {
            nodes.insert(path.to_string(), Node::File(Vec::new()));
        } else {
            if !matches!(nodes.get(path), Some(Node::File(_))) {
                nodes.insert(path.to_string(), Node::File(Vec::new()));
            }
            if let Some(Node::File(data)) = nodes.get_mut(path) {
                if (data.len() as u64) < offset {
                    data.resize(offset as usize, 0);
                }
            }
        }
        drop(nodes);
        self.server.stor_opens.fetch_add(1, Ordering::SeqCst);
        self.transfer = Some(MemTransfer::Stor {
            path: path.to_string(),
            pos: offset,
        });
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_up()?;
        let Some(MemTransfer::Retr { path, pos }) = self.transfer.as_mut() else {
            return Err(Error::Io("no read transfer attached".to_string()));
        };
        let nodes = self.server.nodes.lock().unwrap();
        let Some(Node::File(data)) = nodes.get(path.as_str()) else {
            return Err(Error::BrokenConnection("file vanished".to_string()));
        };
        let start = (*pos).min(data.len() as u64) as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        *pos += n as u64;
        Ok(n)
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.check_up()?;
        let Some(MemTransfer::Stor { path, pos }) = self.transfer.as_mut() else {
            return Err(Error::Io("no write transfer attached".to_string()));
        };
        let mut nodes = self.server.nodes.lock().unwrap();
        let Some(Node::File(data)) = nodes.get_mut(path.as_str()) else {
            return Err(Error::BrokenConnection("file vanished".to_string()));
        };
        let start = *pos as usize;
        if data.len() < start + chunk.len() {
            data.resize(start + chunk.len(), 0);
        }
        data[start..start + chunk.len()].copy_from_slice(chunk);
        *pos += chunk.len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let transfer = self.transfer.take();
        self.check_up()?;
        if let Some(MemTransfer::Stor { path, pos }) = transfer {
            if self.server.truncate_on_close.load(Ordering::SeqCst) {
                let mut nodes = self.server.nodes.lock().unwrap();
                if let Some(Node::File(data)) = nodes.get_mut(&path) {
                    data.truncate(pos as usize);
                }
            }
        }
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.transfer = None;
        self.check_up()
    }

    fn has_stream(&self) -> bool {
        self.transfer.is_some()
    }

    fn set_deadline(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn quit(&mut self) -> Result<()> {
        self.transfer = None;
        Ok(())
    }
}

/// [`Connector`] over the fake server world.
#[derive(Clone, Default)]
pub(crate) struct MemoryConnector {
    servers: Arc<Mutex<HashMap<SocketAddr, Arc<MemoryServer>>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, addr: SocketAddr, server: Arc<MemoryServer>) {
        self.servers.lock().unwrap().insert(addr, server);
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, addr: SocketAddr, _timeout: Duration) -> Result<Box<dyn RemoteConn>> {
        let server = self.servers.lock().unwrap().get(&addr).cloned();
        let Some(server) = server else {
            return Err(Error::Unavailable(format!("connect {}: no route", addr)));
        };
        if !server.up.load(Ordering::SeqCst) {
            return Err(Error::Unavailable(format!(
                "connect {}: connection refused",
                addr
            )));
        }
        server.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConn {
            server,
            transfer: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(server: &Arc<MemoryServer>) -> MemoryConn {
        MemoryConn {
            server: server.clone(),
            transfer: None,
        }
    }

    #[test]
    fn test_stor_roundtrip() {
        let server = MemoryServer::new();
        let mut c = conn(&server);
        c.open_write("f.txt", 0).unwrap();
        c.write_chunk(b"hello world").unwrap();
        c.finalize().unwrap();
        assert_eq!(server.file("f.txt").unwrap(), b"hello world");

        let mut buf = [0u8; 16];
        c.open_read("f.txt", 6).unwrap();
        let n = c.read_chunk(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(c.read_chunk(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_stor_truncates_at_close_position() {
        let server = MemoryServer::new();
        server.put_file("f.txt", &[1u8; 100]);
        let mut c = conn(&server);
        c.open_write("f.txt", 40).unwrap();
        c.finalize().unwrap();
        assert_eq!(server.file("f.txt").unwrap().len(), 40);
    }

    #[test]
    fn test_seek_only_family_keeps_tail() {
        let server = MemoryServer::new();
        server.set_truncate_on_close(false);
        server.put_file("f.txt", &[1u8; 100]);
        let mut c = conn(&server);
        c.open_write("f.txt", 40).unwrap();
        c.finalize().unwrap();
        assert_eq!(server.file("f.txt").unwrap().len(), 100);
    }

    #[test]
    fn test_stopped_server_breaks_transfers() {
        let server = MemoryServer::new();
        server.put_file("f.txt", b"data");
        let mut c = conn(&server);
        c.open_read("f.txt", 0).unwrap();
        server.stop();
        let mut buf = [0u8; 4];
        assert!(matches!(
            c.read_chunk(&mut buf),
            Err(Error::BrokenConnection(_))
        ));
    }

    #[test]
    fn test_rename_moves_children() {
        let server = MemoryServer::new();
        server.put_dir("a");
        server.put_file("a/f.txt", b"x");
        server.put_dir("b");
        let mut c = conn(&server);
        c.rename("a", "b/a").unwrap();
        assert!(server.has("b/a/f.txt"));
        assert!(!server.has("a/f.txt"));
    }
}
