pub mod conn;

#[cfg(test)]
pub(crate) mod memory;

pub use conn::{Connector, DirEntry, EntryKind, FtpConnector, RemoteConn};
