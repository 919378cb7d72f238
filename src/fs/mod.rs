pub mod adapter;
pub mod fuse;
pub mod handle;
pub mod host;

pub use adapter::{Attr, FtpFs};
pub use handle::OpenMode;
pub use host::FuseHost;
