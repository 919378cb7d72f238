pub mod common;
pub mod fs;
pub mod ftp;
pub mod pool;

pub use common::{ClientConfig, Error, Result};
pub use fs::{FtpFs, FuseHost, OpenMode};
