use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file exists: {0}")]
    AlreadyExists(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("directory not empty: {0}")]
    DirNotEmpty(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("broken connection: {0}")]
    BrokenConnection(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("server unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transport faults mark their connection broken on release and are
    /// retried once per operation when no byte has been delivered yet.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::BrokenConnection(_) | Error::Timeout(_) | Error::Unavailable(_)
        )
    }

    /// POSIX error code reported to the kernel bridge.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::IsDirectory(_) => libc::EISDIR,
            Error::NotDirectory(_) => libc::ENOTDIR,
            Error::DirNotEmpty(_) => libc::ENOTEMPTY,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::InvalidPath(_) => libc::EINVAL,
            Error::Timeout(_) => libc::ETIMEDOUT,
            Error::Cancelled => libc::EINTR,
            Error::BrokenConnection(_)
            | Error::Unavailable(_)
            | Error::MountFailed(_)
            | Error::Io(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::Timeout(e.to_string()),
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => Error::BrokenConnection(e.to_string()),
            ErrorKind::ConnectionRefused => Error::Unavailable(e.to_string()),
            _ => Error::Io(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(Error::AlreadyExists("x".into()).errno(), libc::EEXIST);
        assert_eq!(Error::IsDirectory("x".into()).errno(), libc::EISDIR);
        assert_eq!(Error::NotDirectory("x".into()).errno(), libc::ENOTDIR);
        assert_eq!(Error::DirNotEmpty("x".into()).errno(), libc::ENOTEMPTY);
        assert_eq!(Error::PermissionDenied("x".into()).errno(), libc::EACCES);
        assert_eq!(Error::Cancelled.errno(), libc::EINTR);
        assert_eq!(Error::Timeout("x".into()).errno(), libc::ETIMEDOUT);
        assert_eq!(Error::BrokenConnection("x".into()).errno(), libc::EIO);
    }

    #[test]
    fn test_transport_classification() {
        assert!(Error::BrokenConnection("x".into()).is_transport());
        assert!(Error::Timeout("x".into()).is_transport());
        assert!(Error::Unavailable("x".into()).is_transport());
        assert!(!Error::NotFound("x".into()).is_transport());
        assert!(!Error::Io("x".into()).is_transport());
    }

    #[test]
    fn test_from_io_error() {
        let e = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(matches!(e, Error::BrokenConnection(_)));
        let e = Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(e, Error::Timeout(_)));
        let e = Error::from(io::Error::new(io::ErrorKind::ConnectionRefused, "no"));
        assert!(matches!(e, Error::Unavailable(_)));
        let e = Error::from(io::Error::new(io::ErrorKind::Other, "weird"));
        assert!(matches!(e, Error::Io(_)));
    }
}
