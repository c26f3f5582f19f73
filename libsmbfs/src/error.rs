use std::io;

use thiserror::Error;

/// Failures reported by the RPC/transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The session backing the handle went away; the handle is stale.
    #[error("session lost, handle must be reconnected")]
    Reconnect,
    #[error("object not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("sharing violation")]
    SharingViolation,
    #[error("byte range lock conflict")]
    LockConflict,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("io error: {0}")]
    Io(String),
}

impl RpcError {
    pub fn is_reconnect(&self) -> bool {
        matches!(self, RpcError::Reconnect)
    }
}

#[derive(Debug, Error)]
pub enum SmbFsError {
    /// An incompatible exclusive/deny-mode open is already active.
    #[error("resource busy")]
    Busy,
    #[error("bad handle: {0}")]
    BadHandle(String),
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// Self-conflicting lock, or an unlock that matched nothing.
    #[error("operation would block")]
    WouldBlock,
    /// The server refused the lock because another opener holds the range.
    #[error("lock denied by server")]
    LockDenied,
    #[error("handle revoked after reconnect failure")]
    Revoked,
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub type Result<T> = std::result::Result<T, SmbFsError>;

impl SmbFsError {
    /// POSIX errno handed back to the filesystem glue.
    pub fn errno(&self) -> i32 {
        match self {
            SmbFsError::Busy => libc::EBUSY,
            SmbFsError::BadHandle(_) => libc::EBADF,
            SmbFsError::Invalid(_) => libc::EINVAL,
            SmbFsError::WouldBlock => libc::EAGAIN,
            SmbFsError::LockDenied => libc::EACCES,
            SmbFsError::Revoked => libc::EIO,
            SmbFsError::Rpc(e) => match e {
                RpcError::Reconnect => libc::EIO,
                RpcError::NotFound => libc::ENOENT,
                RpcError::AccessDenied => libc::EACCES,
                RpcError::SharingViolation => libc::EBUSY,
                RpcError::LockConflict => libc::EACCES,
                RpcError::InvalidHandle => libc::EBADF,
                RpcError::Io(_) => libc::EIO,
            },
        }
    }
}

impl From<SmbFsError> for io::Error {
    fn from(e: SmbFsError) -> Self {
        io::Error::from_raw_os_error(e.errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(SmbFsError::Busy.errno(), libc::EBUSY);
        assert_eq!(SmbFsError::WouldBlock.errno(), libc::EAGAIN);
        assert_eq!(SmbFsError::LockDenied.errno(), libc::EACCES);
        assert_eq!(SmbFsError::Revoked.errno(), libc::EIO);
        assert_eq!(SmbFsError::from(RpcError::SharingViolation).errno(), libc::EBUSY);
        assert_eq!(SmbFsError::from(RpcError::NotFound).errno(), libc::ENOENT);
    }

    #[test]
    fn test_into_io_error() {
        let err: io::Error = SmbFsError::BadHandle("slot not open".into()).into();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
