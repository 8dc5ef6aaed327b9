//! Error taxonomy shared by backends, queues and arenas.

use std::borrow::Cow;
use std::fmt;
use std::io;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry later: the queue was momentarily full or empty.
    Temporary,
    /// Bad size, name, capacity, alignment, or a parameter mismatch on attach.
    InvalidParameter,
    /// The named object exists with an incompatible shape, or a single-holder
    /// role is already claimed.
    ResourceInUse,
    /// The OS refused to provide memory.
    ResourceExhausted,
    /// An offset outside the mapped segment.
    OutOfRange,
    /// Not available on this platform or kernel.
    Unsupported,
    /// Any other OS failure.
    Fatal,
}

/// Errors produced while creating, attaching to or configuring segments.
///
/// Steady-state operations do not return this type: pushes fail with
/// [`Full`](crate::queue::Full), pops and allocations return `Option`.
#[derive(Debug)]
pub enum Error {
    /// Queue full or empty; convert from [`Full`](crate::queue::Full) with `?`.
    Temporary,
    InvalidParameter(Cow<'static, str>),
    ResourceInUse {
        what: String,
        reason: Cow<'static, str>,
    },
    ResourceExhausted {
        op: &'static str,
        source: io::Error,
    },
    OutOfRange {
        offset: usize,
        len: usize,
    },
    Unsupported(Cow<'static, str>),
    Fatal {
        op: &'static str,
        source: io::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Temporary => ErrorKind::Temporary,
            Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Error::ResourceInUse { .. } => ErrorKind::ResourceInUse,
            Error::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Error::OutOfRange { .. } => ErrorKind::OutOfRange,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    pub(crate) fn invalid(msg: impl Into<Cow<'static, str>>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    /// Classify an OS error raised by `op`.
    pub(crate) fn os(op: &'static str, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::ENOMEM) | Some(libc::ENOSPC) => Error::ResourceExhausted { op, source },
            Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) => {
                Error::Unsupported(format!("{op}: {source}").into())
            }
            Some(libc::EINVAL) | Some(libc::ENAMETOOLONG) => {
                Error::InvalidParameter(format!("{op}: {source}").into())
            }
            _ => Error::Fatal { op, source },
        }
    }

    /// `os` applied to the calling thread's `errno`.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Self::os(op, io::Error::last_os_error())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Temporary => write!(f, "operation would block"),
            Error::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Error::ResourceInUse { what, reason } => write!(f, "{what} is in use: {reason}"),
            Error::ResourceExhausted { op, source } => {
                write!(f, "{op}: resources exhausted: {source}")
            }
            Error::OutOfRange { offset, len } => {
                write!(f, "offset {offset} out of range for segment of {len} bytes")
            }
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Error::Fatal { op, source } => write!(f, "{op} failed: {source}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ResourceExhausted { source, .. } | Error::Fatal { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_errors_are_classified() {
        let exhausted = Error::os("mmap", io::Error::from_raw_os_error(libc::ENOMEM));
        assert_eq!(exhausted.kind(), ErrorKind::ResourceExhausted);

        let unsupported = Error::os("mbind", io::Error::from_raw_os_error(libc::ENOSYS));
        assert_eq!(unsupported.kind(), ErrorKind::Unsupported);

        let fatal = Error::os("shm_open", io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(fatal.kind(), ErrorKind::Fatal);
        assert!(std::error::Error::source(&fatal).is_some());
        assert!(fatal.to_string().starts_with("shm_open failed"));
    }
}
