use std::fmt::{Display, Formatter};

/// Result returned by all fallible store operations.
pub type CResult<T> = Result<T, Error>;

/// Store errors. Each variant corresponds to one failure class surfaced to
/// callers; the inner string carries the human-readable detail.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The file contents are unexpected (bad checksum, unknown chunk,
    /// page position out of range). The store refuses to open.
    FileCorrupt(String),

    /// The file was written with a newer format than this build supports.
    UnsupportedFormat(String),

    /// Writing to the file failed. Wraps the underlying I/O error text.
    WritingFailed(String),

    /// The store or map was already closed.
    Closed,

    /// An unexpected internal condition, always a bug.
    Internal(String),

    /// A transactional write could not acquire the row within the
    /// configured lock timeout.
    LockTimeout(String),

    /// A rollback or snapshot was requested for a version that is neither
    /// retained in memory nor stored in the file.
    UnknownVersion(String),

    /// A write was attempted on a read-only store or map view.
    ReadOnly(String),

    /// A second writer was detected on the same map. Maps are
    /// single-writer; this is a caller bug, not a recoverable conflict.
    ConcurrentModification(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::FileCorrupt(msg) => write!(f, "file corrupt: {}", msg),
            Error::UnsupportedFormat(msg) => write!(f, "unsupported format: {}", msg),
            Error::WritingFailed(msg) => write!(f, "writing failed: {}", msg),
            Error::Closed => write!(f, "the store is closed"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::LockTimeout(msg) => write!(f, "lock timeout: {}", msg),
            Error::UnknownVersion(msg) => write!(f, "unknown version: {}", msg),
            Error::ReadOnly(msg) => write!(f, "read only: {}", msg),
            Error::ConcurrentModification(msg) => {
                write!(f, "concurrent modification: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::WritingFailed(err.to_string())
    }
}

impl From<std::fs::TryLockError> for Error {
    fn from(err: std::fs::TryLockError) -> Self {
        Error::WritingFailed(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::FileCorrupt(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::FileCorrupt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            Error::FileCorrupt("bad header".to_string()).to_string(),
            "file corrupt: bad header"
        );
        assert_eq!(Error::Closed.to_string(), "the store is closed");
    }

    #[test]
    fn from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        match Error::from(io) {
            Error::WritingFailed(msg) => assert!(msg.contains("disk gone")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
