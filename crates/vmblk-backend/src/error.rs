//! Error types for the block backend.

use thiserror::Error;

/// Result type alias for block backend operations.
pub type BlockResult<T> = Result<T, BlockError>;

/// Error variants surfaced by the submission API and by `open`.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Wraps standard I/O errors; the OS error code is preserved.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request named a queue index outside the context's queue array.
    #[error("Invalid queue index {qidx} (context has {queues} queues)")]
    InvalidQueue {
        /// The out-of-range queue index.
        qidx: u16,
        /// Number of queues the context was opened with.
        queues: usize,
    },

    /// The target queue has no free request slots.
    #[error("Queue {qidx} is full")]
    QueueFull {
        /// The queue that rejected the request.
        qidx: u16,
    },

    /// Write or discard submitted to a read-only context.
    #[error("Backing is read-only")]
    ReadOnly,

    /// The backing does not support the requested operation.
    #[error("Not supported: {0}")]
    Unsupported(&'static str),

    /// A discard range failed validation.
    #[error("Invalid discard range: start={start} len={len}")]
    InvalidDiscardRange {
        /// Absolute start of the offending range in bytes.
        start: u64,
        /// Length of the offending range in bytes.
        len: u64,
    },

    /// A discard request carried more segments than permitted.
    #[error("Discard segment count {count} exceeds limit {limit}")]
    TooManySegments {
        /// Segments found in the request.
        count: usize,
        /// Maximum segments the context accepts.
        limit: usize,
    },

    /// Allocation of an aligned bounce buffer failed.
    #[error("Failed to allocate {size}-byte bounce buffer")]
    BounceAlloc {
        /// Requested buffer size in bytes.
        size: usize,
    },

    /// The option string or configuration record was malformed.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BlockError {
    /// OS error code carried by this error, if any.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            BlockError::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_preserved() {
        let err = BlockError::Io(std::io::Error::from_raw_os_error(libc::EINTR));
        assert_eq!(err.os_error(), Some(libc::EINTR));
    }

    #[test]
    fn test_non_io_has_no_os_error() {
        let err = BlockError::ReadOnly;
        assert_eq!(err.os_error(), None);
    }

    #[test]
    fn test_display_messages() {
        let err = BlockError::InvalidQueue { qidx: 4, queues: 2 };
        assert_eq!(
            err.to_string(),
            "Invalid queue index 4 (context has 2 queues)"
        );
        let err = BlockError::QueueFull { qidx: 0 };
        assert_eq!(err.to_string(), "Queue 0 is full");
    }
}
