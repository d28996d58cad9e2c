//! Request types shared by the frontends and the execution core.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::align::AlignInfo;
use crate::error::{BlockError, BlockResult};

/// Identifier a frontend attaches to a request so it can later cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReqId(pub u64);

/// Atomic counter handing out unique request identifiers.
#[derive(Debug)]
pub struct ReqIdGen {
    next: AtomicU64,
}

impl ReqIdGen {
    /// Creates a generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next unique request id.
    pub fn next_id(&self) -> ReqId {
        ReqId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ReqIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Block operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockOp {
    /// Read from the backing into the request's buffers.
    Read,
    /// Write the request's buffers to the backing.
    Write,
    /// Synchronize the backing to stable storage.
    Flush,
    /// Deallocate a range of the backing.
    Discard,
}

impl fmt::Display for BlockOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockOp::Read => write!(f, "read"),
            BlockOp::Write => write!(f, "write"),
            BlockOp::Flush => write!(f, "flush"),
            BlockOp::Discard => write!(f, "discard"),
        }
    }
}

/// An asynchronous block request.
///
/// The core owns the request from submission until the completion callback
/// fires (or until [`crate::BlockContext::cancel`] hands it back). Buffer
/// segments are the request's scatter-gather list; for reads they are filled
/// in order, for writes they are consumed in order.
pub struct BlockRequest {
    /// Caller-assigned identifier, used by cancel.
    pub id: ReqId,
    /// Queue the request dispatches on.
    pub qidx: u16,
    /// Byte offset within the logical backing object, before sub-range
    /// translation.
    pub offset: u64,
    /// Scatter-gather buffer segments.
    pub bufs: Vec<Vec<u8>>,
    /// Bytes remaining; set to the requested length on submission and
    /// decremented by the core on success.
    pub resid: usize,
    pub(crate) align: AlignInfo,
}

impl BlockRequest {
    /// Creates a read/write/discard request; `resid` starts at the total
    /// buffer length.
    pub fn new(id: ReqId, qidx: u16, offset: u64, bufs: Vec<Vec<u8>>) -> Self {
        let resid = bufs.iter().map(Vec::len).sum();
        Self {
            id,
            qidx,
            offset,
            bufs,
            resid,
            align: AlignInfo::default(),
        }
    }

    /// Creates a flush request (no buffers, no offset).
    pub fn flush(id: ReqId, qidx: u16) -> Self {
        Self::new(id, qidx, 0, Vec::new())
    }

    /// Total length of the scatter-gather list in bytes.
    pub fn total_len(&self) -> usize {
        self.bufs.iter().map(Vec::len).sum()
    }
}

impl fmt::Debug for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRequest")
            .field("id", &self.id)
            .field("qidx", &self.qidx)
            .field("offset", &self.offset)
            .field("segments", &self.bufs.len())
            .field("resid", &self.resid)
            .finish_non_exhaustive()
    }
}

/// Completion callback; invoked exactly once when a submitted request
/// reaches a terminal state. Receives the request back together with the
/// outcome.
pub type IoCallback = Box<dyn FnOnce(BlockRequest, BlockResult<()>) + Send + 'static>;

/// Synchronous submission failure; returns ownership of the request and its
/// callback to the caller (the callback has not been and will not be
/// invoked).
pub struct SubmitError {
    /// Why the request was rejected.
    pub error: BlockError,
    /// The rejected request.
    pub request: BlockRequest,
    /// The callback that was supplied with the request.
    pub callback: IoCallback,
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("error", &self.error)
            .field("request", &self.request.id)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for SubmitError {}

/// Result of [`crate::BlockContext::cancel`].
#[derive(Debug)]
pub enum CancelOutcome {
    /// The request was removed before execution started. Ownership returns
    /// to the caller; the completion callback was dropped without running.
    Cancelled(BlockRequest),
    /// The request was already executing. Its callback will still be (or
    /// has already been) invoked exactly once.
    InFlight,
    /// No queued or in-flight request matched the id.
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_gen_monotonic() {
        let ids = ReqIdGen::new();
        assert_eq!(ids.next_id(), ReqId(1));
        assert_eq!(ids.next_id(), ReqId(2));
        assert_eq!(ids.next_id(), ReqId(3));
    }

    #[test]
    fn test_new_sets_resid() {
        let req = BlockRequest::new(ReqId(7), 0, 4096, vec![vec![0u8; 512], vec![0u8; 1024]]);
        assert_eq!(req.resid, 1536);
        assert_eq!(req.total_len(), 1536);
    }

    #[test]
    fn test_flush_request_is_empty() {
        let req = BlockRequest::flush(ReqId(1), 2);
        assert_eq!(req.qidx, 2);
        assert_eq!(req.resid, 0);
        assert!(req.bufs.is_empty());
    }

    #[test]
    fn test_op_display() {
        assert_eq!(BlockOp::Read.to_string(), "read");
        assert_eq!(BlockOp::Discard.to_string(), "discard");
    }
}
