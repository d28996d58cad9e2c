//! Atomic per-context statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters updated by the execution engines.
#[derive(Debug, Default)]
pub struct BackendStats {
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    discards: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    bounced: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    errors: AtomicU64,
}

impl BackendStats {
    pub(crate) fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bounce(&self) {
        self.bounced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`BackendStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Reads completed successfully.
    pub reads: u64,
    /// Writes completed successfully.
    pub writes: u64,
    /// Flushes completed successfully.
    pub flushes: u64,
    /// Discards completed successfully.
    pub discards: u64,
    /// Bytes transferred by successful reads.
    pub bytes_read: u64,
    /// Bytes transferred by successful writes.
    pub bytes_written: u64,
    /// Requests rewritten through a bounce buffer.
    pub bounced: u64,
    /// Submissions rejected with a full queue.
    pub rejected: u64,
    /// Requests cancelled before execution.
    pub cancelled: u64,
    /// Requests that completed with an error.
    pub errors: u64,
}

impl From<&BackendStats> for StatsSnapshot {
    fn from(stats: &BackendStats) -> Self {
        StatsSnapshot {
            reads: stats.reads.load(Ordering::Relaxed),
            writes: stats.writes.load(Ordering::Relaxed),
            flushes: stats.flushes.load(Ordering::Relaxed),
            discards: stats.discards.load(Ordering::Relaxed),
            bytes_read: stats.bytes_read.load(Ordering::Relaxed),
            bytes_written: stats.bytes_written.load(Ordering::Relaxed),
            bounced: stats.bounced.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
            cancelled: stats.cancelled.load(Ordering::Relaxed),
            errors: stats.errors.load(Ordering::Relaxed),
        }
    }
}
