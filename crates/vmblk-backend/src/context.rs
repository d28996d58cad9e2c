//! Context lifecycle and the submission API.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::align;
use crate::cancel;
use crate::config::{AioMode, BlockDeviceConfig};
use crate::discard::DISCARD_SECTOR_SIZE;
use crate::error::{BlockError, BlockResult};
use crate::queue::{BlockQueue, MAX_QUEUED_REQUESTS};
use crate::reactor::Reactor;
use crate::request::{BlockOp, BlockRequest, CancelOutcome, IoCallback, ReqId, SubmitError};
use crate::stats::{BackendStats, StatsSnapshot};
use crate::sysio;
use crate::thread_pool;

/// Backing state shared with worker threads and reactor callbacks.
/// Immutable after open except for the write-cache flag.
pub(crate) struct ContextShared {
    file: File,
    pub(crate) is_block: bool,
    pub(crate) read_only: bool,
    pub(crate) can_discard: bool,
    /// Logical size in bytes (the sub-range length when one is configured).
    pub(crate) size: u64,
    pub(crate) sector_size: u32,
    pub(crate) phys_sector_size: u32,
    pub(crate) phys_sector_off: u32,
    /// Byte offset added to every request offset.
    pub(crate) sub_range_start: u64,
    /// Advisory-locked byte range, released at close.
    pub(crate) locked_range: Option<(u64, u64)>,
    pub(crate) max_discard_sectors: u64,
    pub(crate) max_discard_segments: u32,
    pub(crate) discard_sector_alignment: u32,
    pub(crate) bypass_host_cache: bool,
    pub(crate) aio: AioMode,
    write_cache: AtomicBool,
    pub(crate) stats: BackendStats,
}

impl ContextShared {
    pub(crate) fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub(crate) fn write_cache(&self) -> bool {
        self.write_cache.load(Ordering::Relaxed)
    }

    pub(crate) fn set_write_cache(&self, enabled: bool) {
        self.write_cache.store(enabled, Ordering::Relaxed);
    }

    /// Write-through emulation: fsync after every write while the write
    /// cache is disabled.
    pub(crate) fn flush_cache(&self) -> BlockResult<()> {
        if !self.write_cache() {
            sysio::fsync(self.fd())?;
        }
        Ok(())
    }
}

/// Virtual C/H/S geometry, computed with the VHD algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Cylinder count.
    pub cylinders: u16,
    /// Head count.
    pub heads: u8,
    /// Sectors per track.
    pub sectors: u8,
}

/// An open block backend: backing descriptor, queue array and the selected
/// execution engine.
pub struct BlockContext {
    shared: Arc<ContextShared>,
    queues: Vec<Arc<BlockQueue>>,
    reactor: Option<Arc<dyn Reactor>>,
    /// Per-queue (ring fd, kick fd) pairs to unregister at close.
    ring_fds: Vec<Option<(RawFd, RawFd)>>,
    closed: bool,
}

impl BlockContext {
    /// Opens a backing device and starts the configured engine on
    /// `queue_count` queues (`0` is promoted to one queue).
    ///
    /// `ident` tags worker threads for debugging. The reactor is required
    /// by the ring engine and ignored by the thread pool.
    ///
    /// A sub-range lock conflict aborts the process: a device model whose
    /// backing is claimed elsewhere must not silently continue.
    pub fn open(
        config: &BlockDeviceConfig,
        ident: &str,
        queue_count: usize,
        reactor: Option<Arc<dyn Reactor>>,
    ) -> BlockResult<Self> {
        cancel::install_handler();

        if config.aio == AioMode::IoUring && reactor.is_none() {
            return Err(BlockError::Config(
                "the io_uring engine requires a reactor".into(),
            ));
        }
        #[cfg(not(feature = "uring"))]
        if config.aio == AioMode::IoUring {
            return Err(BlockError::Unsupported(
                "io_uring engine (built without the uring feature)",
            ));
        }

        let mut read_only = config.read_only;
        let mut open_options = OpenOptions::new();
        open_options.read(true).write(!read_only);
        if config.bypass_host_cache {
            open_options.custom_flags(libc::O_DIRECT);
        }
        let file = match open_options.open(&config.path) {
            Ok(file) => file,
            Err(err) if !read_only => {
                // Degrade a failed read-write open to read-only.
                debug!(path = %config.path.display(), %err, "read-write open failed, retrying read-only");
                read_only = true;
                OpenOptions::new().read(true).open(&config.path)?
            }
            Err(err) => return Err(err.into()),
        };

        let meta = file.metadata()?;
        let is_block = meta.file_type().is_block_device();
        let fd = file.as_raw_fd();

        let mut sector_size: u32 = DISCARD_SECTOR_SIZE as u32;
        let mut phys_sector_size: u32;
        let phys_sector_off: u32 = 0;

        let mut size;
        if is_block {
            size = sysio::blk_size64(fd).unwrap_or_else(|err| {
                warn!(%err, "block size ioctl failed, falling back to stat size");
                meta.size()
            });
            phys_sector_size = sysio::blk_phys_sector_size(fd).unwrap_or_else(|err| {
                warn!(%err, "physical sector size ioctl failed");
                sector_size
            });
        } else {
            size = meta.size();
            phys_sector_size = meta.blksize() as u32;
        }

        if let Some(sizes) = config.sector_sizes {
            crate::config::validate_sector_sizes(sizes)?;
            sector_size = sizes.logical;
            phys_sector_size = sizes.physical;
        }

        if !is_block {
            let sectsz = sector_size as u64;
            if size < sectsz || size % sectsz != 0 {
                return Err(BlockError::Config(format!(
                    "backing size {size} is not a multiple of the {sectsz}-byte sector size"
                )));
            }
        }

        let mut can_discard = config.discard.is_some();
        if can_discard && is_block {
            // Probe with a zero-length discard.
            if let Err(err) = sysio::blk_discard(fd, 0, 0) {
                warn!(%err, "backing does not support discard");
                can_discard = false;
            }
        }
        let params = config.discard.unwrap_or_default();
        let max_discard_sectors = params
            .max_sectors
            .map(u64::from)
            .unwrap_or(size / DISCARD_SECTOR_SIZE);
        let max_discard_segments = params.max_segments.unwrap_or(1);
        let discard_sector_alignment = params.sector_alignment.unwrap_or(0);

        let mut sub_range_start = 0;
        let mut locked_range = None;
        if let Some(range) = config.sub_range {
            let start = range.start_sectors * sector_size as u64;
            let len = range.size_sectors * sector_size as u64;
            if let Err(err) = sysio::lock_sub_range(fd, start, len, read_only) {
                error!(
                    path = %config.path.display(),
                    start,
                    len,
                    %err,
                    "backing sub-range is locked by another process"
                );
                std::process::exit(1);
            }
            sub_range_start = start;
            size = len;
            locked_range = Some((start, len));
        }

        let ordered = match config.aio {
            // Kernel-unordered completion makes the gate meaningless.
            AioMode::IoUring => false,
            AioMode::ThreadPool => config.ordered,
        };

        let shared = Arc::new(ContextShared {
            file,
            is_block,
            read_only,
            can_discard,
            size,
            sector_size,
            phys_sector_size,
            phys_sector_off,
            sub_range_start,
            locked_range,
            max_discard_sectors,
            max_discard_segments,
            discard_sector_alignment,
            bypass_host_cache: config.bypass_host_cache,
            aio: config.aio,
            write_cache: AtomicBool::new(config.writeback),
            stats: BackendStats::default(),
        });

        let queue_count = queue_count.max(1);
        let queues: Vec<Arc<BlockQueue>> = (0..queue_count)
            .map(|q| Arc::new(BlockQueue::new(q as u16, ordered)))
            .collect();

        let mut ctx = Self {
            shared,
            queues,
            reactor,
            ring_fds: vec![None; queue_count],
            closed: false,
        };

        for q in 0..queue_count {
            let result = match config.aio {
                AioMode::ThreadPool => {
                    thread_pool::spawn_workers(&ctx.shared, &ctx.queues[q], ident)
                }
                AioMode::IoUring => {
                    #[cfg(feature = "uring")]
                    {
                        let reactor = ctx.reactor.as_ref().expect("checked above");
                        crate::uring::init_queue(&ctx.shared, &ctx.queues[q], reactor)
                            .map(|fds| ctx.ring_fds[q] = Some(fds))
                    }
                    #[cfg(not(feature = "uring"))]
                    unreachable!("rejected above")
                }
            };
            if let Err(err) = result {
                ctx.shutdown();
                return Err(err);
            }
        }

        info!(
            path = %config.path.display(),
            size = ctx.shared.size,
            sector_size = ctx.shared.sector_size,
            queues = queue_count,
            aio = ?config.aio,
            read_only,
            "backing opened"
        );
        Ok(ctx)
    }

    /// Parses an option string and opens the described backing.
    pub fn open_optstr(
        optstr: &str,
        ident: &str,
        queue_count: usize,
        reactor: Option<Arc<dyn Reactor>>,
    ) -> BlockResult<Self> {
        let config = BlockDeviceConfig::parse(optstr)?;
        Self::open(&config, ident, queue_count, reactor)
    }

    fn submit(
        &self,
        op: BlockOp,
        mut req: BlockRequest,
        callback: IoCallback,
    ) -> Result<(), SubmitError> {
        let qidx = req.qidx;
        let Some(queue) = self.queues.get(qidx as usize) else {
            return Err(SubmitError {
                error: BlockError::InvalidQueue {
                    qidx,
                    queues: self.queues.len(),
                },
                request: req,
                callback,
            });
        };

        if matches!(op, BlockOp::Read | BlockOp::Write) {
            align::classify(
                &mut req,
                self.shared.sector_size,
                self.shared.sub_range_start,
                self.shared.bypass_host_cache,
            );
            if req.align.need_conversion {
                if let Err(error) = align::allocate_bounce(&mut req) {
                    return Err(SubmitError {
                        error,
                        request: req,
                        callback,
                    });
                }
                if op == BlockOp::Write {
                    if let Err(error) = align::fill_bounce_for_write(self.shared.fd(), &mut req) {
                        return Err(SubmitError {
                            error,
                            request: req,
                            callback,
                        });
                    }
                }
                self.shared.stats.record_bounce();
            }
        }

        let mut inner = queue.lock();
        match inner.enqueue(req, callback, op) {
            Err((request, callback)) => {
                drop(inner);
                self.shared.stats.record_reject();
                Err(SubmitError {
                    error: BlockError::QueueFull { qidx },
                    request,
                    callback,
                })
            }
            Ok(dispatchable) => {
                match self.shared.aio {
                    AioMode::ThreadPool => {
                        if dispatchable {
                            queue.cond.notify_one();
                        }
                        drop(inner);
                    }
                    AioMode::IoUring => {
                        #[cfg(feature = "uring")]
                        {
                            let completions = if dispatchable {
                                crate::uring::kick(&self.shared, &mut inner)
                            } else {
                                Vec::new()
                            };
                            drop(inner);
                            for (req, cb, res) in completions {
                                cb(req, res);
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Submits an asynchronous read. The callback fires exactly once with
    /// the request and its outcome.
    pub fn read<F>(&self, req: BlockRequest, callback: F) -> Result<(), SubmitError>
    where
        F: FnOnce(BlockRequest, BlockResult<()>) + Send + 'static,
    {
        self.submit(BlockOp::Read, req, Box::new(callback))
    }

    /// Submits an asynchronous write. With the write cache disabled the
    /// data is fsynced before the callback reports success.
    pub fn write<F>(&self, req: BlockRequest, callback: F) -> Result<(), SubmitError>
    where
        F: FnOnce(BlockRequest, BlockResult<()>) + Send + 'static,
    {
        self.submit(BlockOp::Write, req, Box::new(callback))
    }

    /// Submits an asynchronous flush.
    pub fn flush<F>(&self, req: BlockRequest, callback: F) -> Result<(), SubmitError>
    where
        F: FnOnce(BlockRequest, BlockResult<()>) + Send + 'static,
    {
        self.submit(BlockOp::Flush, req, Box::new(callback))
    }

    /// Submits an asynchronous discard. A single buffer segment is decoded
    /// as packed [`crate::DiscardRange`] records; otherwise the range is
    /// taken from the request's offset and `resid`.
    pub fn discard<F>(&self, req: BlockRequest, callback: F) -> Result<(), SubmitError>
    where
        F: FnOnce(BlockRequest, BlockResult<()>) + Send + 'static,
    {
        self.submit(BlockOp::Discard, req, Box::new(callback))
    }

    /// Cancels a request by id on the given queue.
    ///
    /// A still-queued request is withdrawn and returned; its callback is
    /// dropped unrun. An executing request is interrupted (thread-pool
    /// engine only) and reported [`CancelOutcome::InFlight`]; its callback
    /// still fires exactly once from the engine's completion path.
    pub fn cancel(&self, qidx: u16, id: ReqId) -> BlockResult<CancelOutcome> {
        let Some(queue) = self.queues.get(qidx as usize) else {
            return Err(BlockError::InvalidQueue {
                qidx,
                queues: self.queues.len(),
            });
        };

        let mut inner = queue.lock();
        if let Some(idx) = inner.find_queued(id) {
            let (req, _callback) = inner.take_job(idx);
            inner.complete(idx);
            self.shared.stats.record_cancel();
            return Ok(CancelOutcome::Cancelled(req));
        }

        if let Some(idx) = inner.find_busy(id) {
            match self.shared.aio {
                AioMode::ThreadPool => {
                    let worker = inner.slots[idx].worker;
                    let status = Arc::clone(&inner.slots[idx].status);
                    // Holding the queue lock keeps the slot pinned while we
                    // wait for the worker to publish completion.
                    cancel::interrupt_until_done(worker, &status);
                }
                // A submitted ring entry cannot be recalled; the reap path
                // will run the callback.
                AioMode::IoUring => {}
            }
            return Ok(CancelOutcome::InFlight);
        }

        Ok(CancelOutcome::NotFound)
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for (q, queue) in self.queues.iter().enumerate() {
            {
                let mut inner = queue.lock();
                inner.closing = true;
            }
            queue.cond.notify_all();

            match self.shared.aio {
                AioMode::ThreadPool => {
                    let handles: Vec<_> =
                        queue.workers.lock().expect("worker list poisoned").drain(..).collect();
                    for handle in handles {
                        let _ = handle.join();
                    }
                }
                AioMode::IoUring => {
                    if let (Some(reactor), Some((ring_fd, kick_fd))) =
                        (self.reactor.as_ref(), self.ring_fds[q])
                    {
                        if let Err(err) = reactor.unregister(ring_fd) {
                            warn!(%err, "failed to unregister ring fd");
                        }
                        if let Err(err) = reactor.unregister(kick_fd) {
                            warn!(%err, "failed to unregister kick fd");
                        }
                    }
                    #[cfg(feature = "uring")]
                    {
                        queue.lock().ring = None;
                    }
                }
            }
        }

        if let Some((start, len)) = self.shared.locked_range {
            debug!(start, len, "releasing sub-range lock");
            if let Err(err) = sysio::unlock_sub_range(self.shared.fd(), start, len) {
                warn!(%err, "failed to release sub-range lock");
            }
        }
    }

    /// Tears down the engine and closes the backing descriptor. Queued
    /// requests are abandoned without callbacks; quiesce submissions first.
    pub fn close(mut self) {
        self.shutdown();
    }

    /// Logical size of the backing (or of the configured sub-range).
    pub fn size(&self) -> u64 {
        self.shared.size
    }

    /// Logical sector size.
    pub fn sector_size(&self) -> u32 {
        self.shared.sector_size
    }

    /// Physical sector size.
    pub fn physical_sector_size(&self) -> u32 {
        self.shared.phys_sector_size
    }

    /// Physical sector offset.
    pub fn physical_sector_offset(&self) -> u32 {
        self.shared.phys_sector_off
    }

    /// Requests a queue can hold before reporting full.
    pub fn queue_capacity(&self) -> usize {
        MAX_QUEUED_REQUESTS - 1
    }

    /// Number of dispatch queues.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Whether the backing is read-only.
    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    /// Whether discard is advertised and supported by the backing.
    pub fn can_discard(&self) -> bool {
        self.shared.can_discard
    }

    /// Maximum sectors per discard range.
    pub fn max_discard_sectors(&self) -> u64 {
        self.shared.max_discard_sectors
    }

    /// Maximum ranges per discard request.
    pub fn max_discard_segments(&self) -> u32 {
        self.shared.max_discard_segments
    }

    /// Required starting-sector alignment for discards; 0 when unchecked.
    pub fn discard_sector_alignment(&self) -> u32 {
        self.shared.discard_sector_alignment
    }

    /// Current write-cache state.
    pub fn write_cache(&self) -> bool {
        self.shared.write_cache()
    }

    /// Switches between writeback and write-through at runtime.
    pub fn set_write_cache(&self, enabled: bool) {
        self.shared.set_write_cache(enabled);
    }

    /// Synchronously flushes the whole backing.
    pub fn flush_all(&self) -> BlockResult<()> {
        sysio::fsync(self.shared.fd())?;
        Ok(())
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot::from(&self.shared.stats)
    }

    /// Virtual CHS geometry for the backing, clamped to the largest
    /// addressable CHS disk.
    pub fn geometry(&self) -> Geometry {
        let mut sectors = self.shared.size / self.shared.sector_size as u64;
        if sectors > 65535 * 16 * 255 {
            sectors = 65535 * 16 * 255;
        }

        let (secpt, heads, hcyl) = if sectors >= 65536 * 16 * 63 {
            let secpt = 255u64;
            (secpt, 16u64, sectors / secpt)
        } else {
            let mut secpt = 17u64;
            let mut hcyl = sectors / secpt;
            let mut heads = (hcyl + 1023) / 1024;
            if heads < 4 {
                heads = 4;
            }
            if hcyl >= heads * 1024 || heads > 16 {
                secpt = 31;
                heads = 16;
                hcyl = sectors / secpt;
            }
            if hcyl >= heads * 1024 {
                secpt = 63;
                heads = 16;
                hcyl = sectors / secpt;
            }
            (secpt, heads, hcyl)
        };

        Geometry {
            cylinders: (hcyl / heads) as u16,
            heads: heads as u8,
            sectors: secpt as u8,
        }
    }
}

impl Drop for BlockContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BlockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockContext")
            .field("size", &self.shared.size)
            .field("sector_size", &self.shared.sector_size)
            .field("queues", &self.queues.len())
            .field("aio", &self.shared.aio)
            .field("read_only", &self.shared.read_only)
            .finish_non_exhaustive()
    }
}
