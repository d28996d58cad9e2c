//! Worker-thread execution engine: synchronous positional vector I/O.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::align;
use crate::context::ContextShared;
use crate::discard;
use crate::error::{BlockError, BlockResult};
use crate::queue::{BlockQueue, SlotState, WORKERS_PER_QUEUE};
use crate::request::{BlockOp, BlockRequest};
use crate::sysio;

/// Spawns the fixed worker pool for one queue.
pub(crate) fn spawn_workers(
    ctx: &Arc<ContextShared>,
    queue: &Arc<BlockQueue>,
    ident: &str,
) -> BlockResult<()> {
    let mut workers = queue.workers.lock().expect("worker list poisoned");
    for i in 0..WORKERS_PER_QUEUE {
        let name = format!("blk-{ident}-{}-{i}", queue.qidx);
        let ctx = Arc::clone(ctx);
        let queue = Arc::clone(queue);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(ctx, queue))
            .map_err(BlockError::Io)?;
        workers.push(handle);
    }
    Ok(())
}

fn worker_loop(ctx: Arc<ContextShared>, queue: Arc<BlockQueue>) {
    let tid = unsafe { libc::pthread_self() };
    let mut inner = queue.lock();

    loop {
        while let Some(idx) = inner.dequeue(tid) {
            let op = inner.slots[idx].op;
            let status = Arc::clone(&inner.slots[idx].status);
            let (mut req, callback) = inner.take_job(idx);
            drop(inner);

            let result = execute(&ctx, op, &mut req);
            // Published without the lock so a canceller holding it can
            // observe the transition.
            status.store(SlotState::Done as u8, Ordering::Release);
            callback(req, result);

            inner = queue.lock();
            inner.complete(idx);
        }
        if inner.closing {
            break;
        }
        inner = queue.cond.wait(inner).expect("queue mutex poisoned");
    }

    debug!(qidx = queue.qidx, "worker exiting");
}

/// Runs one request to completion on the calling thread. Also used by the
/// ring engine for the operations the ring does not support.
pub(crate) fn execute(ctx: &ContextShared, op: BlockOp, req: &mut BlockRequest) -> BlockResult<()> {
    let result = match op {
        BlockOp::Read => do_rw(ctx, req, false),
        BlockOp::Write => {
            if ctx.read_only {
                Err(BlockError::ReadOnly)
            } else {
                do_rw(ctx, req, true)
            }
        }
        BlockOp::Flush => sysio::fsync(ctx.fd()).map_err(BlockError::Io).map(|()| {
            ctx.stats.record_flush();
        }),
        BlockOp::Discard => discard::process_discard(ctx, req).map(|()| {
            ctx.stats.record_discard();
        }),
    };

    if let Err(err) = &result {
        ctx.stats.record_error();
        warn!(op = %op, %err, "request failed");
    }
    result
}

fn do_rw(ctx: &ContextShared, req: &mut BlockRequest, is_write: bool) -> BlockResult<()> {
    let fd = ctx.fd();
    let converted = req.align.need_conversion;

    let (iovecs, offset) = if converted {
        let bounce = req.align.bounce.as_mut().expect("converted request has a bounce");
        let iov = vec![libc::iovec {
            iov_base: bounce.as_mut_ptr() as *mut libc::c_void,
            iov_len: bounce.len(),
        }];
        (iov, req.align.aligned_start)
    } else {
        (
            sysio::iovecs_from_bufs(&mut req.bufs),
            req.offset + ctx.sub_range_start,
        )
    };

    let io_result = if is_write {
        sysio::pwritev(fd, &iovecs, offset)
    } else {
        sysio::preadv(fd, &iovecs, offset)
    };
    drop(iovecs);

    match io_result {
        Ok(len) => {
            if !is_write && converted {
                align::complete_bounced_read(req);
            }
            req.align.bounce = None;

            if is_write {
                ctx.flush_cache()?;
            }

            let moved = align::transferred(&req.align, len);
            req.resid = req.resid.saturating_sub(moved);
            if is_write {
                ctx.stats.record_write(moved as u64);
            } else {
                ctx.stats.record_read(moved as u64);
            }
            Ok(())
        }
        Err(err) => {
            req.align.bounce = None;
            Err(err.into())
        }
    }
}
