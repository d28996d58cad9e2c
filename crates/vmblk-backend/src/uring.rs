//! Kernel submission-ring execution engine.
//!
//! One ring per queue. Submission fills entries FIFO from the pending list;
//! the kernel may complete them in any order, which is why the ordering
//! gate is disabled for this engine. Completion readiness arrives through
//! the external reactor watching the ring fd; a second, engine-owned
//! eventfd is used as a self-kick so a drain stopped by a full submission
//! queue resumes without depending on further completions.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use io_uring::{opcode, squeue, types, IoUring};
use tracing::{debug, warn};

use crate::align;
use crate::context::ContextShared;
use crate::error::{BlockError, BlockResult};
use crate::queue::{BlockQueue, FlightIovecs, QueueInner, SlotState};
use crate::reactor::Reactor;
use crate::request::{BlockOp, BlockRequest, IoCallback};
use crate::sysio;
use crate::thread_pool;

/// Submission/completion queue depth per ring.
pub(crate) const RING_ENTRIES: u32 = 256;

/// Per-queue ring engine state, stored inside the queue lock.
pub(crate) struct RingState {
    ring: IoUring,
    kick_fd: OwnedFd,
}

impl RingState {
    fn new() -> BlockResult<Self> {
        // SQPOLL/IOPOLL stay off: they only pay for themselves with
        // dedicated cores.
        let ring = IoUring::new(RING_ENTRIES).map_err(BlockError::Io)?;
        let kick_fd = sysio::eventfd().map_err(BlockError::Io)?;
        Ok(Self { ring, kick_fd })
    }
}

/// A finished request ready for its callback, collected while the queue
/// lock is held and fired after it drops.
pub(crate) type Completion = (BlockRequest, IoCallback, BlockResult<()>);

/// Creates the ring for a queue and registers it (and its kick eventfd)
/// with the reactor. Returns the fds for unregistration at close.
pub(crate) fn init_queue(
    ctx: &Arc<ContextShared>,
    queue: &Arc<BlockQueue>,
    reactor: &Arc<dyn Reactor>,
) -> BlockResult<(RawFd, RawFd)> {
    let state = RingState::new()?;
    let ring_fd = state.ring.as_raw_fd();
    let kick_fd = state.kick_fd.as_raw_fd();
    queue.lock().ring = Some(state);

    for fd in [ring_fd, kick_fd] {
        let ctx = Arc::clone(ctx);
        let queue = Arc::clone(queue);
        reactor.register(fd, Box::new(move || on_ready(&ctx, &queue)))?;
    }
    debug!(qidx = queue.qidx, ring_fd, "ring engine initialised");
    Ok((ring_fd, kick_fd))
}

/// Reactor upcall: reap completions, then resubmit still-pending work.
fn on_ready(ctx: &Arc<ContextShared>, queue: &Arc<BlockQueue>) {
    let mut inner = queue.lock();
    let Some(mut state) = inner.ring.take() else {
        return;
    };
    sysio::eventfd_drain(state.kick_fd.as_raw_fd());

    let mut completions = Vec::new();
    reap(ctx, &mut state, &mut inner, &mut completions);
    if inner.has_pending() && !inner.closing {
        submit(ctx, &mut state, &mut inner, &mut completions);
    }
    inner.ring = Some(state);
    drop(inner);

    for (req, callback, result) in completions {
        callback(req, result);
    }
}

/// Submission-path kick: drain the pending list, then reap anything that
/// already finished. Runs under the queue lock; returns the callbacks to
/// fire once the caller drops it.
pub(crate) fn kick(ctx: &Arc<ContextShared>, inner: &mut QueueInner) -> Vec<Completion> {
    let Some(mut state) = inner.ring.take() else {
        return Vec::new();
    };
    let mut completions = Vec::new();
    submit(ctx, &mut state, inner, &mut completions);
    if inner.in_flight > 0 {
        reap(ctx, &mut state, inner, &mut completions);
    }
    inner.ring = Some(state);
    completions
}

fn finish_inline(
    inner: &mut QueueInner,
    idx: usize,
    result: BlockResult<()>,
    out: &mut Vec<Completion>,
) {
    let (req, callback) = inner.take_job(idx);
    inner.slots[idx].set_state(SlotState::Done);
    inner.complete(idx);
    out.push((req, callback, result));
}

fn submit(
    ctx: &ContextShared,
    state: &mut RingState,
    inner: &mut QueueInner,
    out: &mut Vec<Completion>,
) {
    let fd = ctx.fd();

    while let Some(idx) = inner.dequeue(0) {
        let op = inner.slots[idx].op;
        match op {
            BlockOp::Read | BlockOp::Write | BlockOp::Flush => {
                if op == BlockOp::Write && ctx.read_only {
                    ctx.stats.record_error();
                    finish_inline(inner, idx, Err(BlockError::ReadOnly), out);
                    continue;
                }

                let entry = build_entry(fd, ctx.sub_range_start, inner, idx, op);
                // SAFETY: the iovec array and the buffers it points at are
                // owned by the slot and stay put until the completion is
                // reaped.
                let pushed = unsafe { state.ring.submission().push(&entry).is_ok() };
                if !pushed {
                    // Full submission queue: put the slot back and arm the
                    // self-kick so the drain resumes even if no further
                    // completion arrives.
                    inner.requeue_front(idx);
                    let _ = sysio::eventfd_write(state.kick_fd.as_raw_fd());
                    break;
                }
                inner.in_flight += 1;
                if let Err(err) = state.ring.submit() {
                    warn!(%err, "ring submit failed");
                }
            }
            BlockOp::Discard => {
                // The ring has no discard support; run it synchronously.
                let (mut req, callback) = inner.take_job(idx);
                let result = thread_pool::execute(ctx, BlockOp::Discard, &mut req);
                inner.slots[idx].set_state(SlotState::Done);
                inner.complete(idx);
                out.push((req, callback, result));
            }
        }
    }
}

fn build_entry(
    fd: RawFd,
    sub_range_start: u64,
    inner: &mut QueueInner,
    idx: usize,
    op: BlockOp,
) -> squeue::Entry {
    if op == BlockOp::Flush {
        return opcode::Fsync::new(types::Fd(fd))
            .flags(types::FsyncFlags::DATASYNC)
            .build()
            .user_data(idx as u64);
    }

    let slot = &mut inner.slots[idx];
    let req = slot.req.as_mut().expect("slot holds a request");

    let (iovecs, offset) = if req.align.need_conversion {
        let bounce = req
            .align
            .bounce
            .as_mut()
            .expect("converted request has a bounce");
        let iov = vec![libc::iovec {
            iov_base: bounce.as_mut_ptr() as *mut libc::c_void,
            iov_len: bounce.len(),
        }];
        (iov, req.align.aligned_start)
    } else {
        (
            sysio::iovecs_from_bufs(&mut req.bufs),
            req.offset + sub_range_start,
        )
    };

    slot.flight = Some(FlightIovecs(iovecs));
    let flight = slot.flight.as_ref().expect("just stored");
    let ptr = flight.0.as_ptr();
    let cnt = flight.0.len() as u32;

    match op {
        BlockOp::Read => opcode::Readv::new(types::Fd(fd), ptr, cnt)
            .offset(offset)
            .build()
            .user_data(idx as u64),
        BlockOp::Write => opcode::Writev::new(types::Fd(fd), ptr, cnt)
            .offset(offset)
            .build()
            .user_data(idx as u64),
        _ => unreachable!("only read/write reach the vectored path"),
    }
}

fn reap(
    ctx: &ContextShared,
    state: &mut RingState,
    inner: &mut QueueInner,
    out: &mut Vec<Completion>,
) {
    while let Some(cqe) = state.ring.completion().next() {
        let idx = cqe.user_data() as usize;
        inner.in_flight = inner.in_flight.saturating_sub(1);

        let op = inner.slots[idx].op;
        let (mut req, callback) = inner.take_job(idx);
        let raw = cqe.result();

        let result = if raw < 0 {
            req.align.bounce = None;
            ctx.stats.record_error();
            Err(BlockError::Io(io::Error::from_raw_os_error(-raw)))
        } else {
            if op == BlockOp::Read && req.align.need_conversion {
                align::complete_bounced_read(&mut req);
            }
            req.align.bounce = None;

            let flushed = if op == BlockOp::Write {
                ctx.flush_cache()
            } else {
                Ok(())
            };
            match flushed {
                Ok(()) => {
                    let moved = align::transferred(&req.align, raw as usize);
                    match op {
                        BlockOp::Read => {
                            req.resid = req.resid.saturating_sub(moved);
                            ctx.stats.record_read(moved as u64);
                        }
                        BlockOp::Write => {
                            req.resid = req.resid.saturating_sub(moved);
                            ctx.stats.record_write(moved as u64);
                        }
                        BlockOp::Flush => ctx.stats.record_flush(),
                        BlockOp::Discard => {}
                    }
                    Ok(())
                }
                Err(err) => {
                    ctx.stats.record_error();
                    Err(err)
                }
            }
        };

        inner.slots[idx].set_state(SlotState::Done);
        inner.complete(idx);
        out.push((req, callback, result));
    }
}
