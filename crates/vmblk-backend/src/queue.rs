//! Bounded request queue: slot arena, free/pending/busy lists and the
//! adjacent-range ordering gate.
//!
//! Each queue owns a fixed pool of slots partitioned across three index
//! lists under one mutex. Slot status lives in a per-slot atomic so the
//! busy→done transition can be published by a worker without the lock while
//! a canceller holds it and watches for it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::warn;

use crate::request::{BlockOp, BlockRequest, IoCallback, ReqId};

/// Worker threads serving each queue under the thread-pool engine.
pub(crate) const WORKERS_PER_QUEUE: usize = 8;

/// Request slots per queue: headroom for every worker plus a fixed backlog.
pub(crate) const MAX_QUEUED_REQUESTS: usize = 64 + WORKERS_PER_QUEUE;

/// Ordering key for operations without a byte range; never collides with a
/// real end offset.
const UNORDERED_KEY: u64 = u64::MAX;

/// Slot lifecycle states. Stored as a `u8` in [`Slot::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SlotState {
    /// On the free list, no request attached.
    Free = 0,
    /// On the pending list but held back by the ordering gate.
    Blocked = 1,
    /// On the pending list, eligible for dispatch.
    Pending = 2,
    /// On the busy list, owned by a worker or submitted to the ring.
    Busy = 3,
    /// Execution finished; the owning worker has yet to recycle the slot.
    Done = 4,
}

impl SlotState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotState::Free,
            1 => SlotState::Blocked,
            2 => SlotState::Pending,
            3 => SlotState::Busy,
            _ => SlotState::Done,
        }
    }
}

/// Iovec array kept alive for the duration of a ring submission. The
/// pointers reference the slot's own request buffers (or its bounce
/// buffer), which stay allocated until the slot is recycled.
#[derive(Debug, Default)]
pub(crate) struct FlightIovecs(pub(crate) Vec<libc::iovec>);

// SAFETY: the pointers inside target heap allocations owned by the same
// slot; the array is only touched by whichever thread holds the slot.
unsafe impl Send for FlightIovecs {}

/// One reusable request slot.
pub(crate) struct Slot {
    pub(crate) status: Arc<AtomicU8>,
    pub(crate) req: Option<BlockRequest>,
    pub(crate) callback: Option<IoCallback>,
    pub(crate) op: BlockOp,
    pub(crate) req_id: Option<ReqId>,
    /// End-of-range byte offset used by the ordering gate.
    pub(crate) order_key: u64,
    /// pthread id of the owning worker; 0 when unowned.
    pub(crate) worker: libc::pthread_t,
    /// In-flight iovec storage for the ring engine.
    pub(crate) flight: Option<FlightIovecs>,
}

impl Slot {
    fn new() -> Self {
        Self {
            status: Arc::new(AtomicU8::new(SlotState::Free as u8)),
            req: None,
            callback: None,
            op: BlockOp::Flush,
            req_id: None,
            order_key: 0,
            worker: 0,
            flight: None,
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        SlotState::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SlotState) {
        self.status.store(state as u8, Ordering::Release);
    }
}

/// Mutex-protected queue state.
pub(crate) struct QueueInner {
    pub(crate) slots: Vec<Slot>,
    free: VecDeque<usize>,
    pend: VecDeque<usize>,
    busy: Vec<usize>,
    /// Set by close; workers drain and exit.
    pub(crate) closing: bool,
    /// Outstanding ring submissions.
    pub(crate) in_flight: usize,
    /// Whether the ordering gate applies to this queue.
    ordered: bool,
    /// Ring engine state; `None` under the thread-pool engine.
    #[cfg(feature = "uring")]
    pub(crate) ring: Option<crate::uring::RingState>,
}

impl QueueInner {
    pub(crate) fn new(ordered: bool) -> Self {
        let slots: Vec<Slot> = (0..MAX_QUEUED_REQUESTS).map(|_| Slot::new()).collect();
        Self {
            free: (0..slots.len()).collect(),
            slots,
            pend: VecDeque::new(),
            busy: Vec::new(),
            closing: false,
            in_flight: 0,
            ordered,
            #[cfg(feature = "uring")]
            ring: None,
        }
    }

    /// Attaches a request to a free slot and appends it to the pending
    /// list. Returns whether the slot is immediately dispatchable (`true`)
    /// or held by the ordering gate (`false`). Gives the request and
    /// callback back when the queue is full.
    pub(crate) fn enqueue(
        &mut self,
        req: BlockRequest,
        callback: IoCallback,
        op: BlockOp,
    ) -> Result<bool, (BlockRequest, IoCallback)> {
        let Some(idx) = self.free.pop_front() else {
            warn!(op = %op, "request rejected: no free queue slot");
            return Err((req, callback));
        };

        let order_key = match op {
            BlockOp::Read | BlockOp::Write | BlockOp::Discard => {
                req.offset + req.total_len() as u64
            }
            BlockOp::Flush => UNORDERED_KEY,
        };

        let mut state = SlotState::Pending;
        if self.ordered && self.collides(req.offset) {
            state = SlotState::Blocked;
        }

        let slot = &mut self.slots[idx];
        slot.req_id = Some(req.id);
        slot.req = Some(req);
        slot.callback = Some(callback);
        slot.op = op;
        slot.order_key = order_key;
        slot.worker = 0;
        slot.set_state(state);
        self.pend.push_back(idx);

        Ok(state == SlotState::Pending)
    }

    /// Whether any pending or busy slot's range ends where `offset` starts.
    fn collides(&self, offset: u64) -> bool {
        self.pend
            .iter()
            .chain(self.busy.iter())
            .any(|&i| self.slots[i].order_key == offset)
    }

    /// Moves the first dispatchable pending slot to the busy list and
    /// records the owning worker.
    pub(crate) fn dequeue(&mut self, worker: libc::pthread_t) -> Option<usize> {
        let pos = self
            .pend
            .iter()
            .position(|&i| self.slots[i].state() == SlotState::Pending)?;
        let idx = self.pend.remove(pos).expect("position came from iteration");
        let slot = &mut self.slots[idx];
        slot.worker = worker;
        slot.set_state(SlotState::Busy);
        self.busy.push(idx);
        Some(idx)
    }

    /// Puts a dequeued-but-unsubmitted slot back at the head of the pending
    /// list (ring engine, full submission queue).
    pub(crate) fn requeue_front(&mut self, idx: usize) {
        self.busy.retain(|&i| i != idx);
        let slot = &mut self.slots[idx];
        slot.worker = 0;
        slot.set_state(SlotState::Pending);
        self.pend.push_front(idx);
    }

    /// Takes the request and callback out of a slot for execution.
    pub(crate) fn take_job(&mut self, idx: usize) -> (BlockRequest, IoCallback) {
        let slot = &mut self.slots[idx];
        let req = slot.req.take().expect("slot holds a request");
        let callback = slot.callback.take().expect("slot holds a callback");
        (req, callback)
    }

    /// Recycles a slot: removes it from whichever list owns it, runs the
    /// ordering-gate unblock pass, and returns it to the free list.
    pub(crate) fn complete(&mut self, idx: usize) {
        match self.slots[idx].state() {
            SlotState::Busy | SlotState::Done => self.busy.retain(|&i| i != idx),
            _ => {
                if let Some(pos) = self.pend.iter().position(|&i| i == idx) {
                    self.pend.remove(pos);
                }
            }
        }

        if self.ordered {
            let key = self.slots[idx].order_key;
            for &i in &self.pend {
                let slot = &self.slots[i];
                if slot.state() == SlotState::Blocked {
                    if let Some(req) = slot.req.as_ref() {
                        if req.offset == key {
                            slot.set_state(SlotState::Pending);
                        }
                    }
                }
            }
        }

        let slot = &mut self.slots[idx];
        slot.req = None;
        slot.callback = None;
        slot.req_id = None;
        slot.order_key = 0;
        slot.worker = 0;
        slot.flight = None;
        slot.set_state(SlotState::Free);
        self.free.push_back(idx);
    }

    /// Finds a still-queued (pending or blocked) slot by request id.
    pub(crate) fn find_queued(&self, id: ReqId) -> Option<usize> {
        self.pend
            .iter()
            .copied()
            .find(|&i| self.slots[i].req_id == Some(id))
    }

    /// Finds an executing slot by request id.
    pub(crate) fn find_busy(&self, id: ReqId) -> Option<usize> {
        self.busy
            .iter()
            .copied()
            .find(|&i| self.slots[i].req_id == Some(id))
    }

    /// Whether any slot sits on the pending list.
    pub(crate) fn has_pending(&self) -> bool {
        !self.pend.is_empty()
    }

    #[cfg(test)]
    fn list_lens(&self) -> (usize, usize, usize) {
        (self.free.len(), self.pend.len(), self.busy.len())
    }
}

/// One dispatch queue: protected state, worker wakeup and (for the
/// thread-pool engine) the worker handles.
pub(crate) struct BlockQueue {
    pub(crate) qidx: u16,
    pub(crate) inner: Mutex<QueueInner>,
    pub(crate) cond: Condvar,
    pub(crate) workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockQueue {
    pub(crate) fn new(qidx: u16, ordered: bool) -> Self {
        Self {
            qidx,
            inner: Mutex::new(QueueInner::new(ordered)),
            cond: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue mutex poisoned")
    }
}

impl std::fmt::Debug for BlockQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockQueue")
            .field("qidx", &self.qidx)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ReqIdGen;

    fn noop_callback() -> IoCallback {
        Box::new(|_req, _res| {})
    }

    fn make_req(ids: &ReqIdGen, offset: u64, len: usize) -> BlockRequest {
        BlockRequest::new(ids.next_id(), 0, offset, vec![vec![0u8; len]])
    }

    #[test]
    fn test_capacity_and_partition_invariant() {
        let ids = ReqIdGen::new();
        let mut q = QueueInner::new(true);
        assert_eq!(q.list_lens(), (MAX_QUEUED_REQUESTS, 0, 0));

        for i in 0..MAX_QUEUED_REQUESTS {
            // Disjoint, non-meeting ranges: all stay dispatchable.
            q.enqueue(
                make_req(&ids, (i as u64) * 8192, 512),
                noop_callback(),
                BlockOp::Read,
            )
            .map_err(|_| ())
            .unwrap();
        }
        let (free, pend, busy) = q.list_lens();
        assert_eq!((free, pend, busy), (0, MAX_QUEUED_REQUESTS, 0));

        // One more submission bounces without consuming anything.
        assert!(q
            .enqueue(make_req(&ids, 0, 512), noop_callback(), BlockOp::Read)
            .is_err());
        assert_eq!(q.list_lens(), (0, MAX_QUEUED_REQUESTS, 0));
    }

    #[test]
    fn test_slot_cycle_returns_to_free() {
        let ids = ReqIdGen::new();
        let mut q = QueueInner::new(true);
        q.enqueue(make_req(&ids, 0, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap();

        let idx = q.dequeue(1).unwrap();
        assert_eq!(q.slots[idx].state(), SlotState::Busy);
        assert_eq!(q.slots[idx].worker, 1);
        assert_eq!(q.list_lens(), (MAX_QUEUED_REQUESTS - 1, 0, 1));

        let (_req, _cb) = q.take_job(idx);
        q.slots[idx].set_state(SlotState::Done);
        q.complete(idx);
        assert_eq!(q.slots[idx].state(), SlotState::Free);
        assert_eq!(q.list_lens(), (MAX_QUEUED_REQUESTS, 0, 0));
    }

    #[test]
    fn test_gate_blocks_meeting_range_while_pending() {
        let ids = ReqIdGen::new();
        let mut q = QueueInner::new(true);
        let kick_a = q
            .enqueue(make_req(&ids, 0, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap();
        assert!(kick_a);

        // B starts exactly where A ends.
        let kick_b = q
            .enqueue(make_req(&ids, 512, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap();
        assert!(!kick_b);

        // Only A is dispatchable.
        let a = q.dequeue(1).unwrap();
        assert!(q.dequeue(2).is_none());

        // Completing A releases B.
        let _ = q.take_job(a);
        q.slots[a].set_state(SlotState::Done);
        q.complete(a);
        let b = q.dequeue(2).unwrap();
        assert_eq!(q.slots[b].state(), SlotState::Busy);
    }

    #[test]
    fn test_gate_blocks_against_busy_predecessor() {
        let ids = ReqIdGen::new();
        let mut q = QueueInner::new(true);
        q.enqueue(make_req(&ids, 0, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap();
        let a = q.dequeue(1).unwrap();

        let kick = q
            .enqueue(make_req(&ids, 512, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap();
        assert!(!kick);

        let _ = q.take_job(a);
        q.slots[a].set_state(SlotState::Done);
        q.complete(a);
        assert!(q.dequeue(1).is_some());
    }

    #[test]
    fn test_gate_ignores_non_meeting_ranges() {
        let ids = ReqIdGen::new();
        let mut q = QueueInner::new(true);
        q.enqueue(make_req(&ids, 0, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap();
        // Overlapping but not meeting: not serialized.
        assert!(q
            .enqueue(make_req(&ids, 256, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap());
        // Disjoint: not serialized.
        assert!(q
            .enqueue(make_req(&ids, 4096, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap());
    }

    #[test]
    fn test_gate_disabled_never_blocks() {
        let ids = ReqIdGen::new();
        let mut q = QueueInner::new(false);
        q.enqueue(make_req(&ids, 0, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap();
        assert!(q
            .enqueue(make_req(&ids, 512, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap());
    }

    #[test]
    fn test_flush_neither_blocks_nor_unblocks() {
        let ids = ReqIdGen::new();
        let mut q = QueueInner::new(true);
        // A flush enqueued alongside writes stays dispatchable.
        q.enqueue(make_req(&ids, 0, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap();
        assert!(q
            .enqueue(BlockRequest::flush(ids.next_id(), 0), noop_callback(), BlockOp::Flush)
            .map_err(|_| ()).unwrap());

        // A blocked write at the flush's offset is not released by the
        // flush completing.
        assert!(!q
            .enqueue(make_req(&ids, 512, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap());
        let flush_idx = q
            .pend
            .iter()
            .copied()
            .find(|&i| q.slots[i].op == BlockOp::Flush)
            .unwrap();
        q.slots[flush_idx].set_state(SlotState::Done);
        q.busy.push(flush_idx);
        q.pend.retain(|&i| i != flush_idx);
        q.complete(flush_idx);

        let blocked = q
            .pend
            .iter()
            .copied()
            .find(|&i| q.slots[i].state() == SlotState::Blocked);
        assert!(blocked.is_some());
    }

    #[test]
    fn test_unblock_is_one_to_many() {
        let ids = ReqIdGen::new();
        let mut q = QueueInner::new(true);
        q.enqueue(make_req(&ids, 0, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap();
        // Two successors both starting at A's end.
        assert!(!q
            .enqueue(make_req(&ids, 512, 512), noop_callback(), BlockOp::Write)
            .map_err(|_| ()).unwrap());
        assert!(!q
            .enqueue(make_req(&ids, 512, 1024), noop_callback(), BlockOp::Read)
            .map_err(|_| ()).unwrap());

        let a = q.dequeue(1).unwrap();
        let _ = q.take_job(a);
        q.slots[a].set_state(SlotState::Done);
        q.complete(a);

        assert!(q.dequeue(1).is_some());
        assert!(q.dequeue(1).is_some());
    }

    #[test]
    fn test_cancel_lookup_by_id() {
        let ids = ReqIdGen::new();
        let mut q = QueueInner::new(true);
        let req = make_req(&ids, 0, 512);
        let id = req.id;
        q.enqueue(req, noop_callback(), BlockOp::Read).map_err(|_| ()).unwrap();

        let idx = q.find_queued(id).unwrap();
        assert!(q.find_busy(id).is_none());

        let (back, _cb) = q.take_job(idx);
        assert_eq!(back.id, id);
        q.complete(idx);
        assert!(q.find_queued(id).is_none());
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let ids = ReqIdGen::new();
        let mut q = QueueInner::new(false);
        let first = make_req(&ids, 0, 512);
        let first_id = first.id;
        q.enqueue(first, noop_callback(), BlockOp::Read).map_err(|_| ()).unwrap();
        q.enqueue(make_req(&ids, 8192, 512), noop_callback(), BlockOp::Read)
            .map_err(|_| ()).unwrap();

        let idx = q.dequeue(0).unwrap();
        assert_eq!(q.slots[idx].req_id, Some(first_id));
        q.requeue_front(idx);

        // The requeued slot dispatches before the younger one again.
        let again = q.dequeue(0).unwrap();
        assert_eq!(q.slots[again].req_id, Some(first_id));
    }
}
