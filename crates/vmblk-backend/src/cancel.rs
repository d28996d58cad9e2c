//! Signal-based interruption of in-flight thread-pool requests.
//!
//! A cancelling thread publishes a wait record onto a process-wide lock-free
//! stack and sends SIGCONT to the worker that owns the slot. The handler,
//! running on the interrupted worker, pops the entire stack and clears each
//! record's pending flag; the interrupted positional syscall fails with
//! EINTR and the worker finishes the request through its normal completion
//! path. The canceller re-checks the slot and repeats until the worker has
//! published the done state.
//!
//! The handler body is restricted to atomic operations. The process must
//! not repurpose SIGCONT.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::Once;
use std::time::Duration;

use tracing::debug;

use crate::queue::SlotState;

struct WaitRecord {
    next: *mut WaitRecord,
    pending: AtomicBool,
}

static WAITERS: AtomicPtr<WaitRecord> = AtomicPtr::new(ptr::null_mut());
static INSTALL: Once = Once::new();

/// Installs the SIGCONT handler once per process. Safe to call from every
/// open.
pub(crate) fn install_handler() {
    INSTALL.call_once(|| {
        let handler: extern "C" fn(libc::c_int) = sigcont_handler;
        // SAFETY: sigaction with a handler that only performs atomic
        // operations. SA_RESTART is deliberately absent so the signal
        // interrupts blocking positional I/O.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGCONT, &action, ptr::null_mut()) != 0 {
                debug!("failed to install SIGCONT handler: {}", std::io::Error::last_os_error());
            }
        }
    });
}

extern "C" fn sigcont_handler(_sig: libc::c_int) {
    // Pop every record, even those published for other workers; a spurious
    // wakeup re-checks its slot and republishes.
    loop {
        let head = WAITERS.load(Ordering::Acquire);
        if head.is_null() {
            return;
        }
        // SAFETY: a record stays alive until its pending flag is cleared
        // below, and the flag is only cleared by the handler that popped it.
        let next = unsafe { (*head).next };
        if WAITERS
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            unsafe { (*head).pending.store(false, Ordering::Release) };
        }
    }
}

/// Repeatedly interrupts `worker` until the slot whose status is `status`
/// leaves the busy state.
///
/// The caller holds the queue mutex, which keeps the slot from being
/// recycled while its status is watched; the worker publishes done without
/// taking the mutex.
pub(crate) fn interrupt_until_done(worker: libc::pthread_t, status: &AtomicU8) {
    while SlotState::from_u8(status.load(Ordering::Acquire)) == SlotState::Busy {
        let mut record = WaitRecord {
            next: ptr::null_mut(),
            pending: AtomicBool::new(true),
        };

        loop {
            let head = WAITERS.load(Ordering::Acquire);
            record.next = head;
            if WAITERS
                .compare_exchange(head, &mut record, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        // SAFETY: worker is the pthread id recorded at dequeue; workers
        // stay alive while they own a busy slot. If the send fails anyway,
        // raise on the calling thread so our own handler drains the stack
        // and the record cannot dangle.
        let sent = unsafe { libc::pthread_kill(worker, libc::SIGCONT) };
        if sent != 0 {
            unsafe { libc::raise(libc::SIGCONT) };
        }

        while record.pending.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_micros(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;

    #[test]
    fn test_returns_immediately_when_not_busy() {
        install_handler();
        let status = AtomicU8::new(SlotState::Done as u8);
        // No signal is needed; the loop condition fails on entry.
        interrupt_until_done(unsafe { libc::pthread_self() }, &status);
    }

    #[test]
    fn test_interrupt_loop_until_worker_publishes_done() {
        install_handler();
        let status = Arc::new(AtomicU8::new(SlotState::Busy as u8));
        let (tid_tx, tid_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let worker_status = Arc::clone(&status);
        let worker = std::thread::spawn(move || {
            tid_tx.send(unsafe { libc::pthread_self() }).unwrap();
            // Simulates a slow syscall; sleep resumes after EINTR.
            std::thread::sleep(Duration::from_millis(50));
            worker_status.store(SlotState::Done as u8, Ordering::Release);
            // Stay alive until the canceller has returned, like a pool
            // worker looping for more work.
            let _ = done_rx.recv();
        });

        let tid = tid_rx.recv().unwrap();
        interrupt_until_done(tid, &status);
        assert_eq!(
            SlotState::from_u8(status.load(Ordering::Acquire)),
            SlotState::Done
        );
        drop(done_tx);
        worker.join().unwrap();
    }
}
