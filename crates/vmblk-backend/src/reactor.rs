//! Completion-readiness reactor consumed by the ring engine.
//!
//! The engine only needs two upcalls: register a file descriptor with a
//! callback to run when it becomes readable, and unregister it again.
//! [`EpollReactor`] is the stock implementation: a dispatch thread parked in
//! `epoll_wait`, woken through an eventfd for registration changes and
//! shutdown.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::{BlockError, BlockResult};
use crate::sysio;

/// Callback invoked when a registered descriptor becomes readable.
pub type ReadyCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// The event-loop interface the ring engine drives completions through.
pub trait Reactor: Send + Sync {
    /// Registers `fd`; `callback` runs on the reactor thread whenever the
    /// descriptor is readable.
    fn register(&self, fd: RawFd, callback: ReadyCallback) -> BlockResult<()>;

    /// Removes a previously registered descriptor. No callback for `fd`
    /// starts after this returns, though one may be mid-flight.
    fn unregister(&self, fd: RawFd) -> BlockResult<()>;
}

struct ReactorShared {
    epfd: OwnedFd,
    wake: OwnedFd,
    handlers: Mutex<HashMap<RawFd, Arc<dyn Fn() + Send + Sync>>>,
    closing: AtomicBool,
}

/// Epoll-backed [`Reactor`] with a dedicated dispatch thread.
pub struct EpollReactor {
    shared: Arc<ReactorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn epoll_create() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: freshly created descriptor, exclusively owned.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn epoll_add(epfd: RawFd, fd: RawFd) -> io::Result<()> {
    let mut event = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: fd as u64,
    };
    let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut event) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn epoll_del(epfd: RawFd, fd: RawFd) -> io::Result<()> {
    let ret = unsafe {
        libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl EpollReactor {
    /// Creates the reactor and starts its dispatch thread.
    pub fn new() -> BlockResult<Self> {
        let shared = Arc::new(ReactorShared {
            epfd: epoll_create().map_err(BlockError::Io)?,
            wake: sysio::eventfd().map_err(BlockError::Io)?,
            handlers: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        });
        epoll_add(shared.epfd.as_raw_fd(), shared.wake.as_raw_fd()).map_err(BlockError::Io)?;

        let loop_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("blk-reactor".into())
            .spawn(move || dispatch_loop(loop_shared))
            .map_err(BlockError::Io)?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }
}

fn dispatch_loop(shared: Arc<ReactorShared>) {
    let epfd = shared.epfd.as_raw_fd();
    let wake_fd = shared.wake.as_raw_fd();
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 16];

    loop {
        let n = unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, -1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            warn!(%err, "epoll_wait failed, reactor exiting");
            return;
        }

        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;
            if fd == wake_fd {
                sysio::eventfd_drain(wake_fd);
                if shared.closing.load(Ordering::Acquire) {
                    debug!("reactor shutting down");
                    return;
                }
                continue;
            }

            let handler = {
                let handlers = shared.handlers.lock().expect("handler map poisoned");
                handlers.get(&fd).cloned()
            };
            if let Some(handler) = handler {
                handler();
            }
        }
    }
}

impl Reactor for EpollReactor {
    fn register(&self, fd: RawFd, callback: ReadyCallback) -> BlockResult<()> {
        epoll_add(self.shared.epfd.as_raw_fd(), fd).map_err(BlockError::Io)?;
        self.shared
            .handlers
            .lock()
            .expect("handler map poisoned")
            .insert(fd, Arc::from(callback));
        Ok(())
    }

    fn unregister(&self, fd: RawFd) -> BlockResult<()> {
        epoll_del(self.shared.epfd.as_raw_fd(), fd).map_err(BlockError::Io)?;
        self.shared
            .handlers
            .lock()
            .expect("handler map poisoned")
            .remove(&fd);
        Ok(())
    }
}

impl Drop for EpollReactor {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        let _ = sysio::eventfd_write(self.shared.wake.as_raw_fd());
        if let Some(thread) = self.thread.lock().expect("thread slot poisoned").take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for EpollReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollReactor")
            .field("epfd", &self.shared.epfd.as_raw_fd())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_callback_fires_on_readable_fd() {
        let reactor = EpollReactor::new().unwrap();
        let efd = sysio::eventfd().unwrap();
        let raw = efd.as_raw_fd();

        let (tx, rx) = mpsc::channel();
        reactor
            .register(
                raw,
                Box::new(move || {
                    // Level-triggered: drain before reporting.
                    sysio::eventfd_drain(raw);
                    let _ = tx.send(());
                }),
            )
            .unwrap();

        sysio::eventfd_write(raw).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        reactor.unregister(raw).unwrap();
        sysio::eventfd_write(raw).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_drop_joins_dispatch_thread() {
        let reactor = EpollReactor::new().unwrap();
        drop(reactor);
    }
}
