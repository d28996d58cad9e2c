//! Thin wrappers over the raw syscalls both engines share.
//!
//! Negative returns are converted into `io::Error` carrying the OS error
//! code; callers propagate the code unchanged to the request callback.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

// Block-device ioctl requests (asm-generic values, identical on x86_64 and
// aarch64).
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
const BLKPBSZGET: libc::c_ulong = 0x127b;
const BLKDISCARD: libc::c_ulong = 0x1277;

fn cvt(ret: libc::c_long) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn cvt_zero(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Builds an iovec array borrowing the given buffer segments.
///
/// The returned vector must not outlive `bufs`, and `bufs` must not be
/// resized while the iovecs are in use.
pub(crate) fn iovecs_from_bufs(bufs: &mut [Vec<u8>]) -> Vec<libc::iovec> {
    bufs.iter_mut()
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect()
}

/// Positional scatter read.
pub(crate) fn preadv(fd: RawFd, iov: &[libc::iovec], offset: u64) -> io::Result<usize> {
    // SAFETY: iov entries point at live, exclusively borrowed buffers.
    cvt(unsafe {
        libc::preadv(
            fd,
            iov.as_ptr(),
            iov.len() as libc::c_int,
            offset as libc::off_t,
        ) as libc::c_long
    })
}

/// Positional gather write.
pub(crate) fn pwritev(fd: RawFd, iov: &[libc::iovec], offset: u64) -> io::Result<usize> {
    // SAFETY: iov entries point at live buffers.
    cvt(unsafe {
        libc::pwritev(
            fd,
            iov.as_ptr(),
            iov.len() as libc::c_int,
            offset as libc::off_t,
        ) as libc::c_long
    })
}

/// Flushes file data and metadata to stable storage.
pub(crate) fn fsync(fd: RawFd) -> io::Result<()> {
    cvt_zero(unsafe { libc::fsync(fd) })
}

/// Flushes file data (and the metadata needed to retrieve it).
pub(crate) fn fdatasync(fd: RawFd) -> io::Result<()> {
    cvt_zero(unsafe { libc::fdatasync(fd) })
}

/// Deallocates `[offset, offset + len)` without changing the file size.
/// Subsequent reads of the range return zeroes.
pub(crate) fn punch_hole(fd: RawFd, offset: u64, len: u64) -> io::Result<()> {
    cvt_zero(unsafe {
        libc::fallocate(
            fd,
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            len as libc::off_t,
        )
    })
}

/// Issues the block-device discard ioctl for `[offset, offset + len)`.
pub(crate) fn blk_discard(fd: RawFd, offset: u64, len: u64) -> io::Result<()> {
    let range: [u64; 2] = [offset, len];
    cvt_zero(unsafe { libc::ioctl(fd, BLKDISCARD, range.as_ptr()) })
}

/// Queries a block device's size in bytes.
pub(crate) fn blk_size64(fd: RawFd) -> io::Result<u64> {
    let mut size: u64 = 0;
    cvt_zero(unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) })?;
    Ok(size)
}

/// Queries a block device's physical sector size in bytes.
pub(crate) fn blk_phys_sector_size(fd: RawFd) -> io::Result<u32> {
    let mut psectsz: libc::c_uint = 0;
    cvt_zero(unsafe { libc::ioctl(fd, BLKPBSZGET, &mut psectsz) })?;
    Ok(psectsz)
}

fn ofd_lock(fd: RawFd, lock_type: libc::c_short, start: u64, len: u64) -> io::Result<()> {
    // SAFETY: flock is a plain-data struct; zeroed is a valid initial state.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    cvt_zero(unsafe { libc::fcntl(fd, libc::F_OFD_SETLK, &fl) })
}

/// Takes an open-file-description advisory lock on `[start, start + len)`.
/// Fails without blocking if another description holds a conflicting lock.
pub(crate) fn lock_sub_range(fd: RawFd, start: u64, len: u64, read_only: bool) -> io::Result<()> {
    let lock_type = if read_only {
        libc::F_RDLCK
    } else {
        libc::F_WRLCK
    } as libc::c_short;
    ofd_lock(fd, lock_type, start, len)
}

/// Releases a previously acquired sub-range lock.
pub(crate) fn unlock_sub_range(fd: RawFd, start: u64, len: u64) -> io::Result<()> {
    ofd_lock(fd, libc::F_UNLCK as libc::c_short, start, len)
}

/// Creates a non-blocking close-on-exec eventfd.
pub(crate) fn eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by eventfd and is owned by no one else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Signals an eventfd.
pub(crate) fn eventfd_write(fd: RawFd) -> io::Result<()> {
    let one: u64 = 1;
    // SAFETY: writing 8 bytes from a live u64.
    let ret = unsafe {
        libc::write(
            fd,
            &one as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Drains an eventfd; returns `Ok` whether or not it was signalled.
pub(crate) fn eventfd_drain(fd: RawFd) {
    let mut counter: u64 = 0;
    // SAFETY: reading 8 bytes into a live u64; EAGAIN is expected when the
    // eventfd was not signalled.
    unsafe {
        libc::read(
            fd,
            &mut counter as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        );
    }
}
