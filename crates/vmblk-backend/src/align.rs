//! Alignment conversion for page-cache-bypassing I/O.
//!
//! When the backing descriptor is opened with O_DIRECT the kernel requires
//! the file offset, every buffer base and every buffer length to be
//! multiples of the logical sector size. Misaligned requests are rewritten
//! into a single aligned access through a bounce buffer:
//!
//! ```text
//! |<------------------------ bounced_size ----------------------->|
//! |<-- head -->|<------------- org_size ------------->|<-- tail ->|
//! aligned_start                                        aligned_end
//!              start                               end
//! ```
//!
//! For writes the head and tail sectors are pre-read synchronously on the
//! submitting thread (they precede the aligned write they belong to, so
//! scheduling them through the queue would only add ordering hazards). For
//! reads the caller's buffers are filled from the bounce buffer after the
//! aligned read completes.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::os::fd::RawFd;
use std::ptr::NonNull;

use crate::error::{BlockError, BlockResult};
use crate::request::BlockRequest;
use crate::sysio;

/// Heap buffer whose base address is aligned for direct I/O.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    alignment: usize,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocates a zeroed buffer of `len` bytes aligned to `alignment`.
    pub(crate) fn new(len: usize, alignment: usize) -> BlockResult<Self> {
        debug_assert!(alignment.is_power_of_two());
        let layout = Layout::from_size_align(len.max(alignment), alignment)
            .map_err(|_| BlockError::BounceAlloc { size: len })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(BlockError::BounceAlloc { size: len })?;
        Ok(Self {
            ptr,
            len,
            alignment,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes (zero-initialised at alloc).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and exclusively borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len.max(self.alignment), self.alignment)
            .expect("layout was validated at allocation");
        // SAFETY: allocated with the identical layout in `new`.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("alignment", &self.alignment)
            .finish()
    }
}

/// Per-request conversion state, computed once at submission.
#[derive(Debug, Default)]
pub(crate) struct AlignInfo {
    /// Whether the request must go through a bounce buffer.
    pub(crate) need_conversion: bool,
    /// Logical sector size the conversion aligns to.
    pub(crate) alignment: u32,
    /// `start % alignment`.
    pub(crate) head: u32,
    /// Padding after the caller's last byte up to the next boundary.
    pub(crate) tail: u32,
    /// Total caller bytes (sum of segment lengths).
    pub(crate) org_size: usize,
    /// `start - head`; file offset of the aligned access.
    pub(crate) aligned_start: u64,
    /// `end` rounded down to the previous boundary.
    pub(crate) aligned_end: u64,
    /// `head + org_size + tail`.
    pub(crate) bounced_size: usize,
    /// The single aligned scatter entry presented to the engine.
    pub(crate) bounce: Option<AlignedBuf>,
}

/// Geometry of the aligned access window around `[start, start + org_size)`.
fn window(start: u64, org_size: usize, alignment: u32) -> AlignInfo {
    let align = alignment as u64;
    let head = (start % align) as u32;
    let end = start + org_size as u64;
    let end_rmd = (end % align) as u32;
    let tail = if end_rmd == 0 {
        0
    } else {
        alignment - end_rmd
    };
    AlignInfo {
        need_conversion: true,
        alignment,
        head,
        tail,
        org_size,
        aligned_start: start - head as u64,
        aligned_end: end - end_rmd as u64,
        bounced_size: head as usize + org_size + tail as usize,
        bounce: None,
    }
}

/// Classifies a read/write request and stores its conversion state.
///
/// With the cache bypass disabled every request passes through untouched.
/// Otherwise conversion is needed unless the translated offset, every
/// segment base and every segment length are multiples of `alignment`.
pub(crate) fn classify(
    req: &mut BlockRequest,
    alignment: u32,
    sub_range_start: u64,
    bypass_host_cache: bool,
) {
    if !bypass_host_cache {
        req.align = AlignInfo::default();
        return;
    }

    let align = alignment as u64;
    let start = req.offset + sub_range_start;
    let offset_aligned = start % align == 0;
    let bufs_aligned = req.bufs.iter().all(|b| {
        (b.as_ptr() as usize) % alignment as usize == 0 && b.len() % alignment as usize == 0
    });

    if offset_aligned && bufs_aligned {
        req.align = AlignInfo::default();
        return;
    }

    req.align = window(start, req.total_len(), alignment);
}

/// Allocates the bounce buffer for a request that needs conversion.
pub(crate) fn allocate_bounce(req: &mut BlockRequest) -> BlockResult<()> {
    debug_assert!(req.align.need_conversion);
    let buf = AlignedBuf::new(req.align.bounced_size, req.align.alignment as usize)?;
    req.align.bounce = Some(buf);
    Ok(())
}

/// Reads one alignment unit at `offset` (already aligned) into a scratch
/// buffer. Used to preserve the partial head/tail sectors around a bounced
/// write.
fn read_edge(fd: RawFd, offset: u64, alignment: u32) -> BlockResult<AlignedBuf> {
    let mut area = AlignedBuf::new(alignment as usize, alignment as usize)?;
    let iov = [libc::iovec {
        iov_base: area.as_mut_ptr() as *mut libc::c_void,
        iov_len: area.len(),
    }];
    sysio::preadv(fd, &iov, offset)?;
    Ok(area)
}

/// Builds the bounced data for a converted write: head sector bytes, the
/// caller's segments back to back, then tail sector bytes.
///
/// The head/tail reads run synchronously on the submitting thread; on
/// failure the bounce buffer is released and the error is returned without
/// consuming a queue slot.
pub(crate) fn fill_bounce_for_write(fd: RawFd, req: &mut BlockRequest) -> BlockResult<()> {
    let result = try_fill_bounce_for_write(fd, req);
    if result.is_err() {
        req.align.bounce = None;
    }
    result
}

fn try_fill_bounce_for_write(fd: RawFd, req: &mut BlockRequest) -> BlockResult<()> {
    let bufs = &req.bufs;
    let align = &mut req.align;
    let head = align.head as usize;
    let tail = align.tail as usize;
    let alignment = align.alignment;

    let head_area = if head != 0 {
        Some(read_edge(fd, align.aligned_start, alignment)?)
    } else {
        None
    };
    let tail_area = if tail != 0 {
        Some(read_edge(fd, align.aligned_end, alignment)?)
    } else {
        None
    };

    let bounce = align.bounce.as_mut().expect("bounce allocated before fill");
    let out = bounce.as_mut_slice();
    let mut done = 0;

    if let Some(area) = head_area {
        out[..head].copy_from_slice(&area.as_slice()[..head]);
        done += head;
    }
    for buf in bufs {
        out[done..done + buf.len()].copy_from_slice(buf);
        done += buf.len();
    }
    if let Some(area) = tail_area {
        let from = alignment as usize - tail;
        out[done..done + tail].copy_from_slice(&area.as_slice()[from..]);
    }
    Ok(())
}

/// Distributes a completed bounced read back into the caller's segments,
/// in order, stopping once `org_size` bytes are placed or the segments run
/// out.
pub(crate) fn complete_bounced_read(req: &mut BlockRequest) {
    let bufs = &mut req.bufs;
    let Some(bounce) = req.align.bounce.as_ref() else {
        return;
    };
    let src = bounce.as_slice();
    let mut done = req.align.head as usize;
    let mut remaining = req.align.org_size;

    for buf in bufs.iter_mut() {
        if remaining == 0 {
            break;
        }
        let len = buf.len().min(remaining);
        buf[..len].copy_from_slice(&src[done..done + len]);
        done += len;
        remaining -= len;
    }
}

/// Caller-visible bytes of a completed transfer: the raw syscall length for
/// pass-through requests, the original request size for converted ones (the
/// bounced transfer includes head and tail padding the caller never asked
/// for).
pub(crate) fn transferred(info: &AlignInfo, raw_len: usize) -> usize {
    if info.need_conversion {
        info.org_size
    } else {
        raw_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{BlockRequest, ReqId};
    use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
    use std::os::fd::AsRawFd;

    const ALIGN: u32 = 512;

    #[test]
    fn test_window_geometry_misaligned_both_ends() {
        // 100 bytes at offset 200 with 512-byte sectors.
        let info = window(200, 100, ALIGN);
        assert_eq!(info.head, 200);
        assert_eq!(info.tail, 212);
        assert_eq!(info.aligned_start, 0);
        assert_eq!(info.aligned_end, 0);
        assert_eq!(info.bounced_size, 512);
    }

    #[test]
    fn test_window_geometry_aligned_end() {
        let info = window(200, 312, ALIGN);
        assert_eq!(info.head, 200);
        assert_eq!(info.tail, 0);
        assert_eq!(info.aligned_end, 512);
        assert_eq!(info.bounced_size, 512);
    }

    #[test]
    fn test_window_invariants_hold() {
        for (start, size) in [
            (0u64, 1usize),
            (1, 511),
            (511, 2),
            (513, 4096),
            (4095, 1),
            (700, 10_000),
        ] {
            let info = window(start, size, ALIGN);
            assert_eq!(info.aligned_start % ALIGN as u64, 0);
            assert_eq!(info.aligned_end % ALIGN as u64, 0);
            assert_eq!(info.bounced_size % ALIGN as usize, 0);
            assert_eq!(
                info.bounced_size,
                info.head as usize + info.org_size + info.tail as usize
            );
            assert!(info.aligned_start <= start);
        }
    }

    #[test]
    fn test_classify_bypass_disabled() {
        let mut req = BlockRequest::new(ReqId(1), 0, 200, vec![vec![0u8; 100]]);
        classify(&mut req, ALIGN, 0, false);
        assert!(!req.align.need_conversion);
    }

    #[test]
    fn test_classify_misaligned_offset() {
        let mut req = BlockRequest::new(ReqId(1), 0, 200, vec![vec![0u8; 100]]);
        classify(&mut req, ALIGN, 0, true);
        assert!(req.align.need_conversion);
        assert_eq!(req.align.head, 200);
    }

    #[test]
    fn test_classify_accounts_for_sub_range() {
        // Offset 0 but the sub-range shifts the translated start off-axis.
        let mut req = BlockRequest::new(ReqId(1), 0, 0, vec![vec![0u8; 512]]);
        classify(&mut req, ALIGN, 100, true);
        assert!(req.align.need_conversion);
        assert_eq!(req.align.aligned_start, 0);
        assert_eq!(req.align.head, 100);
    }

    #[test]
    fn test_bounced_write_preserves_surroundings() {
        // Backing prefilled with 0x11; write 100 x 0x5A at offset 200.
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0x11u8; 1024]).unwrap();
        let fd = file.as_raw_fd();

        let mut req = BlockRequest::new(ReqId(1), 0, 200, vec![vec![0x5Au8; 100]]);
        classify(&mut req, ALIGN, 0, true);
        allocate_bounce(&mut req).unwrap();
        fill_bounce_for_write(fd, &mut req).unwrap();

        let bounce = req.align.bounce.as_mut().unwrap();
        let iov = [libc::iovec {
            iov_base: bounce.as_mut_ptr() as *mut libc::c_void,
            iov_len: bounce.len(),
        }];
        assert_eq!(
            sysio::pwritev(fd, &iov, req.align.aligned_start).unwrap(),
            512
        );

        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut contents).unwrap();
        assert!(contents[..200].iter().all(|&b| b == 0x11));
        assert!(contents[200..300].iter().all(|&b| b == 0x5A));
        assert!(contents[300..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_bounced_read_fills_segments_in_order() {
        let mut file = tempfile::tempfile().unwrap();
        let mut pattern = vec![0u8; 1024];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        file.write_all(&pattern).unwrap();
        let fd = file.as_raw_fd();

        // Two segments of 60 + 40 bytes at offset 200.
        let mut req = BlockRequest::new(ReqId(1), 0, 200, vec![vec![0u8; 60], vec![0u8; 40]]);
        classify(&mut req, ALIGN, 0, true);
        allocate_bounce(&mut req).unwrap();

        let bounce = req.align.bounce.as_mut().unwrap();
        let iov = [libc::iovec {
            iov_base: bounce.as_mut_ptr() as *mut libc::c_void,
            iov_len: bounce.len(),
        }];
        sysio::preadv(fd, &iov, req.align.aligned_start).unwrap();
        complete_bounced_read(&mut req);

        assert_eq!(&req.bufs[0][..], &pattern[200..260]);
        assert_eq!(&req.bufs[1][..], &pattern[260..300]);
    }

    #[test]
    fn test_transferred_clamps_converted_requests() {
        let info = window(200, 100, ALIGN);
        assert_eq!(transferred(&info, 512), 100);
        assert_eq!(transferred(&AlignInfo::default(), 512), 512);
    }

    #[test]
    fn test_aligned_buf_is_aligned_and_zeroed() {
        let buf = AlignedBuf::new(4096, 4096).unwrap();
        assert_eq!(buf.as_slice().as_ptr() as usize % 4096, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }
}
