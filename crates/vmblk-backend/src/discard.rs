//! Discard execution, shared by both engines.
//!
//! virtio-blk frontends pass a single buffer segment holding packed
//! [`DiscardRange`] records; AHCI-style frontends encode one range in the
//! request's offset and `resid`. Block-device backings use the discard
//! ioctl; regular files punch a hole and then datasync.

use tracing::warn;

use crate::context::ContextShared;
use crate::error::{BlockError, BlockResult};
use crate::request::BlockRequest;
use crate::sysio;

/// Sector unit for discard arithmetic, independent of the emulated logical
/// sector size.
pub(crate) const DISCARD_SECTOR_SIZE: u64 = 512;

/// Hard cap on ranges in a single request, on top of the configured limit.
pub(crate) const MAX_DISCARD_SEGMENTS: usize = 256;

/// One discard range as frontends encode it: a starting sector, a sector
/// count and a flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardRange {
    /// First sector of the range.
    pub sector: u64,
    /// Number of sectors to discard.
    pub num_sectors: u32,
    /// Per-range flags; unused by the backend.
    pub flags: u32,
}

impl DiscardRange {
    /// Encoded size of one record.
    pub const ENCODED_LEN: usize = 16;

    /// Appends this record to a byte buffer in the frontend wire layout.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sector.to_ne_bytes());
        out.extend_from_slice(&self.num_sectors.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        Self {
            sector: u64::from_ne_bytes(raw[0..8].try_into().expect("8-byte field")),
            num_sectors: u32::from_ne_bytes(raw[8..12].try_into().expect("4-byte field")),
            flags: u32::from_ne_bytes(raw[12..16].try_into().expect("4-byte field")),
        }
    }
}

fn validate_range(ctx: &ContextShared, start: u64, len: u64) -> BlockResult<()> {
    let start_sector = start / DISCARD_SECTOR_SIZE;
    let len_sectors = len / DISCARD_SECTOR_SIZE;

    if len == 0 || start + len > ctx.size + ctx.sub_range_start {
        return Err(BlockError::InvalidDiscardRange { start, len });
    }
    if len_sectors > ctx.max_discard_sectors {
        return Err(BlockError::InvalidDiscardRange { start, len });
    }
    if ctx.discard_sector_alignment != 0
        && start_sector % ctx.discard_sector_alignment as u64 != 0
    {
        return Err(BlockError::InvalidDiscardRange { start, len });
    }
    Ok(())
}

/// Translates the request's range vector into absolute byte ranges,
/// validating each.
fn collect_ranges(ctx: &ContextShared, req: &BlockRequest) -> BlockResult<Vec<(u64, u64)>> {
    let mut ranges = Vec::new();

    if req.bufs.len() == 1 {
        let raw = &req.bufs[0];
        let count = raw.len() / DiscardRange::ENCODED_LEN;
        let limit = (ctx.max_discard_segments as usize).min(MAX_DISCARD_SEGMENTS);
        if count > limit {
            return Err(BlockError::TooManySegments { count, limit });
        }
        for chunk in raw.chunks_exact(DiscardRange::ENCODED_LEN) {
            let range = DiscardRange::decode(chunk);
            let start = range.sector * DISCARD_SECTOR_SIZE + ctx.sub_range_start;
            let len = range.num_sectors as u64 * DISCARD_SECTOR_SIZE;
            validate_range(ctx, start, len)?;
            ranges.push((start, len));
        }
    } else {
        let start = req.offset + ctx.sub_range_start;
        let len = req.resid as u64;
        validate_range(ctx, start, len)?;
        ranges.push((start, len));
    }

    Ok(ranges)
}

/// Validates and executes a discard request. On success `resid` drops to
/// zero; the first failing range aborts the remainder.
pub(crate) fn process_discard(ctx: &ContextShared, req: &mut BlockRequest) -> BlockResult<()> {
    if ctx.read_only {
        return Err(BlockError::ReadOnly);
    }
    if !ctx.can_discard {
        return Err(BlockError::Unsupported("discard"));
    }

    let ranges = collect_ranges(ctx, req)?;

    for (start, len) in ranges {
        let result = if ctx.is_block {
            sysio::blk_discard(ctx.fd(), start, len)
        } else {
            sysio::punch_hole(ctx.fd(), start, len).and_then(|()| sysio::fdatasync(ctx.fd()))
        };
        if let Err(err) = result {
            warn!(start, len, %err, "discard failed");
            return Err(err.into());
        }
    }

    req.resid = 0;
    Ok(())
}
