#![warn(missing_docs)]

//! Block I/O backend for virtual block device frontends (virtio-blk, AHCI).
//!
//! The backend executes asynchronous read/write/flush/discard requests
//! against a backing regular file, a sub-range of one, or a raw block
//! device. Requests dispatch through per-queue bounded slot pools onto one
//! of two execution engines selected at open time: a fixed worker-thread
//! pool doing synchronous positional vector I/O, or a kernel submission
//! ring driven by an external reactor. A transparent alignment layer
//! rewrites misaligned requests into aligned single-buffer accesses when
//! the backing bypasses the host page cache, and an optional ordering gate
//! serializes requests whose byte ranges meet end-to-start.

mod align;
mod cancel;
mod discard;
mod queue;
mod sysio;
mod thread_pool;
#[cfg(feature = "uring")]
mod uring;

pub mod config;
pub mod context;
pub mod error;
pub mod reactor;
pub mod request;
pub mod stats;

pub use config::{AioMode, BlockDeviceConfig, DiscardParams, SectorSizes, SubRange};
pub use context::{BlockContext, Geometry};
pub use discard::DiscardRange;
pub use error::{BlockError, BlockResult};
pub use reactor::{EpollReactor, Reactor, ReadyCallback};
pub use request::{
    BlockOp, BlockRequest, CancelOutcome, IoCallback, ReqId, ReqIdGen, SubmitError,
};
pub use stats::StatsSnapshot;
