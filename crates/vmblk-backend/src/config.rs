//! Backing-device configuration and the option-string parser.
//!
//! Frontends describe a backing device either by filling
//! [`BlockDeviceConfig`] directly or by handing `parse` a comma-separated
//! option string whose first token is the backing path.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BlockError, BlockResult};

/// Execution engine selected at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AioMode {
    /// Fixed pool of worker threads doing synchronous positional I/O.
    ThreadPool,
    /// Kernel asynchronous submission ring.
    IoUring,
}

/// Discard limits; unset fields take open-time defaults derived from the
/// backing size (`max_sectors = size / 512`, `max_segments = 1`,
/// `sector_alignment = 0`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardParams {
    /// Maximum sectors a single discard range may cover.
    pub max_sectors: Option<u32>,
    /// Maximum ranges a single discard request may carry.
    pub max_segments: Option<u32>,
    /// Required alignment of a range's starting sector; 0 disables the check.
    pub sector_alignment: Option<u32>,
}

/// Emulated logical/physical sector sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorSizes {
    /// Logical sector size in bytes.
    pub logical: u32,
    /// Physical sector size in bytes.
    pub physical: u32,
}

/// Byte window within the backing, expressed in logical sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRange {
    /// First sector of the window.
    pub start_sectors: u64,
    /// Window length in sectors.
    pub size_sectors: u64,
}

/// Configuration record consumed by [`crate::BlockContext::open`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDeviceConfig {
    /// Path to the backing regular file or block device.
    pub path: PathBuf,
    /// Write cache enable: `true` = writeback, `false` = write-through
    /// (every successful write is followed by fsync).
    pub writeback: bool,
    /// Open the backing read-only.
    pub read_only: bool,
    /// Bypass the host page cache (O_DIRECT); activates the alignment
    /// conversion layer.
    pub bypass_host_cache: bool,
    /// Serialize requests whose byte ranges meet end-to-start. Forced off
    /// for the ring engine.
    pub ordered: bool,
    /// Discard capability; `None` disables discard entirely.
    pub discard: Option<DiscardParams>,
    /// Emulated sector sizes; `None` uses 512 and the backing's preference.
    pub sector_sizes: Option<SectorSizes>,
    /// Restrict I/O to a window of the backing file.
    pub sub_range: Option<SubRange>,
    /// Execution engine.
    pub aio: AioMode,
}

impl Default for BlockDeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            writeback: false,
            read_only: false,
            bypass_host_cache: false,
            ordered: true,
            discard: None,
            sector_sizes: None,
            sub_range: None,
            aio: AioMode::ThreadPool,
        }
    }
}

impl BlockDeviceConfig {
    /// Creates a default (write-through, cached, thread-pool) configuration
    /// for the given backing path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Parses a comma-separated option string.
    ///
    /// The first token is the backing path. Recognised options:
    /// `writeback`, `writethru`, `ro`, `nocache`, `no_bst_block`,
    /// `discard[=<max_sectors>:<max_segs>:<alignment>]`,
    /// `sectorsize=<logical>[/<physical>]`, `range=<start>/<size>`,
    /// `aio=threads|io_uring`. Unknown tokens fail the parse.
    pub fn parse(optstr: &str) -> BlockResult<Self> {
        let mut tokens = optstr.split(',');
        let path = tokens
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| BlockError::Config("empty option string".into()))?;

        let mut config = Self::new(path);

        for opt in tokens {
            match opt {
                "writeback" => config.writeback = true,
                "writethru" => config.writeback = false,
                "ro" => config.read_only = true,
                "nocache" => config.bypass_host_cache = true,
                "no_bst_block" => config.ordered = false,
                "discard" => config.discard = Some(DiscardParams::default()),
                _ if opt.starts_with("discard=") => {
                    config.discard = Some(parse_discard(&opt["discard=".len()..])?);
                }
                _ if opt.starts_with("sectorsize=") => {
                    config.sector_sizes = Some(parse_sectorsize(&opt["sectorsize=".len()..])?);
                }
                _ if opt.starts_with("range=") => {
                    config.sub_range = Some(parse_range(&opt["range=".len()..])?);
                }
                _ if opt.starts_with("aio=") => {
                    config.aio = match &opt["aio=".len()..] {
                        "threads" => AioMode::ThreadPool,
                        "io_uring" => AioMode::IoUring,
                        other => {
                            return Err(BlockError::Config(format!(
                                "unknown aio mode \"{other}\", expected threads or io_uring"
                            )))
                        }
                    };
                }
                other => {
                    return Err(BlockError::Config(format!(
                        "unknown device option \"{other}\""
                    )))
                }
            }
        }

        if let Some(sizes) = config.sector_sizes {
            validate_sector_sizes(sizes)?;
        }

        Ok(config)
    }
}

fn parse_u32(s: &str, what: &str) -> BlockResult<u32> {
    s.parse::<u32>()
        .map_err(|_| BlockError::Config(format!("invalid {what} \"{s}\"")))
}

fn parse_u64(s: &str, what: &str) -> BlockResult<u64> {
    s.parse::<u64>()
        .map_err(|_| BlockError::Config(format!("invalid {what} \"{s}\"")))
}

/// `<max_sectors>:<max_segs>:<alignment>`
fn parse_discard(s: &str) -> BlockResult<DiscardParams> {
    let mut parts = s.split(':');
    let (Some(sectors), Some(segs), Some(align), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(BlockError::Config(format!(
            "discard expects max_sectors:max_segs:alignment, got \"{s}\""
        )));
    };
    Ok(DiscardParams {
        max_sectors: Some(parse_u32(sectors, "discard max_sectors")?),
        max_segments: Some(parse_u32(segs, "discard max_segs")?),
        sector_alignment: Some(parse_u32(align, "discard alignment")?),
    })
}

/// `<logical>[/<physical>]`
fn parse_sectorsize(s: &str) -> BlockResult<SectorSizes> {
    let (logical, physical) = match s.split_once('/') {
        Some((l, p)) => (
            parse_u32(l, "sector size")?,
            parse_u32(p, "physical sector size")?,
        ),
        None => {
            let l = parse_u32(s, "sector size")?;
            (l, l)
        }
    };
    Ok(SectorSizes { logical, physical })
}

/// `<start sectors>/<size sectors>`
fn parse_range(s: &str) -> BlockResult<SubRange> {
    let Some((start, size)) = s.split_once('/') else {
        return Err(BlockError::Config(format!(
            "range expects start/size, got \"{s}\""
        )));
    };
    Ok(SubRange {
        start_sectors: parse_u64(start, "range start")?,
        size_sectors: parse_u64(size, "range size")?,
    })
}

pub(crate) fn validate_sector_sizes(sizes: SectorSizes) -> BlockResult<()> {
    if !sizes.logical.is_power_of_two()
        || !sizes.physical.is_power_of_two()
        || sizes.logical < 512
        || sizes.logical > sizes.physical
    {
        return Err(BlockError::Config(format!(
            "invalid sector size {}/{}",
            sizes.logical, sizes.physical
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_only() {
        let config = BlockDeviceConfig::parse("/dev/vda").unwrap();
        assert_eq!(config.path, PathBuf::from("/dev/vda"));
        assert!(!config.writeback);
        assert!(!config.read_only);
        assert!(!config.bypass_host_cache);
        assert!(config.ordered);
        assert!(config.discard.is_none());
        assert_eq!(config.aio, AioMode::ThreadPool);
    }

    #[test]
    fn test_full_option_string() {
        let config = BlockDeviceConfig::parse(
            "/img/disk.img,writeback,nocache,discard=2048:8:16,sectorsize=512/4096,range=8/2048,aio=io_uring",
        )
        .unwrap();
        assert!(config.writeback);
        assert!(config.bypass_host_cache);
        assert_eq!(
            config.discard,
            Some(DiscardParams {
                max_sectors: Some(2048),
                max_segments: Some(8),
                sector_alignment: Some(16),
            })
        );
        assert_eq!(
            config.sector_sizes,
            Some(SectorSizes {
                logical: 512,
                physical: 4096
            })
        );
        assert_eq!(
            config.sub_range,
            Some(SubRange {
                start_sectors: 8,
                size_sectors: 2048
            })
        );
        assert_eq!(config.aio, AioMode::IoUring);
    }

    #[test]
    fn test_bare_discard_takes_defaults() {
        let config = BlockDeviceConfig::parse("/img/disk.img,discard").unwrap();
        assert_eq!(config.discard, Some(DiscardParams::default()));
    }

    #[test]
    fn test_writethru_and_gate_toggle() {
        let config =
            BlockDeviceConfig::parse("/img/disk.img,writeback,writethru,no_bst_block").unwrap();
        assert!(!config.writeback);
        assert!(!config.ordered);
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(matches!(
            BlockDeviceConfig::parse("/img/disk.img,compress"),
            Err(BlockError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_discard_rejected() {
        assert!(BlockDeviceConfig::parse("/img/disk.img,discard=2048:8").is_err());
        assert!(BlockDeviceConfig::parse("/img/disk.img,discard=a:b:c").is_err());
    }

    #[test]
    fn test_bad_aio_rejected() {
        assert!(BlockDeviceConfig::parse("/img/disk.img,aio=epoll").is_err());
    }

    #[test]
    fn test_sector_size_validation() {
        assert!(BlockDeviceConfig::parse("/img,sectorsize=4096").is_ok());
        // not a power of two
        assert!(BlockDeviceConfig::parse("/img,sectorsize=1000").is_err());
        // below the 512-byte floor
        assert!(BlockDeviceConfig::parse("/img,sectorsize=256").is_err());
        // logical larger than physical
        assert!(BlockDeviceConfig::parse("/img,sectorsize=4096/512").is_err());
    }

    #[test]
    fn test_empty_string_rejected() {
        assert!(BlockDeviceConfig::parse("").is_err());
    }
}
