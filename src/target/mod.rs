//! Device handles
//!
//! A `Target` is an open block device or regular file plus the metadata the
//! dispatcher needs: alignment, discard limits and write-cache state. The
//! handle is opened once by the worker and shared read-only with its
//! dispatcher; `discard()` and `sync()` are the only operations performed on
//! it outside the async engine.
//!
//! # Example
//!
//! ```no_run
//! use blockprobe::target::{open_target, OpenFlags};
//! use std::path::Path;
//!
//! let target = open_target(Path::new("/dev/nvme0n1"), &OpenFlags::default())?;
//! println!("{} bytes, {} byte sectors", target.size(), target.info().logical_block_size);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod block;
pub mod file;

use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

/// Target trait for IO destinations
pub trait Target: Send + Sync {
    /// Path the target was opened from
    fn path(&self) -> &Path;

    /// File descriptor handed to the IO engine
    fn fd(&self) -> RawFd;

    /// Usable size in bytes
    fn size(&self) -> u64;

    /// Device characteristics
    fn info(&self) -> &DeviceInfo;

    /// Synchronously discard `len` bytes at `offset`
    fn discard(&self, offset: u64, len: u64) -> Result<()>;

    /// Synchronously flush written data to stable storage
    fn sync(&self) -> Result<()> {
        let result = unsafe { libc::fdatasync(self.fd()) };
        if result != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("fdatasync failed: {}", self.path().display()));
        }
        Ok(())
    }
}

/// How to open a target
#[derive(Debug, Clone)]
pub struct OpenFlags {
    /// Bypass the page cache (O_DIRECT)
    pub direct: bool,

    /// Open for writing; required for writes and discards
    pub write: bool,

    /// Refuse to open a block device that is mounted or held by another opener (O_EXCL)
    pub exclusive: bool,

    /// Create regular files and extend them to this size
    pub file_size: Option<u64>,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            direct: true,
            write: false,
            exclusive: true,
            file_size: None,
        }
    }
}

impl OpenFlags {
    fn custom_flags(&self) -> i32 {
        let mut flags = 0;
        if self.direct {
            flags |= libc::O_DIRECT;
        }
        flags
    }
}

/// Device characteristics relevant to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Minimum IO alignment for O_DIRECT
    pub logical_block_size: u64,
    pub physical_block_size: u64,
    /// Requests larger than this are split by the block layer
    pub max_io_bytes: Option<u64>,
    /// Largest single discard; 0 means discard is unsupported
    pub discard_max_bytes: u64,
    pub discard_granularity: u64,
    /// Write cache is volatile ("write back")
    pub volatile_write_cache: bool,
    pub rotational: Option<bool>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            logical_block_size: 512,
            physical_block_size: 512,
            max_io_bytes: None,
            discard_max_bytes: 0,
            discard_granularity: 0,
            volatile_write_cache: false,
            rotational: None,
        }
    }
}

impl DeviceInfo {
    /// Warn the operator about settings that skew results
    pub fn log_warnings(&self, path: &Path, max_block_size: usize, wants_discard: bool) {
        if self.volatile_write_cache {
            tracing::warn!(
                device = %path.display(),
                "write cache is volatile; completed writes may not be on stable media until flushed"
            );
        }
        if let Some(max_io) = self.max_io_bytes {
            if max_block_size as u64 > max_io {
                tracing::warn!(
                    device = %path.display(),
                    block_size = max_block_size,
                    max_io_bytes = max_io,
                    "block size exceeds max_sectors_kb; requests will be split"
                );
            }
        }
        if wants_discard && self.discard_max_bytes == 0 {
            tracing::warn!(device = %path.display(), "discard requested but not supported; discards will be skipped");
        }
    }
}

/// Open a block device or regular file, picking the implementation by file type
pub fn open_target(path: &Path, flags: &OpenFlags) -> Result<Arc<dyn Target>> {
    let is_block = std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false);

    let target: Arc<dyn Target> = if is_block {
        Arc::new(block::BlockTarget::open(path, flags)?)
    } else {
        Arc::new(file::FileTarget::open(path, flags)?)
    };

    tracing::debug!(
        device = %path.display(),
        size = target.size(),
        info = ?target.info(),
        "target opened"
    );
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_target_picks_file_for_regular_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        let flags = OpenFlags {
            direct: false,
            write: true,
            exclusive: false,
            file_size: Some(1 << 20),
        };

        let target = open_target(&path, &flags).unwrap();
        assert_eq!(target.size(), 1 << 20);
        assert!(target.fd() >= 0);
        assert!(target.sync().is_ok());
    }

    #[test]
    fn test_open_target_missing_file_read_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.img");
        assert!(open_target(&path, &OpenFlags { direct: false, ..OpenFlags::default() }).is_err());
    }
}
