//! Block device target
//!
//! Raw block devices (e.g. /dev/sdb, /dev/nvme0n1). Size comes from
//! `BLKGETSIZE64`; alignment, discard limits and write-cache state come from
//! the device's sysfs queue directory. Partitions read the queue attributes of
//! their parent disk.
//!
//! # Requirements
//!
//! - Root or appropriate permissions to access block devices
//! - O_EXCL fails while the device is mounted, which protects live filesystems

use super::{DeviceInfo, OpenFlags, Target};
use crate::Result;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

// ioctl request codes
const BLKGETSIZE64: libc::c_ulong = 0x80081272;
const BLKDISCARD: libc::c_ulong = 0x1277;

/// Block device target
pub struct BlockTarget {
    path: PathBuf,
    file: File,
    device_size: u64,
    info: DeviceInfo,
}

impl BlockTarget {
    /// Open the device and gather its metadata
    pub fn open(path: &Path, flags: &OpenFlags) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(flags.write);

        let mut custom_flags = flags.custom_flags();
        if flags.exclusive {
            custom_flags |= libc::O_EXCL;
        }
        if custom_flags != 0 {
            options.custom_flags(custom_flags);
        }

        let file = options.open(path).with_context(|| {
            if flags.exclusive {
                format!("Failed to open block device exclusively (is it mounted?): {}", path.display())
            } else {
                format!("Failed to open block device: {}", path.display())
            }
        })?;

        let device_size = device_size(file.as_raw_fd(), path)?;
        let mut info = read_sysfs_info(path).unwrap_or_default();
        if let Some(lbs) = ioctl_logical_block_size(file.as_raw_fd()) {
            info.logical_block_size = lbs;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            device_size,
            info,
        })
    }
}

impl Target for BlockTarget {
    fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn size(&self) -> u64 {
        self.device_size
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn discard(&self, offset: u64, len: u64) -> Result<()> {
        if self.info.discard_max_bytes == 0 {
            anyhow::bail!("discard not supported by {}", self.path.display());
        }

        let mut done = 0;
        while done < len {
            let chunk = (len - done).min(self.info.discard_max_bytes);
            let range: [u64; 2] = [offset + done, chunk];
            let result = unsafe { libc::ioctl(self.fd(), BLKDISCARD, &range) };
            if result < 0 {
                return Err(std::io::Error::last_os_error()).with_context(|| {
                    format!(
                        "ioctl(BLKDISCARD) failed: path={}, offset={}, len={}",
                        self.path.display(),
                        offset + done,
                        chunk
                    )
                });
            }
            done += chunk;
        }
        Ok(())
    }
}

fn device_size(fd: RawFd, path: &Path) -> Result<u64> {
    let mut size: u64 = 0;
    let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) };
    if result < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("ioctl(BLKGETSIZE64) failed: path={}", path.display()));
    }
    Ok(size)
}

fn ioctl_logical_block_size(fd: RawFd) -> Option<u64> {
    let mut block_size: libc::c_int = 0;
    let result = unsafe { libc::ioctl(fd, libc::BLKSSZGET, &mut block_size) };
    (result == 0 && block_size > 0).then_some(block_size as u64)
}

/// Locate `/sys/class/block/<dev>/queue`, walking up for partitions
fn sysfs_queue_dir(path: &Path) -> Option<PathBuf> {
    let resolved = std::fs::canonicalize(path).ok()?;
    let name = resolved.file_name()?.to_str()?.to_string();
    let class_dir = std::fs::canonicalize(Path::new("/sys/class/block").join(name)).ok()?;

    let own = class_dir.join("queue");
    if own.is_dir() {
        return Some(own);
    }
    let parent = class_dir.parent()?.join("queue");
    parent.is_dir().then_some(parent)
}

fn read_sysfs_info(path: &Path) -> Option<DeviceInfo> {
    let queue = sysfs_queue_dir(path)?;
    Some(parse_queue_dir(&queue))
}

fn read_u64(dir: &Path, attr: &str) -> Option<u64> {
    std::fs::read_to_string(dir.join(attr)).ok()?.trim().parse().ok()
}

/// Build `DeviceInfo` from a sysfs queue directory
pub(crate) fn parse_queue_dir(queue: &Path) -> DeviceInfo {
    let defaults = DeviceInfo::default();
    let write_cache = std::fs::read_to_string(queue.join("write_cache")).unwrap_or_default();

    DeviceInfo {
        logical_block_size: read_u64(queue, "logical_block_size").unwrap_or(defaults.logical_block_size),
        physical_block_size: read_u64(queue, "physical_block_size").unwrap_or(defaults.physical_block_size),
        max_io_bytes: read_u64(queue, "max_sectors_kb").map(|kb| kb * 1024),
        discard_max_bytes: read_u64(queue, "discard_max_bytes").unwrap_or(0),
        discard_granularity: read_u64(queue, "discard_granularity").unwrap_or(0),
        volatile_write_cache: write_cache.trim() == "write back",
        rotational: read_u64(queue, "rotational").map(|r| r != 0),
    }
}
