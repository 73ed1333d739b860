//! Regular file target
//!
//! Files stand in for devices in tests and on systems without a spare disk.
//! Writes may create and extend the file; discards punch holes.

use super::{DeviceInfo, OpenFlags, Target};
use crate::Result;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Regular file target
pub struct FileTarget {
    path: PathBuf,
    file: File,
    size: u64,
    info: DeviceInfo,
}

impl FileTarget {
    pub fn open(path: &Path, flags: &OpenFlags) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(flags.write);
        if flags.write && flags.file_size.is_some() {
            options.create(true);
        }
        let custom_flags = flags.custom_flags();
        if custom_flags != 0 {
            options.custom_flags(custom_flags);
        }

        let file = options
            .open(path)
            .with_context(|| format!("Failed to open file: {}", path.display()))?;

        let mut size = file
            .metadata()
            .with_context(|| format!("Failed to stat file: {}", path.display()))?
            .len();

        if let Some(wanted) = flags.file_size {
            if flags.write && size < wanted {
                file.set_len(wanted)
                    .with_context(|| format!("Failed to extend {} to {} bytes", path.display(), wanted))?;
                size = wanted;
            }
        }

        let block = detect_block_size(file.as_raw_fd());
        let info = DeviceInfo {
            logical_block_size: block,
            physical_block_size: block,
            // Hole punching has no practical size limit
            discard_max_bytes: u32::MAX as u64,
            discard_granularity: block,
            ..DeviceInfo::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            info,
        })
    }
}

impl Target for FileTarget {
    fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn discard(&self, offset: u64, len: u64) -> Result<()> {
        let result = unsafe {
            libc::fallocate(
                self.fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if result != 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| {
                format!("fallocate(PUNCH_HOLE) failed: path={}, offset={}, len={}", self.path.display(), offset, len)
            });
        }
        Ok(())
    }
}

/// Alignment for O_DIRECT on a file: BLKSSZGET, then st_blksize, then 512
fn detect_block_size(fd: RawFd) -> u64 {
    let mut block_size: libc::c_int = 0;
    let result = unsafe { libc::ioctl(fd, libc::BLKSSZGET, &mut block_size) };
    if result == 0 && block_size > 0 {
        return block_size as u64;
    }

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result == 0 {
        let blksize = stat.st_blksize as u64;
        if blksize >= 512 && blksize.is_power_of_two() {
            return blksize;
        }
    }
    512
}
