//! Asynchronous IO engine abstraction
//!
//! An IO engine submits individual read/write/flush requests to the kernel and
//! hands back completion events. The dispatcher owns exactly one engine per
//! device and never shares it across threads.
//!
//! # Engine Types
//!
//! - **libaio**: Linux native async IO via raw `io_submit`/`io_getevents` syscalls
//! - **io_uring**: Modern Linux async IO interface (Linux 5.6+, feature `io_uring`)
//! - **mock**: In-memory engine used by the dispatcher tests
//!
//! # Example
//!
//! ```no_run
//! use blockprobe::engine::{IOEngine, EngineConfig};
//! use blockprobe::engine::libaio::LibaioEngine;
//! use std::time::Duration;
//!
//! let mut engine = LibaioEngine::new();
//! engine.init(&EngineConfig { queue_depth: 32 }).expect("Failed to initialize engine");
//!
//! // Submit operations, then wait up to 10ms for at least one completion
//! let completions = engine.poll_completions(1, Some(Duration::from_millis(10)))?;
//! # let _ = completions;
//!
//! engine.cleanup().expect("Failed to cleanup engine");
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::Result;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::time::Duration;

/// IO engine trait for all async backends
///
/// # Lifecycle
///
/// 1. Create engine instance (via `new()` on concrete type)
/// 2. Call `init()` with configuration
/// 3. Submit operations via `submit()` and harvest them via `poll_completions()`
/// 4. Call `cleanup()` once nothing is outstanding (or the drain window expired)
///
/// Engines must be `Send` so a worker thread can take ownership, but are not
/// required to be `Sync`.
pub trait IOEngine: Send {
    /// Initialize the engine with the given configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel context cannot be created (e.g. the
    /// system-wide `aio-max-nr` limit is exhausted).
    fn init(&mut self, config: &EngineConfig) -> Result<()>;

    /// Submit a single IO operation to the kernel
    ///
    /// The request is handed to the kernel immediately. A returned error means
    /// the request was rejected and nothing is outstanding for `op.user_data`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - The buffer pointer in `op` is valid and properly aligned
    /// - The buffer remains valid until the operation completes
    /// - The file descriptor is valid and open
    fn submit(&mut self, op: IOOperation) -> Result<()>;

    /// Poll for completed IO operations
    ///
    /// Waits until at least `min_complete` operations have finished or
    /// `timeout` expires, whichever comes first. `None` waits without bound;
    /// `Some(Duration::ZERO)` only harvests what is already complete. An
    /// expired timeout is not an error and yields whatever finished so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll syscall itself fails. Per-request failures
    /// are reported through `IOCompletion::result`.
    fn poll_completions(
        &mut self,
        min_complete: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<IOCompletion>>;

    /// Release the kernel context
    ///
    /// Must only be called after the caller drained its outstanding requests
    /// or gave up on them.
    fn cleanup(&mut self) -> Result<()>;

    /// Get engine-specific capabilities
    fn capabilities(&self) -> EngineCapabilities;
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of outstanding IO operations (queue depth)
    ///
    /// Determines the size of the kernel submission/completion queues.
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { queue_depth: 32 }
    }
}

/// Available engine backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Linux native AIO
    Libaio,
    /// io_uring (requires the `io_uring` feature)
    IoUring,
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::Libaio
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Libaio => write!(f, "libaio"),
            EngineKind::IoUring => write!(f, "io_uring"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "libaio" | "aio" => Ok(EngineKind::Libaio),
            "io_uring" | "iouring" | "uring" => Ok(EngineKind::IoUring),
            other => anyhow::bail!("Unknown IO engine '{}' (expected libaio or io_uring)", other),
        }
    }
}

/// Create an uninitialized engine of the requested kind
pub fn create_engine(kind: EngineKind) -> Result<Box<dyn IOEngine>> {
    let engine: Box<dyn IOEngine> = match kind {
        #[cfg(target_os = "linux")]
        EngineKind::Libaio => Box::new(libaio::LibaioEngine::new()),

        #[cfg(not(target_os = "linux"))]
        EngineKind::Libaio => anyhow::bail!("libaio engine only available on Linux"),

        #[cfg(feature = "io_uring")]
        EngineKind::IoUring => Box::new(io_uring::IoUringEngine::new()),

        #[cfg(not(feature = "io_uring"))]
        EngineKind::IoUring => {
            anyhow::bail!("io_uring engine not available (feature not enabled)")
        }
    };

    Ok(engine)
}

/// IO operation descriptor
///
/// # Safety
///
/// The buffer pointer must be valid and properly aligned for the duration of the
/// operation. For O_DIRECT operations, buffers must be aligned to the device's
/// logical block size.
#[derive(Debug)]
pub struct IOOperation {
    /// Type of operation (read, write, fsync)
    pub op_type: OperationType,

    /// File descriptor of the target file or device
    pub target_fd: RawFd,

    /// Byte offset within the device. Ignored for fsync.
    pub offset: u64,

    /// Pointer to the slot buffer for read/write. Null for fsync.
    pub buffer: *mut u8,

    /// Length of the operation in bytes. Zero for fsync.
    pub length: usize,

    /// Opaque token returned in the matching `IOCompletion`
    ///
    /// The dispatcher stores the work item index here; the harvester resolves it
    /// back to the item (and from there to its slot).
    pub user_data: u64,
}

// Safety: IOOperation contains a raw pointer but is only used within a single thread
// and the pointer lifetime is managed by the caller
unsafe impl Send for IOOperation {}

/// Operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Read `length` bytes at `offset` into the buffer
    Read,

    /// Write `length` bytes from the buffer at `offset`
    Write,

    /// Flush the device write cache (no buffer)
    Fsync,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Read => write!(f, "read"),
            OperationType::Write => write!(f, "write"),
            OperationType::Fsync => write!(f, "fsync"),
        }
    }
}

/// Completed IO operation
#[derive(Debug)]
pub struct IOCompletion {
    /// User data from the original IOOperation
    pub user_data: u64,

    /// Bytes transferred on success, the kernel's error otherwise
    pub result: Result<usize>,

    /// Type of operation that completed
    pub op_type: OperationType,
}

/// Engine capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Engine name for log lines
    pub name: &'static str,

    /// Engine supports asynchronous IO
    pub async_io: bool,

    /// Maximum number of operations that can be outstanding simultaneously
    pub max_queue_depth: usize,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            name: "unknown",
            async_io: false,
            max_queue_depth: 1,
        }
    }
}

pub mod mock;

#[cfg(feature = "io_uring")]
pub mod io_uring;

#[cfg(target_os = "linux")]
pub mod libaio;
