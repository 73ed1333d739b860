//! Linux native AIO engine
//!
//! Talks to the kernel through the raw `io_setup`/`io_submit`/`io_getevents`/
//! `io_destroy` syscalls; no userspace libaio is linked. Each request occupies
//! one slot of a fixed iocb slab sized to the queue depth. The kernel hands
//! back the iocb address in `io_event.obj`, which maps straight to the slot,
//! so completion lookup is an index computation.
//!
//! Async fsync needs Linux 4.18 or later. Without O_DIRECT most filesystems
//! complete requests synchronously inside `io_submit`.

use super::{EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation, OperationType};
use crate::Result;
use anyhow::Context;
use std::mem;
use std::ptr;
use std::time::Duration;

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;
const IOCB_CMD_FSYNC: u16 = 2;

/// `struct iocb` from `<linux/aio_abi.h>` (little-endian layout)
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Iocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: i32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// `struct io_event`
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

fn sys_io_setup(nr_events: usize, ctx: &mut AioContext) -> std::io::Result<()> {
    let rc = unsafe { libc::syscall(libc::SYS_io_setup, nr_events as libc::c_long, ctx as *mut AioContext) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn sys_io_destroy(ctx: AioContext) -> std::io::Result<()> {
    let rc = unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// One iocb; returns how many the kernel took
fn sys_io_submit(ctx: AioContext, iocb: *mut Iocb) -> std::io::Result<i64> {
    let mut list = [iocb];
    let rc = unsafe { libc::syscall(libc::SYS_io_submit, ctx, 1 as libc::c_long, list.as_mut_ptr()) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(rc as i64)
}

fn sys_io_getevents(
    ctx: AioContext,
    min_nr: usize,
    events: &mut [IoEvent],
    timeout: Option<Duration>,
) -> std::io::Result<usize> {
    let mut ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts.as_mut().map_or(ptr::null_mut(), |t| t as *mut libc::timespec);
    let rc = unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            min_nr as libc::c_long,
            events.len() as libc::c_long,
            events.as_mut_ptr(),
            ts_ptr,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Bytes transferred, or the failure; a non-zero `res2` fails the request too
fn event_result(event: &IoEvent, op_type: OperationType) -> Result<usize> {
    if event.res < 0 {
        let errno = (-event.res) as i32;
        return Err(std::io::Error::from_raw_os_error(errno))
            .with_context(|| format!("{} failed (errno {})", op_type, errno));
    }
    if event.res2 != 0 {
        anyhow::bail!("{} failed (res={}, res2={})", op_type, event.res, event.res2);
    }
    Ok(event.res as usize)
}

/// Request riding in a slab slot
#[derive(Debug, Clone, Copy)]
struct InFlight {
    user_data: u64,
    op_type: OperationType,
}

/// Linux AIO engine
pub struct LibaioEngine {
    ctx: Option<AioContext>,
    queue_depth: usize,
    /// The kernel holds pointers into this; never reallocated while initialised
    slab: Box<[Iocb]>,
    slots: Vec<Option<InFlight>>,
    free: Vec<usize>,
    events: Vec<IoEvent>,
}

impl LibaioEngine {
    pub fn new() -> Self {
        Self {
            ctx: None,
            queue_depth: 0,
            slab: Box::new([]),
            slots: Vec::new(),
            free: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Number of requests the kernel has not completed yet
    pub fn outstanding(&self) -> usize {
        self.queue_depth - self.free.len()
    }

    fn context(&self) -> Result<AioContext> {
        self.ctx.ok_or_else(|| anyhow::anyhow!("libaio engine not initialized"))
    }

    /// Slab slot for an `io_event.obj` address
    fn slot_of(&self, obj: u64) -> Option<usize> {
        let base = self.slab.as_ptr() as u64;
        let size = mem::size_of::<Iocb>() as u64;
        let offset = obj.checked_sub(base)?;
        if offset % size != 0 {
            return None;
        }
        let slot = (offset / size) as usize;
        (slot < self.slab.len()).then_some(slot)
    }

    fn completion(&mut self, event: IoEvent) -> Option<IOCompletion> {
        let slot = self.slot_of(event.obj)?;
        let req = self.slots[slot].take()?;
        self.free.push(slot);

        Some(IOCompletion {
            user_data: req.user_data,
            result: event_result(&event, req.op_type),
            op_type: req.op_type,
        })
    }
}

impl Default for LibaioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEngine for LibaioEngine {
    fn init(&mut self, config: &EngineConfig) -> Result<()> {
        let qd = config.queue_depth.max(1);
        let mut ctx: AioContext = 0;
        sys_io_setup(qd, &mut ctx).with_context(|| {
            format!("io_setup failed with queue_depth={} (check /proc/sys/fs/aio-max-nr)", qd)
        })?;

        self.ctx = Some(ctx);
        self.queue_depth = qd;
        self.slab = vec![Iocb::default(); qd].into_boxed_slice();
        self.slots = vec![None; qd];
        self.free = (0..qd).rev().collect();
        self.events = vec![IoEvent::default(); qd];

        tracing::debug!(queue_depth = qd, "libaio context created");
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let ctx = self.context()?;
        let slot = self
            .free
            .pop()
            .ok_or_else(|| anyhow::anyhow!("all {} iocbs in use", self.queue_depth))?;

        self.slab[slot] = Iocb {
            aio_data: op.user_data,
            aio_lio_opcode: match op.op_type {
                OperationType::Read => IOCB_CMD_PREAD,
                OperationType::Write => IOCB_CMD_PWRITE,
                OperationType::Fsync => IOCB_CMD_FSYNC,
            },
            aio_fildes: op.target_fd as u32,
            aio_buf: op.buffer as u64,
            aio_nbytes: op.length as u64,
            aio_offset: op.offset as i64,
            ..Iocb::default()
        };

        let accepted = sys_io_submit(ctx, &mut self.slab[slot] as *mut Iocb);
        match accepted {
            Ok(1) => {
                self.slots[slot] = Some(InFlight {
                    user_data: op.user_data,
                    op_type: op.op_type,
                });
                Ok(())
            }
            other => {
                self.free.push(slot);
                let err = match other {
                    Err(e) => e,
                    Ok(_) => std::io::Error::from_raw_os_error(libc::EAGAIN),
                };
                Err(err).with_context(|| {
                    format!("io_submit rejected {} at offset {} ({} bytes)", op.op_type, op.offset, op.length)
                })
            }
        }
    }

    fn poll_completions(
        &mut self,
        min_complete: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<IOCompletion>> {
        let ctx = self.context()?;
        let outstanding = self.outstanding();
        if outstanding == 0 {
            return Ok(Vec::new());
        }

        let max = outstanding.min(self.events.len());
        let mut events = mem::take(&mut self.events);
        let got = sys_io_getevents(ctx, min_complete.min(max), &mut events[..max], timeout);
        let got = match got {
            Ok(n) => n,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => 0,
            Err(e) => {
                self.events = events;
                return Err(e).context("io_getevents failed");
            }
        };

        let mut completions = Vec::with_capacity(got);
        for &event in &events[..got] {
            match self.completion(event) {
                Some(c) => completions.push(c),
                None => tracing::warn!(user_data = event.data, "libaio event for an unknown iocb"),
            }
        }
        self.events = events;
        Ok(completions)
    }

    fn cleanup(&mut self) -> Result<()> {
        let Some(ctx) = self.ctx.take() else { return Ok(()) };
        let outstanding = self.outstanding();
        if outstanding > 0 {
            tracing::warn!(outstanding, "destroying libaio context with requests still outstanding");
        }
        // io_destroy waits for (or cancels) whatever is still in the kernel
        sys_io_destroy(ctx).context("io_destroy failed")?;
        self.slots.iter_mut().for_each(|s| *s = None);
        self.free = (0..self.queue_depth).rev().collect();
        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            name: "libaio",
            async_io: true,
            max_queue_depth: if self.queue_depth > 0 { self.queue_depth } else { 65536 },
        }
    }
}

impl Drop for LibaioEngine {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let _ = sys_io_destroy(ctx);
        }
    }
}
