//! io_uring engine
//!
//! Each `submit()` queues one SQE and enters the kernel straight away, so a
//! rejected request fails at submission like it does under libaio. SQEs carry
//! a slot index rather than the caller's token; the slot table maps it back.
//! Bounded waits use `IORING_ENTER_EXT_ARG` (Linux 5.11+), where an expired
//! wait reports `ETIME` and simply means nothing finished yet.

use super::{EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation, OperationType};
use crate::Result;
use anyhow::Context;
use io_uring::{cqueue, opcode, squeue, types, IoUring};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    user_data: u64,
    op_type: OperationType,
}

/// io_uring engine
pub struct IoUringEngine {
    ring: Option<IoUring>,
    queue_depth: usize,
    slots: Vec<Option<InFlight>>,
    free: Vec<usize>,
}

fn build_entry(op: &IOOperation, slot: usize) -> squeue::Entry {
    let fd = types::Fd(op.target_fd);
    let entry = match op.op_type {
        OperationType::Read => opcode::Read::new(fd, op.buffer, op.length as u32)
            .offset(op.offset)
            .build(),
        OperationType::Write => opcode::Write::new(fd, op.buffer as *const u8, op.length as u32)
            .offset(op.offset)
            .build(),
        OperationType::Fsync => opcode::Fsync::new(fd).build(),
    };
    entry.user_data(slot as u64)
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY))
}

impl IoUringEngine {
    pub fn new() -> Self {
        Self {
            ring: None,
            queue_depth: 0,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Requests submitted and not yet reaped
    pub fn outstanding(&self) -> usize {
        self.queue_depth - self.free.len()
    }

    fn ring(&mut self) -> Result<&mut IoUring> {
        self.ring
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("io_uring engine not initialized"))
    }

    fn reap(&mut self, out: &mut Vec<IOCompletion>) -> Result<()> {
        let cqes: Vec<cqueue::Entry> = self.ring()?.completion().collect();
        for cqe in cqes {
            let slot = cqe.user_data() as usize;
            let Some(req) = self.slots.get_mut(slot).and_then(Option::take) else {
                tracing::warn!(slot, "io_uring completion for an empty slot");
                continue;
            };
            self.free.push(slot);

            let res = cqe.result();
            let result = if res >= 0 {
                Ok(res as usize)
            } else {
                Err(std::io::Error::from_raw_os_error(-res))
                    .with_context(|| format!("{} failed (errno {})", req.op_type, -res))
            };
            out.push(IOCompletion {
                user_data: req.user_data,
                result,
                op_type: req.op_type,
            });
        }
        Ok(())
    }
}

impl Default for IoUringEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEngine for IoUringEngine {
    fn init(&mut self, config: &EngineConfig) -> Result<()> {
        let qd = config.queue_depth.max(1);
        let ring = IoUring::new(qd as u32)
            .with_context(|| format!("io_uring_setup failed with queue_depth={}", qd))?;

        self.ring = Some(ring);
        self.queue_depth = qd;
        self.slots = vec![None; qd];
        self.free = (0..qd).rev().collect();

        tracing::debug!(queue_depth = qd, "io_uring instance created");
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let slot = self
            .free
            .pop()
            .ok_or_else(|| anyhow::anyhow!("all {} io_uring slots in use", self.queue_depth))?;
        let entry = build_entry(&op, slot);

        let queued = self.ring().and_then(|ring| {
            // SAFETY: the caller keeps the buffer alive until the completion is reaped
            unsafe { ring.submission().push(&entry) }
                .map_err(|_| anyhow::anyhow!("submission queue full"))?;
            ring.submit()
                .with_context(|| format!("io_uring_enter failed for {} at offset {}", op.op_type, op.offset))
        });
        if let Err(e) = queued {
            self.free.push(slot);
            return Err(e);
        }

        self.slots[slot] = Some(InFlight {
            user_data: op.user_data,
            op_type: op.op_type,
        });
        Ok(())
    }

    fn poll_completions(
        &mut self,
        min_complete: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<IOCompletion>> {
        let mut done = Vec::new();
        self.reap(&mut done)?;

        let need = min_complete.min(self.outstanding() + done.len()).saturating_sub(done.len());
        if need == 0 {
            return Ok(done);
        }

        let ring = self.ring()?;
        let waited = match timeout {
            None => ring.submit_and_wait(need),
            Some(t) if t.is_zero() => ring.submit(),
            Some(t) => {
                let ts = types::Timespec::new().sec(t.as_secs()).nsec(t.subsec_nanos());
                ring.submitter()
                    .submit_with_args(need, &types::SubmitArgs::new().timespec(&ts))
            }
        };
        match waited {
            Err(e) if !is_transient(&e) => return Err(e).context("waiting for io_uring completions failed"),
            _ => {}
        }

        self.reap(&mut done)?;
        Ok(done)
    }

    fn cleanup(&mut self) -> Result<()> {
        if self.ring.is_none() {
            return Ok(());
        }
        let outstanding = self.outstanding();
        if outstanding > 0 {
            tracing::warn!(outstanding, "dropping io_uring instance with requests still outstanding");
        }
        // Unmapping the rings lets the kernel finish or cancel the rest
        self.ring = None;
        self.slots.iter_mut().for_each(|s| *s = None);
        self.free = (0..self.queue_depth).rev().collect();
        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            name: "io_uring",
            async_io: true,
            max_queue_depth: if self.queue_depth > 0 { self.queue_depth } else { 4096 },
        }
    }
}
