//! Task records and the global task list
//!
//! A task is the kernel-side container for a process: it owns a thread queue,
//! an IPC space and (for BSD processes) a `struct proc`. Tasks are chained on
//! the global `tasks` queue, circular through its head.

use log::debug;

use crate::error::Result;
use crate::kern::queue::QueueWalk;
use crate::layout::Layout;
use crate::memory::{MemoryReader, RecordReader};
use crate::types::{Field, KAddr};

// ============================================================================
// Task
// ============================================================================

/// Decoded `struct task`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub address: KAddr,
    /// Next task on the global queue (the queue head after the last task)
    pub next: Field<KAddr>,
    /// Head of this task's thread queue; an address inside the task
    pub threads_anchor: KAddr,
    /// `struct proc`; NULL for tasks without a BSD process
    pub bsd_info: Field<KAddr>,
    pub ipc_space: Field<KAddr>,
    /// Send right to the task's own port
    pub itk_self: Field<KAddr>,
    pub itk_nself: Field<KAddr>,
    pub itk_sself: Field<KAddr>,
}

impl Task {
    /// Decode the task at `addr`; `None` for NULL
    pub fn decode<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, addr: KAddr) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let off = &layout.task;
        let rec = RecordReader::new(mem, "task", addr);

        let task = Self {
            address: addr,
            next: rec.ptr(off.next),
            threads_anchor: addr.offset(off.threads),
            bsd_info: rec.ptr(off.bsd_info),
            ipc_space: rec.ptr(off.ipc_space),
            itk_self: rec.ptr(off.itk_self),
            itk_nself: rec.ptr(off.itk_nself),
            itk_sself: rec.ptr(off.itk_sself),
        };
        debug!("task {}: proc {} space {}", addr, task.bsd_info, task.ipc_space);
        Some(task)
    }
}

// ============================================================================
// Task List
// ============================================================================

/// Lazy walk over the global task queue
pub struct TaskIter<'a, M: ?Sized> {
    mem: &'a M,
    layout: &'a Layout,
    walk: QueueWalk,
}

impl<'a, M: MemoryReader + ?Sized> TaskIter<'a, M> {
    pub fn new(mem: &'a M, layout: &'a Layout) -> Result<Self> {
        let walk = QueueWalk::start(mem, layout.globals.tasks, layout.task.next)?;
        Ok(Self { mem, layout, walk })
    }
}

impl<M: MemoryReader + ?Sized> Iterator for TaskIter<'_, M> {
    type Item = Result<Task>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.walk.step(self.mem)? {
            // The walk never yields NULL, so the decode is always present
            Ok(addr) => Task::decode(self.mem, self.layout, addr).map(Ok),
            Err(e) => Some(Err(e)),
        }
    }
}
