//! Thread records and thread-list traversal
//!
//! Threads are linked twice: once on the global `threads` queue and once on
//! their task's thread queue, through two different chain fields. Both
//! queues are circular through their head.

use log::debug;

use crate::error::{IntrospectError, Result};
use crate::kern::queue::QueueWalk;
use crate::kern::sched_prim::{recover_next_pc, CurrentThread, NextPc};
use crate::layout::Layout;
use crate::memory::{MemoryReader, RecordReader};
use crate::types::{Field, KAddr};

// ============================================================================
// Thread
// ============================================================================

/// Decoded `struct thread`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub address: KAddr,
    /// Owning task
    pub task: Field<KAddr>,
    pub thread_id: Field<u64>,
    /// Pending continuation; NULL when none
    pub continuation: Field<KAddr>,
    /// Saved user register context; NULL for kernel-only threads
    pub user_context: Field<KAddr>,
    /// Saved kernel context; NULL when the thread has no kernel stack
    pub kernel_stack: Field<KAddr>,
    pub voucher: Field<KAddr>,
    pub voucher_name: Field<u32>,
    pub global_link: Field<KAddr>,
    pub task_link: Field<KAddr>,
    /// Address this thread will execute next
    pub next_pc: NextPc,
}

impl Thread {
    /// Decode the thread at `addr` and recover its next pc; `None` for NULL
    pub fn decode<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, addr: KAddr) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        Self::decode_with(mem, layout, addr, CurrentThread::evaluate(mem, layout))
    }

    /// Decode against an already evaluated current thread
    pub fn decode_with<M: MemoryReader + ?Sized>(
        mem: &M,
        layout: &Layout,
        addr: KAddr,
        current: CurrentThread,
    ) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let off = &layout.thread;
        let rec = RecordReader::new(mem, "thread", addr);

        let mut thread = Self {
            address: addr,
            task: rec.ptr(off.task),
            thread_id: rec.u64(off.thread_id),
            continuation: rec.ptr(off.continuation),
            user_context: rec.ptr(off.user_context),
            kernel_stack: rec.ptr(off.kernel_stack),
            voucher: rec.ptr(off.voucher),
            voucher_name: rec.u32(off.voucher_name),
            global_link: rec.ptr(off.global_threads),
            task_link: rec.ptr(off.task_threads),
            next_pc: NextPc::NotApplicable,
        };
        thread.next_pc = recover_next_pc(mem, layout, Some(&thread), current);
        debug!("thread {} tid {} next pc {}", addr, thread.thread_id, thread.next_pc);
        Some(thread)
    }

    /// Thread with only its pc locators set
    #[cfg(test)]
    pub(crate) fn blank(address: KAddr, user_context: Field<KAddr>, kernel_stack: Field<KAddr>) -> Self {
        Self {
            address,
            task: Field::Known(KAddr::NULL),
            thread_id: Field::Known(0),
            continuation: Field::Known(KAddr::NULL),
            user_context,
            kernel_stack,
            voucher: Field::Known(KAddr::NULL),
            voucher_name: Field::Known(0),
            global_link: Field::Known(KAddr::NULL),
            task_link: Field::Known(KAddr::NULL),
            next_pc: NextPc::NotApplicable,
        }
    }

    /// Whether the thread carries a user register context
    pub fn is_user(&self) -> bool {
        self.user_context.non_null().is_some()
    }

    pub fn has_continuation(&self) -> bool {
        self.continuation.non_null().is_some()
    }
}

// ============================================================================
// Thread Lists
// ============================================================================

/// Which thread queue to walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadList {
    /// Every thread in the system
    Global,
    /// Threads of the task at this address
    Task(KAddr),
}

/// Lazy walk over a thread queue
pub struct ThreadIter<'a, M: ?Sized> {
    mem: &'a M,
    layout: &'a Layout,
    walk: QueueWalk,
    current: CurrentThread,
}

impl<'a, M: MemoryReader + ?Sized> ThreadIter<'a, M> {
    /// Start walking `list`; a per-task walk of a NULL task is rejected
    pub fn new(mem: &'a M, layout: &'a Layout, list: ThreadList) -> Result<Self> {
        let (anchor, link) = match list {
            ThreadList::Global => (layout.globals.threads, layout.thread.global_threads),
            ThreadList::Task(task) if task.is_null() => {
                return Err(IntrospectError::NullAddress { what: "task" });
            }
            ThreadList::Task(task) => (task.offset(layout.task.threads), layout.thread.task_threads),
        };
        let walk = QueueWalk::start(mem, anchor, link)?;
        let current = CurrentThread::evaluate(mem, layout);
        Ok(Self { mem, layout, walk, current })
    }
}

impl<M: MemoryReader + ?Sized> Iterator for ThreadIter<'_, M> {
    type Item = Result<Thread>;

    fn next(&mut self) -> Option<Self::Item> {
        let addr = match self.walk.step(self.mem)? {
            Ok(addr) => addr,
            Err(e) => return Some(Err(e)),
        };
        Thread::decode_with(self.mem, self.layout, addr, self.current)
            .map(Ok)
            .or(Some(Err(IntrospectError::NullAddress { what: "thread" })))
    }
}
