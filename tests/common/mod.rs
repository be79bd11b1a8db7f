//! Synthetic kernel images for integration tests
//!
//! Records are mapped zero-filled first and linked afterwards; linking only
//! writes pointers, so map every record before wiring it into a queue.

#![allow(dead_code)]

use xnu_introspect::{KAddr, Layout, Session, SnapshotMemory};

pub const TASK_SIZE: usize = 0x400;
pub const THREAD_SIZE: usize = 0x600;
pub const SAVED_STATE_SIZE: usize = 0x128;

pub struct SyntheticKernel {
    pub layout: Layout,
    pub mem: SnapshotMemory,
}

impl SyntheticKernel {
    /// Empty task and thread queues, no zones, an idle cpu
    pub fn new() -> Self {
        let mut k = Self::without_current_thread();
        k.mem.set_register("TPIDR_EL1", 0);
        k
    }

    /// Like `new`, but the current-thread register cannot be evaluated
    pub fn without_current_thread() -> Self {
        let layout = Layout::ios_16b92();
        let mut mem = SnapshotMemory::new();
        mem.write_ptr(layout.globals.tasks, layout.globals.tasks);
        mem.write_ptr(layout.globals.threads, layout.globals.threads);
        mem.write_u32(layout.globals.num_zones, 0);
        Self { layout, mem }
    }

    /// Map a zeroed task whose own thread queue is empty
    pub fn task(&mut self, addr: KAddr) -> &mut Self {
        self.mem.map_zeroed(addr, TASK_SIZE);
        let anchor = addr.offset(self.layout.task.threads);
        self.mem.write_ptr(anchor, anchor);
        self
    }

    pub fn thread(&mut self, addr: KAddr) -> &mut Self {
        self.mem.map_zeroed(addr, THREAD_SIZE);
        self
    }

    /// Chain `elems` into the circular queue headed at `anchor`
    pub fn link(&mut self, anchor: KAddr, link: u64, elems: &[KAddr]) -> &mut Self {
        let mut slot = anchor;
        for &elem in elems {
            self.mem.write_ptr(slot, elem);
            slot = elem.offset(link);
        }
        self.mem.write_ptr(slot, anchor);
        self
    }

    pub fn link_tasks(&mut self, tasks: &[KAddr]) -> &mut Self {
        let (anchor, link) = (self.layout.globals.tasks, self.layout.task.next);
        self.link(anchor, link, tasks)
    }

    pub fn link_global_threads(&mut self, threads: &[KAddr]) -> &mut Self {
        let (anchor, link) = (self.layout.globals.threads, self.layout.thread.global_threads);
        self.link(anchor, link, threads)
    }

    pub fn link_task_threads(&mut self, task: KAddr, threads: &[KAddr]) -> &mut Self {
        let anchor = task.offset(self.layout.task.threads);
        let link = self.layout.thread.task_threads;
        self.link(anchor, link, threads)
    }

    /// Map a saved state whose pc is `pc` and sp is `sp`
    pub fn saved_state(&mut self, addr: KAddr, pc: KAddr, sp: KAddr) -> &mut Self {
        let ss = &self.layout.saved_state;
        let (pc_off, sp_off) = (ss.header + ss.pc, ss.header + ss.sp);
        self.mem.map_zeroed(addr, SAVED_STATE_SIZE);
        self.mem.write_ptr(addr.offset(pc_off), pc);
        self.mem.write_ptr(addr.offset(sp_off), sp);
        self
    }

    pub fn set_thread_ptr(&mut self, thread: KAddr, offset: u64, value: KAddr) -> &mut Self {
        self.mem.write_ptr(thread.offset(offset), value);
        self
    }

    pub fn set_num_zones(&mut self, count: u32) -> &mut Self {
        self.mem.write_u32(self.layout.globals.num_zones, count);
        self
    }

    pub fn attach(self) -> Session<SnapshotMemory> {
        Session::attach(self.mem, self.layout).expect("synthetic kernel should attach")
    }
}

/// Distinct kernel addresses, `stride` bytes apart, starting at `base`
pub fn kaddrs(base: u64, stride: u64, count: usize) -> Vec<KAddr> {
    (0..count as u64).map(|i| KAddr(base + i * stride)).collect()
}
