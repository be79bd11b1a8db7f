//! Introspection session
//!
//! A [`Session`] pairs one address-space reader with one [`Layout`]. The
//! layout is checked against the target once, at attach, and is immutable
//! afterwards: there is no way to swap it on a live session, and every
//! iterator borrows the session, so a traversal always sees the layout it
//! started with.
//!
//! Nothing decoded here is cached. Every call reads the target again.

use log::{info, warn};

use crate::arch::aarch64::{exception_level, SavedRegisterState};
use crate::bsd::Process;
use crate::error::{IntrospectError, Result};
use crate::ipc::{IpcEntry, IpcEntryIter, IpcObject, IpcPort, IpcRecord, IpcSpace, Voucher};
use crate::kern::queue::QueueWalk;
use crate::kern::sched_prim::{recover_next_pc, CurrentThread, NextPc};
use crate::kern::zalloc::zone_count;
use crate::kern::{Task, TaskIter, Thread, ThreadIter, ThreadList, Zone, ZoneIter};
use crate::layout::Layout;
use crate::memory::MemoryReader;
use crate::types::KAddr;

/// Exception level of kernel code
pub const KERNEL_EL: u8 = 1;

pub struct Session<M> {
    mem: M,
    layout: Layout,
}

impl<M: MemoryReader> Session<M> {
    /// Check `layout` against the target and open a session
    ///
    /// Fails with [`IntrospectError::LayoutMismatch`] when the global anchors
    /// or the zone count do not look like the build the layout describes.
    pub fn attach(mem: M, layout: Layout) -> Result<Self> {
        layout.validate()?;
        let session = Self { mem, layout };
        session.check_anchor("tasks anchor", session.layout.globals.tasks)?;
        session.check_anchor("threads anchor", session.layout.globals.threads)?;
        session.check_zone_count()?;
        info!("attached with layout {}", session.layout.build);
        Ok(session)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    fn mismatch(&self, what: &'static str, address: KAddr, expected: &str, observed: String) -> IntrospectError {
        warn!("layout {} mismatch: {} at {}: {}", self.layout.build, what, address, observed);
        IntrospectError::LayoutMismatch {
            build: self.layout.build.clone(),
            what,
            address,
            expected: expected.to_string(),
            observed,
        }
    }

    /// A queue head holds a kernel pointer, or itself when the queue is empty
    fn check_anchor(&self, what: &'static str, anchor: KAddr) -> Result<()> {
        match self.mem.read_ptr(anchor) {
            Ok(first) if first.is_kernel_pointer() || first == anchor => Ok(()),
            Ok(first) => Err(self.mismatch(what, anchor, "kernel pointer", first.to_string())),
            Err(e) => Err(self.mismatch(what, anchor, "readable queue head", format!("unreadable: {}", e))),
        }
    }

    fn check_zone_count(&self) -> Result<()> {
        let cell = self.layout.globals.num_zones;
        let limit = self.layout.zone.max_zones;
        match self.mem.read_u32(cell) {
            Ok(n) if n <= limit => Ok(()),
            Ok(n) => Err(self.mismatch("num_zones", cell, &format!("at most {}", limit), n.to_string())),
            Err(e) => Err(self.mismatch("num_zones", cell, "readable count", format!("unreadable: {}", e))),
        }
    }

    // ------------------------------------------------------------------------
    // Traversals
    // ------------------------------------------------------------------------

    pub fn tasks(&self) -> Result<TaskIter<'_, M>> {
        TaskIter::new(&self.mem, &self.layout)
    }

    pub fn threads(&self, list: ThreadList) -> Result<ThreadIter<'_, M>> {
        ThreadIter::new(&self.mem, &self.layout, list)
    }

    pub fn ipc_entries(&self, space: &IpcSpace) -> Result<IpcEntryIter<'_, M>> {
        IpcEntryIter::new(&self.mem, &self.layout, space)
    }

    pub fn zones(&self) -> Result<ZoneIter<'_, M>> {
        ZoneIter::new(&self.mem, &self.layout)
    }

    // ------------------------------------------------------------------------
    // Decoders by address
    // ------------------------------------------------------------------------

    pub fn thread(&self, addr: KAddr) -> Option<Thread> {
        Thread::decode(&self.mem, &self.layout, addr)
    }

    pub fn task(&self, addr: KAddr) -> Option<Task> {
        Task::decode(&self.mem, &self.layout, addr)
    }

    pub fn process(&self, addr: KAddr) -> Option<Process> {
        Process::decode(&self.mem, &self.layout, addr)
    }

    pub fn ipc_space(&self, addr: KAddr) -> Option<IpcSpace> {
        IpcSpace::decode(&self.mem, &self.layout, addr)
    }

    pub fn ipc_entry(&self, addr: KAddr, index: u64) -> Option<IpcEntry> {
        IpcEntry::decode(&self.mem, &self.layout, addr, index)
    }

    pub fn ipc_object(&self, addr: KAddr) -> Option<IpcObject> {
        IpcObject::decode(&self.mem, &self.layout, addr)
    }

    /// Object at `addr` read as a port regardless of its type bits
    pub fn ipc_port(&self, addr: KAddr) -> Option<IpcPort> {
        IpcPort::decode(&self.mem, &self.layout, addr)
    }

    pub fn ipc_record(&self, addr: KAddr) -> Option<IpcRecord> {
        IpcRecord::decode(&self.mem, &self.layout, addr)
    }

    pub fn voucher(&self, addr: KAddr) -> Option<Voucher> {
        Voucher::decode(&self.mem, &self.layout, addr)
    }

    pub fn saved_state(&self, addr: KAddr) -> Option<SavedRegisterState> {
        SavedRegisterState::decode(&self.mem, &self.layout, addr)
    }

    /// Zone in slot `slot`, which must be below `num_zones`
    pub fn zone(&self, slot: u32) -> Result<Zone> {
        let count = zone_count(&self.mem, &self.layout)?;
        if slot >= count {
            return Err(IntrospectError::IndexOutOfRange {
                table: "zone_array",
                index: slot as u64,
                capacity: count as u64,
            });
        }
        Ok(Zone::decode(&self.mem, &self.layout, slot))
    }

    pub fn next_pc(&self, thread: Option<&Thread>) -> NextPc {
        recover_next_pc(&self.mem, &self.layout, thread, self.current())
    }

    // ------------------------------------------------------------------------
    // Target state
    // ------------------------------------------------------------------------

    fn evaluate(&self, expr: &str) -> Result<u64> {
        self.mem.evaluate(expr).map_err(|source| IntrospectError::Evaluate {
            expr: expr.to_string(),
            source,
        })
    }

    /// Thread running on the inspected cpu
    pub fn current_thread(&self) -> Result<KAddr> {
        self.evaluate(&self.layout.registers.current_thread).map(KAddr)
    }

    /// Current thread as a tri-state; a failed evaluation is logged, not raised
    pub fn current(&self) -> CurrentThread {
        CurrentThread::evaluate(&self.mem, &self.layout)
    }

    /// Task of the running thread
    pub fn current_task(&self) -> Result<KAddr> {
        let thread = self.current_thread()?;
        if thread.is_null() {
            return Err(IntrospectError::NullAddress { what: "current thread" });
        }
        let slot = thread.offset(self.layout.thread.task);
        self.mem
            .read_ptr(slot)
            .map_err(|e| IntrospectError::unreadable(slot, e))
    }

    /// Whether the target is stopped in kernel code (EL1)
    pub fn is_in_kernel_space(&self) -> Result<bool> {
        let cpsr = self.evaluate(&self.layout.registers.cpsr)?;
        Ok(exception_level(cpsr) == KERNEL_EL)
    }

    /// Whether `addr` is on the global task list
    pub fn task_exists(&self, addr: KAddr) -> Result<bool> {
        self.on_queue(self.layout.globals.tasks, self.layout.task.next, addr)
    }

    /// Whether `addr` is on the global thread list
    pub fn thread_exists(&self, addr: KAddr) -> Result<bool> {
        self.on_queue(self.layout.globals.threads, self.layout.thread.global_threads, addr)
    }

    /// Follow only the chain links of a queue; elements are not decoded
    fn on_queue(&self, anchor: KAddr, link: u64, addr: KAddr) -> Result<bool> {
        let mut walk = QueueWalk::start(&self.mem, anchor, link)?;
        while let Some(elem) = walk.step(&self.mem) {
            if elem? == addr {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------------
    // Related records, decoded on demand
    // ------------------------------------------------------------------------

    pub fn task_of(&self, thread: &Thread) -> Option<Task> {
        thread.task.non_null().and_then(|a| self.task(a))
    }

    pub fn voucher_of(&self, thread: &Thread) -> Option<Voucher> {
        thread.voucher.non_null().and_then(|a| self.voucher(a))
    }

    pub fn user_state_of(&self, thread: &Thread) -> Option<SavedRegisterState> {
        thread.user_context.non_null().and_then(|a| self.saved_state(a))
    }

    pub fn kernel_state_of(&self, thread: &Thread) -> Option<SavedRegisterState> {
        thread.kernel_stack.non_null().and_then(|a| self.saved_state(a))
    }

    pub fn process_of(&self, task: &Task) -> Option<Process> {
        task.bsd_info.non_null().and_then(|a| self.process(a))
    }

    pub fn space_of(&self, task: &Task) -> Option<IpcSpace> {
        task.ipc_space.non_null().and_then(|a| self.ipc_space(a))
    }

    pub fn self_port_of(&self, task: &Task) -> Option<IpcPort> {
        task.itk_self.non_null().and_then(|a| self.ipc_port(a))
    }

    pub fn object_of(&self, entry: &IpcEntry) -> Option<IpcRecord> {
        entry.object.non_null().and_then(|a| self.ipc_record(a))
    }

    /// The entry's object if it is a port
    pub fn port_of(&self, entry: &IpcEntry) -> Option<IpcPort> {
        match self.object_of(entry)? {
            IpcRecord::Port(port) => Some(port),
            IpcRecord::Object(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SnapshotMemory;

    fn minimal_target(layout: &Layout) -> SnapshotMemory {
        let mut mem = SnapshotMemory::new();
        // Empty task and thread queues point at themselves
        mem.write_ptr(layout.globals.tasks, layout.globals.tasks);
        mem.write_ptr(layout.globals.threads, layout.globals.threads);
        mem.write_u32(layout.globals.num_zones, 0);
        mem
    }

    #[test]
    fn test_attach_minimal_target() {
        let layout = Layout::ios_16b92();
        let session = Session::attach(minimal_target(&layout), layout).unwrap();
        assert_eq!(session.tasks().unwrap().count(), 0);
        assert_eq!(session.zones().unwrap().count(), 0);
    }

    #[test]
    fn test_attach_rejects_wrong_anchor() {
        let layout = Layout::ios_16b92();
        let mut mem = minimal_target(&layout);
        mem.write_ptr(layout.globals.tasks, KAddr(0x1234));
        let err = Session::attach(mem, layout).err().unwrap();
        assert!(matches!(err, IntrospectError::LayoutMismatch { what: "tasks anchor", .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_attach_rejects_zone_count() {
        let layout = Layout::ios_16b92();
        let mut mem = minimal_target(&layout);
        mem.write_u32(layout.globals.num_zones, 5000);
        assert!(matches!(
            Session::attach(mem, layout).err(),
            Some(IntrospectError::LayoutMismatch { what: "num_zones", .. })
        ));
    }

    #[test]
    fn test_zone_slot_out_of_range() {
        let layout = Layout::ios_16b92();
        let session = Session::attach(minimal_target(&layout), layout).unwrap();
        assert!(matches!(
            session.zone(0),
            Err(IntrospectError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_kernel_space_from_cpsr() {
        let layout = Layout::ios_16b92();
        let mut mem = minimal_target(&layout);
        mem.set_register("cpsr", 0x6000_0304);
        let session = Session::attach(mem, layout.clone()).unwrap();
        assert!(session.is_in_kernel_space().unwrap());

        let mut mem = minimal_target(&layout);
        mem.set_register("cpsr", 0x6000_0000);
        let session = Session::attach(mem, layout).unwrap();
        assert!(!session.is_in_kernel_space().unwrap());
    }

    #[test]
    fn test_current_task() {
        let layout = Layout::ios_16b92();
        let mut mem = minimal_target(&layout);
        let thread = KAddr(0xffff_fff0_4000_0000);
        mem.set_register("TPIDR_EL1", thread.raw());
        mem.write_ptr(thread.offset(layout.thread.task), KAddr(0xffff_fff0_4100_0000));
        let session = Session::attach(mem, layout).unwrap();
        assert_eq!(session.current_thread().unwrap(), thread);
        assert_eq!(session.current_task().unwrap(), KAddr(0xffff_fff0_4100_0000));
    }

    #[test]
    fn test_missing_register_is_reported() {
        let layout = Layout::ios_16b92();
        let session = Session::attach(minimal_target(&layout), layout).unwrap();
        assert!(matches!(
            session.current_thread(),
            Err(IntrospectError::Evaluate { .. })
        ));
        assert_eq!(session.current(), CurrentThread::Unavailable);
    }
}
