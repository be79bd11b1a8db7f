//! Kern subsystem - scheduling-side kernel records
//!
//! Based on the XNU osfmk/kern/ structures: tasks, threads, the intrusive
//! queues linking them, next-pc recovery for switched-out threads, and the
//! zone allocator array.

pub mod queue;
pub mod sched_prim;
pub mod task;
pub mod thread;
pub mod zalloc;

pub use queue::QueueWalk;
pub use sched_prim::{recover_next_pc, CurrentThread, NextPc, Unresolved};
pub use task::{Task, TaskIter};
pub use thread::{Thread, ThreadIter, ThreadList};
pub use zalloc::{zone_count, Zone, ZoneFlags, ZoneIter};
