//! BSD-side process state hanging off a Mach task (`task->bsd_info`)

pub mod proc;

pub use proc::{ProcName, Process, MAX_PROC_NAME};
