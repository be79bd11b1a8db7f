//! `struct proc` - pid and command name of a task's BSD process

use log::debug;

use crate::layout::Layout;
use crate::memory::{MemoryReader, RecordReader};
use crate::types::{Field, KAddr};

/// Upper bound on the inline name slot any layout may declare
pub const MAX_PROC_NAME: usize = 64;

/// Process name, bounded like the kernel's fixed-size `p_name` slot
pub type ProcName = heapless::String<MAX_PROC_NAME>;

/// Decoded `struct proc`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub address: KAddr,
    pub pid: Field<u32>,
    pub name: Field<ProcName>,
}

impl Process {
    /// Decode the proc at `addr`; `None` for NULL
    pub fn decode<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, addr: KAddr) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let off = &layout.proc;
        let rec = RecordReader::new(mem, "proc", addr);
        let slot = off.name_len.min(MAX_PROC_NAME);

        let process = Self {
            address: addr,
            pid: rec.u32(off.pid),
            name: rec.inline_str(off.name, slot).map(|raw| bounded_name(&raw)),
        };
        debug!("proc @ {}: pid {} name {}", addr, process.pid, process.name);
        Some(process)
    }

    /// Name for display; empty when unreadable
    pub fn name_str(&self) -> &str {
        match &self.name {
            Field::Known(name) => name.as_str(),
            Field::Unreadable(_) => "",
        }
    }
}

/// Cut at the first NUL, drop trailing padding, and fit the bounded string
fn bounded_name(raw: &str) -> ProcName {
    let visible = raw.split('\0').next().unwrap_or("");
    let trimmed = visible.trim_end_matches(|c: char| c.is_whitespace() || c.is_control());

    let mut name = ProcName::new();
    for c in trimmed.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SnapshotMemory;

    fn proc_at(mem: &mut SnapshotMemory, layout: &Layout, addr: KAddr, pid: u32, name: &[u8]) {
        mem.map_zeroed(addr, 0x300);
        mem.write_u32(addr.offset(layout.proc.pid), pid);
        mem.write_bytes(addr.offset(layout.proc.name), name);
    }

    #[test]
    fn test_decode_pid_and_name() {
        let layout = Layout::ios_16b92();
        let mut mem = SnapshotMemory::new();
        let addr = KAddr(0xffff_fff0_2000_0000);
        proc_at(&mut mem, &layout, addr, 1, b"launchd\0");

        let p = Process::decode(&mem, &layout, addr).unwrap();
        assert_eq!(p.pid, Field::Known(1));
        assert_eq!(p.name_str(), "launchd");
    }

    #[test]
    fn test_name_is_bounded_by_slot() {
        let layout = Layout::ios_16b92();
        let mut mem = SnapshotMemory::new();
        let addr = KAddr(0x8000);
        // 40 characters with no terminator inside the 33-byte slot
        proc_at(&mut mem, &layout, addr, 7, &[b'a'; 40]);

        let p = Process::decode(&mem, &layout, addr).unwrap();
        assert_eq!(p.name_str().len(), layout.proc.name_len);
    }

    #[test]
    fn test_trailing_padding_is_stripped() {
        assert_eq!(bounded_name("backboardd   ").as_str(), "backboardd");
        assert_eq!(bounded_name("sh\0garbage").as_str(), "sh");
    }

    #[test]
    fn test_null_proc_is_absent() {
        let mem = SnapshotMemory::new();
        assert!(Process::decode(&mem, &Layout::ios_16b92(), KAddr::NULL).is_none());
    }
}
