//! IPC Space - Per-task IPC capability namespace
//!
//! Based on XNU osfmk/ipc/ipc_space.h
//! Every task has an IPC space whose entry table maps port names to rights.

use crate::layout::Layout;
use crate::memory::{MemoryReader, RecordReader};
use crate::types::{Field, KAddr};

/// Decoded `struct ipc_space`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcSpace {
    pub address: KAddr,
    /// Base of the entry table
    pub table: Field<KAddr>,
    /// Entry table capacity; slot 0 is reserved
    pub table_size: Field<u32>,
    /// Free entries remaining
    pub table_free: Field<u32>,
    pub low_mod: Field<u32>,
    pub high_mod: Field<u32>,
}

impl IpcSpace {
    /// Decode the space at `addr`; `None` for NULL
    pub fn decode<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, addr: KAddr) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let off = &layout.ipc_space;
        let rec = RecordReader::new(mem, "ipc_space", addr);
        Some(Self {
            address: addr,
            table: rec.ptr(off.table),
            table_size: rec.u32(off.table_size),
            table_free: rec.u32(off.table_free),
            low_mod: rec.u32(off.low_mod),
            high_mod: rec.u32(off.high_mod),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SnapshotMemory;

    #[test]
    fn test_decode_space() {
        let layout = Layout::ios_16b92();
        let addr = KAddr(0xffff_fff0_3200_0000);
        let mut mem = SnapshotMemory::new();
        mem.map_zeroed(addr, 0x40);
        mem.write_u32(addr.offset(0x14), 64);
        mem.write_u32(addr.offset(0x18), 60);
        mem.write_ptr(addr.offset(0x20), KAddr(0xffff_fff0_3300_0000));

        let space = IpcSpace::decode(&mem, &layout, addr).unwrap();
        assert_eq!(space.table_size, Field::Known(64));
        assert_eq!(space.table_free, Field::Known(60));
        assert_eq!(space.table, Field::Known(KAddr(0xffff_fff0_3300_0000)));
    }

    #[test]
    fn test_decode_null_is_absent() {
        let mem = SnapshotMemory::new();
        assert!(IpcSpace::decode(&mem, &Layout::ios_16b92(), KAddr::NULL).is_none());
    }
}
