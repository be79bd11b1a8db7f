//! Mach Inter-Process Communication records
//!
//! A task's capabilities live in its IPC space: a flat entry table mapping
//! port names to IPC objects. Objects are ports or port sets sharing the
//! `ipc_object` header.

pub mod entry;
pub mod ipc_object;
pub mod port;
pub mod space;
pub mod voucher;

pub use entry::{IpcEntry, IpcEntryIter};
pub use ipc_object::{ikot_name, IpcObject, IpcObjectBits, IpcObjectType};
pub use port::{IpcPort, PortFlags};
pub use space::IpcSpace;
pub use voucher::Voucher;

use crate::layout::Layout;
use crate::memory::MemoryReader;
use crate::types::KAddr;

/// An IPC object, specialized to a port when its bits say so
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcRecord {
    Object(IpcObject),
    Port(IpcPort),
}

impl IpcRecord {
    /// Decode the object header at `addr`, then the port extension if it is
    /// a port; `None` for NULL
    pub fn decode<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, addr: KAddr) -> Option<Self> {
        let object = IpcObject::decode(mem, layout, addr)?;
        Some(if object.is_port() {
            IpcRecord::Port(IpcPort::from_object(mem, layout, object))
        } else {
            IpcRecord::Object(object)
        })
    }

    pub fn object(&self) -> &IpcObject {
        match self {
            IpcRecord::Object(o) => o,
            IpcRecord::Port(p) => &p.object,
        }
    }

    pub fn as_port(&self) -> Option<&IpcPort> {
        match self {
            IpcRecord::Port(p) => Some(p),
            IpcRecord::Object(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ipc_object::IO_BITS_ACTIVE;
    use crate::memory::SnapshotMemory;

    #[test]
    fn test_port_set_stays_object() {
        let layout = Layout::ios_16b92();
        let addr = KAddr(0xffff_fff0_3900_0000);
        let mut mem = SnapshotMemory::new();
        mem.map_zeroed(addr, 0xa8);
        mem.write_u32(addr, IO_BITS_ACTIVE | (1 << 16));

        let rec = IpcRecord::decode(&mem, &layout, addr).unwrap();
        assert!(rec.as_port().is_none());
        assert_eq!(rec.object().address, addr);
    }

    #[test]
    fn test_port_is_specialized() {
        let layout = Layout::ios_16b92();
        let addr = KAddr(0xffff_fff0_3900_1000);
        let mut mem = SnapshotMemory::new();
        mem.map_zeroed(addr, 0xa8);
        mem.write_u32(addr, IO_BITS_ACTIVE);
        mem.write_u32(addr.offset(0xa0), 9);

        let rec = IpcRecord::decode(&mem, &layout, addr).unwrap();
        assert_eq!(rec.as_port().map(|p| p.srights), Some(crate::types::Field::Known(9)));
    }
}
