//! IPC Port - the message queue endpoint
//!
//! Based on XNU osfmk/ipc/ipc_port.h
//!
//! A port is an [`IpcObject`] extended in place: the object header sits at
//! the same address and the port fields follow at higher offsets. A port is
//! therefore decoded from an already-decoded object, never on its own.

use crate::ipc::ipc_object::IpcObject;
use crate::layout::Layout;
use crate::memory::{MemoryReader, RecordReader};
use crate::types::{Field, KAddr};

// ============================================================================
// Port Flags
// ============================================================================

/// Packed port flag word (`ip_sprequests` .. `ip_impcount`)
///
/// The low bits are single-bit flags; the same word is also read as a 9-bit
/// sync link state and a 23-bit importance count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortFlags(pub u32);

impl PortFlags {
    /// Send-possible notification requested
    pub const SPREQUESTS: Self = Self(1 << 0);
    /// Send-possible notification is importance-bearing
    pub const SPIMPORTANT: Self = Self(1 << 1);
    /// Importance donation enabled
    pub const IMPDONATION: Self = Self(1 << 2);
    /// Temporary owner of importance
    pub const TEMPOWNER: Self = Self(1 << 3);
    pub const GUARDED: Self = Self(1 << 4);
    pub const STRICT_GUARD: Self = Self(1 << 5);
    pub const SPECIALREPLY: Self = Self(1 << 6);

    pub const SYNC_LINK_STATE_MASK: u32 = 0x0000_01ff;
    pub const IMPCOUNT_MASK: u32 = 0xffff_fe00;
    pub const IMPCOUNT_SHIFT: u32 = 9;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn sprequests(self) -> bool {
        self.contains(Self::SPREQUESTS)
    }

    pub fn spimportant(self) -> bool {
        self.contains(Self::SPIMPORTANT)
    }

    pub fn impdonation(self) -> bool {
        self.contains(Self::IMPDONATION)
    }

    pub fn tempowner(self) -> bool {
        self.contains(Self::TEMPOWNER)
    }

    pub fn guarded(self) -> bool {
        self.contains(Self::GUARDED)
    }

    pub fn strict_guard(self) -> bool {
        self.contains(Self::STRICT_GUARD)
    }

    pub fn specialreply(self) -> bool {
        self.contains(Self::SPECIALREPLY)
    }

    /// 9-bit sync link state
    pub fn sync_link_state(self) -> u16 {
        (self.0 & Self::SYNC_LINK_STATE_MASK) as u16
    }

    /// 23-bit importance count
    pub fn impcount(self) -> u32 {
        (self.0 & Self::IMPCOUNT_MASK) >> Self::IMPCOUNT_SHIFT
    }
}

// ============================================================================
// IPC Port
// ============================================================================

/// Decoded `struct ipc_port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcPort {
    /// Object header at the same address
    pub object: IpcObject,
    /// Message queue head
    pub messages: Field<KAddr>,
    pub data: Field<u64>,
    pub kdata: Field<u64>,
    /// No-senders notification port
    pub nsrequest: Field<KAddr>,
    /// Port-destroyed notification port
    pub pdrequest: Field<KAddr>,
    /// Dead-name request table
    pub requests: Field<KAddr>,
    pub kdata2: Field<u64>,
    pub context: Field<u64>,
    pub flags: Field<PortFlags>,
    /// Make-send count
    pub mscount: Field<u32>,
    pub srights: Field<u32>,
    pub sorights: Field<u32>,
}

impl IpcPort {
    /// Decode the port extension on top of `object`
    pub fn from_object<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, object: IpcObject) -> Self {
        let off = &layout.ipc_port;
        let rec = RecordReader::new(mem, "ipc_port", object.address);
        Self {
            messages: rec.ptr(off.messages),
            data: rec.u64(off.data),
            kdata: rec.u64(off.kdata),
            nsrequest: rec.ptr(off.nsrequest),
            pdrequest: rec.ptr(off.pdrequest),
            requests: rec.ptr(off.requests),
            kdata2: rec.u64(off.kdata2),
            context: rec.u64(off.context),
            flags: rec.u32(off.flags).map(PortFlags),
            mscount: rec.u32(off.mscount),
            srights: rec.u32(off.srights),
            sorights: rec.u32(off.sorights),
            object,
        }
    }

    /// Decode object and port at `addr`; `None` for NULL
    pub fn decode<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, addr: KAddr) -> Option<Self> {
        IpcObject::decode(mem, layout, addr).map(|object| Self::from_object(mem, layout, object))
    }

    pub fn address(&self) -> KAddr {
        self.object.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SnapshotMemory;

    #[test]
    fn test_flag_views() {
        let flags = PortFlags(0b101_0101 | (7 << 9));
        assert!(flags.sprequests());
        assert!(!flags.spimportant());
        assert!(flags.impdonation());
        assert!(flags.guarded());
        assert!(flags.specialreply());
        assert!(!flags.strict_guard());
        assert_eq!(flags.impcount(), 7);
        assert_eq!(flags.sync_link_state(), 0b101_0101);
    }

    #[test]
    fn test_impcount_uses_top_23_bits() {
        assert_eq!(PortFlags(u32::MAX).impcount(), (1 << 23) - 1);
        assert_eq!(PortFlags(u32::MAX).sync_link_state(), 0x1ff);
    }

    #[test]
    fn test_decode_port_counts_are_32_bit() {
        let layout = Layout::ios_16b92();
        let addr = KAddr(0xffff_fff0_3100_0000);
        let mut mem = SnapshotMemory::new();
        mem.map_zeroed(addr, 0xa8);
        mem.write_u32(addr.offset(0x9c), 4);
        mem.write_u32(addr.offset(0xa0), 2);
        mem.write_u32(addr.offset(0xa4), 1);
        mem.write_u64(addr.offset(0x90), 0xc0ffee);

        let port = IpcPort::decode(&mem, &layout, addr).unwrap();
        assert_eq!(port.address(), addr);
        assert_eq!(port.mscount, Field::Known(4));
        assert_eq!(port.srights, Field::Known(2));
        assert_eq!(port.sorights, Field::Known(1));
        assert_eq!(port.context, Field::Known(0xc0ffee));
    }

    #[test]
    fn test_unreadable_tail_keeps_header() {
        let layout = Layout::ios_16b92();
        let addr = KAddr(0x7000);
        let mut mem = SnapshotMemory::new();
        // Header only
        mem.map_zeroed(addr, 0x18);

        let port = IpcPort::decode(&mem, &layout, addr).unwrap();
        assert!(port.object.bits.is_known());
        assert!(!port.flags.is_known());
    }
}
