//! IPC Entry - Port name to capability translation
//!
//! Based on XNU osfmk/ipc/ipc_entry.h
//! Each ipc_entry records a capability (port right) in a task's IPC space.
//! Entries are stored in a flat table indexed by port name.

use log::{debug, warn};

use crate::error::{IntrospectError, Result};
use crate::ipc::space::IpcSpace;
use crate::layout::Layout;
use crate::memory::{MemoryReader, RecordReader};
use crate::types::{Field, KAddr};

/// Entry bits field type
pub type IpcEntryBits = u32;

// ============================================================================
// Entry Bits Constants
// ============================================================================

/// Mask for user references (16 bits)
pub const IE_BITS_UREFS_MASK: u32 = 0x0000_FFFF;

/// Mask for the right type
pub const IE_BITS_TYPE_MASK: u32 = 0x001F_0000;

/// Mask for the generation number
pub const IE_BITS_GEN_MASK: u32 = 0xFF00_0000;

// Port right types, in IE_BITS_TYPE position
pub const MACH_PORT_TYPE_SEND: u32 = 0x0001_0000;
pub const MACH_PORT_TYPE_RECEIVE: u32 = 0x0002_0000;
pub const MACH_PORT_TYPE_SEND_ONCE: u32 = 0x0004_0000;
pub const MACH_PORT_TYPE_PORT_SET: u32 = 0x0008_0000;
pub const MACH_PORT_TYPE_DEAD_NAME: u32 = 0x0010_0000;

/// Extract user references from bits
pub const fn ie_bits_urefs(bits: IpcEntryBits) -> u16 {
    (bits & IE_BITS_UREFS_MASK) as u16
}

pub const fn ie_bits_gen(bits: IpcEntryBits) -> u32 {
    bits & IE_BITS_GEN_MASK
}

/// Short names of the rights present in `bits`
pub fn right_names(bits: IpcEntryBits) -> Vec<&'static str> {
    [
        (MACH_PORT_TYPE_SEND, "send"),
        (MACH_PORT_TYPE_RECEIVE, "receive"),
        (MACH_PORT_TYPE_SEND_ONCE, "send-once"),
        (MACH_PORT_TYPE_PORT_SET, "port-set"),
        (MACH_PORT_TYPE_DEAD_NAME, "dead-name"),
    ]
    .iter()
    .filter(|(mask, _)| bits & mask != 0)
    .map(|(_, name)| *name)
    .collect()
}

// ============================================================================
// IPC Entry
// ============================================================================

/// Decoded `struct ipc_entry`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcEntry {
    pub address: KAddr,
    /// Position in the owning table
    pub index: u64,
    /// Port or port set; NULL for a free slot
    pub object: Field<KAddr>,
    /// Capability bits: type | urefs | generation
    pub bits: Field<IpcEntryBits>,
    /// Hash index for reverse lookups
    pub ie_index: Field<u32>,
    /// Next free index, or pending request index for live entries
    pub next: Field<u32>,
}

impl IpcEntry {
    /// Decode the entry at `addr`, slot `index` of its table; `None` for NULL
    pub fn decode<M: MemoryReader + ?Sized>(
        mem: &M,
        layout: &Layout,
        addr: KAddr,
        index: u64,
    ) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let rec = RecordReader::new(mem, "ipc_entry", addr);
        Some(Self::read_with_bits(&rec, layout, index, rec.u32(layout.ipc_entry.bits)))
    }

    fn read_with_bits<M: MemoryReader + ?Sized>(
        rec: &RecordReader<'_, M>,
        layout: &Layout,
        index: u64,
        bits: Field<IpcEntryBits>,
    ) -> Self {
        let off = &layout.ipc_entry;
        Self {
            address: rec.base(),
            index,
            object: rec.ptr(off.object),
            bits,
            ie_index: rec.u32(off.ie_index),
            next: rec.u32(off.next),
        }
    }

    /// A slot is live iff any right-type bit is set
    pub fn is_live(&self, layout: &Layout) -> bool {
        matches!(self.bits, Field::Known(b) if b & layout.ipc_entry.type_mask != 0)
    }

    pub fn urefs(&self) -> Field<u16> {
        self.bits.map(ie_bits_urefs)
    }

    pub fn rights(&self) -> Vec<&'static str> {
        self.bits.known().map(right_names).unwrap_or_default()
    }
}

// ============================================================================
// Entry Table Iteration
// ============================================================================

/// Lazy walk over the live entries of one space's table
///
/// Reads only `[0, capacity)`. Free slots cost one read of their bits word.
/// A slot whose bits cannot be read is reported and the walk goes on.
pub struct IpcEntryIter<'a, M: ?Sized> {
    mem: &'a M,
    layout: &'a Layout,
    table: KAddr,
    capacity: u64,
    next: u64,
}

impl<'a, M: MemoryReader + ?Sized> IpcEntryIter<'a, M> {
    /// Validate the table bounds of `space` and start at slot 0
    pub fn new(mem: &'a M, layout: &'a Layout, space: &IpcSpace) -> Result<Self> {
        let capacity = space.table_size.require("ipc space table size")? as u64;
        if capacity > layout.ipc_entry.max_table_size {
            warn!("ipc_space {}: table size {} is implausible", space.address, capacity);
            return Err(IntrospectError::BadTableCapacity {
                table: "ipc entry table",
                address: space.address,
                capacity,
                limit: layout.ipc_entry.max_table_size,
            });
        }
        let table = space.table.require("ipc space table")?;
        if table.is_null() && capacity > 0 {
            return Err(IntrospectError::NullAddress { what: "ipc entry table" });
        }
        debug!("ipc_space {}: table {} capacity {}", space.address, table, capacity);
        Ok(Self {
            mem,
            layout,
            table,
            capacity,
            next: 0,
        })
    }
}

impl<M: MemoryReader + ?Sized> Iterator for IpcEntryIter<'_, M> {
    type Item = Result<IpcEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let off = &self.layout.ipc_entry;
        while self.next < self.capacity {
            let index = self.next;
            self.next += 1;

            let addr = self.table.offset(index.wrapping_mul(off.stride));
            let bits_addr = addr.offset(off.bits);
            let bits = match self.mem.read_u32(bits_addr) {
                Ok(bits) => bits,
                Err(e) => {
                    warn!("ipc entry {}: bits at {} unreadable: {}", index, bits_addr, e);
                    return Some(Err(IntrospectError::unreadable(bits_addr, e)));
                }
            };
            if bits & off.type_mask == 0 {
                continue;
            }
            let rec = RecordReader::new(self.mem, "ipc_entry", addr);
            return Some(Ok(IpcEntry::read_with_bits(
                &rec,
                self.layout,
                index,
                Field::Known(bits),
            )));
        }
        None
    }
}
