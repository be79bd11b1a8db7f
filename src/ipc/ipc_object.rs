//! IPC Object - common header of ports and port sets
//!
//! Based on XNU osfmk/ipc/ipc_object.h
//!
//! Every port and port set starts with an `ipc_object`: a packed bits word,
//! a reference count and the object lock. The bits word layout:
//!
//! ```text
//!   31        30..16        15          11..0
//!   active    otype         prealloc    kotype
//! ```

use core::fmt;

use crate::layout::Layout;
use crate::memory::{MemoryReader, RecordReader};
use crate::types::{Field, KAddr};

// ============================================================================
// Object Bits
// ============================================================================

pub const IO_BITS_ACTIVE: u32 = 0x8000_0000;
pub const IO_BITS_OTYPE: u32 = 0x7fff_0000;
pub const IO_BITS_PREALLOC: u32 = 0x0000_8000;
pub const IO_BITS_KOTYPE: u32 = 0x0000_0fff;

/// Kind of IPC object, from the otype field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcObjectType {
    Port,
    PortSet,
    Other(u16),
}

impl IpcObjectType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Port => "port",
            Self::PortSet => "port-set",
            Self::Other(_) => "unknown",
        }
    }
}

/// Kernel object type names, indexed by `IKOT_*` value
pub const IKOT_NAMES: [&str; 42] = [
    "NONE",
    "THREAD",
    "TASK",
    "HOST",
    "HOST_PRIV",
    "PROCESSOR",
    "PSET",
    "PSET_NAME",
    "TIMER",
    "PAGING_REQUEST",
    "MIG",
    "MEMORY_OBJECT",
    "XMM_PAGER",
    "XMM_KERNEL",
    "XMM_REPLY",
    "UND_REPLY",
    "HOST_NOTIFY",
    "HOST_SECURITY",
    "LEDGER",
    "MASTER_DEVICE",
    "TASK_NAME",
    "SUBSYSTEM",
    "IO_DONE_QUEUE",
    "SEMAPHORE",
    "LOCK_SET",
    "CLOCK",
    "CLOCK_CTRL",
    "IOKIT_IDENT",
    "NAMED_ENTRY",
    "IOKIT_CONNECT",
    "IOKIT_OBJECT",
    "UPL",
    "MEM_OBJ_CONTROL",
    "AU_SESSIONPORT",
    "FILEPORT",
    "LABELH",
    "TASK_RESUME",
    "VOUCHER",
    "VOUCHER_ATTR_CONTROL",
    "WORK_INTERVAL",
    "UX_HANDLER",
    "UNKNOWN",
];

/// Name for a kernel object type; out-of-range values read as `UNKNOWN`
pub fn ikot_name(kotype: u16) -> &'static str {
    IKOT_NAMES
        .get(kotype as usize)
        .copied()
        .unwrap_or(IKOT_NAMES[IKOT_NAMES.len() - 1])
}

/// Packed `io_bits` word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpcObjectBits(pub u32);

impl IpcObjectBits {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_active(self) -> bool {
        self.0 & IO_BITS_ACTIVE != 0
    }

    pub fn otype(self) -> IpcObjectType {
        match ((self.0 & IO_BITS_OTYPE) >> 16) as u16 {
            0 => IpcObjectType::Port,
            1 => IpcObjectType::PortSet,
            other => IpcObjectType::Other(other),
        }
    }

    pub fn is_preallocated(self) -> bool {
        self.0 & IO_BITS_PREALLOC != 0
    }

    pub fn kotype(self) -> u16 {
        (self.0 & IO_BITS_KOTYPE) as u16
    }

    pub fn kotype_name(self) -> &'static str {
        ikot_name(self.kotype())
    }
}

impl fmt::Display for IpcObjectBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#010x} ({}{}, {}{})",
            self.0,
            if self.is_active() { "" } else { "inactive " },
            self.otype().name(),
            self.kotype_name(),
            if self.is_preallocated() { ", prealloc" } else { "" }
        )
    }
}

// ============================================================================
// IPC Object
// ============================================================================

/// Decoded `struct ipc_object`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcObject {
    pub address: KAddr,
    pub bits: Field<IpcObjectBits>,
    pub references: Field<u32>,
    /// Lock words; diagnostic only
    pub lock_data: [Field<u64>; 2],
}

impl IpcObject {
    /// Decode the object at `addr`; `None` for NULL
    pub fn decode<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, addr: KAddr) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let off = &layout.ipc_object;
        let rec = RecordReader::new(mem, "ipc_object", addr);
        Some(Self {
            address: addr,
            bits: rec.u32(off.bits).map(IpcObjectBits),
            references: rec.u32(off.references),
            lock_data: [rec.u64(off.lock_data), rec.u64(off.lock_data.wrapping_add(8))],
        })
    }

    /// Whether the bits say this object is a port
    pub fn is_port(&self) -> bool {
        matches!(self.bits, Field::Known(b) if b.otype() == IpcObjectType::Port)
    }
}
