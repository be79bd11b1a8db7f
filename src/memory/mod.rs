//! Address-space readers
//!
//! Every decoder in this crate is built on [`MemoryReader`]: sized reads at a
//! kernel virtual address, a bounded C string read, and evaluation of a
//! register name or expression. Two implementations ship with the crate:
//! - [`snapshot::SnapshotMemory`] - a sparse in-memory image
//! - [`gdb_remote::GdbRemote`] - a GDB remote serial protocol client

pub mod gdb_remote;
pub mod snapshot;

use log::warn;

use crate::error::ReadError;
use crate::types::{Field, KAddr};

pub use gdb_remote::GdbRemote;
pub use snapshot::SnapshotMemory;

// ============================================================================
// Read Width
// ============================================================================

/// Width of a primitive read, named after gdb's `x` unit letters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// 1 byte
    Byte,
    /// 4 bytes
    Word,
    /// 8 bytes
    Giant,
}

impl Width {
    pub const fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 4,
            Width::Giant => 8,
        }
    }
}

// ============================================================================
// Memory Reader
// ============================================================================

/// Read-only access to the target's address space
///
/// Values are little-endian (arm64 target). Receivers are `&self` so that a
/// record can be decoded while an iterator over the same reader is live;
/// implementations that need mutable transport state use interior mutability.
pub trait MemoryReader {
    /// Read an unsigned integer of `width` bytes at `addr`
    fn read_uint(&self, addr: KAddr, width: Width) -> Result<u64, ReadError>;

    /// Read a NUL-terminated string, consuming at most `max_len` bytes
    fn read_cstring(&self, addr: KAddr, max_len: usize) -> Result<String, ReadError>;

    /// Evaluate a register name (`$pc`) or numeric literal to a 64-bit value
    fn evaluate(&self, expr: &str) -> Result<u64, ReadError>;

    fn read_u8(&self, addr: KAddr) -> Result<u8, ReadError> {
        self.read_uint(addr, Width::Byte).map(|v| v as u8)
    }

    fn read_u32(&self, addr: KAddr) -> Result<u32, ReadError> {
        self.read_uint(addr, Width::Word).map(|v| v as u32)
    }

    fn read_u64(&self, addr: KAddr) -> Result<u64, ReadError> {
        self.read_uint(addr, Width::Giant)
    }

    fn read_ptr(&self, addr: KAddr) -> Result<KAddr, ReadError> {
        self.read_u64(addr).map(KAddr)
    }
}

impl<M: MemoryReader + ?Sized> MemoryReader for &M {
    fn read_uint(&self, addr: KAddr, width: Width) -> Result<u64, ReadError> {
        (**self).read_uint(addr, width)
    }

    fn read_cstring(&self, addr: KAddr, max_len: usize) -> Result<String, ReadError> {
        (**self).read_cstring(addr, max_len)
    }

    fn evaluate(&self, expr: &str) -> Result<u64, ReadError> {
        (**self).evaluate(expr)
    }
}

impl<M: MemoryReader + ?Sized> MemoryReader for Box<M> {
    fn read_uint(&self, addr: KAddr, width: Width) -> Result<u64, ReadError> {
        (**self).read_uint(addr, width)
    }

    fn read_cstring(&self, addr: KAddr, max_len: usize) -> Result<String, ReadError> {
        (**self).read_cstring(addr, max_len)
    }

    fn evaluate(&self, expr: &str) -> Result<u64, ReadError> {
        (**self).evaluate(expr)
    }
}

// ============================================================================
// Record Reader - per-field containment
// ============================================================================

/// Reads the fields of one record at `base + offset`
///
/// A failing read is logged and turned into [`Field::Unreadable`]; it never
/// stops the caller from reading the next field.
pub struct RecordReader<'a, M: ?Sized> {
    mem: &'a M,
    record: &'static str,
    base: KAddr,
}

impl<'a, M: MemoryReader + ?Sized> RecordReader<'a, M> {
    pub fn new(mem: &'a M, record: &'static str, base: KAddr) -> Self {
        Self { mem, record, base }
    }

    pub fn base(&self) -> KAddr {
        self.base
    }

    pub fn u8(&self, offset: u64) -> Field<u8> {
        let addr = self.base.offset(offset);
        self.contain(addr, self.mem.read_u8(addr))
    }

    pub fn u32(&self, offset: u64) -> Field<u32> {
        let addr = self.base.offset(offset);
        self.contain(addr, self.mem.read_u32(addr))
    }

    pub fn u64(&self, offset: u64) -> Field<u64> {
        let addr = self.base.offset(offset);
        self.contain(addr, self.mem.read_u64(addr))
    }

    pub fn ptr(&self, offset: u64) -> Field<KAddr> {
        let addr = self.base.offset(offset);
        self.contain(addr, self.mem.read_ptr(addr))
    }

    /// Inline character array of `max_len` bytes at `offset`
    pub fn inline_str(&self, offset: u64, max_len: usize) -> Field<String> {
        let addr = self.base.offset(offset);
        self.contain(addr, self.mem.read_cstring(addr, max_len))
    }

    /// String behind the pointer stored at `offset`; NULL reads as empty
    pub fn str_at_ptr(&self, offset: u64, max_len: usize) -> Field<String> {
        match self.ptr(offset) {
            Field::Known(p) if p.is_null() => Field::Known(String::new()),
            Field::Known(p) => self.contain(p, self.mem.read_cstring(p, max_len)),
            Field::Unreadable(a) => Field::Unreadable(a),
        }
    }

    fn contain<T>(&self, addr: KAddr, result: Result<T, ReadError>) -> Field<T> {
        match result {
            Ok(v) => Field::Known(v),
            Err(e) => {
                warn!(
                    "{} @ {}: field at {} unreadable: {}",
                    self.record, self.base, addr, e
                );
                Field::Unreadable(addr)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_bytes() {
        assert_eq!(Width::Byte.bytes(), 1);
        assert_eq!(Width::Word.bytes(), 4);
        assert_eq!(Width::Giant.bytes(), 8);
    }

    #[test]
    fn test_record_reader_contains_failures() {
        let mut mem = SnapshotMemory::new();
        mem.write_u32(KAddr(0x1000), 0xdead_beef);
        // 0x1004 onwards is unmapped

        let rec = RecordReader::new(&mem, "test", KAddr(0x1000));
        assert_eq!(rec.u32(0), Field::Known(0xdead_beef));
        assert_eq!(rec.u64(8), Field::Unreadable(KAddr(0x1008)));
        // The failure above does not poison later reads
        assert_eq!(rec.u8(0), Field::Known(0xef));
    }

    #[test]
    fn test_str_at_null_ptr_is_empty() {
        let mut mem = SnapshotMemory::new();
        mem.write_ptr(KAddr(0x2000), KAddr::NULL);
        let rec = RecordReader::new(&mem, "test", KAddr(0x2000));
        assert_eq!(rec.str_at_ptr(0, 16), Field::Known(String::new()));
    }
}
