//! IPC voucher (`struct ipc_voucher`)

use crate::layout::Layout;
use crate::memory::{MemoryReader, RecordReader};
use crate::types::{Field, KAddr};

/// Decoded `struct ipc_voucher`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voucher {
    pub address: KAddr,
    pub hash: Field<u32>,
    /// Checksum over the attribute values
    pub sum: Field<u32>,
    pub refs: Field<u32>,
    pub table_size: Field<u32>,
    pub inline_table: Field<KAddr>,
    pub table: Field<KAddr>,
    pub port: Field<KAddr>,
    pub hash_link: Field<KAddr>,
}

impl Voucher {
    /// Decode the voucher at `addr`; `None` for NULL
    pub fn decode<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, addr: KAddr) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let off = &layout.voucher;
        let rec = RecordReader::new(mem, "ipc_voucher", addr);
        Some(Self {
            address: addr,
            hash: rec.u32(off.hash),
            sum: rec.u32(off.sum),
            refs: rec.u32(off.refs),
            table_size: rec.u32(off.table_size),
            inline_table: rec.ptr(off.inline_table),
            table: rec.ptr(off.table),
            port: rec.ptr(off.port),
            hash_link: rec.ptr(off.hash_link),
        })
    }
}
