//! Saved register state (`arm_saved_state64`)
//!
//! Captured at every exception entry and every context switch. The layout
//! is an `arm_state_hdr` followed by x0..x28, fp, lr, sp, pc, cpsr, a
//! reserved word, far, esr and the exception code.

use crate::layout::Layout;
use crate::memory::{MemoryReader, RecordReader};
use crate::types::{Field, KAddr};

/// General registers x0..x28
pub const GPR_COUNT: usize = 29;

/// Decoded `arm_saved_state64`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRegisterState {
    /// Address of the structure (including its header)
    pub address: KAddr,
    pub x: [Field<u64>; GPR_COUNT],
    pub fp: Field<u64>,
    pub lr: Field<u64>,
    pub sp: Field<u64>,
    pub pc: Field<u64>,
    pub cpsr: Field<u32>,
    pub reserved: Field<u32>,
    /// Fault address register
    pub far: Field<u64>,
    /// Exception syndrome register
    pub esr: Field<u32>,
    pub exception: Field<u32>,
}

impl SavedRegisterState {
    /// Decode the saved state at `addr`; `None` for NULL
    pub fn decode<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, addr: KAddr) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        let off = &layout.saved_state;
        let rec = RecordReader::new(mem, "arm_saved_state", addr.offset(off.header));

        let x = std::array::from_fn(|i| rec.u64(off.x0.wrapping_add(8 * i as u64)));
        Some(Self {
            address: addr,
            x,
            fp: rec.u64(off.fp),
            lr: rec.u64(off.lr),
            sp: rec.u64(off.sp),
            pc: rec.u64(off.pc),
            cpsr: rec.u32(off.cpsr),
            reserved: rec.u32(off.reserved),
            far: rec.u64(off.far),
            esr: rec.u32(off.esr),
            exception: rec.u32(off.exception),
        })
    }

    pub fn pc_addr(&self) -> Field<KAddr> {
        self.pc.map(KAddr)
    }

    pub fn sp_addr(&self) -> Field<KAddr> {
        self.sp.map(KAddr)
    }
}
