//! AArch64 register conventions of the inspected kernel

pub mod saved_state;

pub use saved_state::{SavedRegisterState, GPR_COUNT};

/// PSTATE.M[3:2] - exception level the CPU was executing at
#[inline]
pub const fn exception_level(cpsr: u64) -> u8 {
    ((cpsr >> 2) & 0x3) as u8
}

/// ESR_ELx.EC - exception class
#[inline]
pub const fn exception_class(esr: u32) -> u8 {
    (esr >> 26) as u8
}
