//! Target architecture definitions
//!
//! The inspected kernel runs on arm64 regardless of the host this crate
//! runs on, so nothing here is gated on `target_arch`.

pub mod aarch64;
