//! xnu-introspect - typed reconstruction of a running XNU kernel's
//! scheduling and IPC state from raw memory
//!
//! This crate reads kernel memory through a debugger connection and decodes
//! threads, tasks, processes, IPC spaces, entries, ports, vouchers and
//! allocator zones using build-specific structure offsets.
//!
//! ## Layering
//!
//! - [`memory`] - the address-space reader (`MemoryReader`) and its
//!   snapshot and GDB remote implementations
//! - [`layout`] - offset and address table for one kernel build
//! - [`kern`], [`ipc`], [`bsd`], [`arch`] - record decoders and traversals
//! - [`session`] - one reader plus one layout, checked at attach
//! - [`report`], [`symbols`] - presentation for the command-line tool

// Register-level code reads better with explicit shifts and masks
#![allow(clippy::identity_op)]
// Offsets are composed from layout fields; the casts are intentional
#![allow(clippy::unnecessary_cast)]

// Core types
pub mod error;
pub mod types;

// Target access
pub mod layout;
pub mod memory;

// Record decoders
pub mod arch;
pub mod bsd;
pub mod ipc;
pub mod kern;

// Front end
pub mod report;
pub mod session;
pub mod symbols;

pub use error::{IntrospectError, ReadError, Result};
pub use layout::Layout;
pub use memory::{GdbRemote, MemoryReader, SnapshotMemory};
pub use session::Session;
pub use symbols::SymbolTable;
pub use types::{Field, KAddr};
