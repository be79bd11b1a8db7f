//! Kernel structure layout table
//!
//! Every byte offset and absolute address the decoders use comes from a
//! [`Layout`]. Decoders never hard-code offsets. A layout belongs to exactly
//! one kernel build; the built-in one describes iOS 12.1 (`16B92`) on arm64.
//!
//! Layouts are plain data and can also be loaded from a TOML file whose
//! shape mirrors these structs. Absolute addresses are written as hex
//! strings because they do not fit a TOML integer.

use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::bsd::MAX_PROC_NAME;
use crate::error::{IntrospectError, Result};
use crate::types::KAddr;

/// Builds with a built-in layout
pub const SUPPORTED_BUILDS: &[&str] = &["16B92"];

// ============================================================================
// Layout sections
// ============================================================================

/// Known absolute addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalAddresses {
    /// `tasks` queue head
    pub tasks: KAddr,
    /// `threads` queue head
    pub threads: KAddr,
    /// `zone_array[]`
    pub zone_array: KAddr,
    /// `num_zones` (32-bit)
    pub num_zones: KAddr,
}

/// Register names understood by the address-space reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNames {
    /// Evaluates to the running thread pointer
    pub current_thread: String,
    pub pc: String,
    pub cpsr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadOffsets {
    pub continuation: u64,
    /// Link in the global `threads` queue
    pub global_threads: u64,
    /// Link in the owning task's thread queue
    pub task_threads: u64,
    pub task: u64,
    pub thread_id: u64,
    /// Saved user register context (`machine.upcb`)
    pub user_context: u64,
    /// Saved kernel context at the top of the kernel stack
    pub kernel_stack: u64,
    pub voucher_name: u64,
    pub voucher: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOffsets {
    /// Link in the global `tasks` queue
    pub next: u64,
    /// Head of the task's thread queue
    pub threads: u64,
    pub itk_self: u64,
    pub itk_nself: u64,
    pub itk_sself: u64,
    pub ipc_space: u64,
    pub bsd_info: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcOffsets {
    pub pid: u64,
    pub name: u64,
    /// Width of the inline name slot in bytes
    pub name_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcSpaceOffsets {
    pub table_size: u64,
    pub table_free: u64,
    pub table: u64,
    pub low_mod: u64,
    pub high_mod: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcEntryOffsets {
    pub object: u64,
    pub bits: u64,
    pub ie_index: u64,
    pub next: u64,
    /// Size of one table slot
    pub stride: u64,
    /// `IE_BITS_TYPE_MASK`; a slot is live iff `bits & type_mask != 0`
    pub type_mask: u32,
    /// Largest table size accepted before the space is considered corrupt
    pub max_table_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcObjectOffsets {
    pub bits: u64,
    pub references: u64,
    pub lock_data: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcPortOffsets {
    pub messages: u64,
    pub data: u64,
    pub kdata: u64,
    pub nsrequest: u64,
    pub pdrequest: u64,
    pub requests: u64,
    pub kdata2: u64,
    pub context: u64,
    /// Packed flag word (`ip_sprequests` .. `ip_impcount`)
    pub flags: u64,
    pub mscount: u64,
    pub srights: u64,
    pub sorights: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherOffsets {
    pub hash: u64,
    pub sum: u64,
    pub refs: u64,
    pub table_size: u64,
    pub inline_table: u64,
    pub table: u64,
    pub port: u64,
    pub hash_link: u64,
}

/// `arm_saved_state64` layout; register offsets are relative to `header`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedStateOffsets {
    /// Size of the `arm_state_hdr` preceding the registers
    pub header: u64,
    /// x0; x1..x28 follow at 8-byte steps
    pub x0: u64,
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u64,
    pub reserved: u64,
    pub far: u64,
    pub esr: u64,
    pub exception: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneOffsets {
    /// Size of one `struct zone` in `zone_array`
    pub stride: u64,
    /// Capacity of `zone_array` (`MAX_ZONES`)
    pub max_zones: u32,
    pub name: u64,
    pub name_max_len: usize,
    pub index: u64,
    pub flags: u64,
    /// Bit of the flags word that marks an initialized zone
    pub valid_bit: u32,
    pub sum_count: u64,
    pub page_count: u64,
    pub alloc_size: u64,
    pub elem_size: u64,
    pub max_size: u64,
    pub cur_size: u64,
}

/// A function that calls `thread_invoke`, identified by its return address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerLandmark {
    pub name: String,
    /// Link register value stored in `thread_invoke`'s frame
    pub return_address: KAddr,
    /// Slot in the caller's frame holding its own return address
    pub next_pc_slot: u64,
}

/// Landmarks for recovering a blocked thread's next pc
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextPcLandmarks {
    /// Saved link register inside `thread_invoke`'s frame
    pub stored_link: u64,
    /// Size of `thread_invoke`'s frame
    pub frame_size: u64,
    /// Saved x21 in the caller frame (holds the exception saved state)
    pub x21_slot: u64,
    /// `exception_return`
    pub exception_return: KAddr,
    pub callers: Vec<CallerLandmark>,
}

// ============================================================================
// Layout
// ============================================================================

/// Complete offset table for one kernel build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub build: String,
    pub globals: GlobalAddresses,
    pub registers: RegisterNames,
    pub thread: ThreadOffsets,
    pub task: TaskOffsets,
    pub proc: ProcOffsets,
    pub ipc_space: IpcSpaceOffsets,
    pub ipc_entry: IpcEntryOffsets,
    pub ipc_object: IpcObjectOffsets,
    pub ipc_port: IpcPortOffsets,
    pub voucher: VoucherOffsets,
    pub saved_state: SavedStateOffsets,
    pub zone: ZoneOffsets,
    pub next_pc: NextPcLandmarks,
}

impl Layout {
    /// Built-in layout for `build`
    pub fn for_build(build: &str) -> Result<Self> {
        match build.trim().to_ascii_uppercase().as_str() {
            "16B92" => Ok(Self::ios_16b92()),
            _ => Err(IntrospectError::UnsupportedBuild {
                build: build.to_string(),
                supported: SUPPORTED_BUILDS.join(", "),
            }),
        }
    }

    /// iOS 12.1 (16B92), arm64
    pub fn ios_16b92() -> Self {
        Self {
            build: "16B92".to_string(),
            globals: GlobalAddresses {
                tasks: KAddr(0xffff_fff0_0760_f9c0),
                threads: KAddr(0xffff_fff0_0760_f9e0),
                zone_array: KAddr(0xffff_fff0_0762_4ef0),
                num_zones: KAddr(0xffff_fff0_0763_df48),
            },
            registers: RegisterNames {
                current_thread: "$TPIDR_EL1".to_string(),
                pc: "$pc".to_string(),
                cpsr: "$cpsr".to_string(),
            },
            thread: ThreadOffsets {
                continuation: 0x80,
                global_threads: 0x348,
                task_threads: 0x358,
                task: 0x368,
                thread_id: 0x3e0,
                user_context: 0x430,
                kernel_stack: 0x448,
                voucher_name: 0x50c,
                voucher: 0x510,
            },
            task: TaskOffsets {
                next: 0x28,
                threads: 0x40,
                itk_self: 0xd8,
                itk_nself: 0xe0,
                itk_sself: 0xe8,
                ipc_space: 0x300,
                bsd_info: 0x358,
            },
            proc: ProcOffsets {
                pid: 0x60,
                name: 0x261,
                name_len: 33,
            },
            ipc_space: IpcSpaceOffsets {
                table_size: 0x14,
                table_free: 0x18,
                table: 0x20,
                low_mod: 0x38,
                high_mod: 0x3c,
            },
            ipc_entry: IpcEntryOffsets {
                object: 0x00,
                bits: 0x08,
                ie_index: 0x0c,
                next: 0x10,
                stride: 0x18,
                type_mask: 0x001f_0000,
                max_table_size: 1 << 24,
            },
            ipc_object: IpcObjectOffsets {
                bits: 0x00,
                references: 0x04,
                lock_data: 0x08,
            },
            ipc_port: IpcPortOffsets {
                messages: 0x18,
                data: 0x60,
                kdata: 0x68,
                nsrequest: 0x70,
                pdrequest: 0x78,
                requests: 0x80,
                kdata2: 0x88,
                context: 0x90,
                flags: 0x98,
                mscount: 0x9c,
                srights: 0xa0,
                sorights: 0xa4,
            },
            voucher: VoucherOffsets {
                hash: 0x00,
                sum: 0x04,
                refs: 0x08,
                table_size: 0x0c,
                inline_table: 0x10,
                table: 0x30,
                port: 0x38,
                hash_link: 0x40,
            },
            saved_state: SavedStateOffsets {
                header: 0x08,
                x0: 0x00,
                fp: 0xe8,
                lr: 0xf0,
                sp: 0xf8,
                pc: 0x100,
                cpsr: 0x108,
                reserved: 0x10c,
                far: 0x110,
                esr: 0x118,
                exception: 0x11c,
            },
            zone: ZoneOffsets {
                stride: 0x140,
                max_zones: 320,
                name: 0x118,
                name_max_len: 128,
                index: 0x114,
                flags: 0x110,
                valid_bit: 26,
                sum_count: 0x108,
                page_count: 0x100,
                alloc_size: 0xf8,
                elem_size: 0xf0,
                max_size: 0xe8,
                cur_size: 0xe0,
            },
            next_pc: NextPcLandmarks {
                stored_link: 0x88,
                frame_size: 0x90,
                x21_slot: 0x28,
                exception_return: KAddr(0xffff_fff0_070a_1800),
                callers: vec![
                    CallerLandmark {
                        name: "thread_run".to_string(),
                        return_address: KAddr(0xffff_fff0_070e_7d0c),
                        next_pc_slot: 0x38,
                    },
                    CallerLandmark {
                        name: "thread_block_reason".to_string(),
                        return_address: KAddr(0xffff_fff0_070e_3554),
                        next_pc_slot: 0x48,
                    },
                ],
            },
        }
    }

    /// Parse a layout from TOML and check it for internal consistency
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let layout: Layout = toml::from_str(source)?;
        layout.validate()?;
        Ok(layout)
    }

    /// Load a layout file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let layout = Self::from_toml_str(&source)?;
        info!("loaded layout for build {} from {}", layout.build, path.display());
        Ok(layout)
    }

    /// Static sanity checks that need no target memory
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(IntrospectError::InvalidLayout(format!("{}: {}", self.build, msg)));

        if self.ipc_entry.stride == 0 || self.zone.stride == 0 {
            return invalid("table strides must be non-zero");
        }
        if self.ipc_entry.type_mask == 0 {
            return invalid("ipc entry type mask must be non-zero");
        }
        if self.zone.valid_bit >= 32 {
            return invalid("zone valid bit must index a 32-bit word");
        }
        if self.proc.name_len == 0 {
            return invalid("process name slot must be non-empty");
        }
        if self.proc.name_len > MAX_PROC_NAME {
            return invalid("process name slot exceeds the p_comm buffer");
        }
        if self.next_pc.callers.is_empty() {
            return invalid("at least one thread_invoke caller landmark is required");
        }
        for (i, caller) in self.next_pc.callers.iter().enumerate() {
            let duplicate = self.next_pc.callers[..i]
                .iter()
                .any(|c| c.return_address == caller.return_address);
            if duplicate {
                return invalid("caller landmarks must have distinct return addresses");
            }
        }
        Ok(())
    }

    /// Saved-state register offset relative to the start of the structure
    pub fn saved_state_offset(&self, reg_offset: u64) -> u64 {
        self.saved_state.header.wrapping_add(reg_offset)
    }
}
