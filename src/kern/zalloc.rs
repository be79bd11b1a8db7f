//! Zone allocator state
//!
//! Zones live in the fixed `zone_array[MAX_ZONES]`; `num_zones` says how many
//! slots have been handed out. A slot is only meaningful once its flags word
//! has the valid bit set, so the flags are read before anything else and the
//! name pointer of an uninitialized slot is never followed.

use log::{debug, warn};

use crate::error::{IntrospectError, Result};
use crate::layout::Layout;
use crate::memory::{MemoryReader, RecordReader};
use crate::types::{Field, KAddr};

// ============================================================================
// Zone Flags
// ============================================================================

/// Packed zone flags word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZoneFlags(pub u32);

impl ZoneFlags {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn bit(self, n: u32) -> bool {
        n < 32 && (self.0 >> n) & 1 == 1
    }

    /// Whether the zone has been initialized, per the layout's valid bit
    pub fn is_valid(self, layout: &Layout) -> bool {
        self.bit(layout.zone.valid_bit)
    }
}

// ============================================================================
// Zone
// ============================================================================

/// Decoded `struct zone`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub address: KAddr,
    /// Slot in `zone_array` this record was decoded from
    pub slot: u32,
    /// Index the zone records for itself
    pub index: Field<u32>,
    /// Zone name; empty for slots that are not valid
    pub name: Field<String>,
    pub flags: Field<ZoneFlags>,
    pub valid: bool,
    pub elem_size: Field<u64>,
    pub cur_size: Field<u64>,
    pub max_size: Field<u64>,
    pub alloc_size: Field<u64>,
    pub page_count: Field<u64>,
    /// Cumulative allocation count
    pub sum_count: Field<u64>,
}

impl Zone {
    /// Address of slot `slot` in `zone_array`
    pub fn slot_address(layout: &Layout, slot: u32) -> KAddr {
        layout
            .globals
            .zone_array
            .offset(layout.zone.stride.wrapping_mul(slot as u64))
    }

    /// Decode slot `slot`; independent of any other slot
    pub fn decode<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout, slot: u32) -> Self {
        let addr = Self::slot_address(layout, slot);
        let flags = RecordReader::new(mem, "zone", addr).u32(layout.zone.flags);
        Self::decode_with_flags(mem, layout, slot, flags.map(ZoneFlags))
    }

    fn decode_with_flags<M: MemoryReader + ?Sized>(
        mem: &M,
        layout: &Layout,
        slot: u32,
        flags: Field<ZoneFlags>,
    ) -> Self {
        let off = &layout.zone;
        let addr = Self::slot_address(layout, slot);
        let rec = RecordReader::new(mem, "zone", addr);
        let valid = matches!(flags, Field::Known(f) if f.is_valid(layout));

        let name = if valid {
            rec.str_at_ptr(off.name, off.name_max_len)
        } else {
            Field::Known(String::new())
        };

        Self {
            address: addr,
            slot,
            index: rec.u32(off.index),
            name,
            flags,
            valid,
            elem_size: rec.u64(off.elem_size),
            cur_size: rec.u64(off.cur_size),
            max_size: rec.u64(off.max_size),
            alloc_size: rec.u64(off.alloc_size),
            page_count: rec.u64(off.page_count),
            sum_count: rec.u64(off.sum_count),
        }
    }
}

/// Read `num_zones`, bounded by the array capacity
pub fn zone_count<M: MemoryReader + ?Sized>(mem: &M, layout: &Layout) -> Result<u32> {
    let cell = layout.globals.num_zones;
    let count = mem
        .read_u32(cell)
        .map_err(|e| IntrospectError::unreadable(cell, e))?;
    if count > layout.zone.max_zones {
        warn!("num_zones {} exceeds zone_array capacity {}", count, layout.zone.max_zones);
        return Err(IntrospectError::BadTableCapacity {
            table: "zone_array",
            address: cell,
            capacity: count as u64,
            limit: layout.zone.max_zones as u64,
        });
    }
    Ok(count)
}

// ============================================================================
// Zone Iteration
// ============================================================================

/// Lazy walk over the valid zones of `zone_array`
///
/// Slots whose flags cannot be read are reported as errors and skipped;
/// the walk continues with the next slot.
pub struct ZoneIter<'a, M: ?Sized> {
    mem: &'a M,
    layout: &'a Layout,
    next: u32,
    count: u32,
}

impl<'a, M: MemoryReader + ?Sized> ZoneIter<'a, M> {
    pub fn new(mem: &'a M, layout: &'a Layout) -> Result<Self> {
        let count = zone_count(mem, layout)?;
        debug!("zone_array: {} zones", count);
        Ok(Self {
            mem,
            layout,
            next: 0,
            count,
        })
    }

    /// Number of slots the walk covers
    pub fn count_hint(&self) -> u32 {
        self.count
    }
}

impl<M: MemoryReader + ?Sized> Iterator for ZoneIter<'_, M> {
    type Item = Result<Zone>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.count {
            let slot = self.next;
            self.next += 1;

            let addr = Zone::slot_address(self.layout, slot).offset(self.layout.zone.flags);
            let flags = match self.mem.read_u32(addr) {
                Ok(bits) => ZoneFlags(bits),
                Err(e) => {
                    warn!("zone slot {}: flags at {} unreadable: {}", slot, addr, e);
                    return Some(Err(IntrospectError::unreadable(addr, e)));
                }
            };
            if !flags.is_valid(self.layout) {
                debug!("zone slot {}: not valid, skipped", slot);
                continue;
            }
            return Some(Ok(Zone::decode_with_flags(
                self.mem,
                self.layout,
                slot,
                Field::Known(flags),
            )));
        }
        None
    }
}
