//! Integration tests for zone_array traversal

mod common;

use common::SyntheticKernel;
use xnu_introspect::kern::Zone;
use xnu_introspect::types::Field;
use xnu_introspect::{IntrospectError, KAddr};

const VALID: u32 = 1 << 26;
const NAMES: KAddr = KAddr(0xffff_fff0_0750_0000);

/// `flags` per slot; every slot gets a name string, valid or not
fn zones(flags: &[u32]) -> SyntheticKernel {
    let mut k = SyntheticKernel::new();
    k.set_num_zones(flags.len() as u32);
    let off = k.layout.zone.clone();
    for (slot, &f) in flags.iter().enumerate() {
        let addr = Zone::slot_address(&k.layout, slot as u32);
        let name = NAMES.offset(0x40 * slot as u64);
        k.mem.map_zeroed(addr, off.stride as usize);
        k.mem.write_u32(addr.offset(off.flags), f);
        k.mem.write_u32(addr.offset(off.index), slot as u32);
        k.mem.write_u64(addr.offset(off.elem_size), 16 << slot);
        k.mem.write_ptr(addr.offset(off.name), name);
        k.mem.write_cstring(name, &format!("zone.{}", slot));
    }
    k
}

#[test]
fn test_invalid_slots_are_skipped() {
    let session = zones(&[VALID, 0, VALID | 0x3, 0]).attach();
    session.memory().clear_reads();

    let found: Vec<Zone> = session.zones().unwrap().map(|z| z.unwrap()).collect();
    let slots: Vec<u32> = found.iter().map(|z| z.slot).collect();
    assert_eq!(slots, vec![0, 2]);
    assert_eq!(found[1].name, Field::Known("zone.2".to_string()));
    assert_eq!(found[1].elem_size, Field::Known(64));
    assert!(found.iter().all(|z| z.valid));

    // Names of invalid slots are never followed
    for slot in [1u64, 3] {
        let name = NAMES.offset(0x40 * slot);
        assert!(!session.memory().touched(name, name.offset(0x40)));
    }
}

#[test]
fn test_zone_by_slot_keeps_invalid_name_empty() {
    let session = zones(&[VALID, 0]).attach();

    let zone = session.zone(1).unwrap();
    assert!(!zone.valid);
    assert_eq!(zone.name, Field::Known(String::new()));
    assert_eq!(zone.index, Field::Known(1));
    assert!(matches!(
        session.zone(2),
        Err(IntrospectError::IndexOutOfRange { index: 2, capacity: 2, .. })
    ));
}

#[test]
fn test_null_name_pointer_is_empty() {
    let mut k = zones(&[VALID]);
    let name = k.layout.zone.name;
    let addr = Zone::slot_address(&k.layout, 0);
    k.mem.write_ptr(addr.offset(name), KAddr::NULL);
    let session = k.attach();

    let zone = session.zones().unwrap().next().unwrap().unwrap();
    assert_eq!(zone.name, Field::Known(String::new()));
}

#[test]
fn test_unreadable_flags_are_reported_and_skipped() {
    let mut k = SyntheticKernel::new();
    k.set_num_zones(3);
    let off = k.layout.zone.clone();
    // Slot 1 is not in the image at all
    for slot in [0u32, 2] {
        let addr = Zone::slot_address(&k.layout, slot);
        k.mem.map_zeroed(addr, off.stride as usize);
        k.mem.write_u32(addr.offset(off.flags), VALID);
    }
    let session = k.attach();

    let results: Vec<_> = session.zones().unwrap().collect();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().slot, 0);
    assert!(results[1].is_err());
    assert_eq!(results[2].as_ref().unwrap().slot, 2);
}
