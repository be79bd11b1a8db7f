//! Sparse in-memory address space
//!
//! `SnapshotMemory` holds individual bytes keyed by address plus a set of
//! named register values. It backs the offline mode of the CLI (a JSON
//! memory image captured elsewhere) and every synthetic-kernel test.
//!
//! Each successful or failed read is appended to a read log so tests can
//! assert which addresses a decoder touched.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use super::{MemoryReader, Width};
use crate::error::{IntrospectError, ReadError};
use crate::types::KAddr;

/// One contiguous run of bytes in a snapshot file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRegion {
    pub base: KAddr,
    /// Hex-encoded contents
    pub bytes: String,
}

/// On-disk snapshot format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFile {
    #[serde(default)]
    pub registers: BTreeMap<String, KAddr>,
    #[serde(default)]
    pub regions: Vec<SnapshotRegion>,
}

/// Sparse byte-addressed memory image
#[derive(Debug, Default)]
pub struct SnapshotMemory {
    bytes: BTreeMap<u64, u8>,
    registers: HashMap<String, u64>,
    reads: RefCell<Vec<(KAddr, usize)>>,
}

impl SnapshotMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a parsed snapshot file
    pub fn from_file(file: &SnapshotFile) -> Result<Self, IntrospectError> {
        let mut mem = Self::new();
        for region in &file.regions {
            let data = hex::decode(region.bytes.trim()).map_err(|e| {
                IntrospectError::Snapshot(format!("region at {}: {}", region.base, e))
            })?;
            mem.write_bytes(region.base, &data);
        }
        for (name, value) in &file.registers {
            mem.set_register(name, value.raw());
        }
        Ok(mem)
    }

    pub fn from_json_str(json: &str) -> Result<Self, IntrospectError> {
        let file: SnapshotFile = serde_json::from_str(json)?;
        Self::from_file(&file)
    }

    /// Load a JSON snapshot from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IntrospectError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    // ------------------------------------------------------------------------
    // Population
    // ------------------------------------------------------------------------

    pub fn write_bytes(&mut self, addr: KAddr, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.bytes.insert(addr.raw().wrapping_add(i as u64), *byte);
        }
    }

    pub fn write_u8(&mut self, addr: KAddr, value: u8) {
        self.write_bytes(addr, &[value]);
    }

    pub fn write_u32(&mut self, addr: KAddr, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, addr: KAddr, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_ptr(&mut self, addr: KAddr, value: KAddr) {
        self.write_u64(addr, value.raw());
    }

    /// Write `s` followed by a NUL terminator
    pub fn write_cstring(&mut self, addr: KAddr, s: &str) {
        self.write_bytes(addr, s.as_bytes());
        self.write_u8(addr.offset(s.len() as u64), 0);
    }

    /// Fill `len` bytes with zero, mapping them
    pub fn map_zeroed(&mut self, addr: KAddr, len: usize) {
        self.write_bytes(addr, &vec![0u8; len]);
    }

    /// Set a register value; `$` prefix and case are ignored
    pub fn set_register(&mut self, name: &str, value: u64) {
        self.registers.insert(register_key(name), value);
    }

    // ------------------------------------------------------------------------
    // Read log
    // ------------------------------------------------------------------------

    /// Whether any logged read overlapped `[start, end)`
    pub fn touched(&self, start: KAddr, end: KAddr) -> bool {
        self.reads.borrow().iter().any(|(addr, len)| {
            let lo = addr.raw();
            let hi = lo.saturating_add(*len as u64);
            lo < end.raw() && hi > start.raw()
        })
    }

    pub fn clear_reads(&self) {
        self.reads.borrow_mut().clear();
    }

    fn byte(&self, addr: u64) -> Option<u8> {
        self.bytes.get(&addr).copied()
    }
}

fn register_key(name: &str) -> String {
    name.trim().trim_start_matches('$').to_ascii_lowercase()
}

impl MemoryReader for SnapshotMemory {
    fn read_uint(&self, addr: KAddr, width: Width) -> Result<u64, ReadError> {
        let len = width.bytes();
        self.reads.borrow_mut().push((addr, len));
        let mut value = 0u64;
        for i in 0..len {
            let byte = self
                .byte(addr.raw().wrapping_add(i as u64))
                .ok_or(ReadError::Unmapped { address: addr, len })?;
            value |= (byte as u64) << (8 * i);
        }
        debug!("read {} bytes at {} -> {:#x}", len, addr, value);
        Ok(value)
    }

    fn read_cstring(&self, addr: KAddr, max_len: usize) -> Result<String, ReadError> {
        let mut raw = Vec::new();
        for i in 0..max_len {
            match self.byte(addr.raw().wrapping_add(i as u64)) {
                Some(0) => break,
                Some(b) => raw.push(b),
                None if i == 0 => {
                    self.reads.borrow_mut().push((addr, 1));
                    return Err(ReadError::Unmapped { address: addr, len: 1 });
                }
                // The mapped prefix is the string; the terminator is off the image
                None => break,
            }
        }
        self.reads.borrow_mut().push((addr, raw.len() + 1));
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn evaluate(&self, expr: &str) -> Result<u64, ReadError> {
        let trimmed = expr.trim();
        if trimmed.starts_with('$') {
            return self
                .registers
                .get(&register_key(trimmed))
                .copied()
                .ok_or_else(|| ReadError::UnknownExpression(expr.to_string()));
        }
        trimmed
            .parse::<KAddr>()
            .map(KAddr::raw)
            .map_err(|_| ReadError::UnknownExpression(expr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_reads() {
        let mut mem = SnapshotMemory::new();
        mem.write_u64(KAddr(0x100), 0x1122_3344_5566_7788);
        assert_eq!(mem.read_u8(KAddr(0x100)).unwrap(), 0x88);
        assert_eq!(mem.read_u32(KAddr(0x100)).unwrap(), 0x5566_7788);
        assert_eq!(mem.read_u64(KAddr(0x100)).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_partial_mapping_fails() {
        let mut mem = SnapshotMemory::new();
        mem.write_u32(KAddr(0x100), 1);
        assert!(matches!(
            mem.read_u64(KAddr(0x100)),
            Err(ReadError::Unmapped { len: 8, .. })
        ));
    }

    #[test]
    fn test_cstring_stops_at_nul_and_bound() {
        let mut mem = SnapshotMemory::new();
        mem.write_cstring(KAddr(0x200), "launchd");
        assert_eq!(mem.read_cstring(KAddr(0x200), 64).unwrap(), "launchd");
        assert_eq!(mem.read_cstring(KAddr(0x200), 6).unwrap(), "launch");
        assert!(mem.read_cstring(KAddr(0x900), 8).is_err());
    }

    #[test]
    fn test_registers_and_literals() {
        let mut mem = SnapshotMemory::new();
        mem.set_register("$TPIDR_EL1", 0xffff_fff0_0000_1000);
        assert_eq!(mem.evaluate("$tpidr_el1").unwrap(), 0xffff_fff0_0000_1000);
        assert_eq!(mem.evaluate("0x10").unwrap(), 0x10);
        assert!(mem.evaluate("$pc").is_err());
    }

    #[test]
    fn test_read_log() {
        let mut mem = SnapshotMemory::new();
        mem.write_u64(KAddr(0x100), 0);
        let _ = mem.read_u64(KAddr(0x100));
        assert!(mem.touched(KAddr(0x104), KAddr(0x105)));
        assert!(!mem.touched(KAddr(0x108), KAddr(0x110)));
        mem.clear_reads();
        assert!(!mem.touched(KAddr(0x100), KAddr(0x108)));
    }

    #[test]
    fn test_json_snapshot() {
        let json = r#"{
            "registers": { "$pc": "0xfffffff0070a1800" },
            "regions": [ { "base": "0x1000", "bytes": "efbeadde" } ]
        }"#;
        let mem = SnapshotMemory::from_json_str(json).unwrap();
        assert_eq!(mem.read_u32(KAddr(0x1000)).unwrap(), 0xdead_beef);
        assert_eq!(mem.evaluate("$pc").unwrap(), 0xffff_fff0_070a_1800);
    }

    #[test]
    fn test_json_snapshot_rejects_bad_hex() {
        let json = r#"{ "regions": [ { "base": "0x1000", "bytes": "zz" } ] }"#;
        assert!(matches!(
            SnapshotMemory::from_json_str(json),
            Err(IntrospectError::Snapshot(_))
        ));
    }
}
