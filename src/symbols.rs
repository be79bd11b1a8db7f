//! Address to name resolution for report output
//!
//! Two JSON tables map hex address strings to names. The first holds the
//! kernel's exported and recovered symbols; the second holds hand-assigned
//! labels. Auto-generated `FUN_` names in the first table are passed over in
//! favour of a label.

use std::collections::HashMap;
use std::path::Path;

use log::{info, warn};

use crate::error::Result;
use crate::types::KAddr;

/// File name of the symbol table inside a symbols directory
pub const SYMBOLS_FILE: &str = "SymbolsNew";
/// File name of the label table inside a symbols directory
pub const LABELS_FILE: &str = "KnownLables";

const GENERATED_PREFIX: &str = "FUN_";

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<KAddr, String>,
    labels: HashMap<KAddr, String>,
}

impl SymbolTable {
    /// Table that resolves nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(symbols: &str, labels: &str) -> Result<Self> {
        Ok(Self {
            symbols: parse_table(symbols)?,
            labels: parse_table(labels)?,
        })
    }

    /// Load both tables from `dir`
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let symbols = std::fs::read_to_string(dir.join(SYMBOLS_FILE))?;
        let labels = std::fs::read_to_string(dir.join(LABELS_FILE))?;
        let table = Self::from_json(&symbols, &labels)?;
        info!(
            "loaded {} symbols and {} labels from {}",
            table.symbols.len(),
            table.labels.len(),
            dir.display()
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.symbols.len() + self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best name for `addr`, if any
    pub fn lookup(&self, addr: KAddr) -> Option<&str> {
        match self.symbols.get(&addr) {
            Some(name) if !name.contains(GENERATED_PREFIX) => Some(name),
            _ => self.labels.get(&addr).map(String::as_str),
        }
    }

    /// Name for `addr`, falling back to the address in hex
    pub fn resolve(&self, addr: KAddr) -> String {
        self.lookup(addr)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:#x}", addr.raw()))
    }
}

fn parse_table(json: &str) -> Result<HashMap<KAddr, String>> {
    let raw: HashMap<String, String> = serde_json::from_str(json)?;
    let mut table = HashMap::with_capacity(raw.len());
    for (key, name) in raw {
        match key.parse::<KAddr>() {
            Ok(addr) => {
                table.insert(addr, name);
            }
            Err(e) => warn!("symbol table: skipping key {:?}: {}", key, e),
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYMBOLS: &str = r#"{
        "0xfffffff0070e3554": "thread_block_reason",
        "0xfffffff0070a1800": "FUN_fffffff0070a1800"
    }"#;
    const LABELS: &str = r#"{ "0xfffffff0070a1800": "exception_return" }"#;

    #[test]
    fn test_prefers_symbol_over_label() {
        let table = SymbolTable::from_json(SYMBOLS, LABELS).unwrap();
        assert_eq!(
            table.resolve(KAddr(0xffff_fff0_070e_3554)),
            "thread_block_reason"
        );
    }

    #[test]
    fn test_generated_name_falls_back_to_label() {
        let table = SymbolTable::from_json(SYMBOLS, LABELS).unwrap();
        assert_eq!(table.resolve(KAddr(0xffff_fff0_070a_1800)), "exception_return");
    }

    #[test]
    fn test_unknown_address_is_hex() {
        let table = SymbolTable::empty();
        assert_eq!(table.resolve(KAddr(0xffff_fff0_0700_0010)), "0xfffffff007000010");
        assert!(table.is_empty());
    }
}
