//! Integration tests for the on-disk inputs: layouts, symbol tables, snapshots

use std::fs;

use tempfile::TempDir;
use xnu_introspect::kern::ThreadList;
use xnu_introspect::symbols::{LABELS_FILE, SYMBOLS_FILE};
use xnu_introspect::{IntrospectError, KAddr, Layout, Session, SnapshotMemory, SymbolTable};

#[test]
fn test_layout_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("16B92.toml");
    let builtin = Layout::ios_16b92();
    fs::write(&path, toml::to_string(&builtin).unwrap()).unwrap();

    let loaded = Layout::load(&path).unwrap();
    assert_eq!(loaded, builtin);
}

#[test]
fn test_layout_file_with_zero_stride_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    let mut layout = Layout::ios_16b92();
    layout.ipc_entry.stride = 0;
    fs::write(&path, toml::to_string(&layout).unwrap()).unwrap();

    let err = Layout::load(&path).unwrap_err();
    assert!(matches!(err, IntrospectError::InvalidLayout(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_malformed_layout_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.toml");
    fs::write(&path, "build = 16B92 [").unwrap();

    assert!(matches!(Layout::load(&path), Err(IntrospectError::LayoutFile(_))));
}

#[test]
fn test_unsupported_build() {
    assert!(matches!(
        Layout::for_build("15E216"),
        Err(IntrospectError::UnsupportedBuild { .. })
    ));
    assert_eq!(Layout::for_build("16b92").unwrap(), Layout::ios_16b92());
}

#[test]
fn test_symbol_directory() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(SYMBOLS_FILE),
        r#"{ "0xfffffff0070e7d0c": "thread_run", "0xfffffff0070a1800": "FUN_fffffff0070a1800" }"#,
    )
    .unwrap();
    fs::write(dir.path().join(LABELS_FILE), r#"{ "0xfffffff0070a1800": "exception_return" }"#).unwrap();

    let table = SymbolTable::load_dir(dir.path()).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.resolve(KAddr(0xffff_fff0_070e_7d0c)), "thread_run");
    assert_eq!(table.resolve(KAddr(0xffff_fff0_070a_1800)), "exception_return");
}

#[test]
fn test_symbol_directory_missing_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(SYMBOLS_FILE), "{}").unwrap();

    assert!(matches!(SymbolTable::load_dir(dir.path()), Err(IntrospectError::Io(_))));
}

#[test]
fn test_snapshot_file_drives_a_session() {
    let layout = Layout::ios_16b92();
    let tasks = layout.globals.tasks;
    let threads = layout.globals.threads;
    let num_zones = layout.globals.num_zones;
    let json = format!(
        r#"{{
            "registers": {{ "TPIDR_EL1": "0x0", "cpsr": "0x4" }},
            "regions": [
                {{ "base": "{:#x}", "bytes": "{}" }},
                {{ "base": "{:#x}", "bytes": "{}" }},
                {{ "base": "{:#x}", "bytes": "00000000" }}
            ]
        }}"#,
        tasks.raw(),
        hex::encode(tasks.raw().to_le_bytes()),
        threads.raw(),
        hex::encode(threads.raw().to_le_bytes()),
        num_zones.raw(),
    );
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("snapshot.json");
    fs::write(&path, json).unwrap();

    let mem = SnapshotMemory::load(&path).unwrap();
    let session = Session::attach(mem, layout).unwrap();
    assert!(session.is_in_kernel_space().unwrap());
    assert_eq!(session.tasks().unwrap().count(), 0);
    assert_eq!(session.threads(ThreadList::Global).unwrap().count(), 0);
}

#[test]
fn test_snapshot_with_bad_hex() {
    let json = r#"{ "regions": [ { "base": "0x1000", "bytes": "zz" } ] }"#;
    assert!(matches!(
        SnapshotMemory::from_json_str(json),
        Err(IntrospectError::Snapshot(_))
    ));
}
