//! Tests for MetaFile
//!
//! These tests verify:
//! - Newest-first ordering across both slots
//! - Records survive reopen through a second mapping
//! - A garbage meta file yields no records instead of an error

use std::fs;

use mapkv::storage::{MetaFile, MetaInfo, FLAG_ENCRYPTED, META_FILE_SIZE};

use crate::setup_temp_file;

fn record(sequence_id: u64, actual_size: u32) -> MetaInfo {
    MetaInfo {
        sequence_id,
        actual_size,
        crc_digest: actual_size.wrapping_mul(31),
        ..MetaInfo::empty()
    }
}

#[test]
fn test_records_newest_first() {
    let (_temp, path) = setup_temp_file("db.crc");
    let mut meta = MetaFile::open(&path).unwrap();

    meta.write(&record(0, 10), true).unwrap();
    meta.write(&record(0, 20), true).unwrap();
    meta.write(&record(1, 5), true).unwrap();

    let records: Vec<MetaInfo> = meta.records().into_iter().map(|(_, m)| m).collect();
    assert_eq!(records, vec![record(1, 5), record(0, 20)]);
}

#[test]
fn test_second_mapping_sees_writes() {
    let (_temp, path) = setup_temp_file("db.crc");
    let mut writer = MetaFile::open(&path).unwrap();
    let reader = MetaFile::open(&path).unwrap();

    let info = MetaInfo {
        flags: FLAG_ENCRYPTED,
        iv: [9u8; 16],
        key_check: 0xdead_beef,
        ..record(3, 77)
    };
    writer.write(&info, false).unwrap();

    assert_eq!(reader.latest(), Some(info));
    assert!(reader.latest().unwrap().is_encrypted());
}

#[test]
fn test_garbage_file_has_no_records() {
    let (_temp, path) = setup_temp_file("db.crc");
    fs::write(&path, vec![0xa5u8; META_FILE_SIZE]).unwrap();

    let meta = MetaFile::open(&path).unwrap();

    assert!(meta.records().is_empty());
    assert_eq!(meta.latest(), None);
}

#[test]
fn test_short_file_is_extended() {
    let (_temp, path) = setup_temp_file("db.crc");
    fs::write(&path, b"short").unwrap();

    let meta = MetaFile::open(&path).unwrap();

    assert_eq!(fs::metadata(&path).unwrap().len(), META_FILE_SIZE as u64);
    assert_eq!(meta.latest(), None);
}
