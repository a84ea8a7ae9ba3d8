#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use fgdb_repair::pagefile::PAGE_SIZE;
use fgdb_repair::tablx::{TablxReader, BLOCK_ROWS};
use fgdb_repair::{resync, Config, RemapTable, RepairError};
use tempfile::tempdir;

const RECORD_SIZE: usize = 4;
const VALUE_SIZE: usize = 8;
const INDEX_TRAILER_LEN: usize = 22;
const LEAF_HEADER_LEN: usize = 12;

fn record_for(row: u32) -> Vec<u8> {
    (row * 8 + 1).to_le_bytes().to_vec()
}

/// Writes a row-offset table in the engine's own on-disk shape: 1024-row
/// blocks, all-empty blocks omitted and flagged in the trailer bitmap.
fn write_tablx(path: &Path, max_identifier: u32, rows: &BTreeMap<u32, Vec<u8>>) {
    let total_blocks = max_identifier.div_ceil(BLOCK_ROWS);
    let present: Vec<u32> = (0..total_blocks)
        .filter(|&block| {
            let lo = block * BLOCK_ROWS + 1;
            rows.range(lo..=lo + BLOCK_ROWS - 1).next().is_some()
        })
        .collect();
    let sparse = (present.len() as u32) < total_blocks;

    let mut data = Vec::new();
    data.extend_from_slice(&[0u8; 4]);
    let stored = if sparse {
        present.len() as u32
    } else {
        total_blocks
    };
    data.extend_from_slice(&stored.to_le_bytes());
    data.extend_from_slice(&max_identifier.to_le_bytes());
    data.extend_from_slice(&(RECORD_SIZE as u32).to_le_bytes());
    for &block in &present {
        let mut body = vec![0u8; BLOCK_ROWS as usize * RECORD_SIZE];
        let lo = block * BLOCK_ROWS + 1;
        for (&row, record) in rows.range(lo..=lo + BLOCK_ROWS - 1) {
            let slot = (row - lo) as usize * RECORD_SIZE;
            body[slot..slot + RECORD_SIZE].copy_from_slice(record);
        }
        data.extend_from_slice(&body);
    }

    let bitmap_len = ((total_blocks as usize + 7) / 8).div_ceil(128) * 128;
    let mut bitmap = vec![0u8; bitmap_len];
    for &block in &present {
        bitmap[block as usize / 8] |= 1 << (block % 8);
    }
    let mut trailer = [0u8; 16];
    trailer[4..8].copy_from_slice(&total_blocks.to_le_bytes());
    trailer[8..12].copy_from_slice(&(present.len() as u32).to_le_bytes());
    if sparse {
        trailer[0..4].copy_from_slice(&((bitmap.len() / 4) as u32).to_le_bytes());
        let span_words = ((max_identifier - 1) / BLOCK_ROWS + 31) / 32;
        trailer[12..16].copy_from_slice(&span_words.to_le_bytes());
    }
    data.extend_from_slice(&trailer);
    if sparse {
        data.extend_from_slice(&bitmap);
    }
    fs::write(path, data).expect("write tablx fixture");
}

/// Writes a depth-1 index file: one leaf page plus the trailer.
fn write_index(path: &Path, entries: &[(u32, u8)]) {
    let max_entries = (PAGE_SIZE - LEAF_HEADER_LEN) / (4 + VALUE_SIZE);
    assert!(entries.len() <= max_entries);
    let mut page = vec![0u8; PAGE_SIZE];
    page[4..8].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    let values_offset = LEAF_HEADER_LEN + max_entries * 4;
    for (slot, &(id, value_tag)) in entries.iter().enumerate() {
        let at = LEAF_HEADER_LEN + 4 * slot;
        page[at..at + 4].copy_from_slice(&id.to_le_bytes());
        let vat = values_offset + slot * VALUE_SIZE;
        page[vat..vat + VALUE_SIZE].copy_from_slice(&[value_tag; VALUE_SIZE]);
    }
    let mut trailer = [0u8; INDEX_TRAILER_LEN];
    trailer[0] = VALUE_SIZE as u8;
    trailer[6..10].copy_from_slice(&1i32.to_le_bytes());
    page.extend_from_slice(&trailer);
    fs::write(path, page).expect("write index fixture");
}

fn read_leaf_entries(path: &Path) -> Vec<(u32, u8)> {
    let data = fs::read(path).expect("read index");
    let count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    let max_entries = (PAGE_SIZE - LEAF_HEADER_LEN) / (4 + VALUE_SIZE);
    let values_offset = LEAF_HEADER_LEN + max_entries * 4;
    (0..count)
        .map(|slot| {
            let at = LEAF_HEADER_LEN + 4 * slot;
            let id = u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
            (id, data[values_offset + slot * VALUE_SIZE])
        })
        .collect()
}

#[test]
fn resync_moves_high_identifier_back_into_place() {
    let dir = tempdir().expect("tempdir");
    let table = dir.path().join("a00000009.gdbtable");
    fs::write(&table, b"data").expect("seed table");

    // Rows 1..=4 plus one row parked at 1,000,001 that is externally row 5.
    let mut rows: BTreeMap<u32, Vec<u8>> = (1..=4).map(|r| (r, record_for(r))).collect();
    rows.insert(1_000_001, record_for(1_000_001));
    write_tablx(&dir.path().join("a00000009.gdbtablx"), 1_000_001, &rows);

    let index_path = dir.path().join("a00000009.name.atx");
    write_index(&index_path, &[(10, b'A'), (1_000_001, b'A')]);
    let unrelated = dir.path().join("b00000001.name.atx");
    write_index(&unrelated, &[(1_000_001, b'Z')]);
    let unrelated_before = fs::read(&unrelated).expect("unrelated bytes");

    let mut remap = RemapTable::new();
    remap.record_collision(5, 1_000_001).expect("record pair");
    let report = resync(&table, &mut remap, &Config::default()).expect("resync");

    assert!(report.performed);
    assert_eq!(report.pairs_resynced, 1);
    assert_eq!(report.tablx.rows_out, 5);
    assert_eq!(report.indexes_repaired, 1);
    assert_eq!(report.indexes_invalidated, 0);
    assert!(remap.is_empty(), "remap retired after the swap");

    let mut reader = TablxReader::open(&dir.path().join("a00000009.gdbtablx")).expect("open");
    assert_eq!(reader.header().max_identifier, 5);
    assert_eq!(reader.offset_record(5).expect("row 5"), Some(record_for(1_000_001)));
    assert_eq!(reader.offset_record(4).expect("row 4"), Some(record_for(4)));

    // Identifier rewritten and the equal-valued run re-sorted.
    assert_eq!(read_leaf_entries(&index_path), vec![(5, b'A'), (10, b'A')]);
    assert_eq!(
        fs::read(&unrelated).expect("unrelated bytes"),
        unrelated_before,
        "other tables' indexes stay untouched"
    );

    assert!(!dir.path().join("a00000009.gdbtablx.new").exists());
    assert!(!dir.path().join("a00000009.gdbtablx.tmp").exists());
}

#[test]
fn unrepairable_index_is_dropped_and_resync_still_completes() {
    let dir = tempdir().expect("tempdir");
    let table = dir.path().join("a00000009.gdbtable");
    fs::write(&table, b"data").expect("seed table");

    let rows: BTreeMap<u32, Vec<u8>> = [(1, record_for(1)), (700, record_for(700))]
        .into_iter()
        .collect();
    write_tablx(&dir.path().join("a00000009.gdbtablx"), 700, &rows);

    // Leaf declaring more entries than a page can hold.
    let broken = dir.path().join("a00000009.broken.atx");
    write_index(&broken, &[]);
    let mut raw = fs::read(&broken).expect("read broken");
    raw[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
    fs::write(&broken, raw).expect("corrupt index");
    // Too short to even carry a trailer.
    let stub = dir.path().join("a00000009.stub.spx");
    fs::write(&stub, vec![0u8; 8]).expect("write stub");

    let mut remap = RemapTable::new();
    remap.record_collision(2, 700).expect("record pair");
    let report = resync(&table, &mut remap, &Config::default()).expect("resync");

    assert_eq!(report.indexes_invalidated, 2);
    assert!(!broken.exists(), "unwalkable index removed");
    assert!(!stub.exists(), "unreadable index removed");

    let mut reader = TablxReader::open(&dir.path().join("a00000009.gdbtablx")).expect("open");
    assert_eq!(reader.header().max_identifier, 2);
    assert_eq!(reader.offset_record(2).expect("row 2"), Some(record_for(700)));
}

#[test]
fn fatal_index_config_aborts_without_touching_the_table() {
    let dir = tempdir().expect("tempdir");
    let table = dir.path().join("a00000009.gdbtable");
    fs::write(&table, b"data").expect("seed table");

    let tablx_path = dir.path().join("a00000009.gdbtablx");
    let rows: BTreeMap<u32, Vec<u8>> = [(1, record_for(1)), (700, record_for(700))]
        .into_iter()
        .collect();
    write_tablx(&tablx_path, 700, &rows);
    let tablx_before = fs::read(&tablx_path).expect("tablx bytes");

    let stub = dir.path().join("a00000009.stub.spx");
    fs::write(&stub, vec![0u8; 8]).expect("write stub");

    let mut remap = RemapTable::new();
    remap.record_collision(2, 700).expect("record pair");
    let config = Config {
        invalid_index_is_fatal: true,
        ..Config::default()
    };
    let err = resync(&table, &mut remap, &config).expect_err("must abort");
    assert!(matches!(err, RepairError::Corruption(_)));

    assert_eq!(
        fs::read(&tablx_path).expect("tablx bytes"),
        tablx_before,
        "original row-offset table kept"
    );
    assert!(!dir.path().join("a00000009.gdbtablx.new").exists());
    assert!(stub.exists(), "index left for inspection");
    assert!(!remap.is_empty(), "remap survives an aborted resync");
}

#[test]
fn second_resync_is_a_noop() {
    let dir = tempdir().expect("tempdir");
    let table = dir.path().join("a00000009.gdbtable");
    fs::write(&table, b"data").expect("seed table");

    let tablx_path = dir.path().join("a00000009.gdbtablx");
    let rows: BTreeMap<u32, Vec<u8>> = [(1, record_for(1)), (900, record_for(900))]
        .into_iter()
        .collect();
    write_tablx(&tablx_path, 900, &rows);
    let index_path = dir.path().join("a00000009.name.atx");
    write_index(&index_path, &[(1, b'A'), (900, b'A')]);

    let mut remap = RemapTable::new();
    remap.record_collision(3, 900).expect("record pair");
    resync(&table, &mut remap, &Config::default()).expect("first resync");
    let tablx_after = fs::read(&tablx_path).expect("tablx bytes");
    let index_after = fs::read(&index_path).expect("index bytes");

    let report = resync(&table, &mut remap, &Config::default()).expect("second resync");
    assert!(!report.performed);
    assert_eq!(fs::read(&tablx_path).expect("tablx bytes"), tablx_after);
    assert_eq!(fs::read(&index_path).expect("index bytes"), index_after);
}
