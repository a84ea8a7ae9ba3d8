//! Row-offset table (`.gdbtablx`) codecs and the remap rewrite pass.
//!
//! The table maps row identifiers to byte offsets of the row data, in
//! 1024-row blocks. Sparse files omit all-zero blocks and carry a bitmap in
//! the trailer saying which blocks are physically present. The rewrite pass
//! produces a new table in which every remapped external identifier owns the
//! offset record its internal identifier held, in one forward streaming pass
//! over the input.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::config::Config;
use crate::error::{RepairError, Result};
use crate::remap::RemapTable;

/// Rows per block.
pub const BLOCK_ROWS: u32 = 1024;
/// Smallest valid offset-record width.
pub const MIN_RECORD_SIZE: u32 = 4;
/// Largest valid offset-record width.
pub const MAX_RECORD_SIZE: u32 = 6;

const HEADER_LEN: usize = 16;
const TRAILER_LEN: usize = 16;
/// Bitmap sizes round up to this many bytes (32 little-endian words).
const BITMAP_ALIGN: usize = 128;

const HDR_STORED_BLOCKS_OFFSET: usize = 4;
const HDR_MAX_IDENTIFIER_OFFSET: usize = 8;
const HDR_RECORD_SIZE_OFFSET: usize = 12;

const TRL_BITMAP_WORDS_OFFSET: usize = 0;
const TRL_TOTAL_BLOCKS_OFFSET: usize = 4;
const TRL_NON_EMPTY_OFFSET: usize = 8;
const TRL_BITMAP_SPAN_OFFSET: usize = 12;

/// Leading 16 bytes of a row-offset table.
#[derive(Debug, Clone)]
pub struct TablxHeader {
    /// 1024-row blocks physically present in the file.
    pub stored_blocks: u32,
    /// Highest row identifier the table addresses.
    pub max_identifier: u32,
    /// Offset-record width in bytes, 4 to 6.
    pub record_size: u32,
}

impl TablxHeader {
    /// Decodes and validates the header region.
    pub fn parse(data: &[u8; HEADER_LEN]) -> Result<Self> {
        let stored_blocks = read_u32(data, HDR_STORED_BLOCKS_OFFSET);
        let max_identifier = read_u32(data, HDR_MAX_IDENTIFIER_OFFSET);
        let record_size = read_u32(data, HDR_RECORD_SIZE_OFFSET);
        if !(MIN_RECORD_SIZE..=MAX_RECORD_SIZE).contains(&record_size) {
            return Err(RepairError::Corruption(format!(
                "row-offset table record size {record_size} outside {MIN_RECORD_SIZE}..={MAX_RECORD_SIZE}"
            )));
        }
        Ok(Self {
            stored_blocks,
            max_identifier,
            record_size,
        })
    }
}

/// Trailing 16 bytes of a row-offset table, before the optional bitmap.
#[derive(Debug, Clone)]
pub struct TablxTrailer {
    /// Little-endian words in the block bitmap; zero means dense.
    pub bitmap_words: u32,
    /// Total 1024-row blocks the table spans, including omitted ones.
    pub total_blocks: u32,
    /// Blocks physically present.
    pub non_empty_blocks: u32,
}

impl TablxTrailer {
    /// Decodes the trailer region.
    pub fn parse(data: &[u8; TRAILER_LEN]) -> Result<Self> {
        Ok(Self {
            bitmap_words: read_u32(data, TRL_BITMAP_WORDS_OFFSET),
            total_blocks: read_u32(data, TRL_TOTAL_BLOCKS_OFFSET),
            non_empty_blocks: read_u32(data, TRL_NON_EMPTY_OFFSET),
        })
    }
}

/// Counters reported by a successful rewrite.
#[derive(Debug, Clone, Default)]
pub struct TablxRewriteStats {
    /// Input max identifier after trailing compaction.
    pub rows_in: u32,
    /// Output max identifier.
    pub rows_out: u32,
    /// Trailing rows dropped by compaction (relocated or holding no record).
    pub trailing_trimmed: u32,
    /// Blocks physically written to the output.
    pub blocks_written: u32,
}

/// Rewrites the row-offset table at `src` into `dst`, reassigning offset
/// records according to `remap`.
///
/// For every remapped pair, the output row at the external identifier holds
/// the record the input kept at the internal identifier, and the internal
/// slot is left empty. Unremapped rows carry over unchanged. On error `dst`
/// is partial and must be discarded by the caller; `src` is never modified.
pub fn rewrite_row_offset_table(
    src: &Path,
    dst: &Path,
    remap: &RemapTable,
    config: &Config,
) -> Result<TablxRewriteStats> {
    let mut input = File::open(src)?;
    let mut header_raw = [0u8; HEADER_LEN];
    input.read_exact(&mut header_raw)?;
    let header = TablxHeader::parse(&header_raw)?;
    let record_size = header.record_size as usize;

    let max_external = remap.max_external().unwrap_or(0);
    let mut in_max = header.max_identifier;
    let mut out_max = in_max.max(max_external);

    let records_len = u64::from(header.stored_blocks) * u64::from(BLOCK_ROWS) * record_size as u64;
    input.seek(SeekFrom::Start(HEADER_LEN as u64 + records_len))?;
    let mut trailer_raw = [0u8; TRAILER_LEN];
    input.read_exact(&mut trailer_raw)?;
    let trailer = TablxTrailer::parse(&trailer_raw)?;
    check_block_span(&header, &trailer)?;
    let bitmap = if trailer.bitmap_words != 0 {
        let mut map = vec![0u8; bitmap_len(trailer.total_blocks)];
        input.read_exact(&mut map)?;
        Some(map)
    } else {
        None
    };

    let mut fetch = RecordFetch {
        input: &mut input,
        record_size,
        bitmap,
        memo: BlockCountMemo::default(),
        record: [0u8; MAX_RECORD_SIZE as usize],
    };

    // Trailing rows that were relocated to external slots at or below the
    // new maximum, or that hold no record at all, need not be retained.
    // Skipped entirely with no pending remaps so that a plain rewrite stays
    // a byte round-trip.
    let mut trailing_trimmed = 0u32;
    if !remap.is_empty() {
        while in_max > max_external
            && (remap.is_relocated_internal(in_max) || !fetch.record_present(in_max)?)
        {
            in_max -= 1;
            out_max -= 1;
            trailing_trimmed += 1;
        }
    }

    let out_blocks = out_max.div_ceil(BLOCK_ROWS);
    let mut output = File::create(dst)?;
    let mut header_out = header_raw;
    header_out[HDR_STORED_BLOCKS_OFFSET..HDR_STORED_BLOCKS_OFFSET + 4]
        .copy_from_slice(&out_blocks.to_le_bytes());
    header_out[HDR_MAX_IDENTIFIER_OFFSET..HDR_MAX_IDENTIFIER_OFFSET + 4]
        .copy_from_slice(&out_max.to_le_bytes());
    output.write_all(&header_out)?;

    let mut bitmap_out = vec![0u8; round_up(bitmap_len(out_blocks), BITMAP_ALIGN)];
    let block_len = BLOCK_ROWS as usize * record_size;
    let mut block_buf = vec![0u8; block_len];
    let mut non_empty_blocks = 0u32;

    let mut block_index = 0u32;
    while u64::from(block_index) * u64::from(BLOCK_ROWS) < u64::from(out_max) {
        let first_row = block_index * BLOCK_ROWS + 1;

        if !config.disable_sparse_blocks {
            if first_row > in_max {
                // Beyond the input's rows only pending external identifiers
                // can produce content; jump straight to the next one's block.
                match remap.next_external_at_or_after(first_row) {
                    None => break,
                    Some(next_external) => {
                        if next_external > first_row + BLOCK_ROWS {
                            block_index = (next_external - 1) / BLOCK_ROWS;
                            continue;
                        }
                    }
                }
            } else if let Some(map) = fetch.bitmap.as_deref() {
                let in_block = ((first_row - 1) / BLOCK_ROWS) as usize;
                if !test_bit(map, in_block)
                    && remap
                        .next_external_at_or_after(first_row)
                        .is_none_or(|n| n > first_row + BLOCK_ROWS)
                    && remap
                        .next_internal_at_or_after(first_row)
                        .is_none_or(|n| n > first_row + BLOCK_ROWS)
                {
                    // Empty input block with no remap targets nearby.
                    block_index += 1;
                    continue;
                }
            }
        }

        let last_row = out_max.min(block_index * BLOCK_ROWS + BLOCK_ROWS);
        let mut any_record = false;
        for row in first_row..=last_row {
            let source = if let Some(internal) = remap.internal_for(row) {
                internal
            } else if row > in_max || remap.is_relocated_internal(row) {
                // Relocated internal slots become empty; rows past the input
                // maximum have no source at all.
                continue;
            } else {
                row
            };
            let slot = (row - first_row) as usize * record_size;
            if fetch.copy_record(source, &mut block_buf[slot..slot + record_size])? {
                any_record = true;
            }
        }

        if any_record || config.disable_sparse_blocks {
            output.write_all(&block_buf)?;
            set_bit(&mut bitmap_out, block_index as usize);
            non_empty_blocks += 1;
        }
        block_buf.fill(0);
        block_index += 1;
    }

    let mut trailer_out = [0u8; TRAILER_LEN];
    trailer_out[TRL_TOTAL_BLOCKS_OFFSET..TRL_TOTAL_BLOCKS_OFFSET + 4]
        .copy_from_slice(&out_blocks.to_le_bytes());
    trailer_out[TRL_NON_EMPTY_OFFSET..TRL_NON_EMPTY_OFFSET + 4]
        .copy_from_slice(&non_empty_blocks.to_le_bytes());
    let sparse = non_empty_blocks < out_blocks;
    if sparse {
        let bitmap_words = (bitmap_out.len() / 4) as u32;
        trailer_out[TRL_BITMAP_WORDS_OFFSET..TRL_BITMAP_WORDS_OFFSET + 4]
            .copy_from_slice(&bitmap_words.to_le_bytes());
        // Words actually spanned by the block range; not consulted by known
        // readers but carried for byte fidelity.
        let span_words = ((out_max - 1) / BLOCK_ROWS + 31) / 32;
        trailer_out[TRL_BITMAP_SPAN_OFFSET..TRL_BITMAP_SPAN_OFFSET + 4]
            .copy_from_slice(&span_words.to_le_bytes());
    }
    output.write_all(&trailer_out)?;
    if sparse {
        output.write_all(&bitmap_out)?;
        // With blocks omitted, the header's stored-block count is the number
        // of blocks physically present.
        output.seek(SeekFrom::Start(HDR_STORED_BLOCKS_OFFSET as u64))?;
        output.write_all(&non_empty_blocks.to_le_bytes())?;
    }

    let stats = TablxRewriteStats {
        rows_in: in_max,
        rows_out: out_max,
        trailing_trimmed,
        blocks_written: non_empty_blocks,
    };
    debug!(
        rows_in = stats.rows_in,
        rows_out = stats.rows_out,
        trailing_trimmed = stats.trailing_trimmed,
        blocks_written = stats.blocks_written,
        sparse,
        "repair.tablx.rewritten"
    );
    Ok(stats)
}

/// Read-only accessor over a row-offset table, mainly for verification.
#[derive(Debug)]
pub struct TablxReader {
    file: File,
    header: TablxHeader,
    bitmap: Option<Vec<u8>>,
}

impl TablxReader {
    /// Opens the table and loads its header, trailer and bitmap.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header_raw = [0u8; HEADER_LEN];
        file.read_exact(&mut header_raw)?;
        let header = TablxHeader::parse(&header_raw)?;
        let records_len = u64::from(header.stored_blocks)
            * u64::from(BLOCK_ROWS)
            * u64::from(header.record_size);
        file.seek(SeekFrom::Start(HEADER_LEN as u64 + records_len))?;
        let mut trailer_raw = [0u8; TRAILER_LEN];
        file.read_exact(&mut trailer_raw)?;
        let trailer = TablxTrailer::parse(&trailer_raw)?;
        check_block_span(&header, &trailer)?;
        let bitmap = if trailer.bitmap_words != 0 {
            let mut map = vec![0u8; bitmap_len(trailer.total_blocks)];
            file.read_exact(&mut map)?;
            Some(map)
        } else {
            None
        };
        Ok(Self {
            file,
            header,
            bitmap,
        })
    }

    /// Parsed header.
    pub fn header(&self) -> &TablxHeader {
        &self.header
    }

    /// Whether block `block_index` is physically present.
    pub fn block_present(&self, block_index: u32) -> bool {
        match &self.bitmap {
            Some(map) => test_bit(map, block_index as usize),
            None => block_index < self.header.stored_blocks,
        }
    }

    /// Offset record for `row`, or `None` when the row is absent.
    pub fn offset_record(&mut self, row: u32) -> Result<Option<Vec<u8>>> {
        if row == 0 || row > self.header.max_identifier {
            return Ok(None);
        }
        let record_size = self.header.record_size as usize;
        let block = (row - 1) / BLOCK_ROWS;
        let physical = match &self.bitmap {
            Some(map) => {
                if !test_bit(map, block as usize) {
                    return Ok(None);
                }
                let before = (0..block as usize).filter(|&b| test_bit(map, b)).count() as u64;
                before * u64::from(BLOCK_ROWS) + u64::from((row - 1) % BLOCK_ROWS)
            }
            None => u64::from(row - 1),
        };
        self.file
            .seek(SeekFrom::Start(HEADER_LEN as u64 + physical * record_size as u64))?;
        let mut record = vec![0u8; record_size];
        self.file.read_exact(&mut record)?;
        if record.iter().all(|&b| b == 0) {
            Ok(None)
        } else {
            Ok(Some(record))
        }
    }
}

struct RecordFetch<'a> {
    input: &'a mut File,
    record_size: usize,
    bitmap: Option<Vec<u8>>,
    memo: BlockCountMemo,
    record: [u8; MAX_RECORD_SIZE as usize],
}

impl RecordFetch<'_> {
    /// Reads the offset record of input row `source` into the scratch
    /// buffer, honoring the input bitmap. Returns false when the row is
    /// absent (omitted block or all-zero record).
    fn record_present(&mut self, source: u32) -> Result<bool> {
        let physical = match self.bitmap.as_deref() {
            Some(map) => {
                let block = ((source - 1) / BLOCK_ROWS) as usize;
                if block >= map.len() * 8 || !test_bit(map, block) {
                    return Ok(false);
                }
                let before = self.memo.set_bits_before(map, block);
                u64::from(before) * u64::from(BLOCK_ROWS) + u64::from((source - 1) % BLOCK_ROWS)
            }
            None => u64::from(source - 1),
        };
        self.input.seek(SeekFrom::Start(
            HEADER_LEN as u64 + physical * self.record_size as u64,
        ))?;
        let record = &mut self.record[..self.record_size];
        self.input.read_exact(record)?;
        Ok(record.iter().any(|&b| b != 0))
    }

    /// Copies the offset record of input row `source` into `dst`; false when
    /// the row is absent.
    fn copy_record(&mut self, source: u32, dst: &mut [u8]) -> Result<bool> {
        if self.record_present(source)? {
            dst.copy_from_slice(&self.record[..self.record_size]);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Running popcount over the block bitmap. Sources arrive mostly in
/// ascending block order, so counting resumes from the last queried block
/// instead of rescanning from zero.
#[derive(Debug, Default)]
struct BlockCountMemo {
    block: usize,
    count: u32,
}

impl BlockCountMemo {
    fn set_bits_before(&mut self, map: &[u8], block: usize) -> u32 {
        let count = if block >= self.block {
            let mut count = self.count;
            for b in self.block..block {
                count += u32::from(test_bit(map, b));
            }
            count
        } else {
            let mut count = 0;
            for b in 0..block {
                count += u32::from(test_bit(map, b));
            }
            count
        };
        self.block = block;
        self.count = count;
        count
    }
}

/// The trailer's block count must agree with the rows the header addresses;
/// bitmap indexing is bounded by it.
fn check_block_span(header: &TablxHeader, trailer: &TablxTrailer) -> Result<()> {
    let expected = header.max_identifier.div_ceil(BLOCK_ROWS);
    if trailer.total_blocks != expected {
        return Err(RepairError::Corruption(format!(
            "trailer spans {} blocks but {} rows occupy {}",
            trailer.total_blocks, header.max_identifier, expected
        )));
    }
    Ok(())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn bitmap_len(blocks: u32) -> usize {
    (blocks as usize + 7) / 8
}

fn round_up(len: usize, align: usize) -> usize {
    len.div_ceil(align) * align
}

fn test_bit(map: &[u8], bit: usize) -> bool {
    map[bit / 8] & (1 << (bit % 8)) != 0
}

fn set_bit(map: &mut [u8], bit: usize) {
    map[bit / 8] |= 1 << (bit % 8);
}
