//! Attribute/spatial index (`.atx`/`.spx`) page codecs and the repair walk.
//!
//! Index files are B-tree-like: interior pages reference sub-pages, leaf
//! pages hold row identifiers next to fixed-width indexed values, chained
//! through next-page pointers in value order. Repair rewrites every stored
//! internal identifier to its external one and restores the secondary sort
//! (ascending identifier within equal indexed values), which the rewrite can
//! break. An index that cannot be repaired is deleted: readers fall back to
//! a full scan on a missing index, but a half-rewritten one silently returns
//! wrong rows.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RepairError, Result};
use crate::pagefile::{PageFile, PAGE_SIZE};
use crate::remap::RemapTable;

/// Trailer length at the end of every index file.
pub const INDEX_TRAILER_LEN: usize = 22;
/// A run of equal-valued entries spanning more pages than this marks the
/// index as corrupt rather than sortable.
pub const RUN_PAGE_LIMIT: usize = 100_000;

const TRL_VALUE_SIZE_OFFSET: usize = 0;
const TRL_DEPTH_OFFSET: usize = 6;

const LEAF_NEXT_PAGE_OFFSET: usize = 0;
const LEAF_COUNT_OFFSET: usize = 4;
const LEAF_HEADER_LEN: usize = 12;

const INTERIOR_COUNT_OFFSET: usize = 4;
const INTERIOR_CHILDREN_OFFSET: usize = 8;
const MAX_CHILDREN: usize = (PAGE_SIZE - INTERIOR_CHILDREN_OFFSET) / 4;

/// Result of repairing one index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRepairOutcome {
    /// No stored identifier needed rewriting.
    Clean,
    /// Identifiers were rewritten (and runs re-sorted where needed).
    Repaired,
    /// The index was unrepairable and has been removed.
    Invalidated,
}

/// Geometry of one index file, decoded from its trailer.
#[derive(Debug, Clone, Copy)]
pub struct IndexTrailer {
    /// Width in bytes of each indexed value.
    pub value_size: usize,
    /// Tree depth; 1 means the root page is already a leaf.
    pub depth: u32,
}

impl IndexTrailer {
    /// Decodes the 22-byte trailer region.
    pub fn parse(data: &[u8; INDEX_TRAILER_LEN]) -> Result<Self> {
        let value_size = data[TRL_VALUE_SIZE_OFFSET] as usize;
        if value_size == 0 {
            return Err(RepairError::Corruption(
                "index trailer declares zero-width indexed values".into(),
            ));
        }
        let depth = i32::from_le_bytes([
            data[TRL_DEPTH_OFFSET],
            data[TRL_DEPTH_OFFSET + 1],
            data[TRL_DEPTH_OFFSET + 2],
            data[TRL_DEPTH_OFFSET + 3],
        ]);
        if depth < 1 {
            return Err(RepairError::Corruption(format!(
                "index trailer declares tree depth {depth}"
            )));
        }
        Ok(Self {
            value_size,
            depth: depth as u32,
        })
    }

    /// Entries a leaf page of this geometry can hold.
    pub fn max_entries_per_page(&self) -> usize {
        (PAGE_SIZE - LEAF_HEADER_LEN) / (4 + self.value_size)
    }
}

/// Rewrites remapped row identifiers throughout the index file at `path`
/// and restores identifier order within equal-valued leaf runs.
///
/// A walk-phase failure (I/O or structural) deletes the file and reports
/// [`IndexRepairOutcome::Invalidated`], unless `config.invalid_index_is_fatal`
/// turns it into a hard error. A file whose trailer cannot be read fails
/// without being modified.
pub fn repair_index_file(
    path: &Path,
    remap: &RemapTable,
    config: &Config,
) -> Result<IndexRepairOutcome> {
    repair_index_file_with_limit(path, remap, config, RUN_PAGE_LIMIT)
}

fn repair_index_file_with_limit(
    path: &Path,
    remap: &RemapTable,
    config: &Config,
    run_page_limit: usize,
) -> Result<IndexRepairOutcome> {
    let mut file = PageFile::open(path)?;
    let len = file.len()?;
    if len <= INDEX_TRAILER_LEN as u64 {
        return Err(RepairError::Corruption(format!(
            "index file {} too short to carry a trailer",
            path.display()
        )));
    }
    let mut trailer_raw = [0u8; INDEX_TRAILER_LEN];
    file.read_exact_at(len - INDEX_TRAILER_LEN as u64, &mut trailer_raw)?;
    let trailer = IndexTrailer::parse(&trailer_raw)?;

    let mut editor = IndexEditor {
        file,
        value_size: trailer.value_size,
        max_entries: trailer.max_entries_per_page(),
        remap,
        run_page_limit,
        run: LeafRun::default(),
        last_leaf: 0,
        pages_rewritten: 0,
        ids_rewritten: 0,
    };
    match editor.walk(1, trailer.depth) {
        Ok(()) => {
            let outcome = if editor.pages_rewritten > 0 {
                IndexRepairOutcome::Repaired
            } else {
                IndexRepairOutcome::Clean
            };
            debug!(
                path = %path.display(),
                pages_rewritten = editor.pages_rewritten,
                ids_rewritten = editor.ids_rewritten,
                "repair.index.walked"
            );
            Ok(outcome)
        }
        Err(err) => {
            drop(editor);
            if config.invalid_index_is_fatal {
                return Err(err);
            }
            warn!(path = %path.display(), error = %err, "repair.index.invalidated");
            fs::remove_file(path)?;
            Ok(IndexRepairOutcome::Invalidated)
        }
    }
}

/// Accumulator for the run of leaf entries sharing the current indexed
/// value, threaded through the whole walk in page-visitation order.
#[derive(Debug, Default)]
struct LeafRun {
    /// Indexed value bytes of the current run; meaningful once `value_valid`.
    value: Vec<u8>,
    value_valid: bool,
    /// Entry index where the run starts inside its first page.
    first_index: usize,
    /// Pages the run spans so far, in visitation order.
    pages: Vec<u32>,
    /// Whether an identifier inside the run was rewritten, requiring a
    /// re-sort when the run closes.
    sort_pending: bool,
}

struct IndexEditor<'a> {
    file: PageFile,
    value_size: usize,
    max_entries: usize,
    remap: &'a RemapTable,
    run_page_limit: usize,
    run: LeafRun,
    last_leaf: u32,
    pages_rewritten: u32,
    ids_rewritten: u64,
}

impl IndexEditor<'_> {
    fn walk(&mut self, page: u32, depth: u32) -> Result<()> {
        if depth == 1 {
            self.visit_leaf(page)
        } else {
            self.visit_interior(page, depth)
        }
    }

    fn visit_interior(&mut self, page: u32, depth: u32) -> Result<()> {
        let mut buf = [0u8; PAGE_SIZE];
        self.file.read_page(page, &mut buf)?;
        let sub_pages = read_u32(&buf, INTERIOR_COUNT_OFFSET) as usize + 1;
        if sub_pages > MAX_CHILDREN {
            return Err(RepairError::Corruption(format!(
                "interior page {page} declares {sub_pages} children"
            )));
        }
        for slot in 0..sub_pages {
            let child = read_u32(&buf, INTERIOR_CHILDREN_OFFSET + 4 * slot);
            if child < 1 {
                return Err(RepairError::Corruption(format!(
                    "interior page {page} references page {child}"
                )));
            }
            self.walk(child, depth - 1)?;
        }
        Ok(())
    }

    fn visit_leaf(&mut self, page: u32) -> Result<()> {
        // A leaf already consumed through a multi-page sort can be reached
        // again through its parent.
        if page == self.last_leaf {
            return Ok(());
        }
        let mut buf = [0u8; PAGE_SIZE];
        self.file.read_page(page, &mut buf)?;
        let next_page = read_u32(&buf, LEAF_NEXT_PAGE_OFFSET);
        let count = read_u32(&buf, LEAF_COUNT_OFFSET) as usize;
        if count > self.max_entries {
            return Err(RepairError::Corruption(format!(
                "leaf page {page} declares {count} entries, maximum is {}",
                self.max_entries
            )));
        }
        let values_offset = LEAF_HEADER_LEN + self.max_entries * 4;

        let mut dirty = false;
        for entry in 0..count {
            let value_at = values_offset + entry * self.value_size;
            let value = &buf[value_at..value_at + self.value_size];
            let is_new_value = !self.run.value_valid || self.run.value.as_slice() != value;
            let is_final_entry = entry + 1 == count && next_page == 0;

            let stored = read_u32(&buf, LEAF_HEADER_LEN + 4 * entry);
            let remapped = self.remap.external_for(stored);
            if let Some(external) = remapped {
                buf[LEAF_HEADER_LEN + 4 * entry..LEAF_HEADER_LEN + 4 * entry + 4]
                    .copy_from_slice(&external.to_le_bytes());
                dirty = true;
                self.ids_rewritten += 1;
                if self.run.value_valid && is_final_entry {
                    self.run.sort_pending = true;
                }
            }

            if self.run.sort_pending && (is_new_value || is_final_entry) {
                self.sort_run(page, &mut buf, entry, is_new_value, is_final_entry, &mut dirty)?;
            }

            if is_new_value {
                self.run.first_index = entry;
                self.run.pages.clear();
                self.run.pages.push(page);
                self.run.value.clear();
                self.run
                    .value
                    .extend_from_slice(&buf[value_at..value_at + self.value_size]);
                self.run.sort_pending = false;
            } else if entry == 0 {
                if self.run.pages.len() > self.run_page_limit {
                    return Err(RepairError::Corruption(format!(
                        "leaf run for one indexed value spans more than {} pages",
                        self.run_page_limit
                    )));
                }
                self.run.pages.push(page);
            }

            if remapped.is_some() {
                self.run.sort_pending = true;
            }
            self.run.value_valid = true;
        }

        if dirty {
            self.file.write_page(page, &buf)?;
            self.pages_rewritten += 1;
        }
        self.last_leaf = page;
        Ok(())
    }

    /// Re-sorts the closing run's identifiers ascending across all the pages
    /// and positions the run occupies. `entry` is the index of the entry
    /// being visited when the run closed; its page buffer is edited in place,
    /// other run pages are edited through the file.
    fn sort_run(
        &mut self,
        page: u32,
        buf: &mut [u8; PAGE_SIZE],
        entry: usize,
        is_new_value: bool,
        is_final_entry: bool,
        dirty: &mut bool,
    ) -> Result<()> {
        // Entries of the current page belonging to the closing run: all
        // before `entry`, plus the entry itself when the run closes with the
        // page chain rather than at a value boundary.
        let mut current_page_entries = entry;
        if !is_new_value && is_final_entry {
            current_page_entries += 1;
        }

        if self.run.pages[0] == page {
            // Run confined to the current page.
            let count = current_page_entries - self.run.first_index;
            let start = LEAF_HEADER_LEN + 4 * self.run.first_index;
            sort_id_slots(&mut buf[start..start + 4 * count]);
            *dirty = true;
            return Ok(());
        }

        struct Segment {
            page: u32,
            start_entry: usize,
            entries: usize,
            in_buffer: bool,
        }

        // Snapshot: the loop reads other run pages through the file, which
        // needs the editor mutably.
        let run_pages = self.run.pages.clone();
        let mut segments = Vec::with_capacity(run_pages.len() + 1);
        let mut ids: Vec<u32> = Vec::new();
        for (position, &run_page) in run_pages.iter().enumerate() {
            let is_current = position + 1 == run_pages.len() && run_page == page;
            if is_current {
                for slot in 0..current_page_entries {
                    ids.push(read_u32(buf, LEAF_HEADER_LEN + 4 * slot));
                }
                segments.push(Segment {
                    page: run_page,
                    start_entry: 0,
                    entries: current_page_entries,
                    in_buffer: true,
                });
            } else {
                let feature_count = self.read_leaf_count(run_page)? as usize;
                let start_entry = if position == 0 { self.run.first_index } else { 0 };
                if start_entry > feature_count || feature_count > self.max_entries {
                    return Err(RepairError::Corruption(format!(
                        "leaf page {run_page} shrank mid-run"
                    )));
                }
                let entries = feature_count - start_entry;
                let mut raw = vec![0u8; 4 * entries];
                self.file.read_exact_at(
                    leaf_field_offset(run_page, LEAF_HEADER_LEN + 4 * start_entry),
                    &mut raw,
                )?;
                for chunk in raw.chunks_exact(4) {
                    ids.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
                segments.push(Segment {
                    page: run_page,
                    start_entry,
                    entries,
                    in_buffer: false,
                });
            }
        }
        // The run can close on a page it never got registered on: final
        // entry of the chain at entry index 0 of a fresh page. Its entries
        // still belong to the run.
        if current_page_entries > 0 && !segments.iter().any(|s| s.in_buffer) {
            for slot in 0..current_page_entries {
                ids.push(read_u32(buf, LEAF_HEADER_LEN + 4 * slot));
            }
            segments.push(Segment {
                page,
                start_entry: 0,
                entries: current_page_entries,
                in_buffer: true,
            });
        }

        ids.sort_unstable();

        let mut cursor = 0usize;
        for segment in &segments {
            let slice = &ids[cursor..cursor + segment.entries];
            if segment.in_buffer {
                for (slot, &id) in slice.iter().enumerate() {
                    let at = LEAF_HEADER_LEN + 4 * slot;
                    buf[at..at + 4].copy_from_slice(&id.to_le_bytes());
                }
                *dirty = true;
            } else {
                let mut raw = Vec::with_capacity(4 * segment.entries);
                for &id in slice {
                    raw.extend_from_slice(&id.to_le_bytes());
                }
                self.file.write_all_at(
                    leaf_field_offset(segment.page, LEAF_HEADER_LEN + 4 * segment.start_entry),
                    &raw,
                )?;
            }
            cursor += segment.entries;
        }
        Ok(())
    }

    fn read_leaf_count(&mut self, page: u32) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.file
            .read_exact_at(leaf_field_offset(page, LEAF_COUNT_OFFSET), &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }
}

fn leaf_field_offset(page: u32, field_offset: usize) -> u64 {
    u64::from(page - 1) * PAGE_SIZE as u64 + field_offset as u64
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Sorts a packed array of little-endian 4-byte identifiers ascending.
fn sort_id_slots(slots: &mut [u8]) {
    let mut ids: Vec<u32> = slots
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    ids.sort_unstable();
    for (chunk, id) in slots.chunks_exact_mut(4).zip(&ids) {
        chunk.copy_from_slice(&id.to_le_bytes());
    }
}
