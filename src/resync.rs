//! Resync orchestration: rewrite the row-offset table, repair every index,
//! swap the rewrite into place, and retire the remap table.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info};

use crate::config::Config;
use crate::error::{RepairError, Result};
use crate::index::{repair_index_file, IndexRepairOutcome};
use crate::remap::RemapTable;
use crate::swap::{remove_if_exists, replace_file};
use crate::tablx::{rewrite_row_offset_table, TablxRewriteStats};

/// Summary of one resync pass.
#[derive(Debug, Clone, Default)]
pub struct ResyncReport {
    /// Whether anything was done; `false` means the remap table was empty.
    pub performed: bool,
    /// Identifier pairs that were pending and are now retired.
    pub pairs_resynced: usize,
    /// Row-offset table rewrite counters.
    pub tablx: TablxRewriteStats,
    /// Index files whose identifiers were rewritten.
    pub indexes_repaired: usize,
    /// Index files that needed no edits.
    pub indexes_clean: usize,
    /// Index files deleted because they could not be repaired.
    pub indexes_invalidated: usize,
    /// Wall-clock time the pass took.
    pub duration_ms: f64,
}

/// Brings the on-disk structures of the table at `table_path` back in line
/// with its external identifiers, then clears `remap`.
///
/// `table_path` is the table's data file (any extension); the row-offset
/// table is its `.gdbtablx` sibling and indexes are the `.atx`/`.spx` files
/// sharing the table's basename prefix. An empty remap table is a no-op.
///
/// Failure behavior, in pass order: a rewrite failure removes the partial
/// output and leaves everything else untouched; an index failure under
/// `invalid_index_is_fatal` aborts the same way; the final swap leaves its
/// intermediate artifacts in place if any rename dies, so the directory
/// shows which step failed. The remap table is cleared only after the swap
/// succeeded.
pub fn resync(table_path: &Path, remap: &mut RemapTable, config: &Config) -> Result<ResyncReport> {
    if remap.is_empty() {
        debug!(table = %table_path.display(), "repair.resync.noop");
        return Ok(ResyncReport::default());
    }
    let start = Instant::now();

    let tablx_path = table_path.with_extension("gdbtablx");
    let rewritten_path = suffixed(&tablx_path, ".new");

    let tablx = match rewrite_row_offset_table(&tablx_path, &rewritten_path, remap, config) {
        Ok(stats) => stats,
        Err(err) => {
            remove_if_exists(&rewritten_path)?;
            return Err(err);
        }
    };

    let mut report = ResyncReport {
        performed: true,
        pairs_resynced: remap.len(),
        tablx,
        ..ResyncReport::default()
    };

    for index_path in index_files_for(table_path)? {
        match repair_index_file(&index_path, remap, config) {
            Ok(IndexRepairOutcome::Repaired) => report.indexes_repaired += 1,
            Ok(IndexRepairOutcome::Clean) => report.indexes_clean += 1,
            Ok(IndexRepairOutcome::Invalidated) => report.indexes_invalidated += 1,
            Err(err) if config.invalid_index_is_fatal => {
                remove_if_exists(&rewritten_path)?;
                return Err(err);
            }
            Err(err) => {
                // Editors fail before touching the file only when they could
                // not even read the trailer; such an index is as unusable as
                // a half-rewritten one.
                debug!(
                    index = %index_path.display(),
                    error = %err,
                    "repair.resync.index_unreadable"
                );
                remove_if_exists(&index_path)?;
                report.indexes_invalidated += 1;
            }
        }
    }

    replace_file(&tablx_path, &rewritten_path)?;
    remap.clear();
    report.duration_ms = start.elapsed().as_secs_f64() * 1_000.0;

    info!(
        table = %table_path.display(),
        pairs = report.pairs_resynced,
        rows_out = report.tablx.rows_out,
        indexes_repaired = report.indexes_repaired,
        indexes_clean = report.indexes_clean,
        indexes_invalidated = report.indexes_invalidated,
        duration_ms = report.duration_ms,
        "repair.resync.completed"
    );
    Ok(report)
}

/// Index files (`.atx`/`.spx`, case-insensitive) in the table's directory
/// whose names start with the table's basename, sorted for determinism.
fn index_files_for(table_path: &Path) -> Result<Vec<PathBuf>> {
    let dir = table_path.parent().filter(|p| !p.as_os_str().is_empty());
    let dir = dir.unwrap_or_else(|| Path::new("."));
    let stem = table_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            RepairError::InvalidArgument(format!(
                "table path has no usable basename: {}",
                table_path.display()
            ))
        })?;

    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(stem) {
            continue;
        }
        let path = entry.path();
        let is_index = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("atx") || e.eq_ignore_ascii_case("spx"));
        if is_index {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// `<path><suffix>`, keeping the full original file name.
fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
