//! Atomic-enough file replacement via a rename chase.
//!
//! `rename` within one directory is atomic on the filesystems that matter,
//! but replacing a live file with a freshly written sibling takes two of
//! them. The sequence parks the current file under a `.tmp` name, promotes
//! the replacement, then discards the parked copy. On any failure the
//! intermediate artifacts are left in place so the caller (or an operator)
//! can see exactly which step died; nothing is deleted on a partial swap.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{RepairError, Result};

/// Replaces `target` with `replacement` by renaming.
///
/// Steps: `target` -> `target.tmp`, `replacement` -> `target`, remove
/// `target.tmp`. A missing `target` is fine (first step is skipped); a
/// missing `replacement` is an error. The `.tmp` copy is removed only after
/// the promotion succeeded.
pub fn replace_file(target: &Path, replacement: &Path) -> Result<()> {
    if target == replacement {
        return Err(RepairError::InvalidArgument(format!(
            "replacement path must differ from the target: {}",
            target.display()
        )));
    }
    if !replacement.exists() {
        return Err(RepairError::InvalidArgument(format!(
            "replacement file not found: {}",
            replacement.display()
        )));
    }

    let parked = tmp_sibling(target);
    debug!(
        target = %target.display(),
        replacement = %replacement.display(),
        "swap.replace.begin"
    );

    rename_if_exists(target, &parked)?;
    fs::rename(replacement, target)?;
    remove_if_exists(&parked)?;

    info!(target = %target.display(), "swap.replace.completed");
    Ok(())
}

/// `<path>.tmp`, keeping the full original file name.
fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Removes `path`, treating an already-missing file as success.
pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Renames `src` to `dst`, treating a missing `src` as success.
pub fn rename_if_exists(src: &Path, dst: &Path) -> std::io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
