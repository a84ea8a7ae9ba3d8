//! Raw page-granular I/O over a single seekable file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{RepairError, Result};

/// Fixed page size shared by index files.
pub const PAGE_SIZE: usize = 4096;

/// Read/write handle over one fixed-layout file.
///
/// Page numbers are 1-based: page `n` starts at byte `(n - 1) * 4096`. No
/// caching, no business logic; the rewriters above decide what the bytes
/// mean.
#[derive(Debug)]
pub struct PageFile {
    file: File,
}

impl PageFile {
    /// Opens an existing file for in-place page edits.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Whether the file holds no bytes at all.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads page `page_no` into `buf`.
    pub fn read_page(&mut self, page_no: u32, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let offset = page_offset(page_no)?;
        self.read_exact_at(offset, buf)
    }

    /// Writes `buf` back as page `page_no`.
    pub fn write_page(&mut self, page_no: u32, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let offset = page_offset(page_no)?;
        self.write_all_at(offset, buf)
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes all of `buf` starting at `offset`.
    pub fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }
}

fn page_offset(page_no: u32) -> Result<u64> {
    if page_no == 0 {
        return Err(RepairError::Corruption(
            "page numbers are 1-based; page 0 referenced".into(),
        ));
    }
    Ok(u64::from(page_no - 1) * PAGE_SIZE as u64)
}
