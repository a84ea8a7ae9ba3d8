//! Repair engine for FileGDB-style geodatabase auxiliary structures.
//!
//! When rows are inserted under caller-specified identifiers that collide
//! with a table's own sequence, the rows land under fresh internal
//! identifiers and the pairs are tracked in a [`remap::RemapTable`]. This
//! crate rewrites the `.gdbtablx` row-offset table and repairs `.atx`/`.spx`
//! index files so the externally visible identifiers become the stored ones
//! again; [`resync::resync`] drives the whole pass and swaps the rewrite
//! into place.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod index;
pub mod pagefile;
pub mod remap;
pub mod resync;
pub mod swap;
pub mod tablx;

pub use config::Config;
pub use error::{RepairError, Result};
pub use index::{repair_index_file, IndexRepairOutcome};
pub use remap::RemapTable;
pub use resync::{resync, ResyncReport};
pub use tablx::{rewrite_row_offset_table, TablxRewriteStats};
