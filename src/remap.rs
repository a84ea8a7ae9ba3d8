//! Bidirectional external/internal identifier mapping.
//!
//! When a row is inserted under a caller-specified identifier that collides
//! with the table's own sequence, the row is physically stored under a fresh
//! internal identifier and the pair is recorded here. Both rewriters consult
//! the table read-only; only the resync orchestrator clears it.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::{RepairError, Result};

/// Paired `external -> internal` and `internal -> external` maps.
///
/// Every mutation touches both sides, so a pair exists in one direction iff
/// the inverse pair exists in the other. Ordered maps deliberately: the
/// row-offset rewriter asks for the next remapped identifier at or after a
/// given row while walking the table forward.
#[derive(Debug, Default, Clone)]
pub struct RemapTable {
    external_to_internal: BTreeMap<u32, u32>,
    internal_to_external: BTreeMap<u32, u32>,
}

impl RemapTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the row visible as `external` is stored under `internal`.
    ///
    /// Identifiers are strictly positive and each may participate in at most
    /// one pair; re-recording the exact same pair is a no-op.
    pub fn record_collision(&mut self, external: u32, internal: u32) -> Result<()> {
        if external == 0 || internal == 0 {
            return Err(RepairError::InvalidArgument(
                "identifiers must be strictly positive".into(),
            ));
        }
        match (
            self.external_to_internal.get(&external),
            self.internal_to_external.get(&internal),
        ) {
            (Some(&mapped), Some(&back)) if mapped == internal && back == external => {
                return Ok(());
            }
            (None, None) => {}
            _ => {
                return Err(RepairError::InvalidArgument(format!(
                    "identifier pair ({external}, {internal}) conflicts with an existing entry"
                )));
            }
        }
        self.external_to_internal.insert(external, internal);
        self.internal_to_external.insert(internal, external);
        Ok(())
    }

    /// Internal identifier backing `external`, if remapped.
    pub fn internal_for(&self, external: u32) -> Option<u32> {
        self.external_to_internal.get(&external).copied()
    }

    /// External identifier a relocated `internal` row is visible as.
    pub fn external_for(&self, internal: u32) -> Option<u32> {
        self.internal_to_external.get(&internal).copied()
    }

    /// Whether `internal` was relocated to an external slot.
    pub fn is_relocated_internal(&self, internal: u32) -> bool {
        self.internal_to_external.contains_key(&internal)
    }

    /// Highest remapped external identifier.
    pub fn max_external(&self) -> Option<u32> {
        self.external_to_internal.keys().next_back().copied()
    }

    /// Smallest remapped external identifier `>= row`.
    pub fn next_external_at_or_after(&self, row: u32) -> Option<u32> {
        self.external_to_internal.range(row..).next().map(|(&k, _)| k)
    }

    /// Smallest relocated internal identifier `>= row`.
    pub fn next_internal_at_or_after(&self, row: u32) -> Option<u32> {
        self.internal_to_external.range(row..).next().map(|(&k, _)| k)
    }

    /// Drops the pair keyed by `external` (row deletion path), returning the
    /// internal identifier it was stored under.
    pub fn remove_external(&mut self, external: u32) -> Option<u32> {
        let internal = self.external_to_internal.remove(&external)?;
        self.internal_to_external.remove(&internal);
        Some(internal)
    }

    /// Empties the table after a successful resync.
    pub fn clear(&mut self) {
        self.external_to_internal.clear();
        self.internal_to_external.clear();
    }

    /// Number of pending pairs.
    pub fn len(&self) -> usize {
        self.external_to_internal.len()
    }

    /// Whether no pairs are pending.
    pub fn is_empty(&self) -> bool {
        self.external_to_internal.is_empty()
    }

    /// Whether enough pairs accumulated that the caller should resync.
    pub fn needs_resync(&self, config: &Config) -> bool {
        self.len() >= config.resync_threshold
    }
}
