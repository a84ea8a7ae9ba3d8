//! Repair tunables.

use std::env;

/// Pending remap pairs tolerated before a resync should be triggered.
pub const DEFAULT_RESYNC_THRESHOLD: usize = 1_000_000;

const ENV_RESYNC_THRESHOLD: &str = "FGDB_REPAIR_RESYNC_THRESHOLD";
const ENV_DISABLE_SPARSE_BLOCKS: &str = "FGDB_REPAIR_DISABLE_SPARSE_PAGES";
const ENV_INVALID_INDEX_IS_FATAL: &str = "FGDB_REPAIR_INVALID_INDEX_IS_FATAL";

/// Behavior switches for the repair engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pending remap pairs before [`RemapTable::needs_resync`] reports true.
    ///
    /// [`RemapTable::needs_resync`]: crate::remap::RemapTable::needs_resync
    pub resync_threshold: usize,
    /// Write every 1024-row block of the row-offset table, even all-zero
    /// ones. Some readers cannot handle sparse tables.
    pub disable_sparse_blocks: bool,
    /// Treat an unrepairable index file as a hard resync failure instead of
    /// deleting it and degrading to full scans.
    pub invalid_index_is_fatal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resync_threshold: DEFAULT_RESYNC_THRESHOLD,
            disable_sparse_blocks: false,
            invalid_index_is_fatal: false,
        }
    }
}

impl Config {
    /// Builds a config from the process environment, falling back to the
    /// defaults for unset or unparseable variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(threshold) = env::var(ENV_RESYNC_THRESHOLD)
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
        {
            config.resync_threshold = threshold;
        }
        if let Ok(raw) = env::var(ENV_DISABLE_SPARSE_BLOCKS) {
            config.disable_sparse_blocks = parse_bool(&raw);
        }
        if let Ok(raw) = env::var(ENV_INVALID_INDEX_IS_FATAL) {
            config.invalid_index_is_fatal = parse_bool(&raw);
        }
        config
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_behavior() {
        let config = Config::default();
        assert_eq!(config.resync_threshold, DEFAULT_RESYNC_THRESHOLD);
        assert!(!config.disable_sparse_blocks);
        assert!(!config.invalid_index_is_fatal);
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        for raw in ["1", "true", "YES", " on "] {
            assert!(parse_bool(raw), "{raw:?} should parse as true");
        }
        for raw in ["0", "false", "no", "off", ""] {
            assert!(!parse_bool(raw), "{raw:?} should parse as false");
        }
    }
}
