//! Mount-time options. Plain struct with `Default`, the way the
//! teacher's `main.rs` builds a `clap`-derived `Params` and passes it
//! straight into `btrfs::dump`.

use crate::error::ErrorMode;

#[derive(Debug, Clone)]
pub struct Options {
    /// Policy applied when a runtime `Inconsistent` error is hit.
    pub error_mode: ErrorMode,
    /// Number of sibling nodes to read ahead when descending interior
    /// nodes on an active filesystem (§4.D.4).
    pub prefetch_active: usize,
    /// Same, but during journal replay / recovery.
    pub prefetch_recovery: usize,
    /// Maximum number of nodes held in the node cache (§4.D.1).
    pub node_cache_capacity: usize,
    /// Maximum number of commit retries before a restart is surfaced
    /// to the caller instead of retried internally (§7).
    pub max_commit_retries: usize,
    /// Refuse all writes; reads still work. Set automatically when
    /// `error_mode` downgrades the fs.
    pub read_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            error_mode: ErrorMode::Continue,
            prefetch_active: 2,
            prefetch_recovery: 16,
            node_cache_capacity: 4096,
            max_commit_retries: 32,
            read_only: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let o = Options::default();
        assert_eq!(o.prefetch_active, 2);
        assert_eq!(o.prefetch_recovery, 16);
        assert!(!o.read_only);
    }
}
