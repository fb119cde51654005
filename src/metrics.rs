//! Collection statistics.

use std::time::Duration;

/// Statistics from the most recent collection pass, queryable through
/// [`Heap::last_collect_stats`](crate::Heap::last_collect_stats).
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectStats {
    /// Wall-clock duration of the pass.
    pub duration: Duration,
    /// Allocations reclaimed by the sweep.
    pub storages_reclaimed: usize,
    /// Bytes returned to the memory resource.
    pub bytes_reclaimed: usize,
    /// Allocations surviving the pass.
    pub storages_live: usize,
    /// Bytes still held by surviving allocations.
    pub bytes_live: usize,
}
