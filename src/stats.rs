//! Process-wide transfer counters.
//!
//! One global set of atomics plus an optional per-file table sized at
//! session start. Pipeline stages bump these as blocks move through.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock, RwLock};

#[derive(Debug, Default)]
pub struct Stats {
    /// Bytes read from / written to disk. Includes block padding on the
    /// receive side.
    pub disk_byte_count: AtomicU64,

    /// Payload bytes moved over the network. Includes block padding on the
    /// transmit side.
    pub net_byte_count: AtomicU64,

    /// Total announced size of the files in the transfer.
    pub file_byte_count: AtomicU64,

    /// Blocks pushed into a pipeline queue.
    pub queued_block_count: AtomicU64,

    /// Blocks drained from a pipeline queue.
    pub dequeued_block_count: AtomicU64,
}

#[derive(Default)]
struct StatsManager {
    file_stats: RwLock<Vec<Arc<Stats>>>,
}

fn manager() -> &'static StatsManager {
    static MANAGER: OnceLock<StatsManager> = OnceLock::new();
    MANAGER.get_or_init(StatsManager::default)
}

/// Global counters for this process.
pub fn stats() -> &'static Stats {
    static GLOBAL: Stats = Stats {
        disk_byte_count: AtomicU64::new(0),
        net_byte_count: AtomicU64::new(0),
        file_byte_count: AtomicU64::new(0),
        queued_block_count: AtomicU64::new(0),
        dequeued_block_count: AtomicU64::new(0),
    };
    &GLOBAL
}

/// Size the per-file table for a transfer of `count` files.
///
/// File ids are 1-based; slot 0 is allocated but unused.
pub fn reallocate_file_stats(count: usize) {
    let mut table = manager().file_stats.write().unwrap();
    *table = (0..=count).map(|_| Arc::new(Stats::default())).collect();
}

/// Counters for a single file id, if the table covers it.
pub fn file_stats(id: u16) -> Option<Arc<Stats>> {
    let table = manager().file_stats.read().unwrap();
    table.get(id as usize).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_file_stats_table() {
        reallocate_file_stats(3);

        assert!(file_stats(0).is_some());
        assert!(file_stats(3).is_some());
        assert!(file_stats(4).is_none());

        let s = file_stats(2).unwrap();
        s.net_byte_count.fetch_add(4096, Ordering::Relaxed);
        assert_eq!(
            file_stats(2).unwrap().net_byte_count.load(Ordering::Relaxed),
            4096
        );
    }
}
