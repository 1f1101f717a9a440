use cachenotify_core::{DedupConfig, OrderNumber};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Ring of per-table buckets holding order numbers processed in recent cycles.
#[derive(Debug, Clone)]
struct TableRing {
    buckets: Vec<HashSet<OrderNumber>>,
    current: usize,
    flush_every: u32,
    ticks: u32,
}

impl TableRing {
    fn new(bucket_count: usize, flush_every: u32) -> Self {
        Self {
            buckets: vec![HashSet::new(); bucket_count],
            current: 0,
            flush_every: flush_every.max(1),
            ticks: 0,
        }
    }

    fn seen(&self, order_number: OrderNumber) -> bool {
        self.buckets.iter().any(|b| b.contains(&order_number))
    }

    fn rotate(&mut self) {
        self.current = (self.current + 1) % self.buckets.len();
        self.buckets[self.current].clear();
        self.ticks = 0;
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(HashSet::len).sum()
    }
}

/// Bounded suppression window for re-read change rows.
///
/// An order number recorded for a table stays suppressed until its bucket has been
/// rotated out, which takes `bucket_count - 1` to `bucket_count` flush intervals.
#[derive(Debug, Clone)]
pub struct IntervalDedupWindow {
    config: DedupConfig,
    tables: HashMap<String, TableRing>,
}

/// Read-only view of one table's ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupSnapshot {
    pub table: String,
    pub current_bucket: usize,
    pub bucket_sizes: Vec<usize>,
    pub flush_interval_cycles: u32,
}

impl IntervalDedupWindow {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            tables: HashMap::new(),
        }
    }

    fn ring_mut(&mut self, table: &str) -> &mut TableRing {
        let bucket_count = self.config.bucket_count.max(2);
        let flush_every = self.config.flush_interval_for(table);
        self.tables
            .entry(table.to_string())
            .or_insert_with(|| TableRing::new(bucket_count, flush_every))
    }

    pub fn seen(&self, table: &str, order_number: OrderNumber) -> bool {
        self.tables
            .get(table)
            .is_some_and(|ring| ring.seen(order_number))
    }

    pub fn record(&mut self, table: &str, order_number: OrderNumber) {
        let ring = self.ring_mut(table);
        let current = ring.current;
        ring.buckets[current].insert(order_number);
    }

    /// Drops the oldest bucket for `table` and makes it current.
    pub fn rotate(&mut self, table: &str) {
        self.ring_mut(table).rotate();
    }

    /// Counts one finished cycle; rotates when the table's flush interval elapses.
    /// Returns whether a rotation happened.
    pub fn tick(&mut self, table: &str) -> bool {
        let ring = self.ring_mut(table);
        ring.ticks += 1;
        if ring.ticks >= ring.flush_every {
            ring.rotate();
            true
        } else {
            false
        }
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, TableRing::len)
    }

    pub fn snapshot(&self) -> Vec<DedupSnapshot> {
        let mut snapshots: Vec<_> = self
            .tables
            .iter()
            .map(|(table, ring)| DedupSnapshot {
                table: table.clone(),
                current_bucket: ring.current,
                bucket_sizes: ring.buckets.iter().map(HashSet::len).collect(),
                flush_interval_cycles: ring.flush_every,
            })
            .collect();
        snapshots.sort_by(|a, b| a.table.cmp(&b.table));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(bucket_count: usize, flush: u32) -> IntervalDedupWindow {
        IntervalDedupWindow::new(DedupConfig {
            bucket_count,
            flush_interval_cycles: flush,
            table_flush_intervals: HashMap::new(),
        })
    }

    #[test]
    fn recorded_number_is_seen_until_rotated_out() {
        let mut dedup = window(2, 1);
        dedup.record("Fare", 5);
        assert!(dedup.seen("Fare", 5));

        // End of cycle 1: the other bucket becomes current, 5 is still live.
        assert!(dedup.tick("Fare"));
        assert!(dedup.seen("Fare", 5));

        // End of cycle 2: the bucket holding 5 is reused and cleared.
        assert!(dedup.tick("Fare"));
        assert!(!dedup.seen("Fare", 5));
    }

    #[test]
    fn tables_are_independent() {
        let mut dedup = window(3, 1);
        dedup.record("Fare", 7);
        assert!(!dedup.seen("Rule", 7));
        dedup.rotate("Rule");
        dedup.rotate("Rule");
        dedup.rotate("Rule");
        assert!(dedup.seen("Fare", 7));
    }

    #[test]
    fn flush_interval_delays_rotation() {
        let mut dedup = window(2, 3);
        dedup.record("Fare", 1);
        assert!(!dedup.tick("Fare"));
        assert!(!dedup.tick("Fare"));
        assert!(dedup.tick("Fare"));
        assert!(dedup.seen("Fare", 1));
        for _ in 0..3 {
            dedup.tick("Fare");
        }
        assert!(!dedup.seen("Fare", 1));
    }

    #[test]
    fn per_table_override_applies() {
        let mut config = DedupConfig::default();
        config.bucket_count = 2;
        config.table_flush_intervals.insert("Rule".into(), 2);
        let mut dedup = IntervalDedupWindow::new(config);
        assert!(dedup.tick("Fare"));
        assert!(!dedup.tick("Rule"));
        assert!(dedup.tick("Rule"));
    }

    #[test]
    fn memory_is_bounded_by_bucket_count() {
        let mut dedup = window(4, 1);
        for cycle in 0..100 {
            for n in 0..10 {
                dedup.record("Fare", cycle * 10 + n);
            }
            dedup.tick("Fare");
        }
        assert!(dedup.len("Fare") <= 30);

        let snapshot = dedup.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].bucket_sizes.len(), 4);
    }
}
