use cachenotify_core::{
    ChangeEvent, EventStore, OrderNumber, PollError, RecoveryConfig, SourceId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingOrder {
    pub order_number: OrderNumber,
    pub attempts: u32,
    pub first_detected: DateTime<Utc>,
}

/// Order numbers known to exist for a source but not yet delivered.
#[derive(Debug, Clone, Default)]
pub struct MissingOrderSet {
    entries: BTreeMap<OrderNumber, MissingOrder>,
    high_water: Option<OrderNumber>,
}

impl MissingOrderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, order_number: OrderNumber) -> bool {
        self.entries.contains_key(&order_number)
    }

    pub fn order_numbers(&self) -> BTreeSet<OrderNumber> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MissingOrder> {
        self.entries.values()
    }

    /// Highest order number ever observed for the source.
    pub fn high_water(&self) -> Option<OrderNumber> {
        self.high_water
    }

    pub fn insert(&mut self, order_number: OrderNumber, detected_at: DateTime<Utc>) {
        self.entries
            .entry(order_number)
            .or_insert_with(|| MissingOrder {
                order_number,
                attempts: 0,
                first_detected: detected_at,
            });
    }

    pub fn resolve(&mut self, order_number: OrderNumber) -> bool {
        self.entries.remove(&order_number).is_some()
    }

    pub fn record_attempt(&mut self, order_number: OrderNumber) {
        if let Some(entry) = self.entries.get_mut(&order_number) {
            entry.attempts += 1;
        }
    }

    pub fn raise_high_water(&mut self, order_number: OrderNumber) {
        self.high_water = Some(self.high_water.map_or(order_number, |h| h.max(order_number)));
    }

    /// Removes and returns every entry that has used up its attempts.
    pub fn take_exhausted(&mut self, max_retries: u32) -> Vec<MissingOrder> {
        let exhausted: Vec<OrderNumber> = self
            .entries
            .values()
            .filter(|e| e.attempts >= max_retries)
            .map(|e| e.order_number)
            .collect();
        exhausted
            .into_iter()
            .filter_map(|n| self.entries.remove(&n))
            .collect()
    }
}

/// Result of comparing one cycle's observed order numbers with the high-water mark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapScan {
    pub gaps: Vec<OrderNumber>,
    /// Inclusive ranges too wide to track one number at a time.
    pub oversized: Vec<(OrderNumber, OrderNumber)>,
    pub high_water: Option<OrderNumber>,
}

pub struct MissingOrderRecovery {
    store: Arc<dyn EventStore>,
    fetch_limit: Arc<Semaphore>,
    config: RecoveryConfig,
}

impl MissingOrderRecovery {
    pub fn new(
        store: Arc<dyn EventStore>,
        fetch_limit: Arc<Semaphore>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            fetch_limit,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Order numbers between the high-water mark and the newest observed number
    /// that were not observed and are not already tracked.
    pub fn find_gaps(
        &self,
        missing: &MissingOrderSet,
        observed: &BTreeSet<OrderNumber>,
    ) -> GapScan {
        let Some(&newest) = observed.last() else {
            return GapScan {
                high_water: missing.high_water(),
                ..Default::default()
            };
        };
        let mut scan = GapScan {
            high_water: Some(missing.high_water().map_or(newest, |h| h.max(newest))),
            ..Default::default()
        };

        let mut previous = match (missing.high_water(), observed.first()) {
            (Some(high), _) => high,
            (None, Some(&first)) => first,
            (None, None) => return scan,
        };
        for &n in observed.range(previous + 1..) {
            if n > previous + 1 {
                let (from, to) = (previous + 1, n - 1);
                let width = u64::try_from(to - from + 1).unwrap_or(u64::MAX);
                if width > self.config.max_gap_span {
                    scan.oversized.push((from, to));
                } else {
                    scan.gaps
                        .extend((from..=to).filter(|&gap| !missing.contains(gap)));
                }
            }
            previous = n;
        }
        scan
    }

    /// Numbers to look up this cycle: fewest attempts first, at most
    /// `block_size * max_blocks`.
    pub fn refetch_candidates(&self, missing: &MissingOrderSet) -> Vec<OrderNumber> {
        let mut entries: Vec<&MissingOrder> = missing.iter().collect();
        entries.sort_by_key(|e| (e.attempts, e.order_number));
        entries
            .into_iter()
            .take(self.config.block_size * self.config.max_blocks)
            .map(|e| e.order_number)
            .collect()
    }

    /// Looks up exact order numbers in blocks of `block_size`.
    pub async fn refetch(
        &self,
        source: SourceId,
        order_numbers: &[OrderNumber],
    ) -> Result<Vec<ChangeEvent>, PollError> {
        let mut found = Vec::new();
        for block in order_numbers.chunks(self.config.block_size.max(1)) {
            let _permit = self
                .fetch_limit
                .acquire()
                .await
                .map_err(|_| PollError::Transient("fetch limiter closed".into()))?;
            let rows = self.store.fetch_orders(source, block).await?;
            debug!(
                source = %source,
                requested = block.len(),
                found = rows.len(),
                "missing order lookup"
            );
            found.extend(rows);
        }
        Ok(found)
    }
}
