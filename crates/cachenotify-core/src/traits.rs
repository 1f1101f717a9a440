use crate::{
    ChangeEvent, Checkpoint, CheckpointError, ControlError, CutoffWindow, InvalidationBatch,
    OrderNumber, SequenceId, ServiceError, SourceId, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time range for a notify table scan. `from` is open-ended when `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanBounds {
    pub from: Option<DateTime<Utc>>,
    pub to: DateTime<Utc>,
}

impl ScanBounds {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at <= self.to && self.from.map_or(true, |from| at >= from)
    }
}

/// Query boundary over the notify tables.
///
/// `scan` and `fetch_orders` must return rows ordered by `(entity, sequence_id)`;
/// `fetch_after` orders by `sequence_id` alone.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn fetch_after(
        &self,
        source: SourceId,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, StoreError>;

    async fn scan(
        &self,
        source: SourceId,
        bounds: ScanBounds,
    ) -> Result<Vec<ChangeEvent>, StoreError>;

    async fn fetch_orders(
        &self,
        source: SourceId,
        order_numbers: &[OrderNumber],
    ) -> Result<Vec<ChangeEvent>, StoreError>;

    /// Highest sequence id observed at or before `at`, if any.
    async fn latest_sequence_at(
        &self,
        source: SourceId,
        at: DateTime<Utc>,
    ) -> Result<Option<SequenceId>, StoreError>;
}

/// Downstream cache boundary. Must tolerate redelivery of the same batch.
#[async_trait]
pub trait InvalidationService: Send + Sync {
    async fn process(&self, batch: &InvalidationBatch) -> Result<(), ServiceError>;
}

/// Allow-list of entities that some cache still consumes.
pub trait ControlFilter: Send + Sync {
    fn in_use(&self, entity: &str) -> Result<bool, ControlError>;
}

/// Filter that keeps every entity.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ControlFilter for AllowAll {
    fn in_use(&self, _entity: &str) -> Result<bool, ControlError> {
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub source: SourceId,
    pub at: DateTime<Utc>,
    pub degraded: bool,
    pub consecutive_failures: u32,
}

pub trait LivenessSink: Send + Sync {
    fn heartbeat(&self, beat: &Heartbeat);
}

/// State written after every committed cycle so a restart can resume from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCheckpoint {
    pub source: SourceId,
    pub checkpoint: Checkpoint,
    pub window: CutoffWindow,
    pub saved_at: DateTime<Utc>,
}

pub trait CheckpointStore: Send + Sync {
    fn load(&self, source: SourceId) -> Result<Option<PersistedCheckpoint>, CheckpointError>;
    fn save(&self, persisted: &PersistedCheckpoint) -> Result<(), CheckpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn scan_bounds_respect_open_start() {
        let now = Utc::now();
        let unbounded = ScanBounds {
            from: None,
            to: now,
        };
        assert!(unbounded.contains(now - Duration::days(365)));
        assert!(!unbounded.contains(now + Duration::seconds(1)));

        let bounded = ScanBounds {
            from: Some(now - Duration::hours(1)),
            to: now,
        };
        assert!(bounded.contains(now - Duration::minutes(59)));
        assert!(!bounded.contains(now - Duration::hours(2)));
    }

    #[test]
    fn allow_all_keeps_everything() {
        assert_eq!(AllowAll.in_use("ANYTHING"), Ok(true));
    }
}
