// ABOUTME: Status and metrics structures for the notification engine
// ABOUTME: Read-only snapshots of per-source progress for diagnostics

use cachenotify_core::{Checkpoint, CutoffWindow, SourceId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::dedup::DedupSnapshot;
use crate::health::HealthState;

/// Where a source's cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStage {
    Idle,
    Polling,
    Deduping,
    RecoveringGaps,
    Dispatching,
    /// Stopped after a configuration error
    Failed,
    Stopped,
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStage::Idle => write!(f, "Idle"),
            CycleStage::Polling => write!(f, "Polling"),
            CycleStage::Deduping => write!(f, "Deduping"),
            CycleStage::RecoveringGaps => write!(f, "RecoveringGaps"),
            CycleStage::Dispatching => write!(f, "Dispatching"),
            CycleStage::Failed => write!(f, "Failed"),
            CycleStage::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub cycles_committed: u64,
    pub cycles_failed: u64,
    pub events_dispatched: u64,
    pub events_suppressed: u64,
    pub events_filtered: u64,
    pub events_recovered: u64,
    pub orders_abandoned: u64,
    pub last_committed: Option<DateTime<Utc>>,
}

impl CycleMetrics {
    pub fn record_commit(
        &mut self,
        dispatched: u64,
        suppressed: u64,
        filtered: u64,
        recovered: u64,
        at: DateTime<Utc>,
    ) {
        self.cycles_committed += 1;
        self.events_dispatched += dispatched;
        self.events_suppressed += suppressed;
        self.events_filtered += filtered;
        self.events_recovered += recovered;
        self.last_committed = Some(at);
    }

    pub fn record_failure(&mut self) {
        self.cycles_failed += 1;
    }
}

/// Snapshot published by a source task after each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source: SourceId,
    pub stage: CycleStage,
    pub health: HealthState,
    pub checkpoint: Checkpoint,
    pub window: Option<CutoffWindow>,
    pub missing_orders: usize,
    pub dedup: Vec<DedupSnapshot>,
    pub metrics: CycleMetrics,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SourceStatus {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            stage: CycleStage::Idle,
            health: HealthState::Healthy,
            checkpoint: Checkpoint::default(),
            window: None,
            missing_orders: 0,
            dedup: Vec::new(),
            metrics: CycleMetrics::default(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Latest published status per source. Source tasks write, everyone else reads.
pub type StatusBoard = Arc<RwLock<HashMap<SourceId, SourceStatus>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use cachenotify_core::EntityType;

    #[test]
    fn test_cycle_metrics_record_commit() {
        let mut metrics = CycleMetrics::default();
        assert_eq!(metrics.cycles_committed, 0);

        metrics.record_commit(5, 2, 1, 1, Utc::now());
        assert_eq!(metrics.cycles_committed, 1);
        assert_eq!(metrics.events_dispatched, 5);
        assert_eq!(metrics.events_suppressed, 2);
        assert!(metrics.last_committed.is_some());

        metrics.record_failure();
        assert_eq!(metrics.cycles_failed, 1);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(CycleStage::RecoveringGaps.to_string(), "RecoveringGaps");
        assert_eq!(CycleStage::Idle.to_string(), "Idle");
    }

    #[test]
    fn test_status_serializes() {
        let status = SourceStatus::new(SourceId::current(EntityType::Fare));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["stage"], "Idle");
        assert_eq!(json["health"], "Healthy");
    }
}
