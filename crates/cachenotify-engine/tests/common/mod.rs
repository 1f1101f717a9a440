#![allow(dead_code)]

use async_trait::async_trait;
use cachenotify_core::{
    ChangeEvent, ControlError, ControlFilter, EngineConfig, EntityType, Heartbeat,
    InvalidationBatch, InvalidationService, LivenessSink, MemoryEventStore, OrderNumber,
    SequenceId, ServiceError, SourceConfig, SourceId, StrategyKind,
};
use cachenotify_engine::{Collaborators, SourceWorker, StatusBoard};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub fn fare() -> SourceId {
    SourceId::current(EntityType::Fare)
}

pub fn rule() -> SourceId {
    SourceId::current(EntityType::Rule)
}

pub fn row(seq: SequenceId, order: OrderNumber, entity: &str, at: DateTime<Utc>) -> ChangeEvent {
    ChangeEvent {
        sequence_id: seq,
        order_number: order,
        entity: entity.to_string(),
        observed_at: at,
        business_key: format!("A|{entity}|{order}"),
    }
}

/// Zero processing delay, no files, only the given sources enabled.
pub fn config(strategy: StrategyKind, sources: &[SourceId]) -> EngineConfig {
    let mut config = EngineConfig::default().with_processing_delay(std::time::Duration::ZERO);
    config.poll.strategy = strategy;
    config.sources = sources
        .iter()
        .map(|s| SourceConfig {
            entity_type: s.entity_type,
            historical: s.historical,
            enabled: true,
            strategy: None,
        })
        .collect();
    config.liveness.alive_file = None;
    config.recovery.report_file = None;
    config
}

pub fn worker(
    source: SourceId,
    config: &EngineConfig,
    deps: Collaborators,
    started_at: DateTime<Utc>,
) -> SourceWorker {
    let source_config = config
        .sources
        .iter()
        .find(|s| s.source_id() == source)
        .cloned()
        .expect("source configured");
    SourceWorker::new(
        &source_config,
        config,
        deps,
        Arc::new(Semaphore::new(config.poll.max_concurrent_fetches)),
        StatusBoard::default(),
        started_at,
    )
    .expect("worker builds")
}

pub fn minutes(t0: DateTime<Utc>, n: i64) -> DateTime<Utc> {
    t0 + Duration::minutes(n)
}

/// Records every batch it is offered, including the ones it rejects.
#[derive(Default)]
pub struct RecordingService {
    pub offered: Mutex<Vec<InvalidationBatch>>,
    pub accepted: Mutex<Vec<InvalidationBatch>>,
    reject_next: AtomicUsize,
}

impl RecordingService {
    pub fn reject_next(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    pub fn accepted_for(&self, source: SourceId) -> Vec<InvalidationBatch> {
        self.accepted
            .lock()
            .iter()
            .filter(|b| b.source == Some(source))
            .cloned()
            .collect()
    }

    /// Order numbers in accepted batches, in delivery order, duplicates kept.
    pub fn delivered_orders(&self, source: SourceId) -> Vec<OrderNumber> {
        self.accepted_for(source)
            .iter()
            .flat_map(|b| b.requests.iter().map(|r| r.order_number))
            .collect()
    }
}

#[async_trait]
impl InvalidationService for RecordingService {
    async fn process(&self, batch: &InvalidationBatch) -> Result<(), ServiceError> {
        self.offered.lock().push(batch.clone());
        let pending = self.reject_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.reject_next.store(pending - 1, Ordering::SeqCst);
            return Err(ServiceError("cache unavailable".into()));
        }
        self.accepted.lock().push(batch.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLiveness {
    pub beats: Mutex<Vec<Heartbeat>>,
}

impl LivenessSink for RecordingLiveness {
    fn heartbeat(&self, beat: &Heartbeat) {
        self.beats.lock().push(beat.clone());
    }
}

/// Allow-list that keeps only the named entities, or fails every lookup.
pub struct StaticControl {
    pub allowed: Option<HashSet<String>>,
}

impl ControlFilter for StaticControl {
    fn in_use(&self, entity: &str) -> Result<bool, ControlError> {
        match &self.allowed {
            Some(allowed) => Ok(allowed.contains(entity)),
            None => Err(ControlError("control file missing".into())),
        }
    }
}

pub fn deps(store: &Arc<MemoryEventStore>, service: &Arc<RecordingService>) -> Collaborators {
    Collaborators::new(store.clone(), service.clone())
}
