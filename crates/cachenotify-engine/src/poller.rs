use cachenotify_core::{
    ChangeEvent, Checkpoint, CutoffWindow, EventStore, PollError, ScanBounds, SequenceId,
    SourceId, StrategyKind,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// How a source's notify table is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStrategy {
    /// Rows with `sequence_id > checkpoint.last_sequence_id`, ordered by id.
    SequenceId,
    /// Per-entity resync point over the whole table up to the cutoff.
    ResyncPoint,
    /// Resync point restricted to the last `hours` hours of rows.
    BoundedScan { hours: u32 },
}

impl PollStrategy {
    pub fn from_kind(kind: StrategyKind, scan_window_hours: u32) -> Self {
        match kind {
            StrategyKind::SequenceId => PollStrategy::SequenceId,
            StrategyKind::ResyncPoint => PollStrategy::ResyncPoint,
            StrategyKind::BoundedScan => PollStrategy::BoundedScan {
                hours: scan_window_hours,
            },
        }
    }
}

/// One page of rows for a cycle.
#[derive(Debug, Clone, Default)]
pub struct PolledPage {
    pub events: Vec<ChangeEvent>,
    /// Highest sequence id consumed, or the checkpoint's when nothing was read.
    pub last_sequence_id: SequenceId,
}

pub struct NotificationPoller {
    store: Arc<dyn EventStore>,
    fetch_limit: Arc<Semaphore>,
    strategy: PollStrategy,
    poll_size: usize,
}

impl NotificationPoller {
    pub fn new(
        store: Arc<dyn EventStore>,
        fetch_limit: Arc<Semaphore>,
        strategy: PollStrategy,
        poll_size: usize,
    ) -> Self {
        Self {
            store,
            fetch_limit,
            strategy,
            poll_size,
        }
    }

    pub fn strategy(&self) -> PollStrategy {
        self.strategy
    }

    /// Highest sequence id at or before `at`; the starting point for a fresh
    /// sequence-id checkpoint.
    pub async fn seed_sequence(
        &self,
        source: SourceId,
        at: DateTime<Utc>,
    ) -> Result<Option<SequenceId>, PollError> {
        let _permit = self
            .fetch_limit
            .acquire()
            .await
            .map_err(|_| PollError::Transient("fetch limiter closed".into()))?;
        Ok(self.store.latest_sequence_at(source, at).await?)
    }

    /// Reads one page. Nothing is mutated, so a failed call can simply be repeated.
    pub async fn poll(
        &self,
        source: SourceId,
        checkpoint: &Checkpoint,
        window: &CutoffWindow,
        now: DateTime<Utc>,
    ) -> Result<PolledPage, PollError> {
        let _permit = self
            .fetch_limit
            .acquire()
            .await
            .map_err(|_| PollError::Transient("fetch limiter closed".into()))?;

        match self.strategy {
            PollStrategy::SequenceId => self.poll_by_sequence(source, checkpoint, window).await,
            PollStrategy::ResyncPoint => {
                let bounds = ScanBounds {
                    from: None,
                    to: window.cutoff,
                };
                self.poll_by_resync_point(source, checkpoint, window, bounds)
                    .await
            }
            PollStrategy::BoundedScan { hours } => {
                let bounds = ScanBounds {
                    from: Some(now - Duration::hours(i64::from(hours))),
                    to: window.cutoff,
                };
                self.poll_by_resync_point(source, checkpoint, window, bounds)
                    .await
            }
        }
    }

    async fn poll_by_sequence(
        &self,
        source: SourceId,
        checkpoint: &Checkpoint,
        window: &CutoffWindow,
    ) -> Result<PolledPage, PollError> {
        let rows = self
            .store
            .fetch_after(source, checkpoint.last_sequence_id, self.poll_size)
            .await?;
        let fetched = rows.len();
        // Rows past the cutoff may still have uncommitted neighbours; stop there and
        // re-read from that row next cycle.
        let events: Vec<ChangeEvent> = rows
            .into_iter()
            .take_while(|e| e.observed_at <= window.cutoff)
            .collect();
        let last_sequence_id = events
            .last()
            .map_or(checkpoint.last_sequence_id, |e| e.sequence_id);
        debug!(
            source = %source,
            fetched,
            kept = events.len(),
            last_sequence_id,
            "sequence poll"
        );
        Ok(PolledPage {
            events,
            last_sequence_id,
        })
    }

    async fn poll_by_resync_point(
        &self,
        source: SourceId,
        checkpoint: &Checkpoint,
        window: &CutoffWindow,
        bounds: ScanBounds,
    ) -> Result<PolledPage, PollError> {
        let rows = self.store.scan(source, bounds).await?;
        let points = resync_points(&rows, checkpoint, window.prior_cutoff);
        trace!(source = %source, ?points, "resync points");
        let events = select_from(rows, &points, self.poll_size);
        let last_sequence_id = events
            .iter()
            .map(|e| e.sequence_id)
            .max()
            .map_or(checkpoint.last_sequence_id, |max| {
                max.max(checkpoint.last_sequence_id)
            });
        debug!(
            source = %source,
            entities = points.len(),
            selected = events.len(),
            "resync poll"
        );
        Ok(PolledPage {
            events,
            last_sequence_id,
        })
    }
}

/// Per entity, the lowest sequence id a cycle must re-read from.
///
/// Candidates are (a) the first row after the last processed order number,
/// (b) the newest row at or before the cutoff and (c) the first row of an entity
/// with nothing at or before `prior_cutoff`. `rows` must already be bounded by the
/// cutoff.
pub fn resync_points(
    rows: &[ChangeEvent],
    checkpoint: &Checkpoint,
    prior_cutoff: DateTime<Utc>,
) -> BTreeMap<String, SequenceId> {
    let mut by_entity: BTreeMap<&str, Vec<&ChangeEvent>> = BTreeMap::new();
    for row in rows {
        by_entity.entry(row.entity.as_str()).or_default().push(row);
    }

    by_entity
        .into_iter()
        .filter_map(|(entity, rows)| {
            let processed = rows
                .iter()
                .filter(|e| checkpoint.was_last_seen(entity, e.order_number))
                .map(|e| e.sequence_id)
                .max();
            let after_processed = processed.and_then(|p| {
                rows.iter()
                    .map(|e| e.sequence_id)
                    .filter(|&id| id > p)
                    .min()
            });
            let newest = rows.iter().map(|e| e.sequence_id).max();
            let first_appearance = if rows.iter().all(|e| e.observed_at > prior_cutoff) {
                rows.iter().map(|e| e.sequence_id).min()
            } else {
                None
            };

            [after_processed, newest, first_appearance]
                .into_iter()
                .flatten()
                .min()
                .map(|point| (entity.to_string(), point))
        })
        .collect()
}

/// Rows at or after their entity's resync point, ordered by `(entity, sequence_id)`.
pub fn select_from(
    rows: Vec<ChangeEvent>,
    points: &BTreeMap<String, SequenceId>,
    limit: usize,
) -> Vec<ChangeEvent> {
    let mut selected: Vec<ChangeEvent> = rows
        .into_iter()
        .filter(|e| {
            points
                .get(&e.entity)
                .is_some_and(|&point| e.sequence_id >= point)
        })
        .collect();
    selected.sort_by(|a, b| {
        a.entity
            .cmp(&b.entity)
            .then(a.sequence_id.cmp(&b.sequence_id))
    });
    selected.truncate(limit);
    selected
}
