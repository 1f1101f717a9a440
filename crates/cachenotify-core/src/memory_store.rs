use crate::{
    ChangeEvent, EventStore, OrderNumber, ScanBounds, SequenceId, SourceId, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Event store backed by in-process vectors.
///
/// Rows may be inserted in any order; visibility follows insertion, so a test can
/// commit order number 4 before order number 3 the same way a database would.
#[derive(Default)]
pub struct MemoryEventStore {
    rows: RwLock<HashMap<SourceId, Vec<ChangeEvent>>>,
    failures: Mutex<Vec<StoreError>>,
    calls: AtomicUsize,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: SourceId, event: ChangeEvent) {
        self.rows.write().entry(source).or_default().push(event);
    }

    pub fn extend(&self, source: SourceId, events: impl IntoIterator<Item = ChangeEvent>) {
        self.rows.write().entry(source).or_default().extend(events);
    }

    /// Queues an error to be returned by the next store call.
    pub fn fail_next(&self, error: StoreError) {
        self.failures.lock().push(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.remove(0))
        }
    }

    fn select<F>(&self, source: SourceId, keep: F) -> Vec<ChangeEvent>
    where
        F: Fn(&ChangeEvent) -> bool,
    {
        let rows = self.rows.read();
        let mut selected: Vec<ChangeEvent> = rows
            .get(&source)
            .map(|events| events.iter().filter(|e| keep(e)).cloned().collect())
            .unwrap_or_default();
        sort_by_entity_sequence(&mut selected);
        selected
    }
}

pub(crate) fn sort_by_entity_sequence(rows: &mut [ChangeEvent]) {
    rows.sort_by(|a, b| {
        a.entity
            .cmp(&b.entity)
            .then(a.sequence_id.cmp(&b.sequence_id))
    });
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn fetch_after(
        &self,
        source: SourceId,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        self.enter()?;
        let mut selected = self.select(source, |e| e.sequence_id > after);
        selected.sort_by_key(|e| e.sequence_id);
        selected.truncate(limit);
        Ok(selected)
    }

    async fn scan(
        &self,
        source: SourceId,
        bounds: ScanBounds,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        self.enter()?;
        Ok(self.select(source, |e| bounds.contains(e.observed_at)))
    }

    async fn fetch_orders(
        &self,
        source: SourceId,
        order_numbers: &[OrderNumber],
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        self.enter()?;
        let wanted: HashSet<OrderNumber> = order_numbers.iter().copied().collect();
        Ok(self.select(source, |e| wanted.contains(&e.order_number)))
    }

    async fn latest_sequence_at(
        &self,
        source: SourceId,
        at: DateTime<Utc>,
    ) -> Result<Option<SequenceId>, StoreError> {
        self.enter()?;
        Ok(self
            .select(source, |e| e.observed_at <= at)
            .iter()
            .map(|e| e.sequence_id)
            .max())
    }
}
