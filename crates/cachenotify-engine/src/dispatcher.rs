use cachenotify_core::{
    ChangeAction, ChangeEvent, InvalidationBatch, InvalidationRequest, InvalidationService,
    ServiceError, SourceId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns a cycle's surviving events into one batch and hands it downstream.
pub struct ChangeEventDispatcher {
    service: Arc<dyn InvalidationService>,
}

impl ChangeEventDispatcher {
    pub fn new(service: Arc<dyn InvalidationService>) -> Self {
        Self { service }
    }

    /// Builds the batch for `events`, which must already be in `(entity, sequence_id)` order.
    pub fn dispatch(&self, source: SourceId, events: &[ChangeEvent]) -> InvalidationBatch {
        InvalidationBatch::new(source, build_requests(source, events))
    }

    /// Sends the batch in a single call. Empty batches succeed without a call.
    pub async fn commit(&self, batch: &InvalidationBatch) -> Result<(), ServiceError> {
        if batch.is_empty() {
            debug!(source = %batch.origin(), "empty batch, nothing to send");
            return Ok(());
        }
        self.service.process(batch).await?;
        info!(
            target: "cachenotify::engine",
            source = %batch.origin(),
            batch = %batch.id,
            requests = batch.len(),
            "invalidation batch accepted"
        );
        Ok(())
    }
}

/// One request per business-key record, deduplicated on `(entity, key)`.
///
/// A later record for a key already present overwrites that entry's action and
/// sequence ids, keeping its original position.
pub fn build_requests(source: SourceId, events: &[ChangeEvent]) -> Vec<InvalidationRequest> {
    let mut requests: Vec<InvalidationRequest> = Vec::new();
    let mut positions: HashMap<(String, String), usize> = HashMap::new();

    for event in events {
        for record in event
            .business_key
            .split('\n')
            .map(|r| r.trim().trim_end_matches('^'))
            .filter(|r| !r.is_empty())
        {
            let (action, key) = ChangeAction::split_business_key(record);
            let request = InvalidationRequest {
                entity: event.entity.clone(),
                business_key: key.to_string(),
                action,
                historical: source.historical,
                sequence_id: event.sequence_id,
                order_number: event.order_number,
            };
            let slot = (request.entity.clone(), request.business_key.clone());
            match positions.get(&slot) {
                Some(&idx) => requests[idx] = request,
                None => {
                    positions.insert(slot, requests.len());
                    requests.push(request);
                }
            }
        }
    }
    requests
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cachenotify_core::EntityType;
    use chrono::Utc;
    use parking_lot::Mutex;

    fn event(seq: i64, entity: &str, key: &str) -> ChangeEvent {
        ChangeEvent {
            sequence_id: seq,
            order_number: seq * 10,
            entity: entity.into(),
            observed_at: Utc::now(),
            business_key: key.into(),
        }
    }

    #[derive(Default)]
    struct RecordingService {
        batches: Mutex<Vec<InvalidationBatch>>,
        reject: bool,
    }

    #[async_trait]
    impl InvalidationService for RecordingService {
        async fn process(&self, batch: &InvalidationBatch) -> Result<(), ServiceError> {
            if self.reject {
                return Err(ServiceError("cache offline".into()));
            }
            self.batches.lock().push(batch.clone());
            Ok(())
        }
    }

    #[test]
    fn later_event_supersedes_same_key() {
        let source = SourceId::current(EntityType::Fare);
        let requests = build_requests(
            source,
            &[
                event(1, "FARE", "A|ATP|0001"),
                event(2, "FARE", "A|ATP|0002"),
                event(3, "FARE", "D|ATP|0001"),
            ],
        );
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].business_key, "ATP|0001");
        assert_eq!(requests[0].action, ChangeAction::Remove);
        assert_eq!(requests[0].sequence_id, 3);
        assert_eq!(requests[1].business_key, "ATP|0002");
    }

    #[test]
    fn same_key_on_different_entities_is_kept() {
        let source = SourceId::new(EntityType::Rule, true);
        let requests = build_requests(
            source,
            &[event(1, "RULE", "A|X"), event(2, "RULEAPP", "A|X")],
        );
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.historical));
    }

    #[test]
    fn multi_record_keys_expand() {
        let source = SourceId::current(EntityType::Support);
        let requests = build_requests(source, &[event(1, "NATION", "A|US\nA|CA^")]);
        let keys: Vec<_> = requests.iter().map(|r| r.business_key.as_str()).collect();
        assert_eq!(keys, vec!["US", "CA"]);
    }

    #[tokio::test]
    async fn commit_calls_service_once_per_batch() {
        let service = Arc::new(RecordingService::default());
        let dispatcher = ChangeEventDispatcher::new(service.clone());
        let source = SourceId::current(EntityType::Fare);

        let empty = dispatcher.dispatch(source, &[]);
        dispatcher.commit(&empty).await.unwrap();
        assert!(service.batches.lock().is_empty());

        let batch = dispatcher.dispatch(source, &[event(1, "FARE", "A|K1"), event(2, "FARE", "A|K2")]);
        dispatcher.commit(&batch).await.unwrap();
        let sent = service.batches.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].requests.len(), 2);
    }

    #[tokio::test]
    async fn rejected_commit_is_an_error() {
        let service = Arc::new(RecordingService {
            reject: true,
            ..Default::default()
        });
        let dispatcher = ChangeEventDispatcher::new(service);
        let batch = dispatcher.dispatch(
            SourceId::current(EntityType::Fare),
            &[event(1, "FARE", "A|K1")],
        );
        assert!(dispatcher.commit(&batch).await.is_err());
    }
}
