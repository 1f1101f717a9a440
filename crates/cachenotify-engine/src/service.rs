use async_trait::async_trait;
use cachenotify_core::{ChangeAction, InvalidationBatch, InvalidationService, ServiceError};
use tracing::{debug, info};

/// Invalidation service that only logs what a cache would do. Used for local runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInvalidationService;

#[async_trait]
impl InvalidationService for LoggingInvalidationService {
    async fn process(&self, batch: &InvalidationBatch) -> Result<(), ServiceError> {
        for request in &batch.requests {
            match request.action {
                ChangeAction::Invalidate => debug!(
                    "Cache invalidation: {} key '{}' (order {})",
                    request.entity, request.business_key, request.order_number
                ),
                ChangeAction::Remove => debug!(
                    "Cache removal: {} key '{}' (order {})",
                    request.entity, request.business_key, request.order_number
                ),
                ChangeAction::Clear => info!("Cache clear: {}", request.entity),
            }
        }
        info!(
            "Processed batch {} from {} with {} requests",
            batch.id,
            batch.origin(),
            batch.len()
        );
        Ok(())
    }
}
