use crate::memory_store::sort_by_entity_sequence;
use crate::{
    ChangeEvent, EventStore, OrderNumber, ScanBounds, SequenceId, SourceId, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads one `<TableName>.jsonl` file per source, one [`ChangeEvent`] per line.
///
/// Files are re-read on every call so rows appended by another process become
/// visible on the next poll. Line order is commit order.
pub struct JsonlEventStore {
    dir: PathBuf,
}

impl JsonlEventStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, source: SourceId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", source.table_name()))
    }

    async fn load(&self, source: SourceId) -> Result<Vec<ChangeEvent>, StoreError> {
        let path = self.path_for(source);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no notify file, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "reading {}: {e}",
                    path.display()
                )))
            }
        };
        parse_lines(&path, &text)
    }
}

fn parse_lines(path: &Path, text: &str) -> Result<Vec<ChangeEvent>, StoreError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<ChangeEvent>(line).map_err(|e| {
                StoreError::Query(format!("{}:{}: {e}", path.display(), idx + 1))
            })
        })
        .collect()
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn fetch_after(
        &self,
        source: SourceId,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let mut rows: Vec<_> = self
            .load(source)
            .await?
            .into_iter()
            .filter(|e| e.sequence_id > after)
            .collect();
        rows.sort_by_key(|e| e.sequence_id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn scan(
        &self,
        source: SourceId,
        bounds: ScanBounds,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let mut rows: Vec<_> = self
            .load(source)
            .await?
            .into_iter()
            .filter(|e| bounds.contains(e.observed_at))
            .collect();
        sort_by_entity_sequence(&mut rows);
        Ok(rows)
    }

    async fn fetch_orders(
        &self,
        source: SourceId,
        order_numbers: &[OrderNumber],
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let wanted: HashSet<OrderNumber> = order_numbers.iter().copied().collect();
        let mut rows: Vec<_> = self
            .load(source)
            .await?
            .into_iter()
            .filter(|e| wanted.contains(&e.order_number))
            .collect();
        sort_by_entity_sequence(&mut rows);
        Ok(rows)
    }

    async fn latest_sequence_at(
        &self,
        source: SourceId,
        at: DateTime<Utc>,
    ) -> Result<Option<SequenceId>, StoreError> {
        Ok(self
            .load(source)
            .await?
            .iter()
            .filter(|e| e.observed_at <= at)
            .map(|e| e.sequence_id)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityType;
    use std::fs;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn line(seq: i64, order: i64, entity: &str) -> String {
        serde_json::to_string(&ChangeEvent {
            sequence_id: seq,
            order_number: order,
            entity: entity.into(),
            observed_at: Utc::now() - chrono::Duration::minutes(1),
            business_key: format!("A|{order}"),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn reads_rows_from_table_file() {
        let dir = TempDir::new().unwrap();
        let store = JsonlEventStore::new(dir.path());
        let source = SourceId::current(EntityType::Routing);
        fs::write(
            store.path_for(source),
            format!("{}\n\n{}\n", line(2, 20, "B"), line(1, 10, "A")),
        )
        .unwrap();

        let rows = assert_ok!(
            store
                .scan(source, ScanBounds { from: None, to: Utc::now() })
                .await
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entity, "A");

        let orders = assert_ok!(store.fetch_orders(source, &[20]).await);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].sequence_id, 2);
    }

    #[tokio::test]
    async fn missing_file_is_empty_and_bad_line_is_query_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonlEventStore::new(dir.path());
        let source = SourceId::current(EntityType::Intl);
        assert!(assert_ok!(store.fetch_after(source, 0, 10).await).is_empty());

        fs::write(store.path_for(source), "{not json}\n").unwrap();
        match store.fetch_after(source, 0, 10).await {
            Err(StoreError::Query(msg)) => assert!(msg.contains(":1:")),
            other => panic!("expected query error, got {other:?}"),
        }
    }
}
