use cachenotify_core::{FlushConfig, InvalidationBatch};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

/// Next due time for each cache that is cleared wholesale on a timer.
#[derive(Debug, Clone, Default)]
pub struct FlushSchedule {
    entries: BTreeMap<String, (Duration, DateTime<Utc>)>,
}

impl FlushSchedule {
    /// First clear for each cache is one interval after `now`.
    pub fn new(config: &FlushConfig, now: DateTime<Utc>) -> Self {
        let entries = config
            .intervals
            .iter()
            .filter(|(_, &secs)| secs > 0)
            .map(|(cache, &secs)| {
                let interval = Duration::seconds(i64::from(u32::try_from(secs).unwrap_or(u32::MAX)));
                (cache.clone(), (interval, now + interval))
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|(_, due)| *due).min()
    }

    /// Cache ids due at `now`, each rescheduled one interval after `now`.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for (cache, (interval, next)) in self.entries.iter_mut() {
            if *next <= now {
                *next = now + *interval;
                due.push(cache.clone());
            }
        }
        due
    }

    /// `Clear` batch for every due cache, or `None` when nothing is due.
    pub fn due_batch(&mut self, now: DateTime<Utc>) -> Option<InvalidationBatch> {
        let due = self.due(now);
        (!due.is_empty()).then(|| InvalidationBatch::flush(due))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn schedule(now: DateTime<Utc>) -> FlushSchedule {
        let intervals: HashMap<String, u64> =
            [("FareCache".to_string(), 60), ("RuleCache".to_string(), 300)].into();
        FlushSchedule::new(&FlushConfig { intervals }, now)
    }

    #[test]
    fn caches_fall_due_on_their_own_interval() {
        let start = Utc::now();
        let mut flush = schedule(start);
        assert_eq!(flush.next_due(), Some(start + Duration::seconds(60)));
        assert!(flush.due(start + Duration::seconds(30)).is_empty());

        assert_eq!(flush.due(start + Duration::seconds(60)), vec!["FareCache"]);
        assert!(flush.due(start + Duration::seconds(90)).is_empty());

        let mut later = flush.due(start + Duration::seconds(300));
        later.sort();
        assert_eq!(later, vec!["FareCache", "RuleCache"]);
    }

    #[test]
    fn due_batch_holds_one_clear_per_cache() {
        let start = Utc::now();
        let mut flush = schedule(start);
        assert!(flush.due_batch(start).is_none());

        let batch = flush.due_batch(start + Duration::hours(1)).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.source.is_none());
    }

    #[test]
    fn empty_config_never_fires() {
        let mut flush = FlushSchedule::new(&FlushConfig::default(), Utc::now());
        assert!(flush.is_empty());
        assert!(flush.next_due().is_none());
        assert!(flush.due_batch(Utc::now() + Duration::days(1)).is_none());
    }
}
