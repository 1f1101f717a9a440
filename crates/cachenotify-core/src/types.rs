use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

pub type SequenceId = i64;
pub type OrderNumber = i64;

/// Category of change source. Each one is polled from its own notify table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Fare,
    Routing,
    Rule,
    Support,
    Intl,
    Merchandising,
    Historical,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::Fare,
        EntityType::Routing,
        EntityType::Rule,
        EntityType::Support,
        EntityType::Intl,
        EntityType::Merchandising,
        EntityType::Historical,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            EntityType::Fare => "Fare",
            EntityType::Routing => "Routing",
            EntityType::Rule => "Rule",
            EntityType::Support => "Support",
            EntityType::Intl => "Intl",
            EntityType::Merchandising => "Merch",
            EntityType::Historical => "Hist",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            EntityType::Fare => "FareCacheNotify",
            EntityType::Routing => "RoutingCacheNotify",
            EntityType::Rule => "RuleCacheNotify",
            EntityType::Support => "SupportCacheNotify",
            EntityType::Intl => "IntlCacheNotify",
            EntityType::Merchandising => "MerchandisingCacheNotify",
            EntityType::Historical => "CacheNotifyHistorical",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One polled source: an entity type plus its current/historical variant.
///
/// Checkpoints, dedup windows and missing-order sets are all keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    pub entity_type: EntityType,
    pub historical: bool,
}

impl SourceId {
    pub fn new(entity_type: EntityType, historical: bool) -> Self {
        Self {
            entity_type,
            historical: historical || entity_type == EntityType::Historical,
        }
    }

    pub fn current(entity_type: EntityType) -> Self {
        Self::new(entity_type, false)
    }

    pub fn label(&self) -> String {
        if self.historical && self.entity_type != EntityType::Historical {
            format!("{}Hist", self.entity_type.label())
        } else {
            self.entity_type.label().to_string()
        }
    }

    pub fn table_name(&self) -> String {
        if self.historical && self.entity_type != EntityType::Historical {
            format!("{}Historical", self.entity_type.table_name())
        } else {
            self.entity_type.table_name().to_string()
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// A row read from a notify table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Monotonic per-table row id.
    pub sequence_id: SequenceId,
    /// Business sequence number; may become visible out of commit order.
    pub order_number: OrderNumber,
    /// Sub-entity name within the table (for example `FARE` or `MARKETS`).
    pub entity: String,
    pub observed_at: DateTime<Utc>,
    pub business_key: String,
}

/// What the downstream cache should do with a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Invalidate,
    Remove,
    Clear,
}

impl ChangeAction {
    fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "A" | "a" | "C" | "c" => Some(ChangeAction::Invalidate),
            "D" | "d" => Some(ChangeAction::Remove),
            "F" | "f" => Some(ChangeAction::Clear),
            _ => None,
        }
    }

    /// Splits one business-key record into its action code and the key proper.
    ///
    /// Records look like `A|ATP|0001`; a record without a one-letter code is an
    /// invalidation of the whole string.
    pub fn split_business_key(record: &str) -> (ChangeAction, &str) {
        let record = record.trim();
        match record.split_once('|') {
            Some((code, key)) => match Self::from_code(code) {
                Some(action) => (action, key),
                None => (ChangeAction::Invalidate, record),
            },
            None => match Self::from_code(record) {
                Some(action) => (action, ""),
                None => (ChangeAction::Invalidate, record),
            },
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Invalidate => write!(f, "invalidate"),
            ChangeAction::Remove => write!(f, "remove"),
            ChangeAction::Clear => write!(f, "clear"),
        }
    }
}

/// Per-source progress marker, advanced only after a committed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_sequence_id: SequenceId,
    /// Order numbers delivered by the latest committed poll, per entity.
    #[serde(default)]
    pub last_order_numbers_seen: BTreeMap<String, BTreeSet<OrderNumber>>,
}

impl Checkpoint {
    pub fn starting_at(last_sequence_id: SequenceId) -> Self {
        Self {
            last_sequence_id,
            last_order_numbers_seen: BTreeMap::new(),
        }
    }

    pub fn was_last_seen(&self, entity: &str, order_number: OrderNumber) -> bool {
        self.last_order_numbers_seen
            .get(entity)
            .is_some_and(|seen| seen.contains(&order_number))
    }

    pub fn all_last_seen(&self) -> BTreeSet<OrderNumber> {
        self.last_order_numbers_seen
            .values()
            .flat_map(|seen| seen.iter().copied())
            .collect()
    }
}

/// Time bound applied to one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutoffWindow {
    pub prior_cutoff: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    #[serde(with = "delay_secs")]
    pub processing_delay: Duration,
}

mod delay_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(d)?))
    }
}

/// One key the cache boundary must act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRequest {
    pub entity: String,
    pub business_key: String,
    pub action: ChangeAction,
    pub historical: bool,
    pub sequence_id: SequenceId,
    pub order_number: OrderNumber,
}

/// Deduplicated, ordered work for one cycle of one source.
///
/// Scheduled whole-cache flushes carry no source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationBatch {
    pub id: Uuid,
    pub source: Option<SourceId>,
    pub requests: Vec<InvalidationRequest>,
    pub created_at: DateTime<Utc>,
}

impl InvalidationBatch {
    pub fn new(source: SourceId, requests: Vec<InvalidationRequest>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: Some(source),
            requests,
            created_at: Utc::now(),
        }
    }

    /// One `Clear` request per cache id.
    pub fn flush<I, S>(cache_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requests = cache_ids
            .into_iter()
            .map(|cache| InvalidationRequest {
                entity: cache.into(),
                business_key: String::new(),
                action: ChangeAction::Clear,
                historical: false,
                sequence_id: 0,
                order_number: 0,
            })
            .collect();
        Self {
            id: Uuid::new_v4(),
            source: None,
            requests,
            created_at: Utc::now(),
        }
    }

    /// Source label, or `flush` for scheduled clears.
    pub fn origin(&self) -> String {
        self.source
            .map_or_else(|| "flush".to_string(), |source| source.label())
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
