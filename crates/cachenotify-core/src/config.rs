use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use config as cfg;
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{EntityType, SourceId};

/// Lag subtracted from "now" so rows still mid-commit are not read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingDelay {
    Fixed(u64),
    Range { low: u64, high: u64 },
}

impl ProcessingDelay {
    /// Draws the delay once. Callers keep the result for the process lifetime.
    pub fn resolve(&self) -> Duration {
        self.resolve_with(&mut rand::rng())
    }

    pub fn resolve_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            ProcessingDelay::Fixed(secs) => Duration::from_secs(secs),
            ProcessingDelay::Range { low, high } => {
                Duration::from_secs(rng.random_range(low..=high))
            }
        }
    }
}

impl FromStr for ProcessingDelay {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(ProcessingDelay::Fixed(0));
        }
        match s.split_once("..") {
            Some((low, high)) => {
                let low: u64 = low
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid processing delay lower bound in {s:?}"))?;
                let high: u64 = high
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid processing delay upper bound in {s:?}"))?;
                if low == high {
                    Ok(ProcessingDelay::Fixed(low))
                } else {
                    Ok(ProcessingDelay::Range {
                        low: low.min(high),
                        high: low.max(high),
                    })
                }
            }
            None => Ok(ProcessingDelay::Fixed(
                s.parse()
                    .with_context(|| format!("invalid processing delay {s:?}"))?,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SequenceId,
    ResyncPoint,
    BoundedScan,
}

/// Where a resync restarts scanning from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOrigin {
    Startup,
    LastCheckpoint,
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResyncOriginKind {
    Startup,
    LastCheckpoint,
    At,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PollConfig {
    #[serde(default = "PollConfig::default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "PollConfig::default_size")]
    pub size: usize,
    /// Fetches allowed in flight against the event store across all sources.
    #[serde(default = "PollConfig::default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default = "PollConfig::default_strategy")]
    pub strategy: StrategyKind,
    #[serde(default = "PollConfig::default_scan_window_hours")]
    pub scan_window_hours: u32,
    /// Seconds, either `N` or `low..high`.
    #[serde(default = "PollConfig::default_processing_delay")]
    pub processing_delay: String,
}

impl PollConfig {
    fn default_interval_secs() -> u64 {
        60
    }

    fn default_size() -> usize {
        1000
    }

    fn default_max_concurrent_fetches() -> usize {
        4
    }

    fn default_strategy() -> StrategyKind {
        StrategyKind::ResyncPoint
    }

    fn default_scan_window_hours() -> u32 {
        1
    }

    fn default_processing_delay() -> String {
        "0".to_string()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Scan width for the bounded strategy. Out-of-range values fall back to one hour.
    pub fn effective_scan_window_hours(&self) -> u32 {
        if (1..=48).contains(&self.scan_window_hours) {
            self.scan_window_hours
        } else {
            1
        }
    }

    pub fn parsed_processing_delay(&self) -> Result<ProcessingDelay> {
        self.processing_delay.parse()
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: Self::default_interval_secs(),
            size: Self::default_size(),
            max_concurrent_fetches: Self::default_max_concurrent_fetches(),
            strategy: Self::default_strategy(),
            scan_window_hours: Self::default_scan_window_hours(),
            processing_delay: Self::default_processing_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SourceConfig {
    pub entity_type: EntityType,
    #[serde(default)]
    pub historical: bool,
    #[serde(default = "SourceConfig::default_enabled")]
    pub enabled: bool,
    /// Overrides `poll.strategy` for this source.
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
}

impl SourceConfig {
    fn default_enabled() -> bool {
        true
    }

    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            historical: false,
            enabled: true,
            strategy: None,
        }
    }

    pub fn source_id(&self) -> SourceId {
        SourceId::new(self.entity_type, self.historical)
    }
}

fn default_sources() -> Vec<SourceConfig> {
    EntityType::ALL
        .iter()
        .map(|&entity_type| SourceConfig {
            entity_type,
            historical: entity_type == EntityType::Historical,
            enabled: !matches!(
                entity_type,
                EntityType::Merchandising | EntityType::Historical
            ),
            strategy: None,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DedupConfig {
    #[serde(default = "DedupConfig::default_bucket_count")]
    pub bucket_count: usize,
    /// Cycles between rotations unless a table overrides it.
    #[serde(default = "DedupConfig::default_flush_interval_cycles")]
    pub flush_interval_cycles: u32,
    #[serde(default)]
    pub table_flush_intervals: HashMap<String, u32>,
}

impl DedupConfig {
    fn default_bucket_count() -> usize {
        10
    }

    fn default_flush_interval_cycles() -> u32 {
        1
    }

    pub fn flush_interval_for(&self, table: &str) -> u32 {
        self.table_flush_intervals
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, cycles)| *cycles)
            .unwrap_or(self.flush_interval_cycles)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            bucket_count: Self::default_bucket_count(),
            flush_interval_cycles: Self::default_flush_interval_cycles(),
            table_flush_intervals: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RecoveryConfig {
    #[serde(default = "RecoveryConfig::default_enabled")]
    pub enabled: bool,
    /// Refetch attempts before a missing order number is abandoned and reported.
    #[serde(default = "RecoveryConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RecoveryConfig::default_block_size")]
    pub block_size: usize,
    #[serde(default = "RecoveryConfig::default_max_blocks")]
    pub max_blocks: usize,
    /// A single gap wider than this triggers a resync instead of being tracked.
    #[serde(default = "RecoveryConfig::default_max_gap_span")]
    pub max_gap_span: u64,
    #[serde(default = "RecoveryConfig::default_report_file")]
    pub report_file: Option<PathBuf>,
}

impl RecoveryConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_max_retries() -> u32 {
        5
    }

    fn default_block_size() -> usize {
        10
    }

    fn default_max_blocks() -> usize {
        10
    }

    fn default_max_gap_span() -> u64 {
        10_000
    }

    fn default_report_file() -> Option<PathBuf> {
        Some(PathBuf::from("cachenotification-unprocessed.log"))
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            max_retries: Self::default_max_retries(),
            block_size: Self::default_block_size(),
            max_blocks: Self::default_max_blocks(),
            max_gap_span: Self::default_max_gap_span(),
            report_file: Self::default_report_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResyncConfig {
    #[serde(default = "ResyncConfig::default_origin")]
    pub origin: ResyncOriginKind,
    /// RFC 3339 timestamp, required when `origin = "at"`.
    #[serde(default)]
    pub at: Option<String>,
    /// Enables checkpoint persistence when set.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Persisted checkpoints older than this are ignored. Defaults to six processing delays.
    #[serde(default)]
    pub checkpoint_max_age_secs: Option<u64>,
}

impl ResyncConfig {
    fn default_origin() -> ResyncOriginKind {
        ResyncOriginKind::LastCheckpoint
    }

    pub fn resolved_origin(&self) -> Result<ResyncOrigin> {
        Ok(match self.origin {
            ResyncOriginKind::Startup => ResyncOrigin::Startup,
            ResyncOriginKind::LastCheckpoint => ResyncOrigin::LastCheckpoint,
            ResyncOriginKind::At => {
                let raw = self
                    .at
                    .as_deref()
                    .context("resync.at is required when resync.origin = \"at\"")?;
                let at = DateTime::parse_from_rfc3339(raw)
                    .with_context(|| format!("resync.at is not RFC 3339: {raw:?}"))?;
                ResyncOrigin::At(at.with_timezone(&Utc))
            }
        })
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            origin: Self::default_origin(),
            at: None,
            checkpoint_dir: None,
            checkpoint_max_age_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ControlConfig {
    /// TOML allow-list mapping entities to consuming cache ids.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LivenessConfig {
    #[serde(default = "LivenessConfig::default_alive_file")]
    pub alive_file: Option<PathBuf>,
    /// Consecutive failed cycles before a source reports degraded.
    #[serde(default = "LivenessConfig::default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive good cycles before a degraded source reports healthy again.
    #[serde(default = "LivenessConfig::default_success_threshold")]
    pub success_threshold: u32,
}

impl LivenessConfig {
    fn default_alive_file() -> Option<PathBuf> {
        Some(PathBuf::from("cache.thread.alive"))
    }

    fn default_failure_threshold() -> u32 {
        5
    }

    fn default_success_threshold() -> u32 {
        2
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            alive_file: Self::default_alive_file(),
            failure_threshold: Self::default_failure_threshold(),
            success_threshold: Self::default_success_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FlushConfig {
    /// Cache id to seconds between whole-cache clears.
    #[serde(default)]
    pub intervals: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub resync: ResyncConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default = "EngineConfig::default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(skip)]
    resolved_delay: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            sources: default_sources(),
            dedup: DedupConfig::default(),
            recovery: RecoveryConfig::default(),
            resync: ResyncConfig::default(),
            control: ControlConfig::default(),
            liveness: LivenessConfig::default(),
            flush: FlushConfig::default(),
            shutdown_timeout_secs: Self::default_shutdown_timeout_secs(),
            resolved_delay: None,
        }
    }
}

impl EngineConfig {
    fn default_shutdown_timeout_secs() -> u64 {
        10
    }

    /// Pins the processing delay instead of drawing it from `poll.processing_delay`.
    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.resolved_delay = Some(delay);
        self
    }

    /// Returns the pinned delay, drawing and storing it on first use.
    pub fn resolve_processing_delay(&mut self) -> Result<Duration> {
        if let Some(delay) = self.resolved_delay {
            return Ok(delay);
        }
        let delay = self.poll.parsed_processing_delay()?.resolve();
        debug!(delay_secs = delay.as_secs(), "processing delay resolved");
        self.resolved_delay = Some(delay);
        Ok(delay)
    }

    pub fn processing_delay(&self) -> Option<Duration> {
        self.resolved_delay
    }

    pub fn enabled_sources(&self) -> Vec<SourceConfig> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn strategy_for(&self, source: &SourceConfig) -> StrategyKind {
        source.strategy.unwrap_or(self.poll.strategy)
    }

    /// Age past which a persisted checkpoint is too stale to resume from.
    pub fn checkpoint_max_age(&self) -> Duration {
        if let Some(secs) = self.resync.checkpoint_max_age_secs {
            return Duration::from_secs(secs);
        }
        let delay = self.resolved_delay.unwrap_or_default();
        (delay * 6).max(self.poll.interval())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.poll.interval_secs > 0, "poll.interval_secs must be > 0");
        anyhow::ensure!(self.poll.size > 0, "poll.size must be > 0");
        anyhow::ensure!(
            self.poll.max_concurrent_fetches > 0,
            "poll.max_concurrent_fetches must be > 0"
        );
        self.poll
            .parsed_processing_delay()
            .context("poll.processing_delay")?;

        anyhow::ensure!(
            self.dedup.bucket_count >= 2,
            "dedup.bucket_count must be >= 2"
        );
        anyhow::ensure!(
            self.dedup.flush_interval_cycles > 0,
            "dedup.flush_interval_cycles must be > 0"
        );
        for (table, cycles) in &self.dedup.table_flush_intervals {
            anyhow::ensure!(
                *cycles > 0,
                "dedup.table_flush_intervals.{table} must be > 0"
            );
        }

        anyhow::ensure!(
            self.recovery.block_size > 0 && self.recovery.max_blocks > 0,
            "recovery.block_size and recovery.max_blocks must be > 0"
        );
        anyhow::ensure!(
            self.recovery.max_gap_span > 0,
            "recovery.max_gap_span must be > 0"
        );

        self.resync.resolved_origin()?;

        anyhow::ensure!(
            !self.enabled_sources().is_empty(),
            "at least one source must be enabled"
        );
        let mut seen = HashSet::new();
        for source in &self.sources {
            anyhow::ensure!(
                seen.insert(source.source_id()),
                "source {} configured more than once",
                source.source_id()
            );
        }

        for (cache, secs) in &self.flush.intervals {
            anyhow::ensure!(*secs > 0, "flush.intervals.{cache} must be > 0");
        }
        Ok(())
    }

    /// Layers `default`, `<env>`, `local` files from `config_dir`, then `CACHENOTIFY__*` env vars.
    pub fn load_from_sources(config_dir: &Path, env_name: &str) -> Result<EngineConfig> {
        let builder = cfg::Config::builder()
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(cfg::File::from(config_dir.join("default.json")).required(false))
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.toml", env_name))).required(false),
            )
            .add_source(
                cfg::File::from(config_dir.join(format!("{}.json", env_name))).required(false),
            )
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                cfg::Environment::with_prefix("CACHENOTIFY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: EngineConfig = builder
            .build()
            .context("building configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        let enabled: Vec<_> = config
            .enabled_sources()
            .iter()
            .map(|s| s.entity_type)
            .collect();
        assert!(enabled.contains(&EntityType::Fare));
        assert!(!enabled.contains(&EntityType::Merchandising));
        assert!(!enabled.contains(&EntityType::Historical));
    }

    #[test]
    fn processing_delay_parses_fixed_and_ranges() {
        assert_eq!("".parse::<ProcessingDelay>().unwrap(), ProcessingDelay::Fixed(0));
        assert_eq!("90".parse::<ProcessingDelay>().unwrap(), ProcessingDelay::Fixed(90));
        assert_eq!(
            "600..1800".parse::<ProcessingDelay>().unwrap(),
            ProcessingDelay::Range { low: 600, high: 1800 }
        );
        assert_eq!(
            "1800..600".parse::<ProcessingDelay>().unwrap(),
            ProcessingDelay::Range { low: 600, high: 1800 }
        );
        assert_eq!(
            "30..30".parse::<ProcessingDelay>().unwrap(),
            ProcessingDelay::Fixed(30)
        );
        assert!("ten".parse::<ProcessingDelay>().is_err());
        assert!("5..x".parse::<ProcessingDelay>().is_err());
    }

    #[test]
    fn ranged_delay_draw_stays_in_bounds() {
        let delay = ProcessingDelay::Range { low: 10, high: 20 };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let drawn = delay.resolve_with(&mut rng).as_secs();
            assert!((10..=20).contains(&drawn));
        }
    }

    #[test]
    fn processing_delay_is_drawn_once() {
        let mut config = EngineConfig::default();
        config.poll.processing_delay = "1..100000".into();
        let first = config.resolve_processing_delay().unwrap();
        for _ in 0..10 {
            assert_eq!(config.resolve_processing_delay().unwrap(), first);
        }

        let pinned = EngineConfig::default().with_processing_delay(Duration::from_secs(42));
        assert_eq!(pinned.processing_delay(), Some(Duration::from_secs(42)));
    }

    #[test]
    fn scan_window_out_of_range_falls_back_to_one_hour() {
        let mut poll = PollConfig::default();
        poll.scan_window_hours = 12;
        assert_eq!(poll.effective_scan_window_hours(), 12);
        poll.scan_window_hours = 0;
        assert_eq!(poll.effective_scan_window_hours(), 1);
        poll.scan_window_hours = 49;
        assert_eq!(poll.effective_scan_window_hours(), 1);
    }

    #[test]
    fn resync_at_requires_timestamp() {
        let mut resync = ResyncConfig {
            origin: ResyncOriginKind::At,
            ..Default::default()
        };
        assert!(resync.resolved_origin().is_err());

        resync.at = Some("2024-03-01T12:00:00Z".into());
        match resync.resolved_origin().unwrap() {
            ResyncOrigin::At(at) => assert_eq!(at.to_rfc3339(), "2024-03-01T12:00:00+00:00"),
            other => panic!("unexpected origin {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.dedup.bucket_count = 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sources.push(SourceConfig::new(EntityType::Fare));
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        for source in &mut config.sources {
            source.enabled = false;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn checkpoint_max_age_defaults_to_six_delays() {
        let config = EngineConfig::default().with_processing_delay(Duration::from_secs(600));
        assert_eq!(config.checkpoint_max_age(), Duration::from_secs(3600));

        let config = EngineConfig::default();
        assert_eq!(config.checkpoint_max_age(), Duration::from_secs(60));
    }

    #[test]
    fn table_flush_interval_overrides_default() {
        let mut dedup = DedupConfig::default();
        dedup.table_flush_intervals.insert("Fare".into(), 3);
        assert_eq!(dedup.flush_interval_for("Fare"), 3);
        assert_eq!(dedup.flush_interval_for("Rule"), 1);
    }
}
