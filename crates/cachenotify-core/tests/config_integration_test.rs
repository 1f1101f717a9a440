use cachenotify_core::{EngineConfig, EntityType, ResyncOrigin, StrategyKind};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_missing_files_yield_defaults() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::load_from_sources(dir.path(), "production").unwrap();
    assert_eq!(config.poll.interval_secs, 60);
    assert_eq!(config.poll.size, 1000);
    assert_eq!(config.dedup.bucket_count, 10);
    assert_eq!(config.resync.resolved_origin().unwrap(), ResyncOrigin::LastCheckpoint);
}

#[test]
fn test_environment_file_overrides_default() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("default.toml"),
        r#"
[poll]
interval_secs = 30
size = 500
processing_delay = "600..1800"

[dedup]
bucket_count = 10
table_flush_intervals = { Fare = 3 }
"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("production.toml"),
        r#"
[poll]
interval_secs = 15
strategy = "bounded_scan"
scan_window_hours = 6

[[sources]]
entity_type = "fare"

[[sources]]
entity_type = "fare"
historical = true
strategy = "sequence_id"

[[sources]]
entity_type = "merchandising"
enabled = false
"#,
    )
    .unwrap();

    let config = EngineConfig::load_from_sources(dir.path(), "production").unwrap();
    assert_eq!(config.poll.interval_secs, 15);
    assert_eq!(config.poll.size, 500);
    assert_eq!(config.poll.strategy, StrategyKind::BoundedScan);
    assert_eq!(config.poll.effective_scan_window_hours(), 6);
    assert_eq!(config.dedup.flush_interval_for("Fare"), 3);

    let enabled = config.enabled_sources();
    assert_eq!(enabled.len(), 2);
    assert!(enabled.iter().all(|s| s.entity_type == EntityType::Fare));
    assert_eq!(
        config.strategy_for(&enabled[1]),
        StrategyKind::SequenceId
    );
    assert_eq!(config.strategy_for(&enabled[0]), StrategyKind::BoundedScan);
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("default.toml"),
        "[poll]\nprocessing_delay = \"soon\"\n",
    )
    .unwrap();
    assert!(EngineConfig::load_from_sources(dir.path(), "dev").is_err());

    fs::write(dir.path().join("default.toml"), "[dedup]\nbucket_count = 1\n").unwrap();
    assert!(EngineConfig::load_from_sources(dir.path(), "dev").is_err());
}

#[test]
fn test_config_serialization() {
    let config = EngineConfig::default();
    let text = toml::to_string(&config).unwrap();
    let back: EngineConfig = toml::from_str(&text).unwrap();
    assert_eq!(back.poll.interval_secs, config.poll.interval_secs);
    assert_eq!(back.sources.len(), config.sources.len());
    assert!(back.validate().is_ok());
}
