// ABOUTME: Alive-file heartbeat for external process monitoring
// ABOUTME: Rewrites one JSON file per heartbeat so its mtime tracks the last completed cycle

use cachenotify_core::{Heartbeat, LivenessSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Serialize)]
struct AliveFile<'a> {
    updated_at: DateTime<Utc>,
    degraded: bool,
    sources: &'a BTreeMap<String, Heartbeat>,
}

/// Liveness sink backed by a file on disk.
pub struct FileLivenessSink {
    path: PathBuf,
    latest: Mutex<BTreeMap<String, Heartbeat>>,
}

impl FileLivenessSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            latest: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, sources: &BTreeMap<String, Heartbeat>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = AliveFile {
            updated_at: Utc::now(),
            degraded: sources.values().any(|beat| beat.degraded),
            sources,
        };
        let json = serde_json::to_vec_pretty(&body)?;
        fs::write(&self.path, json)
    }
}

impl LivenessSink for FileLivenessSink {
    fn heartbeat(&self, beat: &Heartbeat) {
        let mut latest = self.latest.lock();
        latest.insert(beat.source.label(), beat.clone());
        match self.write(&latest) {
            Ok(()) => debug!(source = %beat.source, path = ?self.path, "heartbeat written"),
            Err(e) => warn!(path = ?self.path, error = %e, "failed to write alive file"),
        }
    }
}

/// Sink that drops heartbeats, for embedding without a monitor.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLivenessSink;

impl LivenessSink for NoopLivenessSink {
    fn heartbeat(&self, _beat: &Heartbeat) {}
}
