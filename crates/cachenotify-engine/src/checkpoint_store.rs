use cachenotify_core::{CheckpointError, CheckpointStore, PersistedCheckpoint, SourceId};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One JSON file per source under `dir`, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
    max_age: Duration,
}

impl JsonFileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, source: SourceId) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.json", source.label()))
    }

    /// Every checkpoint file in the directory regardless of age, sorted by source.
    pub fn list(&self) -> Result<Vec<PersistedCheckpoint>, CheckpointError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".checkpoint.json"));
            if !is_checkpoint {
                continue;
            }
            let bytes = fs::read(&path)?;
            found.push(serde_json::from_slice::<PersistedCheckpoint>(&bytes)?);
        }
        found.sort_by_key(|p| p.source);
        Ok(found)
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn load(&self, source: SourceId) -> Result<Option<PersistedCheckpoint>, CheckpointError> {
        let path = self.path_for(source);
        if !path.exists() {
            debug!(source = %source, "no persisted checkpoint");
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let persisted: PersistedCheckpoint = serde_json::from_slice(&bytes)?;

        let age = (Utc::now() - persisted.saved_at)
            .to_std()
            .unwrap_or_default();
        if age > self.max_age {
            warn!(
                source = %source,
                age_secs = age.as_secs(),
                max_age_secs = self.max_age.as_secs(),
                "persisted checkpoint is stale, ignoring"
            );
            return Ok(None);
        }
        info!(
            source = %source,
            last_sequence_id = persisted.checkpoint.last_sequence_id,
            cutoff = %persisted.window.cutoff,
            "resuming from persisted checkpoint"
        );
        Ok(Some(persisted))
    }

    fn save(&self, persisted: &PersistedCheckpoint) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(persisted.source);
        let temp_path = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&serde_json::to_vec_pretty(persisted)?)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        debug!(source = %persisted.source, path = ?path, "checkpoint saved");
        Ok(())
    }
}
