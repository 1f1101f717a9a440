// ABOUTME: Hot-reloadable allow-list of entities still consumed by some cache
// ABOUTME: Missing or unreadable control files make every entity count as in use

use anyhow::{Context, Result};
use cachenotify_core::{ControlError, ControlFilter};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Deserialize)]
struct ControlDocument {
    #[serde(default)]
    entities: HashMap<String, Vec<String>>,
}

/// Entity name (upper-cased) to the cache ids that consume it.
type EntityCaches = HashMap<String, Vec<String>>;

pub struct ControlFile {
    path: PathBuf,
    entities: Arc<RwLock<Option<EntityCaches>>>,
}

impl ControlFile {
    /// Reads the file once. A failed read leaves the filter unloaded, which fails open.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let control = Self {
            path: path.into(),
            entities: Arc::new(RwLock::new(None)),
        };
        control.reload();
        control
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.entities.read().is_some()
    }

    pub fn caches_for(&self, entity: &str) -> Vec<String> {
        self.entities
            .read()
            .as_ref()
            .and_then(|map| map.get(&entity.to_ascii_uppercase()).cloned())
            .unwrap_or_default()
    }

    pub fn reload(&self) {
        Self::reload_into(&self.path, &self.entities);
    }

    fn reload_into(path: &Path, slot: &RwLock<Option<EntityCaches>>) {
        match read_document(path) {
            Ok(map) => {
                info!(path = ?path, entities = map.len(), "control file loaded");
                *slot.write() = Some(map);
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "control file unavailable, all entities in use");
                *slot.write() = None;
            }
        }
    }

    /// Watches the file's directory and reloads on any change to the file.
    /// The returned watcher must be kept alive.
    pub fn spawn_watcher(&self) -> Result<RecommendedWatcher> {
        let path = self.path.clone();
        let entities = self.entities.clone();
        let file_name = path.file_name().map(|n| n.to_os_string());
        let watch_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    let touches_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if touches_file {
                        debug!(kind = ?event.kind, "control file changed");
                        Self::reload_into(&path, &entities);
                    }
                }
                Err(e) => error!("control file watcher error: {:?}", e),
            }
        })?;
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {:?}", watch_dir))?;
        Ok(watcher)
    }
}

fn read_document(path: &Path) -> Result<EntityCaches> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let doc: ControlDocument =
        toml::from_str(&text).with_context(|| format!("parsing {:?}", path))?;
    Ok(doc
        .entities
        .into_iter()
        .map(|(entity, caches)| (entity.to_ascii_uppercase(), caches))
        .collect())
}

impl ControlFilter for ControlFile {
    fn in_use(&self, entity: &str) -> std::result::Result<bool, ControlError> {
        match self.entities.read().as_ref() {
            Some(map) => Ok(map
                .get(&entity.to_ascii_uppercase())
                .is_some_and(|caches| !caches.is_empty())),
            None => Err(ControlError(format!("{:?} not loaded", self.path))),
        }
    }
}
