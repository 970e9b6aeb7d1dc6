use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::sync::RwLock;
use tracing::debug;
use walkdir::WalkDir;

use crate::model::ProjectSummary;

#[derive(Debug, Clone)]
struct CacheEntry {
    mtime: SystemTime,
    summary: Option<ProjectSummary>,
}

#[derive(Debug)]
pub struct ProjectCache {
    root: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ProjectCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn needs_parsing(&self, project_id: &str) -> bool {
        let Some(current) = self.stat(project_id).await else {
            return true;
        };
        match self.entries.read().await.get(project_id) {
            Some(entry) => entry.mtime != current,
            None => true,
        }
    }

    pub async fn get(&self, project_id: &str) -> Option<ProjectSummary> {
        self.entries
            .read()
            .await
            .get(project_id)
            .and_then(|entry| entry.summary.clone())
    }

    #[cfg(test)]
    pub async fn contains(&self, project_id: &str) -> bool {
        self.entries.read().await.contains_key(project_id)
    }

    // Stores a freshly parsed result. Must be called after parsing finishes:
    // the directory is stat'ed here, so a write that landed mid-parse still
    // reads as stale next time.
    pub async fn update(&self, project_id: &str, summary: Option<ProjectSummary>) {
        let Some(mtime) = self.stat(project_id).await else {
            debug!(project = %project_id, "project vanished before cache update");
            self.entries.write().await.remove(project_id);
            return;
        };
        self.entries
            .write()
            .await
            .insert(project_id.to_string(), CacheEntry { mtime, summary });
    }

    pub async fn invalidate(&self, project_id: &str) -> bool {
        self.entries.write().await.remove(project_id).is_some()
    }

    pub async fn retain(&self, live: &HashSet<String>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|id, _| live.contains(id));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn stat(&self, project_id: &str) -> Option<SystemTime> {
        let dir = self.root.join(project_id);
        tokio::task::spawn_blocking(move || directory_mtime(&dir))
            .await
            .ok()
            .flatten()
    }
}

// Newest modification time among the directory itself and the files
// directly inside it. Appending to a log leaves the directory's own mtime
// alone, so the children have to be included.
pub fn directory_mtime(dir: &Path) -> Option<SystemTime> {
    let meta = std::fs::metadata(dir).ok()?;
    if !meta.is_dir() {
        return None;
    }
    let mut newest = meta.modified().ok()?;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if let Ok(child) = entry.metadata()
            && let Ok(modified) = child.modified()
            && modified > newest
        {
            newest = modified;
        }
    }
    Some(newest)
}
