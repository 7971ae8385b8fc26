use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::photo::ImageDescriptor;

pub const HISTORY_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub image: ImageDescriptor,
    pub path: PathBuf,
}

/// Most recent rendered images, newest first, backing "previous" navigation.
///
/// Files are named by cache id, so repeated images share one file; a file is
/// unlinked once no entry refers to it anymore.
#[derive(Debug)]
pub struct ImageHistory {
    dir: PathBuf,
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
    refs: HashMap<PathBuf, usize>,
}

impl ImageHistory {
    /// Opens the history directory, discarding files left by a previous run.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_capacity(dir, HISTORY_SIZE)
    }

    pub fn with_capacity(dir: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create history dir {}", dir.display()))?;
        for entry in fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.is_file() {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "failed to clear stale history file");
                }
            }
        }
        Ok(Self {
            dir,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            refs: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies `rendered` into the history and records it as newest.
    pub fn add(&mut self, image: &ImageDescriptor, rendered: &Path) -> Result<()> {
        let mut name = image.cache_id();
        if let Some(ext) = rendered.extension().and_then(|e| e.to_str()) {
            name.push('.');
            name.push_str(ext);
        }
        let path = self.dir.join(name);
        if !self.refs.contains_key(&path) {
            fs::copy(rendered, &path).with_context(|| {
                format!(
                    "failed to copy {} into history at {}",
                    rendered.display(),
                    path.display()
                )
            })?;
        }
        *self.refs.entry(path.clone()).or_insert(0) += 1;
        self.entries.push_front(HistoryEntry {
            image: image.clone(),
            path,
        });

        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_back() {
                self.release(&evicted.path);
            }
        }
        Ok(())
    }

    fn release(&mut self, path: &Path) {
        let remaining = match self.refs.get_mut(path) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            self.refs.remove(path);
            debug!(path = %path.display(), "history file released");
            if let Err(err) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %err, "failed to remove history file");
            }
        }
    }

    /// Entry `index` steps back from the newest (0 = currently shown).
    pub fn get(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.get(index)
    }

    pub fn references(&self, path: &Path) -> usize {
        self.refs.get(path).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    #[test]
    fn eviction_keeps_files_still_referenced() {
        let work = tempfile::tempdir().unwrap();
        let mut history = ImageHistory::with_capacity(work.path().join("history"), 2).unwrap();
        let src = rendered(work.path(), "frame.jpg");

        let a = ImageDescriptor::new("a", "u");
        let b = ImageDescriptor::new("b", "u");
        history.add(&a, &src).unwrap();
        history.add(&b, &src).unwrap();
        history.add(&a, &src).unwrap();

        let a_path = history.get(0).unwrap().path.clone();
        assert_eq!(history.len(), 2);
        assert_eq!(history.references(&a_path), 1);
        assert!(a_path.exists(), "newest entry still references the file");

        history.add(&b, &src).unwrap();
        history.add(&b, &src).unwrap();
        assert!(!a_path.exists(), "file unlinked once unreferenced");
    }

    #[test]
    fn newest_first_indexing() {
        let work = tempfile::tempdir().unwrap();
        let mut history = ImageHistory::new(work.path().join("history")).unwrap();
        let src = rendered(work.path(), "frame.png");
        for id in ["1", "2", "3"] {
            history.add(&ImageDescriptor::new(id, "u"), &src).unwrap();
        }
        assert_eq!(history.get(0).unwrap().image.id, "3");
        assert_eq!(history.get(2).unwrap().image.id, "1");
        assert!(history.get(3).is_none());
        assert_eq!(history.get(0).unwrap().path.extension().unwrap(), "png");
    }
}
