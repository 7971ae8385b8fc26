use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::photo::hash_text;

/// New ids are flushed to disk after this many additions.
const FLUSH_EVERY: usize = 20;

#[derive(Debug)]
struct OpenKeyword {
    hash: String,
    seen: HashSet<String>,
    unsaved: usize,
}

/// Per-keyword "already shown" sets, one JSON file per keyword hash.
///
/// Only one keyword is held in memory; touching another one flushes the
/// current set first.
#[derive(Debug)]
pub struct MemoryStore {
    dir: PathBuf,
    open: Option<OpenKeyword>,
}

impl MemoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create memory dir {}", dir.display()))?;
        Ok(Self { dir, open: None })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, keyword_hash: &str) -> PathBuf {
        self.dir.join(format!("{keyword_hash}.json"))
    }

    pub fn file_for_keyword(&self, keyword: &str) -> PathBuf {
        self.file_for(&hash_text(keyword))
    }

    fn read_set(&self, keyword_hash: &str) -> Result<HashSet<String>> {
        let path = self.file_for(keyword_hash);
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(ids) => Ok(ids.into_iter().collect()),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "discarding corrupt memory file");
                    Ok(HashSet::new())
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(HashSet::new()),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn open(&mut self, keyword: &str) -> Result<&mut OpenKeyword> {
        let hash = hash_text(keyword);
        let matches = self.open.as_ref().is_some_and(|o| o.hash == hash);
        if !matches {
            self.flush()?;
            let seen = self.read_set(&hash)?;
            debug!(keyword, entries = seen.len(), "memory switched keyword");
            self.open = Some(OpenKeyword {
                hash,
                seen,
                unsaved: 0,
            });
        }
        match self.open.as_mut() {
            Some(open) => Ok(open),
            None => anyhow::bail!("memory keyword failed to open"),
        }
    }

    /// Marks `id` as shown under `keyword`; returns whether it was new.
    pub fn remember(&mut self, id: &str, keyword: &str) -> Result<bool> {
        let id_hash = hash_text(id);
        let open = self.open(keyword)?;
        if !open.seen.insert(id_hash) {
            return Ok(false);
        }
        open.unsaved += 1;
        if open.unsaved >= FLUSH_EVERY {
            self.flush()?;
        }
        Ok(true)
    }

    pub fn seen(&mut self, id: &str, keyword: &str) -> Result<bool> {
        let id_hash = hash_text(id);
        Ok(self.open(keyword)?.seen.contains(&id_hash))
    }

    pub fn count(&self, keyword: &str) -> Result<usize> {
        let hash = hash_text(keyword);
        match &self.open {
            Some(open) if open.hash == hash => Ok(open.seen.len()),
            _ => Ok(self.read_set(&hash)?.len()),
        }
    }

    /// Writes the open keyword's set if it has unsaved additions.
    pub fn flush(&mut self) -> Result<()> {
        let Some(open) = self.open.as_mut() else {
            return Ok(());
        };
        if open.unsaved == 0 {
            return Ok(());
        }
        let mut ids: Vec<&String> = open.seen.iter().collect();
        ids.sort();
        let body = serde_json::to_string(&ids)?;
        let path = self.dir.join(format!("{}.json", open.hash));
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
        open.unsaved = 0;
        Ok(())
    }

    /// Drops the memory of one keyword, on disk and in RAM.
    pub fn forget(&mut self, keyword: &str) -> Result<()> {
        let hash = hash_text(keyword);
        if self.open.as_ref().is_some_and(|o| o.hash == hash) {
            self.open = None;
        }
        remove_if_present(&self.file_for(&hash))
    }

    pub fn forget_all(&mut self) -> Result<()> {
        self.open = None;
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                remove_if_present(&path)?;
            }
        }
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = ?err, "failed to flush memory on drop");
        }
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_is_idempotent_and_partitioned_by_keyword() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = MemoryStore::new(dir.path()).unwrap();
        assert!(memory.remember("a", "cats").unwrap());
        assert!(!memory.remember("a", "cats").unwrap());
        assert!(memory.seen("a", "cats").unwrap());
        assert!(!memory.seen("a", "dogs").unwrap());
        assert_eq!(memory.count("cats").unwrap(), 1);
    }

    #[test]
    fn switching_keywords_flushes_previous_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = MemoryStore::new(dir.path()).unwrap();
        memory.remember("a", "cats").unwrap();
        memory.remember("b", "dogs").unwrap();
        assert!(memory.file_for_keyword("cats").exists());

        let mut reopened = MemoryStore::new(dir.path()).unwrap();
        assert!(reopened.seen("a", "cats").unwrap());
    }

    #[test]
    fn flushes_every_twenty_additions() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = MemoryStore::new(dir.path()).unwrap();
        for i in 0..19 {
            memory.remember(&format!("id-{i}"), "cats").unwrap();
        }
        assert!(!memory.file_for_keyword("cats").exists());
        memory.remember("id-19", "cats").unwrap();
        assert!(memory.file_for_keyword("cats").exists());
    }

    #[test]
    fn forget_removes_file_and_open_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = MemoryStore::new(dir.path()).unwrap();
        memory.remember("a", "cats").unwrap();
        memory.flush().unwrap();
        memory.forget("cats").unwrap();
        assert!(!memory.file_for_keyword("cats").exists());
        assert!(!memory.seen("a", "cats").unwrap());

        memory.remember("b", "dogs").unwrap();
        memory.flush().unwrap();
        memory.forget_all().unwrap();
        assert_eq!(memory.count("dogs").unwrap(), 0);
    }
}
