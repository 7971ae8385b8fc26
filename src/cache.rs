use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const FULL_THRESHOLD_BYTES: u64 = 50 * 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total: u64,
    pub free: u64,
}

/// Filesystem pressure, ordered from relaxed to severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiskPressure {
    Heaps,
    Enough,
    Worrisome,
    Critical,
    Full,
}

impl DiskPressure {
    pub const ALL: [DiskPressure; 5] = [
        DiskPressure::Heaps,
        DiskPressure::Enough,
        DiskPressure::Worrisome,
        DiskPressure::Critical,
        DiskPressure::Full,
    ];

    pub fn from_space(space: DiskSpace) -> Self {
        if space.free < FULL_THRESHOLD_BYTES {
            return Self::Full;
        }
        let ratio = if space.total == 0 {
            0.0
        } else {
            space.free as f64 / space.total as f64
        };
        if ratio < 0.10 {
            Self::Critical
        } else if ratio < 0.20 {
            Self::Worrisome
        } else if ratio < 0.50 {
            Self::Enough
        } else {
            Self::Heaps
        }
    }

    /// Files older than this are swept at this level.
    fn max_age(self) -> Option<Duration> {
        match self {
            Self::Heaps => Some(DAY * 180),
            Self::Enough => Some(DAY * 30),
            Self::Worrisome | Self::Critical => Some(DAY * 7),
            Self::Full => None,
        }
    }
}

pub type SpaceProbe = Arc<dyn Fn(&Path) -> Result<DiskSpace> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Sweep {
    pub files: usize,
    pub bytes: u64,
}

impl Sweep {
    fn absorb(&mut self, other: Sweep) {
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GcReport {
    pub pressure: DiskPressure,
    pub removed: Sweep,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub files: usize,
    pub bytes: u64,
}

/// Content-addressed store of rendered images with pressure-driven eviction.
#[derive(Clone)]
pub struct CacheManager {
    root: PathBuf,
    probe: SpaceProbe,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_probe(root, Arc::new(statvfs_probe))
    }

    pub fn with_probe(root: impl Into<PathBuf>, probe: SpaceProbe) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache dir {}", root.display()))?;
        Ok(Self { root, probe })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache subdir {}", dir.display()))?;
        Ok(dir)
    }

    pub fn path_for(&self, cache_id: &str) -> PathBuf {
        self.root.join(cache_id)
    }

    /// Copies the cached artifact to `dest` when present.
    pub fn lookup(&self, cache_id: &str, dest: &Path) -> Result<bool> {
        let cached = self.path_for(cache_id);
        match fs::copy(&cached, dest) {
            Ok(_) => {
                debug!(cache_id, "cache hit");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| {
                format!("failed to copy {} to {}", cached.display(), dest.display())
            }),
        }
    }

    /// Publishes `source` under `cache_id`, replacing any earlier artifact.
    pub fn store(&self, source: &Path, cache_id: &str) -> Result<()> {
        let target = self.path_for(cache_id);
        let staging = self.root.join(format!(".{cache_id}.incoming"));
        fs::copy(source, &staging)
            .with_context(|| format!("failed to stage {} into cache", source.display()))?;
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %target.display(), error = %err, "failed to unlink cached file"),
        }
        fs::rename(&staging, &target)
            .with_context(|| format!("failed to publish {}", target.display()))?;
        Ok(())
    }

    /// Unlinks every file below the cache (or one subdirectory of it),
    /// keeping the directories.
    pub fn empty(&self, subdir: Option<&str>) -> Sweep {
        let dir = match subdir {
            Some(name) => self.root.join(name),
            None => self.root.clone(),
        };
        sweep(&dir, |_| true)
    }

    pub fn delete_older_than(&self, age: Duration) -> Sweep {
        let cutoff = SystemTime::now().checked_sub(age);
        sweep(&self.root, |meta| match (cutoff, meta.modified()) {
            (Some(cutoff), Ok(modified)) => modified < cutoff,
            _ => false,
        })
    }

    pub fn pressure(&self) -> Result<DiskPressure> {
        let space = (self.probe)(&self.root)?;
        Ok(DiskPressure::from_space(space))
    }

    pub fn garbage_collect(&self, less_important: &[&str]) -> Result<GcReport> {
        let pressure = self.pressure()?;
        Ok(self.collect(pressure, less_important))
    }

    /// Applies the eviction rule of `pressure`.
    ///
    /// Each level also performs the sweep of the level below it, so a more
    /// severe level never removes fewer files than a milder one.
    pub fn collect(&self, pressure: DiskPressure, less_important: &[&str]) -> GcReport {
        let mut removed = Sweep::default();
        match pressure {
            DiskPressure::Full => removed.absorb(self.empty(None)),
            DiskPressure::Critical => {
                for name in less_important {
                    removed.absorb(self.empty(Some(name)));
                }
            }
            _ => {}
        }
        if let Some(age) = pressure.max_age() {
            removed.absorb(self.delete_older_than(age));
        }
        if removed.files > 0 {
            info!(
                ?pressure,
                files = removed.files,
                freed = %format_bytes(removed.bytes),
                "cache garbage collected"
            );
        }
        GcReport { pressure, removed }
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in WalkDir::new(&self.root).into_iter().flatten() {
            if entry.file_type().is_file() {
                stats.files += 1;
                stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        stats
    }
}

fn sweep(dir: &Path, select: impl Fn(&fs::Metadata) -> bool) -> Sweep {
    let mut removed = Sweep::default();
    for entry in WalkDir::new(dir).into_iter() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "skipping unreadable cache entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !select(&meta) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                removed.files += 1;
                removed.bytes += meta.len();
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "failed to delete cached file")
            }
        }
    }
    removed
}

fn statvfs_probe(path: &Path) -> Result<DiskSpace> {
    let stat = nix::sys::statvfs::statvfs(path)
        .with_context(|| format!("statvfs failed for {}", path.display()))?;
    Ok(usable_space(
        stat.blocks() as u64,
        stat.blocks_available() as u64,
        stat.fragment_size() as u64,
    ))
}

/// Free space as seen by an unprivileged process; blocks reserved for root
/// don't count.
fn usable_space(blocks: u64, available: u64, unit: u64) -> DiskSpace {
    DiskSpace {
        total: blocks * unit,
        free: available * unit,
    }
}

/// Human readable byte count using decimal units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_blocks_are_not_free() {
        let space = usable_space(1_000_000, 80_000, 4096);
        assert_eq!(space.total, 4_096_000_000);
        assert_eq!(space.free, 327_680_000);
        assert_eq!(DiskPressure::from_space(space), DiskPressure::Critical);
    }

    #[test]
    fn pressure_thresholds() {
        let gb = 1_000_000_000;
        let at = |free: u64| DiskPressure::from_space(DiskSpace { total: 10 * gb, free });
        assert_eq!(at(40_000_000), DiskPressure::Full);
        assert_eq!(at(gb / 2), DiskPressure::Critical);
        assert_eq!(at(gb + gb / 2), DiskPressure::Worrisome);
        assert_eq!(at(3 * gb), DiskPressure::Enough);
        assert_eq!(at(6 * gb), DiskPressure::Heaps);
    }

    #[test]
    fn bytes_are_formatted_decimal() {
        assert_eq!(format_bytes(999), "999 bytes");
        assert_eq!(format_bytes(1_500), "1.5 KB");
        assert_eq!(format_bytes(2_000_000_000), "2.0 GB");
    }

    #[test]
    fn store_replaces_and_lookup_copies() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path().join("cache")).unwrap();
        let src = dir.path().join("src.jpg");
        fs::write(&src, b"one").unwrap();
        cache.store(&src, "abc").unwrap();
        fs::write(&src, b"two").unwrap();
        cache.store(&src, "abc").unwrap();

        let dest = dir.path().join("dest.jpg");
        assert!(cache.lookup("abc", &dest).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), b"two");
        assert!(!cache.lookup("missing", &dest).unwrap());
    }

    #[test]
    fn empty_keeps_directories() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path().join("cache")).unwrap();
        let sub = cache.subdir("colormatch").unwrap();
        fs::write(sub.join("x"), b"12345").unwrap();
        fs::write(cache.root().join("y"), b"1").unwrap();

        let removed = cache.empty(Some("colormatch"));
        assert_eq!(removed, Sweep { files: 1, bytes: 5 });
        assert!(sub.is_dir());
        assert_eq!(cache.stats().files, 1);
    }
}
