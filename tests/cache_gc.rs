use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use photoframe_svc::cache::{CacheManager, DiskPressure, DiskSpace};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn aged_file(dir: &Path, name: &str, days: u64) {
    let path = dir.join(name);
    fs::write(&path, vec![7u8; 1024]).unwrap();
    let file = File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() - DAY * days as u32)
        .unwrap();
}

fn populated(root: &Path) -> CacheManager {
    let cache = CacheManager::with_probe(
        root,
        Arc::new(|_: &Path| {
            Ok(DiskSpace {
                total: 1_000_000_000_000,
                free: 150_000_000_000,
            })
        }),
    )
    .unwrap();
    for (name, days) in [("fresh", 1), ("week", 8), ("month", 45), ("old", 200)] {
        aged_file(root, name, days);
    }
    let tinted = cache.subdir("colormatch").unwrap();
    aged_file(&tinted, "tinted", 1);
    cache
}

#[test]
fn worrisome_keeps_only_the_recent_files() {
    let dir = tempfile::tempdir().unwrap();
    let cache = populated(dir.path());

    let report = cache.garbage_collect(&["colormatch"]).unwrap();
    assert_eq!(report.pressure, DiskPressure::Worrisome);
    assert_eq!(report.removed.files, 3);
    assert_eq!(report.removed.bytes, 3 * 1024);
    assert!(dir.path().join("fresh").exists());
    assert!(dir.path().join("colormatch/tinted").exists());
    for gone in ["week", "month", "old"] {
        assert!(!dir.path().join(gone).exists(), "{gone} survived");
    }
}

#[test]
fn harsher_pressure_never_removes_less() {
    let mut removed = Vec::new();
    for pressure in DiskPressure::ALL {
        let dir = tempfile::tempdir().unwrap();
        let cache = populated(dir.path());
        let report = cache.collect(pressure, &["colormatch"]);
        removed.push(report.removed.files);
    }
    assert_eq!(removed, [1, 2, 3, 4, 5]);
    assert!(removed.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn full_disk_empties_everything_but_keeps_directories() {
    let dir = tempfile::tempdir().unwrap();
    let cache = CacheManager::with_probe(
        dir.path(),
        Arc::new(|_: &Path| {
            Ok(DiskSpace {
                total: 1_000_000_000_000,
                free: 10_000_000,
            })
        }),
    )
    .unwrap();
    aged_file(dir.path(), "fresh", 0);
    let tinted = cache.subdir("colormatch").unwrap();
    aged_file(&tinted, "tinted", 0);

    let report = cache.garbage_collect(&["colormatch"]).unwrap();
    assert_eq!(report.pressure, DiskPressure::Full);
    assert_eq!(report.removed.files, 2);
    assert!(tinted.is_dir());
    assert_eq!(cache.stats().files, 0);
}
