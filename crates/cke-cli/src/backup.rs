use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cke_core::time::{is_snapshot_name, snapshot_name};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::info;

/// Snapshot files in `dir`, oldest first.
pub fn list_snapshots(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_snapshot_name(name) {
                names.push(name.to_string());
            }
        }
    }
    // The timestamp format sorts lexically.
    names.sort();
    Ok(names)
}

/// Gzip `data` into `dir/snapshot-YYYYMMDD_HHMMSS.db.gz`.
///
/// The file is written under a temporary name and renamed into place.
pub fn write_snapshot(dir: &Path, data: &[u8], at: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(snapshot_name(at));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("create temporary snapshot file")?;
    {
        let mut gz = GzEncoder::new(&mut tmp, Compression::default());
        gz.write_all(data).context("compress snapshot")?;
        gz.finish().context("finish snapshot")?;
    }
    tmp.persist(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Keep the newest `max` snapshots; returns the removed names.
pub fn rotate(dir: &Path, max: usize) -> Result<Vec<String>> {
    let names = list_snapshots(dir)?;
    let excess = names.len().saturating_sub(max);
    let removed: Vec<String> = names.into_iter().take(excess).collect();
    for name in &removed {
        fs::remove_file(dir.join(name)).with_context(|| format!("Failed to remove {name}"))?;
        info!(file = %name, "removed old snapshot");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, sec).unwrap()
    }

    #[test]
    fn test_write_snapshot_is_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_snapshot(dir.path(), b"etcd-db", at(1)).unwrap();
        assert_eq!(path.file_name().unwrap(), "snapshot-20240501_120001.db.gz");

        let mut out = String::new();
        GzDecoder::new(fs::File::open(&path).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "etcd-db");
    }

    #[test]
    fn test_list_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), b"b", at(2)).unwrap();
        write_snapshot(dir.path(), b"a", at(1)).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("snapshot-bad.db.gz"), "x").unwrap();
        assert_eq!(
            list_snapshots(dir.path()).unwrap(),
            vec!["snapshot-20240501_120001.db.gz", "snapshot-20240501_120002.db.gz"]
        );
    }

    #[test]
    fn test_rotate_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for s in 1..=4 {
            write_snapshot(dir.path(), b"x", at(s)).unwrap();
        }
        let removed = rotate(dir.path(), 2).unwrap();
        assert_eq!(removed, vec!["snapshot-20240501_120001.db.gz", "snapshot-20240501_120002.db.gz"]);
        assert_eq!(list_snapshots(dir.path()).unwrap().len(), 2);
        assert!(rotate(dir.path(), 5).unwrap().is_empty());
    }
}
