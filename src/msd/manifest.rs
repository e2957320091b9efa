//! Pending-deletion manifest
//!
//! Paths marked for removal are kept in a text file (one normalized relative
//! path per line) and applied the next time the image is mounted read-write.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// Normalize a relative path inside the image.
///
/// Returns `None` for empty paths, absolute paths and anything with a `..`
/// segment. `.` segments, repeated and trailing separators are dropped.
pub fn normalize(path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() || path.starts_with('/') || path.starts_with('\\') {
        return None;
    }

    let mut parts = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => parts.push(s),
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn validate(path: &str) -> Result<String> {
    normalize(path).ok_or_else(|| AppError::InvalidPath(path.to_string()))
}

/// Outcome of applying the manifest to a mounted image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Entries whose target was removed
    pub deleted: Vec<String>,
    /// Entries whose target no longer existed
    pub missing: Vec<String>,
    /// Entries whose removal failed; kept for the next commit
    pub failed: Vec<String>,
}

/// Persisted set of paths awaiting deletion
pub struct PendingDeletions {
    path: PathBuf,
    /// Serializes read-modify-write of the manifest file
    lock: Mutex<()>,
}

impl PendingDeletions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the manifest. A missing file is an empty set; malformed lines are skipped.
    pub fn load(&self) -> Result<BTreeSet<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = BTreeSet::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match normalize(line) {
                Some(p) => {
                    entries.insert(p);
                }
                None => warn!("Ignoring invalid manifest entry: {:?}", line),
            }
        }
        Ok(entries)
    }

    /// Rewrite the whole manifest
    pub fn save(&self, entries: &BTreeSet<String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut content = String::new();
        for entry in entries {
            content.push_str(entry);
            content.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Sorted manifest contents
    pub fn entries(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        Ok(self.load()?.into_iter().collect())
    }

    /// Mark a path for deletion. Adding twice is a no-op.
    pub fn add(&self, path: &str) -> Result<()> {
        let normalized = validate(path)?;
        let _guard = self.lock.lock();
        let mut entries = self.load()?;
        if entries.insert(normalized.clone()) {
            self.save(&entries)?;
            info!("Marked for deletion: {}", normalized);
        }
        Ok(())
    }

    /// Unmark a path. Returns whether it was pending.
    pub fn remove(&self, path: &str) -> Result<bool> {
        let normalized = validate(path)?;
        let _guard = self.lock.lock();
        let mut entries = self.load()?;
        if !entries.remove(&normalized) {
            return Ok(false);
        }
        self.save(&entries)?;
        info!("Unmarked deletion: {}", normalized);
        Ok(true)
    }

    /// Delete every pending path under `root`.
    ///
    /// Deleted and already-missing entries leave the manifest; entries that
    /// fail to delete stay for the next attempt. The manifest is saved even
    /// when some entries fail.
    pub fn apply_to(&self, root: &Path) -> Result<ApplyReport> {
        let _guard = self.lock.lock();
        let entries = self.load()?;
        let mut report = ApplyReport::default();
        let mut remaining = BTreeSet::new();

        for entry in entries {
            let target = root.join(&entry);
            let result = match fs::symlink_metadata(&target) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target),
                Ok(_) => fs::remove_file(&target),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    debug!("Deleted {}", target.display());
                    report.deleted.push(entry);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Pending deletion already gone: {}", entry);
                    report.missing.push(entry);
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", target.display(), e);
                    report.failed.push(entry.clone());
                    remaining.insert(entry);
                }
            }
        }

        self.save(&remaining)?;
        if !report.deleted.is_empty() || !report.failed.is_empty() {
            info!(
                "Applied pending deletions: {} deleted, {} missing, {} failed",
                report.deleted.len(),
                report.missing.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest(dir: &TempDir) -> PendingDeletions {
        PendingDeletions::new(dir.path().join("state/pending.txt"))
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a.txt").as_deref(), Some("a.txt"));
        assert_eq!(normalize("./dir//sub/").as_deref(), Some("dir/sub"));
        assert_eq!(normalize("dir\\file").as_deref(), Some("dir/file"));
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("  "), None);
        assert_eq!(normalize("."), None);
        assert_eq!(normalize("/etc/passwd"), None);
        assert_eq!(normalize("a/../b"), None);
        assert_eq!(normalize(".."), None);
    }

    #[test]
    fn test_add_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir);
        m.add("a.txt").unwrap();
        m.add("./a.txt").unwrap();
        m.add("docs/").unwrap();
        assert_eq!(m.entries().unwrap(), vec!["a.txt", "docs"]);
        assert_eq!(
            fs::read_to_string(m.path()).unwrap(),
            "a.txt\ndocs\n"
        );
    }

    #[test]
    fn test_unsafe_paths_rejected_without_change() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir);
        m.add("keep.txt").unwrap();
        let before = fs::read_to_string(m.path()).unwrap();

        for bad in ["../escape", "/abs", "a/../../b", "", ".."] {
            assert!(matches!(m.add(bad), Err(AppError::InvalidPath(_))));
            assert!(matches!(m.remove(bad), Err(AppError::InvalidPath(_))));
        }
        assert_eq!(fs::read_to_string(m.path()).unwrap(), before);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir);
        m.add("a.txt").unwrap();
        assert!(m.remove("a.txt").unwrap());
        assert!(!m.remove("a.txt").unwrap());
        assert!(m.entries().unwrap().is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir);
        let set: BTreeSet<String> = ["z", "a/b", "dir with space/f.txt"]
            .into_iter()
            .map(String::from)
            .collect();
        m.save(&set).unwrap();
        assert_eq!(m.load().unwrap(), set);
        m.save(&m.load().unwrap()).unwrap();
        assert_eq!(m.load().unwrap(), set);
    }

    #[test]
    fn test_load_skips_invalid_lines() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir);
        fs::create_dir_all(m.path().parent().unwrap()).unwrap();
        fs::write(m.path(), "ok.txt\n../bad\n\n/abs\nsub/x\n").unwrap();
        let entries: Vec<_> = m.load().unwrap().into_iter().collect();
        assert_eq!(entries, vec!["ok.txt", "sub/x"]);
    }

    #[test]
    fn test_apply_removes_files_and_dirs() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir);
        let root = dir.path().join("mnt");
        fs::create_dir_all(root.join("photos/2024")).unwrap();
        fs::write(root.join("photos/2024/img.jpg"), b"jpg").unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("keep.txt"), b"k").unwrap();

        m.add("a.txt").unwrap();
        m.add("photos").unwrap();
        m.add("never-existed.bin").unwrap();

        let report = m.apply_to(&root).unwrap();
        assert_eq!(report.deleted, vec!["a.txt", "photos"]);
        assert_eq!(report.missing, vec!["never-existed.bin"]);
        assert!(report.failed.is_empty());

        assert!(!root.join("a.txt").exists());
        assert!(!root.join("photos").exists());
        assert!(root.join("keep.txt").exists());
        assert!(m.entries().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_apply_removes_symlink_not_target() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir);
        let root = dir.path().join("mnt");
        fs::create_dir_all(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();

        m.add("link").unwrap();
        m.apply_to(&root).unwrap();
        assert!(!root.join("link").exists());
        assert!(root.join("real").is_dir());
    }
}
