//! Fingerprint store: snapshots of a dependency set and their diff.
//!
//! A fingerprint records size and modification time per file. Two
//! snapshots of the same component are diffed into a [`ChangeSet`].

use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{DevError, Result};

/// Future returned by a dependency lister.
pub type DepsFuture = BoxFuture<'static, Result<Vec<PathBuf>>>;

/// Lists the files a watched component depends on.
pub type Lister = Arc<dyn Fn() -> DepsFuture + Send + Sync>;

/// Build a [`Lister`] that always returns the same paths.
pub fn static_lister(paths: Vec<PathBuf>) -> Lister {
    Arc::new(move || {
        let paths = paths.clone();
        Box::pin(async move { Ok(paths) })
    })
}

/// Opaque per-file fingerprint value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    size: u64,
    modified: Option<SystemTime>,
}

/// Path -> stamp snapshot of one component's dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFingerprint {
    files: HashMap<PathBuf, FileStamp>,
}

impl FileFingerprint {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &std::path::Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.keys()
    }

    /// Stat every path. Fails with [`DevError::Stat`] if one vanished.
    pub fn stat(paths: Vec<PathBuf>) -> Result<Self> {
        let mut files = HashMap::with_capacity(paths.len());
        for path in paths {
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(source) => return Err(DevError::Stat { path, source }),
            };
            let stamp = FileStamp {
                size: meta.len(),
                modified: meta.modified().ok(),
            };
            files.insert(path, stamp);
        }
        Ok(Self { files })
    }
}

/// Invoke the lister and fingerprint what it returns.
pub async fn capture(lister: &Lister) -> Result<FileFingerprint> {
    let paths = lister().await.map_err(|e| match e {
        DevError::List(_) => e,
        other => DevError::List(other.to_string()),
    })?;
    tokio::task::spawn_blocking(move || FileFingerprint::stat(paths))
        .await
        .map_err(|e| DevError::List(format!("stat task failed: {}", e)))?
}

/// Added / modified / deleted paths between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: BTreeSet<PathBuf>,
    pub modified: BTreeSet<PathBuf>,
    pub deleted: BTreeSet<PathBuf>,
}

impl ChangeSet {
    pub fn has_changed(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty())
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_changed()
    }

    /// Every path touched by this change set.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.deleted.iter())
    }
}

/// Diff two snapshots with a hash-map join.
pub fn diff(old: &FileFingerprint, new: &FileFingerprint) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (path, stamp) in &new.files {
        match old.files.get(path) {
            None => {
                changes.added.insert(path.clone());
            }
            Some(prev) if prev != stamp => {
                changes.modified.insert(path.clone());
            }
            Some(_) => {}
        }
    }

    for path in old.files.keys() {
        if !new.files.contains_key(path) {
            changes.deleted.insert(path.clone());
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        fs::write(path, contents).unwrap();
    }

    fn apply(base: &FileFingerprint, changes: &ChangeSet) -> BTreeSet<PathBuf> {
        let mut paths: BTreeSet<PathBuf> = base.paths().cloned().collect();
        for p in &changes.deleted {
            paths.remove(p);
        }
        paths.extend(changes.added.iter().cloned());
        paths
    }

    #[test]
    fn test_diff_of_identical_snapshots_is_empty() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        write(&a, "a");
        let snap = FileFingerprint::stat(vec![a]).unwrap();
        assert!(!diff(&snap, &snap).has_changed());
        assert!(diff(&FileFingerprint::default(), &FileFingerprint::default()).is_empty());
    }

    #[test]
    fn test_diff_classifies_changes() {
        let dir = tempdir().unwrap();
        let kept = dir.path().join("kept.txt");
        let grown = dir.path().join("grown.txt");
        let gone = dir.path().join("gone.txt");
        let fresh = dir.path().join("fresh.txt");
        write(&kept, "same");
        write(&grown, "x");
        write(&gone, "bye");

        let old = FileFingerprint::stat(vec![kept.clone(), grown.clone(), gone.clone()]).unwrap();

        write(&grown, "xxxxxxxx");
        write(&fresh, "hi");
        fs::remove_file(&gone).unwrap();
        let new = FileFingerprint::stat(vec![kept.clone(), grown.clone(), fresh.clone()]).unwrap();

        let changes = diff(&old, &new);
        assert_eq!(changes.added.iter().collect::<Vec<_>>(), vec![&fresh]);
        assert_eq!(changes.modified.iter().collect::<Vec<_>>(), vec![&grown]);
        assert_eq!(changes.deleted.iter().collect::<Vec<_>>(), vec![&gone]);
        assert_eq!(changes.len(), 3);

        // Applying the diff to the old path set yields the new path set.
        let expected: BTreeSet<PathBuf> = new.paths().cloned().collect();
        assert_eq!(apply(&old, &changes), expected);
    }

    #[test]
    fn test_stat_missing_path_is_stat_error() {
        let err = FileFingerprint::stat(vec![PathBuf::from("/nonexistent/devloop/file")])
            .unwrap_err();
        assert!(matches!(err, DevError::Stat { .. }));
    }

    #[tokio::test]
    async fn test_capture_wraps_lister_failure() {
        let lister: Lister =
            Arc::new(|| Box::pin(async { Err(DevError::Parse("bad glob [".to_string())) }));
        let err = capture(&lister).await.unwrap_err();
        assert!(matches!(err, DevError::List(_)));
    }

    #[tokio::test]
    async fn test_capture_static_lister() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        write(&a, "1");
        let snap = capture(&static_lister(vec![a.clone()])).await.unwrap();
        assert_eq!(snap.len(), 1);
        assert!(snap.contains(&a));
    }
}
