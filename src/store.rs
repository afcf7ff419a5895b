//! Snapshots of every file at every processed commit.

use crate::model::{Blame, CommitId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Files of one commit, keyed by path.
pub type Snapshot = HashMap<String, Arc<Blame>>;

/// Commit to path to snapshot. Entries for files a commit did not touch point
/// at the same [`Blame`] as the parent's entry.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    commits: HashMap<CommitId, Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, commit: CommitId, files: Snapshot) {
        self.commits.insert(commit, files);
    }

    pub fn contains(&self, commit: &str) -> bool {
        self.commits.contains_key(commit)
    }

    pub fn files(&self, commit: &str) -> Option<&Snapshot> {
        self.commits.get(commit)
    }

    pub fn get(&self, commit: &str, path: &str) -> Option<&Arc<Blame>> {
        self.commits.get(commit)?.get(path)
    }

    /// Number of commits stored.
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CommitId, &Snapshot)> {
        self.commits.iter()
    }
}

/// What one commit changed: files it rewrote plus merge files that had to be
/// picked from one branch. Files merely carried forward are left out.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub commit: CommitId,
    pub files: BTreeMap<String, Arc<Blame>>,
}
