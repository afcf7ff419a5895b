//! Walking commits in order and keeping every file's snapshot current.
//!
//! The orchestrator owns the [`SnapshotStore`] and the [`CommitGraph`]. For
//! each commit it applies the commit's own diffs, then fills in every other
//! file from the parents: a single parent hands its entries over unchanged,
//! a merge picks the one branch that touched the file since the branches
//! split. A commit's snapshot is stored only once all of its files succeeded.

use crate::apply::{
    Side, apply_combined_merge, apply_per_parent_merge, apply_single_parent, diff_matches,
};
use crate::diff::{FileDiff, ParseError};
use crate::graph::CommitGraph;
use crate::log::{Commit, spawn_log_parser};
use crate::model::{Blame, CommitId};
use crate::store::{CommitResult, Snapshot, SnapshotStore};
use crate::{BlameError, InconsistencyError};
use crossbeam_channel::{Receiver, Sender, bounded};
use rayon::prelude::*;
use std::any::Any;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Whole-file blame for files the log cannot follow line by line.
///
/// Used when a file's content is binary in the diff, including the commit
/// where a binary file turns back into text.
pub trait FullBlameSource: Send + Sync {
    /// Blame of `path` as of `commit`, or `None` if the file is binary there.
    fn full_blame(&self, commit: &CommitId, path: &str) -> Option<Blame>;
}

/// Treats every file it is asked about as binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFullBlame;

impl FullBlameSource for NoFullBlame {
    fn full_blame(&self, _commit: &CommitId, _path: &str) -> Option<Blame> {
        None
    }
}

/// How merges are described in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeDiffs {
    /// One combined diff against all parents (`git log -c`)
    #[default]
    Combined,
    /// One two-way diff per parent (`git log -m`)
    PerParent,
}

impl MergeDiffs {
    /// `git log` flag producing this form.
    pub fn log_flag(self) -> &'static str {
        match self {
            MergeDiffs::Combined => "-c",
            MergeDiffs::PerParent => "-m",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Commits (and results) allowed in flight between pipeline stages
    pub queue_capacity: usize,
    pub merge_diffs: MergeDiffs,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            merge_diffs: MergeDiffs::default(),
        }
    }
}

/// Stops a run between two commits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A file written by the commit being processed.
struct FileChange {
    path: String,
    blame: Arc<Blame>,
    /// Old path of a rename, to be tombstoned
    vacated: Option<String>,
}

impl FileChange {
    fn new(path: impl Into<String>, blame: impl Into<Arc<Blame>>) -> Self {
        Self {
            path: path.into(),
            blame: blame.into(),
            vacated: None,
        }
    }

    fn vacating(mut self, diff: &FileDiff) -> Self {
        if diff.is_rename() {
            self.vacated = Some(diff.path_before.clone());
        }
        self
    }
}

pub struct Orchestrator {
    store: SnapshotStore,
    graph: CommitGraph,
    source: Box<dyn FullBlameSource>,
    last_commit: Option<CommitId>,
}

impl Orchestrator {
    pub fn new(source: Box<dyn FullBlameSource>) -> Self {
        Self {
            store: SnapshotStore::new(),
            graph: CommitGraph::new(),
            source,
            last_commit: None,
        }
    }

    /// Resume from previously saved state.
    pub fn from_parts(
        store: SnapshotStore,
        graph: CommitGraph,
        last_commit: Option<CommitId>,
        source: Box<dyn FullBlameSource>,
    ) -> Self {
        Self {
            store,
            graph,
            source,
            last_commit,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn graph(&self) -> &CommitGraph {
        &self.graph
    }

    /// Last commit stored, in processing order.
    pub fn last_commit(&self) -> Option<&CommitId> {
        self.last_commit.as_ref()
    }

    pub fn has_processed(&self, commit: &str) -> bool {
        self.store.contains(commit)
    }

    /// Apply one commit and store its snapshot.
    ///
    /// Every parent must already be processed. On error nothing is stored.
    pub fn process(&mut self, commit: &Commit) -> Result<CommitResult, BlameError> {
        let hash = &commit.hash;
        if let Some(parent) = commit.parents.iter().find(|p| !self.store.contains(p)) {
            return Err(InconsistencyError::UnknownParent {
                commit: hash.to_string(),
                parent: parent.to_string(),
            }
            .into());
        }

        let groups = commit
            .groups
            .par_iter()
            .map(|group| {
                group
                    .par_iter()
                    .map(|block| FileDiff::parse(block))
                    .collect::<Result<Vec<_>, ParseError>>()
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        let changes = self.apply_groups(commit, &groups)?;

        let mut changed: BTreeMap<String, Arc<Blame>> = BTreeMap::new();
        let mut vacated = Vec::new();
        for change in changes {
            vacated.extend(change.vacated);
            changed.insert(change.path, change.blame);
        }
        for path in vacated {
            changed
                .entry(path)
                .or_insert_with(|| Arc::new(Blame::tombstone(hash.clone())));
        }

        let mut files: Snapshot = match commit.parents.as_slice() {
            [] => Snapshot::new(),
            [parent] => self.store.files(parent).cloned().unwrap_or_default(),
            _ => {
                let (files, picked) = self.resolve_merge(commit, &changed)?;
                changed.extend(picked);
                files
            }
        };
        for (path, blame) in &changed {
            files.insert(path.clone(), blame.clone());
        }

        debug!(
            commit = %hash,
            parents = commit.parents.len(),
            changed = changed.len(),
            files = files.len(),
            "processed commit"
        );
        self.store.insert(hash.clone(), files);
        self.graph.insert(hash.clone(), commit.parents.clone());
        self.last_commit = Some(hash.clone());

        Ok(CommitResult {
            commit: hash.clone(),
            files: changed,
        })
    }

    /// Process commits from `commits` until the stream ends, an error occurs or
    /// `cancel` is set. Results, and the first error, go to `results`.
    /// Commits already in the store are skipped without a result.
    pub fn run(
        &mut self,
        commits: &Receiver<Result<Commit, BlameError>>,
        results: &Sender<Result<CommitResult, BlameError>>,
        cancel: &CancelToken,
    ) {
        let mut processed = 0usize;
        for next in commits {
            if cancel.is_cancelled() {
                info!(processed, "run cancelled");
                let _ = results.send(Err(BlameError::Cancelled));
                return;
            }

            let outcome = next.and_then(|commit| {
                if self.store.contains(&commit.hash) {
                    debug!(commit = %commit.hash, "already processed, skipping");
                    return Ok(None);
                }
                self.process(&commit).map(Some)
            });

            match outcome {
                Ok(None) => {}
                Ok(Some(result)) => {
                    processed += 1;
                    if results.send(Ok(result)).is_err() {
                        debug!("result consumer went away, stopping");
                        return;
                    }
                }
                Err(err) => {
                    error!(%err, processed, "blame run failed");
                    let _ = results.send(Err(err));
                    return;
                }
            }
        }
        info!(processed, "blame run finished");
    }

    fn apply_groups(
        &self,
        commit: &Commit,
        groups: &[Vec<FileDiff>],
    ) -> Result<Vec<FileChange>, BlameError> {
        match groups {
            [] => Ok(Vec::new()),
            [diffs] if !commit.is_merge() => diffs
                .par_iter()
                .map(|diff| self.apply_single(commit, diff))
                .collect(),
            [diffs] if diffs.iter().all(|d| d.combined) => diffs
                .par_iter()
                .map(|diff| self.apply_combined(commit, diff))
                .collect(),
            _ if commit.is_merge() && groups.len() == commit.parents.len() => {
                let slots: Vec<_> = groups.iter().map(|g| Some(g.as_slice())).collect();
                self.apply_per_parent(commit, &slots)
            }
            _ if commit.is_merge()
                && groups.len() < commit.parents.len()
                && groups.iter().flatten().all(|d| !d.combined) =>
            {
                let slots = self.place_groups(commit, groups)?;
                self.apply_per_parent(commit, &slots)
            }
            _ => Err(InconsistencyError::DiffGroupMismatch {
                commit: commit.hash.to_string(),
                groups: groups.len(),
                parents: commit.parents.len(),
            }
            .into()),
        }
    }

    fn apply_single(&self, commit: &Commit, diff: &FileDiff) -> Result<FileChange, BlameError> {
        let hash = &commit.hash;
        if diff.is_deletion() {
            return Ok(FileChange::new(
                diff.path_before.as_str(),
                Blame::tombstone(hash.clone()),
            ));
        }
        if diff.is_binary {
            return Ok(FileChange::new(diff.path(), self.reseed(hash, diff.path())).vacating(diff));
        }
        if diff.is_creation() {
            let blame = apply_single_parent(None, diff, hash)?;
            debug!(commit = %hash, path = diff.path(), lines = blame.len(), "created");
            return Ok(FileChange::new(diff.path(), blame));
        }

        let parent = commit.parents.first();
        let previous = parent
            .and_then(|p| self.store.get(p, &diff.path_before))
            .ok_or_else(|| InconsistencyError::MissingParentSnapshot {
                commit: hash.to_string(),
                parent: parent.map_or_else(|| "(none)".to_string(), ToString::to_string),
                path: diff.path_before.clone(),
            })?;

        if diff.hunks.is_empty() {
            // Mode change or pure rename: same lines, same snapshot.
            return Ok(FileChange::new(diff.path(), previous.clone()).vacating(diff));
        }
        if previous.is_binary() {
            return Err(InconsistencyError::TextDiffOnBinary {
                commit: hash.to_string(),
                path: diff.path().to_string(),
            }
            .into());
        }

        let blame = apply_single_parent(Some(&**previous), diff, hash)?;
        debug!(commit = %hash, path = diff.path(), lines = blame.len(), "applied");
        Ok(FileChange::new(diff.path(), blame).vacating(diff))
    }

    fn apply_combined(&self, commit: &Commit, diff: &FileDiff) -> Result<FileChange, BlameError> {
        let hash = &commit.hash;
        if diff.is_deletion() {
            return Ok(FileChange::new(
                diff.path_before.as_str(),
                Blame::tombstone(hash.clone()),
            ));
        }
        if diff.is_rename() {
            return Err(unsupported_rename(hash, diff).into());
        }
        if diff.is_binary {
            return Ok(FileChange::new(diff.path(), self.reseed(hash, diff.path())));
        }

        let path = diff.path();
        let parents = commit
            .parents
            .iter()
            .enumerate()
            .map(|(i, parent)| {
                let needed = diff
                    .hunks
                    .iter()
                    .any(|h| h.old_location(i).is_some_and(|l| l.count > 0));
                match self.store.get(parent, path) {
                    Some(blame) if blame.is_binary() && !diff.hunks.is_empty() => {
                        Err(InconsistencyError::TextDiffOnBinary {
                            commit: hash.to_string(),
                            path: path.to_string(),
                        })
                    }
                    Some(blame) => Ok(Some(&**blame)),
                    None if needed => Err(InconsistencyError::MissingParentSnapshot {
                        commit: hash.to_string(),
                        parent: parent.to_string(),
                        path: path.to_string(),
                    }),
                    None => Ok(None),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let blame = apply_combined_merge(&parents, diff, hash)?;
        debug!(commit = %hash, path, lines = blame.len(), "applied combined merge");
        Ok(FileChange::new(path, blame))
    }

    /// Match the groups of a `-m` merge to parents when git printed fewer
    /// groups than there are parents.
    ///
    /// git prints nothing for a parent the merge result equals. Groups keep
    /// parent order, so each order-preserving placement is tried: a placed
    /// group's diffs must start from its parent's snapshot, and every parent
    /// left without a group must already hold what the diffs produce.
    /// Exactly one placement may fit.
    fn place_groups<'g>(
        &self,
        commit: &Commit,
        groups: &'g [Vec<FileDiff>],
    ) -> Result<Vec<Option<&'g [FileDiff]>>, BlameError> {
        let parents = &commit.parents;
        let fitting: Vec<Vec<usize>> = placements(parents.len(), groups.len())
            .into_iter()
            .filter(|placed| self.placement_fits(parents, groups, placed))
            .collect();

        let [placed] = fitting.as_slice() else {
            debug!(
                commit = %commit.hash,
                fitting = fitting.len(),
                "no single placement for diff groups"
            );
            return Err(InconsistencyError::DiffGroupMismatch {
                commit: commit.hash.to_string(),
                groups: groups.len(),
                parents: parents.len(),
            }
            .into());
        };

        debug!(commit = %commit.hash, ?placed, "placed diff groups");
        let mut slots = vec![None; parents.len()];
        for (group, parent) in groups.iter().zip(placed) {
            slots[*parent] = Some(group.as_slice());
        }
        Ok(slots)
    }

    fn placement_fits(
        &self,
        parents: &[CommitId],
        groups: &[Vec<FileDiff>],
        placed: &[usize],
    ) -> bool {
        parents
            .iter()
            .enumerate()
            .all(|(i, parent)| match placed.iter().position(|p| *p == i) {
                Some(g) => groups[g].iter().all(|diff| {
                    let before = self.store.get(parent, &diff.path_before);
                    diff_matches(before.map(|b| &**b), diff, Side::Before)
                }),
                None => groups.iter().flatten().all(|diff| {
                    let after = self.store.get(parent, diff.path());
                    diff_matches(after.map(|b| &**b), diff, Side::After)
                }),
            })
    }

    /// `slots[i]` holds the diffs against parent `i`, `None` when git printed none.
    fn apply_per_parent(
        &self,
        commit: &Commit,
        slots: &[Option<&[FileDiff]>],
    ) -> Result<Vec<FileChange>, BlameError> {
        let mut by_path: BTreeMap<&str, Vec<Option<&FileDiff>>> = BTreeMap::new();
        for (i, group) in slots.iter().enumerate() {
            for diff in group.iter().copied().flatten() {
                by_path
                    .entry(diff.path())
                    .or_insert_with(|| vec![None; slots.len()])[i] = Some(diff);
            }
        }

        let paths: Vec<_> = by_path.into_iter().collect();
        paths
            .par_iter()
            .map(|(path, diffs)| self.apply_per_parent_file(commit, path, diffs))
            .collect()
    }

    fn apply_per_parent_file(
        &self,
        commit: &Commit,
        path: &str,
        diffs: &[Option<&FileDiff>],
    ) -> Result<FileChange, BlameError> {
        let hash = &commit.hash;
        let present = || diffs.iter().flatten();

        if let Some(renamed) = present().find(|d| d.is_rename()) {
            return Err(unsupported_rename(hash, renamed).into());
        }
        if present().any(|d| d.is_deletion()) {
            return Ok(FileChange::new(path, Blame::tombstone(hash.clone())));
        }
        if present().any(|d| d.is_binary) {
            return Ok(FileChange::new(path, self.reseed(hash, path)));
        }

        let parents = commit
            .parents
            .iter()
            .zip(diffs)
            .map(|(parent, diff)| {
                if diff.is_some_and(FileDiff::is_creation) {
                    return Ok(None);
                }
                match self.store.get(parent, path) {
                    Some(blame) if blame.is_binary() => Err(InconsistencyError::TextDiffOnBinary {
                        commit: hash.to_string(),
                        path: path.to_string(),
                    }),
                    Some(blame) => Ok(Some(&**blame)),
                    None => Err(InconsistencyError::MissingParentSnapshot {
                        commit: hash.to_string(),
                        parent: parent.to_string(),
                        path: path.to_string(),
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let blame = apply_per_parent_merge(&parents, diffs, path, hash)?;
        debug!(commit = %hash, path, lines = blame.len(), "applied per-parent merge");
        Ok(FileChange::new(path, blame))
    }

    /// Fill in the files a merge's own diff left alone.
    ///
    /// Returns the merge's snapshot (without `changed`) and the files that
    /// had to be picked from one of several differing branches.
    fn resolve_merge(
        &self,
        commit: &Commit,
        changed: &BTreeMap<String, Arc<Blame>>,
    ) -> Result<(Snapshot, Vec<(String, Arc<Blame>)>), BlameError> {
        let mut candidates: BTreeMap<&str, Vec<&Arc<Blame>>> = BTreeMap::new();
        for files in commit.parents.iter().filter_map(|p| self.store.files(p)) {
            for (path, blame) in files {
                if changed.contains_key(path) {
                    continue;
                }
                let found = candidates.entry(path.as_str()).or_default();
                if found.iter().all(|c| c.id() != blame.id()) {
                    found.push(blame);
                }
            }
        }

        let mut root: Option<CommitId> = None;
        let mut files = Snapshot::with_capacity(candidates.len());
        let mut picked = Vec::new();

        for (path, found) in candidates {
            let chosen = match found.as_slice() {
                [] => continue,
                [only] => *only,
                _ => {
                    let base = match &root {
                        Some(base) => base.clone(),
                        None => {
                            let base = self.graph.last_common_parent(&commit.parents)?;
                            debug!(commit = %commit.hash, root = %base, "merge base");
                            root = Some(base.clone());
                            base
                        }
                    };
                    let chosen = pick_branch(&commit.hash, path, &found, self.store.get(&base, path))?;
                    picked.push((path.to_string(), chosen.clone()));
                    chosen
                }
            };
            files.insert(path.to_string(), chosen.clone());
        }

        Ok((files, picked))
    }

    fn reseed(&self, commit: &CommitId, path: &str) -> Blame {
        match self.source.full_blame(commit, path) {
            Some(blame) => {
                debug!(commit = %commit, path, lines = blame.len(), "reseeded from full blame");
                blame
            }
            None => Blame::binary(commit.clone()),
        }
    }
}

/// Choose among distinct snapshots of one path at a merge's parents: the
/// single one that differs from the merge base's.
fn pick_branch<'a>(
    commit: &CommitId,
    path: &str,
    found: &[&'a Arc<Blame>],
    base: Option<&Arc<Blame>>,
) -> Result<&'a Arc<Blame>, InconsistencyError> {
    let base = base.map(|b| b.id());
    let differing: Vec<&'a Arc<Blame>> = found
        .iter()
        .copied()
        .filter(|b| Some(b.id()) != base)
        .collect();

    match differing.as_slice() {
        [] => Ok(found[0]),
        [one] => Ok(*one),
        [first, rest @ ..] if rest.iter().all(|b| b.same_lines(first)) => {
            warn!(commit = %commit, path, "branches hold identical snapshots, taking the first");
            Ok(*first)
        }
        many => Err(InconsistencyError::DivergentMerge {
            commit: commit.to_string(),
            path: path.to_string(),
            branches: many.len(),
        }),
    }
}

/// Every order-preserving choice of `groups` parent indices out of `parents`.
fn placements(parents: usize, groups: usize) -> Vec<Vec<usize>> {
    if groups == 0 {
        return vec![Vec::new()];
    }
    (groups - 1..parents)
        .flat_map(|last| {
            placements(last, groups - 1).into_iter().map(move |mut placed| {
                placed.push(last);
                placed
            })
        })
        .collect()
}

fn unsupported_rename(commit: &CommitId, diff: &FileDiff) -> InconsistencyError {
    InconsistencyError::UnsupportedMergeRename {
        commit: commit.to_string(),
        from: diff.path_before.clone(),
        to: diff.path_after.clone(),
    }
}

/// The two pipeline threads: log parsing feeding the orchestrator, which
/// feeds [`Pipeline::results`].
pub struct Pipeline {
    results: Receiver<Result<CommitResult, BlameError>>,
    parser: JoinHandle<()>,
    worker: JoinHandle<Orchestrator>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn spawn<R>(orchestrator: Orchestrator, reader: R, options: &Options) -> Self
    where
        R: BufRead + Send + 'static,
    {
        Self::spawn_with_cancel(orchestrator, reader, options, CancelToken::new())
    }

    pub fn spawn_with_cancel<R>(
        orchestrator: Orchestrator,
        reader: R,
        options: &Options,
        cancel: CancelToken,
    ) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let capacity = options.queue_capacity.max(1);
        info!(capacity, merge_diffs = ?options.merge_diffs, "starting blame pipeline");

        let (commits, parser) = spawn_log_parser(reader, capacity);
        let (tx, results) = bounded(capacity);
        let token = cancel.clone();
        let worker = thread::spawn(move || {
            let mut orchestrator = orchestrator;
            orchestrator.run(&commits, &tx, &token);
            orchestrator
        });

        Self {
            results,
            parser,
            worker,
            cancel,
        }
    }

    /// Results in commit order. Ends after the last commit or the first error.
    pub fn results(&self) -> crossbeam_channel::Iter<'_, Result<CommitResult, BlameError>> {
        self.results.iter()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Wait for both threads and take the orchestrator back. Unread results
    /// are dropped.
    pub fn join(self) -> Result<Orchestrator, BlameError> {
        let Pipeline {
            results,
            parser,
            worker,
            ..
        } = self;
        drop(results);
        let orchestrator = worker.join().map_err(worker_panicked)?;
        parser.join().map_err(worker_panicked)?;
        Ok(orchestrator)
    }
}

fn worker_panicked(payload: Box<dyn Any + Send>) -> BlameError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    BlameError::WorkerPanicked { message }
}
