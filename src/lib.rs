//! Incremental per-line authorship for a whole repository history.
//!
//! Commits are read from `git log -p` text, each file diff is applied to the
//! parent's snapshot, and untouched files are carried forward by reference.
//!
//! # Examples
//! ```no_run
//! # use git_lineage::{GitLog, NoFullBlame, Options, Orchestrator, Pipeline};
//! let options = Options::default();
//! let mut log = GitLog::spawn(".", options.merge_diffs).unwrap();
//! let pipeline = Pipeline::spawn(
//!     Orchestrator::new(Box::new(NoFullBlame)),
//!     log.take_stdout().unwrap(),
//!     &options,
//! );
//! for result in pipeline.results() {
//!     let result = result.unwrap();
//!     println!("{} {}", result.commit, result.files.len());
//! }
//! ```

use error_set::error_set;

pub mod apply;
pub mod checkpoint;
pub mod diff;
pub mod git;
pub mod graph;
pub mod log;
pub mod model;
pub mod orchestrator;
pub mod store;

pub use apply::{apply_combined_merge, apply_per_parent_merge, apply_single_parent};
pub use checkpoint::{
    Checkpoint, CheckpointError, load_checkpoint, read_checkpoint, save_checkpoint,
    write_checkpoint,
};
pub use diff::{FileDiff, Hunk, HunkLocation, ParseError};
pub use git::{GitBlameSource, GitLog};
pub use graph::CommitGraph;
pub use log::{Commit, CommitLogParser, spawn_log_parser};
pub use model::{Blame, BlameId, CommitId, Line};
pub use orchestrator::{
    CancelToken, FullBlameSource, MergeDiffs, NoFullBlame, Options, Orchestrator, Pipeline,
};
pub use store::{CommitResult, SnapshotStore};

error_set! {
    /// Top-level error for a blame run
    BlameError := {
        ParseError(ParseError),
        CheckpointError(CheckpointError),
        #[display("Run cancelled")]
        Cancelled,
        #[display("Worker thread panicked: {message}")]
        WorkerPanicked { message: String },
    } || InconsistencyError || GitCommandError

    /// History that contradicts itself: diffs that do not fit their parents,
    /// merges that cannot be resolved, graph queries with no answer
    InconsistencyError := {
        #[display("{commit}: hunk at {offset} outside {path} ({len} lines):\n{hunk}")]
        HunkOutOfRange {
            commit: String,
            path: String,
            offset: usize,
            len: usize,
            hunk: String,
        },
        #[display("{commit}: empty hunk in {path}:\n{hunk}")]
        EmptyHunk {
            commit: String,
            path: String,
            hunk: String,
        },
        #[display("{commit}: merge candidates for {path} have {found} lines, expected {expected}")]
        CandidateLengthMismatch {
            commit: String,
            path: String,
            expected: usize,
            found: usize,
        },
        #[display("{commit}: {path} diff describes {found} parents, commit has {expected}")]
        ParentCountMismatch {
            commit: String,
            path: String,
            expected: usize,
            found: usize,
        },
        /// More than one branch edited a file the merge diff does not mention
        #[display("{commit}: {path} was changed on {branches} branches but not by the merge")]
        DivergentMerge {
            commit: String,
            path: String,
            branches: usize,
        },
        #[display("{commit}: no snapshot of {path} at parent {parent}")]
        MissingParentSnapshot {
            commit: String,
            parent: String,
            path: String,
        },
        #[display("{commit}: parent {parent} has not been processed")]
        UnknownParent { commit: String, parent: String },
        #[display("No common ancestor of {heads}")]
        GraphIncomplete { heads: String },
        #[display("Commit {commit} is not in the graph")]
        CommitNotInGraph { commit: String },
        #[display("{commit}: rename of {from} to {to} in a merge is not supported")]
        UnsupportedMergeRename {
            commit: String,
            from: String,
            to: String,
        },
        #[display("{commit}: {groups} diff groups for {parents} parents")]
        DiffGroupMismatch {
            commit: String,
            groups: usize,
            parents: usize,
        },
        #[display("{commit}: text diff for {path} whose parent snapshot is binary")]
        TextDiffOnBinary { commit: String, path: String },
    }

    /// Errors from git command execution
    GitCommandError := {
        #[display("Failed to spawn git {command}: {message}")]
        SpawnFailed { command: String, message: String },
        #[display("Failed to get stdout handle for git {command}")]
        StdoutUnavailable { command: String },
        #[display("Failed to wait for git {command}: {message}")]
        WaitFailed { command: String, message: String },
        #[display("git {command} failed: {stderr}")]
        ExitError { command: String, stderr: String },
    }
}
