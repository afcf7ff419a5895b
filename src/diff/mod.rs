//! Parsing of per-file patch blocks from `git log -p` output.
//!
//! A block starts at its `diff --git` (two-way) or `diff --cc` (combined,
//! one prefix column per merge parent) line and runs to the next block. The
//! parser only structures the text; interpreting the prefix columns is left to
//! [`crate::apply`].

use error_set::error_set;

pub mod file;
pub mod header;
pub mod hunk;

pub use file::FileDiff;
pub use hunk::{BodyLine, Hunk, HunkLocation, LocationOp};

error_set! {
    /// Errors from reading patch and commit log text
    ParseError := {
        /// First line of a block is not a diff header
        #[display("Malformed diff header: {line}")]
        MalformedHeader { line: String },
        /// `@@ … @@` line with bad numbers or a marker that disagrees with its locations
        #[display("Malformed hunk header: {line}")]
        MalformedHunkHeader { line: String },
        /// Body line whose prefix columns are not ' ', '-' or '+'
        #[display("Malformed hunk line: {line}")]
        MalformedHunkLine { line: String },
        /// Line between the header and the first hunk that git never writes there
        #[display("Unexpected line in diff preamble: {line}")]
        UnexpectedPreambleLine { line: String },
        /// `---` marker without the `+++` marker after it
        #[display("Diff for {path} ends inside its file markers")]
        TruncatedDiff { path: String },
        /// Renamed path containing spaces with no `rename` lines to resolve it
        #[display("Cannot tell the paths apart in '{line}'")]
        AmbiguousPath { line: String },
        #[display("Malformed quoted path {path}")]
        MalformedPath { path: String },
        /// Hunks of one block disagree on how many parents they describe
        #[display("Hunk describes {found} parents, expected {expected}")]
        HunkParentsMismatch { expected: usize, found: usize },
        #[display("Unexpected line in commit log: {line}")]
        UnexpectedLogLine { line: String },
        #[display("Failed to read commit log: {message}")]
        LogReadFailed { message: String },
    }
}
