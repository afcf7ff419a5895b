//! Applying parsed diffs to parent snapshots.
//!
//! Three entry points, one per shape of history:
//! - [`apply_single_parent`] for ordinary commits and file creations
//! - [`apply_combined_merge`] for a merge described by one combined diff
//! - [`apply_per_parent_merge`] for a merge described by one two-way diff per parent

mod combined;

pub use combined::apply_combined_merge;

use crate::InconsistencyError;
use crate::diff::{FileDiff, Hunk};
use crate::model::{Blame, CommitId, Line};
use std::sync::Arc;

/// Apply a two-way diff to `parent` (or to nothing, for a created file).
///
/// Hunks are applied from the highest offset down so each one still finds
/// its lines where the header says they are.
pub fn apply_single_parent(
    parent: Option<&Blame>,
    diff: &FileDiff,
    commit: &CommitId,
) -> Result<Blame, InconsistencyError> {
    if let Some(found) = diff.parent_count().filter(|n| *n != 1) {
        return Err(InconsistencyError::ParentCountMismatch {
            commit: commit.to_string(),
            path: diff.path().to_string(),
            expected: 1,
            found,
        });
    }

    let mut lines: Vec<Arc<Line>> = parent.map(|b| b.lines().to_vec()).unwrap_or_default();

    for hunk in diff.hunks_descending() {
        let mut cursor = start_cursor(hunk, 0, lines.len(), diff, commit)?;

        for line in hunk.lines() {
            match line.column(0) {
                b'+' => {
                    lines.insert(cursor, Arc::new(Line::new(line.content, commit.clone())));
                    cursor += 1;
                }
                b'-' => {
                    check_cursor(cursor, lines.len(), hunk, diff, commit)?;
                    lines.remove(cursor);
                }
                _ => {
                    check_cursor(cursor, lines.len(), hunk, diff, commit)?;
                    cursor += 1;
                }
            }
        }
    }

    Ok(Blame::new(commit.clone(), lines))
}

/// Resolve a merge from one independently applied diff per parent.
///
/// `diffs[i]` is `None` when the merge result equals parent `i`. Every
/// candidate must end up with the same line count; each position then takes
/// the first candidate line, in parent order, that the merge itself did not
/// author.
pub fn apply_per_parent_merge(
    parents: &[Option<&Blame>],
    diffs: &[Option<&FileDiff>],
    path: &str,
    commit: &CommitId,
) -> Result<Blame, InconsistencyError> {
    if parents.len() != diffs.len() {
        return Err(InconsistencyError::ParentCountMismatch {
            commit: commit.to_string(),
            path: path.to_string(),
            expected: parents.len(),
            found: diffs.len(),
        });
    }

    let candidates = parents
        .iter()
        .zip(diffs)
        .map(|(parent, diff)| match diff {
            Some(diff) => apply_single_parent(*parent, diff, commit).map(|b| b.lines().to_vec()),
            None => Ok(parent.map(|b| b.lines().to_vec()).unwrap_or_default()),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let Some(first) = candidates.first() else {
        return Ok(Blame::new(commit.clone(), Vec::new()));
    };
    if let Some(other) = candidates.iter().find(|c| c.len() != first.len()) {
        return Err(InconsistencyError::CandidateLengthMismatch {
            commit: commit.to_string(),
            path: path.to_string(),
            expected: first.len(),
            found: other.len(),
        });
    }

    let lines = (0..first.len())
        .map(|i| {
            candidates
                .iter()
                .map(|c| &c[i])
                .find(|line| line.owner != *commit)
                .unwrap_or(&first[i])
                .clone()
        })
        .collect();

    Ok(Blame::new(commit.clone(), lines))
}

/// One side of a two-way diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    /// The parent's version: context and removed lines
    Before,
    /// The commit's version: context and added lines
    After,
}

/// Whether `snapshot` holds the lines `diff` shows on `side`.
///
/// Binary content is not compared, only whether the file is there.
pub(crate) fn diff_matches(snapshot: Option<&Blame>, diff: &FileDiff, side: Side) -> bool {
    if diff.parent_count().is_some_and(|n| n != 1) {
        return false;
    }
    let absent = match side {
        Side::Before => diff.is_creation(),
        Side::After => diff.is_deletion(),
    };
    if absent {
        return snapshot.is_none_or(|b| !b.is_binary() && b.is_empty());
    }
    let Some(snapshot) = snapshot else {
        return false;
    };
    if diff.is_binary || snapshot.is_binary() {
        return true;
    }

    let skipped = match side {
        Side::Before => b'+',
        Side::After => b'-',
    };
    let lines = snapshot.lines();
    diff.hunks.iter().all(|hunk| {
        let location = match side {
            Side::Before => hunk.old_location(0),
            Side::After => hunk.new_location(),
        };
        let Some(location) = location else {
            return false;
        };
        let mut cursor = location.start_index();
        hunk.lines()
            .filter(|line| line.column(0) != skipped)
            .all(|line| {
                let found = lines.get(cursor).is_some_and(|l| l.content == line.content);
                cursor += 1;
                found
            })
    })
}

/// Cursor for the first line `hunk` touches in the given parent's version.
fn start_cursor(
    hunk: &Hunk,
    parent: usize,
    len: usize,
    diff: &FileDiff,
    commit: &CommitId,
) -> Result<usize, InconsistencyError> {
    if hunk.lines().next().is_none() {
        return Err(InconsistencyError::EmptyHunk {
            commit: commit.to_string(),
            path: diff.path().to_string(),
            hunk: hunk.text(),
        });
    }

    let offset = hunk
        .old_location(parent)
        .map(|l| l.start_index())
        .unwrap_or(usize::MAX);
    if offset > len {
        return Err(out_of_range(offset, len, hunk, diff, commit));
    }
    Ok(offset)
}

fn check_cursor(
    cursor: usize,
    len: usize,
    hunk: &Hunk,
    diff: &FileDiff,
    commit: &CommitId,
) -> Result<(), InconsistencyError> {
    if cursor >= len {
        return Err(out_of_range(cursor, len, hunk, diff, commit));
    }
    Ok(())
}

fn out_of_range(
    offset: usize,
    len: usize,
    hunk: &Hunk,
    diff: &FileDiff,
    commit: &CommitId,
) -> InconsistencyError {
    InconsistencyError::HunkOutOfRange {
        commit: commit.to_string(),
        path: diff.path().to_string(),
        offset,
        len,
        hunk: hunk.text(),
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// An edit script over a file of `len` lines: per original line, whether
    /// to keep or drop it, and how many lines to insert before it.
    fn arb_edit(len: usize) -> impl Strategy<Value = (Vec<bool>, Vec<usize>)> {
        (
            prop::collection::vec(any::<bool>(), len..=len),
            prop::collection::vec(0..3usize, len + 1..=len + 1),
        )
    }

    /// Render an edit script as a single whole-file hunk.
    fn render(len: usize, keep: &[bool], inserts: &[usize]) -> (String, usize, usize) {
        let mut body = String::new();
        let (mut added, mut removed) = (0, 0);
        for i in 0..=len {
            for n in 0..inserts[i] {
                body.push_str(&format!("+new {i}.{n}\n"));
                added += 1;
            }
            if i < len {
                if keep[i] {
                    body.push_str(&format!(" line {i}\n"));
                } else {
                    body.push_str(&format!("-line {i}\n"));
                    removed += 1;
                }
            }
        }
        let new_len = len + added - removed;
        let text = format!(
            "diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -1,{len} +1,{new_len} @@\n{body}"
        );
        (text, added, removed)
    }

    proptest! {
        /// Result length is parent length minus deletions plus additions,
        /// and every line is owned by the commit or by the parent's owner.
        #[test]
        fn single_parent_line_count_law(len in 1..20usize, seed in any::<u64>()) {
            let keep: Vec<bool> = (0..len).map(|i| (seed >> (i % 64)) & 1 == 0).collect();
            let inserts: Vec<usize> = (0..=len).map(|i| ((seed >> ((i * 3) % 62)) & 3) as usize % 3).collect();
            let (text, added, removed) = render(len, &keep, &inserts);
            prop_assume!(added + removed > 0);

            let c1: CommitId = Arc::from("c1");
            let c2: CommitId = Arc::from("c2");
            let parent = Blame::new(
                c1.clone(),
                (0..len).map(|i| Arc::new(Line::new(format!("line {i}"), c1.clone()))).collect(),
            );
            let diff = FileDiff::parse(text.as_bytes()).unwrap();
            let result = apply_single_parent(Some(&parent), &diff, &c2).unwrap();

            prop_assert_eq!(result.len(), len - removed + added);
            prop_assert_eq!(result.len(), diff.hunks[0].new_location().unwrap().count);
            prop_assert_eq!(result.owners().filter(|o| *o == "c2").count(), added);
            prop_assert!(result.owners().all(|o| o == "c1" || o == "c2"));
        }

        /// Kept lines survive in order and keep their original owner.
        #[test]
        fn single_parent_keeps_surviving_lines((keep, inserts) in arb_edit(12)) {
            let len = 12;
            let (text, added, removed) = render(len, &keep, &inserts);
            prop_assume!(added + removed > 0);

            let c1: CommitId = Arc::from("c1");
            let parent = Blame::new(
                c1.clone(),
                (0..len).map(|i| Arc::new(Line::new(format!("line {i}"), c1.clone()))).collect(),
            );
            let diff = FileDiff::parse(text.as_bytes()).unwrap();
            let result = apply_single_parent(Some(&parent), &diff, &Arc::from("c2")).unwrap();

            let survivors: Vec<String> = result
                .lines()
                .iter()
                .filter(|l| l.owner.as_ref() == "c1")
                .map(|l| String::from_utf8_lossy(&l.content).into_owned())
                .collect();
            let expected: Vec<String> = (0..len).filter(|i| keep[*i]).map(|i| format!("line {i}")).collect();
            prop_assert_eq!(survivors, expected);
        }
    }
}
