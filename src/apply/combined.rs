use super::{check_cursor, start_cursor};
use crate::InconsistencyError;
use crate::diff::{BodyLine, FileDiff, Hunk};
use crate::model::{Blame, CommitId, Line};
use std::sync::Arc;

/// Read positions in every non-primary parent while scanning one hunk body.
///
/// Parent 0 is edited in place, so only parents `1..N` need their own
/// cursors. A cursor moves past a body line exactly when that line exists
/// in its parent: a `-` column on a removal, or a blank column on a line
/// that survives into the merge.
struct ParentCursors<'a> {
    parents: &'a [Option<&'a Blame>],
    offsets: Vec<usize>,
}

impl<'a> ParentCursors<'a> {
    fn new(
        parents: &'a [Option<&'a Blame>],
        hunk: &Hunk,
        diff: &FileDiff,
        commit: &CommitId,
    ) -> Result<Self, InconsistencyError> {
        let offsets = (0..parents.len())
            .map(|i| {
                let len = parents[i].map_or(0, Blame::len);
                if i == 0 {
                    Ok(0)
                } else {
                    start_cursor(hunk, i, len, diff, commit)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { parents, offsets })
    }

    /// Existing line an added line was taken from: the first non-primary
    /// parent that already had it.
    fn source_of(
        &self,
        line: &BodyLine<'_>,
        hunk: &Hunk,
        diff: &FileDiff,
        commit: &CommitId,
    ) -> Result<Option<Arc<Line>>, InconsistencyError> {
        let Some(parent) = (1..self.parents.len()).find(|&i| line.column(i) == b' ') else {
            return Ok(None);
        };
        let lines = self.parents[parent].map_or(&[][..], Blame::lines);
        let offset = self.offsets[parent];
        check_cursor(offset, lines.len(), hunk, diff, commit)?;
        Ok(Some(lines[offset].clone()))
    }

    fn advance(&mut self, line: &BodyLine<'_>) {
        for (i, offset) in self.offsets.iter_mut().enumerate().skip(1) {
            if line.in_parent(i) {
                *offset += 1;
            }
        }
    }
}

/// Apply a combined (`diff --cc`) merge diff.
///
/// The result starts as parent 0's lines. Column 0 of each body line edits
/// them; an added line keeps the owner it had in the first other parent whose
/// column shows it unchanged, and only lines new to every parent are owned
/// by `commit`.
pub fn apply_combined_merge(
    parents: &[Option<&Blame>],
    diff: &FileDiff,
    commit: &CommitId,
) -> Result<Blame, InconsistencyError> {
    if let Some(found) = diff.parent_count() {
        if found != parents.len() {
            return Err(InconsistencyError::ParentCountMismatch {
                commit: commit.to_string(),
                path: diff.path().to_string(),
                expected: parents.len(),
                found,
            });
        }
    }

    let primary = parents.first().copied().flatten();
    let mut lines: Vec<Arc<Line>> = primary.map(|b| b.lines().to_vec()).unwrap_or_default();

    for hunk in diff.hunks_descending() {
        let mut cursor = start_cursor(hunk, 0, lines.len(), diff, commit)?;
        let mut others = ParentCursors::new(parents, hunk, diff, commit)?;

        for line in hunk.lines() {
            if line.is_removal() {
                if line.column(0) == b'-' {
                    check_cursor(cursor, lines.len(), hunk, diff, commit)?;
                    lines.remove(cursor);
                }
            } else if line.column(0) == b'+' {
                let added = match others.source_of(&line, hunk, diff, commit)? {
                    Some(existing) => existing,
                    None => Arc::new(Line::new(line.content, commit.clone())),
                };
                lines.insert(cursor, added);
                cursor += 1;
            } else {
                check_cursor(cursor, lines.len(), hunk, diff, commit)?;
                cursor += 1;
            }
            others.advance(&line);
        }
    }

    Ok(Blame::new(commit.clone(), lines))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn id(s: &str) -> CommitId {
        Arc::from(s)
    }

    fn blame(commit: &str, rows: &[(&str, &str)]) -> Blame {
        Blame::new(
            id(commit),
            rows.iter()
                .map(|(owner, content)| Arc::new(Line::new(*content, id(owner))))
                .collect(),
        )
    }

    fn table(blame: &Blame) -> String {
        blame
            .lines()
            .iter()
            .map(|l| format!("{} {:?}\n", l.owner, String::from_utf8_lossy(&l.content)))
            .collect()
    }

    fn base_with(extra: Option<(usize, &'static str, &'static str)>) -> Vec<(&'static str, &'static str)> {
        let mut rows = vec![("c1", "L1"), ("c1", "L2"), ("c1", "L3"), ("c1", "L4")];
        if let Some((at, owner, content)) = extra {
            rows.insert(at, (owner, content));
        }
        rows
    }

    #[test]
    fn diverging_branches_keep_their_owners() {
        let left = blame("c2", &base_with(Some((3, "c2", "A"))));
        let right = blame("c3", &base_with(Some((3, "c3", "B"))));
        let diff = FileDiff::parse(
            b"diff --cc f.txt
index 1111111,2222222..3333333
--- a/f.txt
+++ b/f.txt
@@@ -1,5 -1,5 +1,6 @@@
  L1
  L2
  L3
 +A
+ B
  L4
",
        )
        .unwrap();

        let result = apply_combined_merge(&[Some(&left), Some(&right)], &diff, &id("c4")).unwrap();
        assert_eq!(result.len(), 6);
        insta::assert_snapshot!(table(&result), @r#"
        c1 "L1"
        c1 "L2"
        c1 "L3"
        c2 "A"
        c3 "B"
        c1 "L4"
        "#);
    }

    #[test]
    fn conflict_resolution_is_owned_by_merge() {
        let left = blame("c2", &[("c1", "x"), ("c2", "left"), ("c1", "y")]);
        let right = blame("c3", &[("c1", "x"), ("c3", "right"), ("c1", "y")]);
        let diff = FileDiff::parse(
            b"diff --cc f
index 1111111,2222222..3333333
--- a/f
+++ b/f
@@@ -1,3 -1,3 +1,3 @@@
  x
- left
 -right
++both
  y
",
        )
        .unwrap();

        let result = apply_combined_merge(&[Some(&left), Some(&right)], &diff, &id("c4")).unwrap();
        assert_eq!(result.owners().collect::<Vec<_>>(), vec!["c1", "c4", "c1"]);
        assert_eq!(result.lines()[1].content, b"both");
    }

    #[test]
    fn removal_only_in_other_parent_leaves_primary_alone() {
        // The second parent had an extra line the merge dropped; parent 0 never had it.
        let left = blame("c2", &[("c1", "a"), ("c2", "b")]);
        let right = blame("c3", &[("c1", "a"), ("c3", "gone"), ("c1", "c")]);
        let diff = FileDiff::parse(
            b"diff --cc f
--- a/f
+++ b/f
@@@ -1,2 -1,3 +1,2 @@@
  a
 -gone
 -c
 +b
",
        )
        .unwrap();

        let result = apply_combined_merge(&[Some(&left), Some(&right)], &diff, &id("c4")).unwrap();
        insta::assert_snapshot!(table(&result), @r#"
        c1 "a"
        c2 "b"
        "#);
    }

    #[test]
    fn octopus_merge_takes_first_parent_with_line() {
        let p0 = blame("c2", &[("c1", "top")]);
        let p1 = blame("c3", &[("c1", "top"), ("c3", "one")]);
        let p2 = blame("c4", &[("c1", "top"), ("c4", "two"), ("c4", "tail")]);
        let diff = FileDiff::parse(
            b"diff --cc f
--- a/f
+++ b/f
@@@@ -1,1 -1,2 -1,3 +1,5 @@@@
   top
+ +one
++ two
++ tail
+++brand new
",
        )
        .unwrap();

        let result =
            apply_combined_merge(&[Some(&p0), Some(&p1), Some(&p2)], &diff, &id("c5")).unwrap();
        insta::assert_snapshot!(table(&result), @r#"
        c1 "top"
        c3 "one"
        c4 "two"
        c4 "tail"
        c5 "brand new"
        "#);
    }

    #[test]
    fn file_new_in_one_parent() {
        let right = blame("c3", &[("c3", "hello")]);
        let diff = FileDiff::parse(
            b"diff --cc f
--- a/f
+++ b/f
@@@ -0,0 -1,1 +1,2 @@@
+ hello
++world
",
        )
        .unwrap();

        let result = apply_combined_merge(&[None, Some(&right)], &diff, &id("c4")).unwrap();
        assert_eq!(result.owners().collect::<Vec<_>>(), vec!["c3", "c4"]);
    }

    #[test]
    fn parent_count_must_match() {
        let left = blame("c2", &[("c1", "a")]);
        let diff = FileDiff::parse(
            b"diff --cc f
--- a/f
+++ b/f
@@@ -1 -1 +1,2 @@@
  a
++b
",
        )
        .unwrap();

        let err = apply_combined_merge(&[Some(&left)], &diff, &id("c4")).unwrap_err();
        assert!(matches!(
            err,
            InconsistencyError::ParentCountMismatch { expected: 1, found: 2, .. }
        ));
    }

    #[test]
    fn other_parent_offset_out_of_range() {
        let left = blame("c2", &[("c1", "a")]);
        let right = blame("c3", &[("c1", "a")]);
        let diff = FileDiff::parse(
            b"diff --cc f
--- a/f
+++ b/f
@@@ -1 -1,2 +1,2 @@@
  a
+ b
",
        )
        .unwrap();

        let err =
            apply_combined_merge(&[Some(&left), Some(&right)], &diff, &id("c4")).unwrap_err();
        assert!(matches!(err, InconsistencyError::HunkOutOfRange { .. }));
    }
}
