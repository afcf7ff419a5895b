use super::ParseError;
use super::header::{DiffHeader, unquote};
use super::hunk::Hunk;
use std::cmp::Reverse;

/// Metadata lines git may write before the file markers that carry nothing
/// the blame needs.
const IGNORED_PREAMBLE: &[&str] = &[
    "index ",
    "mode ",
    "old mode ",
    "new mode ",
    "similarity index ",
    "dissimilarity index ",
    "copy from ",
    "copy to ",
];

/// A complete diff for a single file.
///
/// `path_before` is empty for a created file and `path_after` is empty for a
/// deleted one. Both are set, and differ, for a rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path_before: String,
    pub path_after: String,
    pub is_binary: bool,
    /// Came from a `diff --cc` / `diff --combined` block
    pub combined: bool,
    pub hunks: Vec<Hunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Preamble,
    NewMarker,
    HunkHeader,
    HunkBody,
    /// Binary payload follows; nothing left to read
    Binary,
}

impl FileDiff {
    /// Parse one file block from `git log -p` output.
    ///
    /// Expects input starting with a `diff --git`, `diff --cc` or
    /// `diff --combined` line. Trailing blank lines are ignored.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let mut lines: Vec<&[u8]> = block.split(|b| *b == b'\n').collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }

        let mut state = State::Header;
        let mut header = None;
        let mut header_line = String::new();
        let mut rename_from = None;
        let mut rename_to = None;
        let mut created = false;
        let mut deleted = false;
        let mut is_binary = false;
        let mut hunks: Vec<Hunk> = Vec::new();

        for raw in lines {
            match state {
                State::Header => {
                    header_line = String::from_utf8_lossy(raw).into_owned();
                    header = Some(DiffHeader::parse(&header_line)?);
                    state = State::Preamble;
                }
                State::Preamble => {
                    let line = String::from_utf8_lossy(raw);
                    if let Some(rest) = line.strip_prefix("rename from ") {
                        rename_from = Some(unquote(rest)?);
                    } else if let Some(rest) = line.strip_prefix("rename to ") {
                        rename_to = Some(unquote(rest)?);
                    } else if line.starts_with("new file") {
                        created = true;
                    } else if line.starts_with("deleted file") {
                        deleted = true;
                    } else if line.starts_with("Binary files") || line.starts_with("GIT binary patch") {
                        is_binary = true;
                        state = State::Binary;
                    } else if line.starts_with("--- ") {
                        state = State::NewMarker;
                    } else if !IGNORED_PREAMBLE.iter().any(|p| line.starts_with(p)) {
                        return Err(ParseError::UnexpectedPreambleLine {
                            line: line.into_owned(),
                        });
                    }
                }
                State::NewMarker => {
                    if !raw.starts_with(b"+++ ") {
                        return Err(ParseError::TruncatedDiff {
                            path: header_line.clone(),
                        });
                    }
                    state = State::HunkHeader;
                }
                State::HunkHeader | State::HunkBody if raw.first() == Some(&b'@') => {
                    let hunk = Hunk::parse_header(&String::from_utf8_lossy(raw))?;
                    if let Some(first) = hunks.first() {
                        if first.parent_count() != hunk.parent_count() {
                            return Err(ParseError::HunkParentsMismatch {
                                expected: first.parent_count(),
                                found: hunk.parent_count(),
                            });
                        }
                    }
                    hunks.push(hunk);
                    state = State::HunkBody;
                }
                State::HunkHeader => {
                    return Err(ParseError::MalformedHunkHeader {
                        line: String::from_utf8_lossy(raw).into_owned(),
                    });
                }
                State::HunkBody => {
                    if let Some(hunk) = hunks.last_mut() {
                        hunk.push_line(raw)?;
                    }
                }
                State::Binary => {}
            }
        }

        let header = header.ok_or_else(|| ParseError::MalformedHeader {
            line: String::new(),
        })?;
        if state == State::NewMarker {
            return Err(ParseError::TruncatedDiff { path: header_line });
        }

        let combined = matches!(header, DiffHeader::Combined { .. });
        if !combined {
            if let Some(hunk) = hunks.iter().find(|h| h.parent_count() != 1) {
                return Err(ParseError::HunkParentsMismatch {
                    expected: 1,
                    found: hunk.parent_count(),
                });
            }
        }

        let (mut path_before, mut path_after) = match header {
            DiffHeader::Git { paths: Some(paths) } => paths,
            DiffHeader::Combined { path } => (path.clone(), path),
            DiffHeader::Git { paths: None } => match (&rename_from, &rename_to) {
                (Some(from), Some(to)) => (from.clone(), to.clone()),
                _ => return Err(ParseError::AmbiguousPath { line: header_line }),
            },
        };
        if let Some(from) = rename_from {
            path_before = from;
        }
        if let Some(to) = rename_to {
            path_after = to;
        }
        if created {
            path_before.clear();
        }
        if deleted {
            path_after.clear();
            hunks.clear();
        }
        if is_binary {
            hunks.clear();
        }

        Ok(FileDiff {
            path_before,
            path_after,
            is_binary,
            combined,
            hunks,
        })
    }

    /// Path the diff is filed under: the new path, or the old one for a deletion.
    pub fn path(&self) -> &str {
        if self.path_after.is_empty() {
            &self.path_before
        } else {
            &self.path_after
        }
    }

    pub fn is_creation(&self) -> bool {
        self.path_before.is_empty()
    }

    pub fn is_deletion(&self) -> bool {
        self.path_after.is_empty()
    }

    pub fn is_rename(&self) -> bool {
        !self.is_creation() && !self.is_deletion() && self.path_before != self.path_after
    }

    /// Parents described by each hunk (1 for two-way diffs).
    pub fn parent_count(&self) -> Option<usize> {
        self.hunks.first().map(Hunk::parent_count)
    }

    /// Hunks ordered by descending offset in the first parent, so applying
    /// them in order never shifts a hunk that is still pending.
    pub fn hunks_descending(&self) -> Vec<&Hunk> {
        let mut hunks: Vec<&Hunk> = self.hunks.iter().collect();
        hunks.sort_by_key(|h| Reverse(h.old_location(0).map_or(0, |l| l.offset)));
        hunks
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn parse_single_hunk() {
        let diff = br#"diff --git a/flake.nix b/flake.nix
index abc1234..def5678 100644
--- a/flake.nix
+++ b/flake.nix
@@ -136,0 +137 @@
+      debug = true;
"#;
        let file_diff = FileDiff::parse(diff).unwrap();
        assert_eq!(file_diff.path_before, "flake.nix");
        assert_eq!(file_diff.path_after, "flake.nix");
        assert!(!file_diff.combined);
        assert_eq!(file_diff.hunks.len(), 1);
        assert_eq!(file_diff.hunks[0].body, b"+      debug = true;\n");
    }

    #[test]
    fn parse_multiple_hunks() {
        let diff = br#"diff --git a/config.nix b/config.nix
index fa2da6e..41114ff 100644
--- a/config.nix
+++ b/config.nix
@@ -1,3 +1,4 @@ line 1
 line 1
+# FIRST INSERTION
 line 2
 line 3
@@ -8,3 +9,4 @@ line 8
 line 8
+# SECOND INSERTION
 line 9
 line 10
"#;
        let file_diff = FileDiff::parse(diff).unwrap();
        assert_eq!(file_diff.hunks.len(), 2);
        assert_eq!(file_diff.hunks[0].old_location(0).unwrap().offset, 1);
        assert_eq!(file_diff.hunks[1].old_location(0).unwrap().offset, 8);

        let descending: Vec<usize> = file_diff
            .hunks_descending()
            .iter()
            .map(|h| h.old_location(0).unwrap().offset)
            .collect();
        assert_eq!(descending, vec![8, 1]);
    }

    #[test]
    fn parse_new_file() {
        let diff = b"diff --git a/main.go b/main.go
new file mode 100644
index 0000000..e69de29
--- /dev/null
+++ b/main.go
@@ -0,0 +1,2 @@
+package main
+
";
        let file_diff = FileDiff::parse(diff).unwrap();
        assert!(file_diff.is_creation());
        assert_eq!(file_diff.path(), "main.go");
        assert_eq!(file_diff.hunks[0].lines().count(), 2);
    }

    #[test]
    fn parse_empty_new_file() {
        let diff = b"diff --git a/empty b/empty
new file mode 100644
index 0000000..e69de29
";
        let file_diff = FileDiff::parse(diff).unwrap();
        assert!(file_diff.is_creation());
        assert!(file_diff.hunks.is_empty());
    }

    #[test]
    fn deleted_file_drops_hunks() {
        let diff = b"diff --git a/old.txt b/old.txt
deleted file mode 100644
index 3b18e51..0000000
--- a/old.txt
+++ /dev/null
@@ -1,2 +0,0 @@
-hello
-world
";
        let file_diff = FileDiff::parse(diff).unwrap();
        assert!(file_diff.is_deletion());
        assert_eq!(file_diff.path(), "old.txt");
        assert!(file_diff.hunks.is_empty());
    }

    #[test]
    fn pure_rename() {
        let diff = b"diff --git a/src/a.rs b/src/b.rs
similarity index 100%
rename from src/a.rs
rename to src/b.rs
";
        let file_diff = FileDiff::parse(diff).unwrap();
        assert!(file_diff.is_rename());
        assert_eq!(file_diff.path_before, "src/a.rs");
        assert_eq!(file_diff.path_after, "src/b.rs");
        assert!(file_diff.hunks.is_empty());
    }

    #[test]
    fn rename_lines_resolve_ambiguous_header() {
        let diff = b"diff --git a/x b/y b/x b/z
similarity index 90%
rename from x b/y
rename to x b/z
";
        let file_diff = FileDiff::parse(diff).unwrap();
        assert_eq!(file_diff.path_before, "x b/y");
        assert_eq!(file_diff.path_after, "x b/z");
    }

    #[test]
    fn ambiguous_header_without_rename_lines() {
        let diff = b"diff --git a/x b/y b/x b/z
index 1234567..89abcde 100644
";
        assert!(matches!(
            FileDiff::parse(diff),
            Err(ParseError::AmbiguousPath { .. })
        ));
    }

    #[test]
    fn binary_file_has_no_hunks() {
        let diff = b"diff --git a/logo.png b/logo.png
index 1234567..89abcde 100644
Binary files a/logo.png and b/logo.png differ
";
        let file_diff = FileDiff::parse(diff).unwrap();
        assert!(file_diff.is_binary);
        assert!(file_diff.hunks.is_empty());
    }

    #[test]
    fn binary_patch_payload_is_skipped() {
        let diff = b"diff --git a/logo.png b/logo.png
index 1234567..89abcde 100644
GIT binary patch
literal 12
TcmZ?wbhEHbRA6LaU|;|M2>=0U

";
        let file_diff = FileDiff::parse(diff).unwrap();
        assert!(file_diff.is_binary);
    }

    #[test]
    fn parse_combined_diff() {
        let diff = b"diff --cc f.txt
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
";
        let file_diff = FileDiff::parse(diff).unwrap();
        assert!(file_diff.combined);
        assert_eq!(file_diff.path_before, "f.txt");
        assert_eq!(file_diff.path_after, "f.txt");
        assert_eq!(file_diff.parent_count(), Some(2));
        assert_eq!(file_diff.hunks[0].lines().count(), 6);
    }

    #[test]
    fn combined_new_file() {
        let diff = b"diff --cc added.txt
new file mode 100644
index 0000000,0000000..3333333
--- /dev/null
+++ b/added.txt
@@@ -0,0 -0,0 +1,1 @@@
++fresh
";
        let file_diff = FileDiff::parse(diff).unwrap();
        assert!(file_diff.is_creation());
        assert_eq!(file_diff.path(), "added.txt");
    }

    #[test]
    fn combined_hunk_in_two_way_diff_is_rejected() {
        let diff = b"diff --git a/f b/f
--- a/f
+++ b/f
@@@ -1 -1 +1 @@@
  x
";
        assert!(matches!(
            FileDiff::parse(diff),
            Err(ParseError::HunkParentsMismatch { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn missing_new_marker() {
        let diff = b"diff --git a/f b/f
--- a/f
@@ -1 +1 @@
";
        assert!(matches!(
            FileDiff::parse(diff),
            Err(ParseError::TruncatedDiff { .. })
        ));
    }

    #[test]
    fn unknown_preamble_line() {
        let diff = b"diff --git a/f b/f
something odd
";
        assert!(matches!(
            FileDiff::parse(diff),
            Err(ParseError::UnexpectedPreambleLine { .. })
        ));
    }

    #[test]
    fn body_before_hunk_header() {
        let diff = b"diff --git a/f b/f
--- a/f
+++ b/f
+orphan
";
        assert!(matches!(
            FileDiff::parse(diff),
            Err(ParseError::MalformedHunkHeader { .. })
        ));
    }

    #[test]
    fn quoted_rename_paths() {
        let diff = br#"diff --git "a/tab\there" "b/tab\tthere"
similarity index 100%
rename from "tab\there"
rename to "tab\tthere"
"#;
        let file_diff = FileDiff::parse(diff).unwrap();
        assert_eq!(file_diff.path_before, "tab\there");
        assert_eq!(file_diff.path_after, "tab\tthere");
    }
}
