//! Per-line ownership snapshots.
//!
//! A [`Blame`] records, for one file at one commit, which commit last touched
//! each line. Blames are immutable once built and are shared by reference
//! between every commit that did not modify the file, so equality of two
//! snapshots is decided by their [`BlameId`], never by walking their lines.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Full commit hash, shared between every line and snapshot that names it.
pub type CommitId = Arc<str>;

static NEXT_BLAME_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`Blame`], assigned once at construction.
///
/// Two snapshots with the same id are the same snapshot. Ids are unique
/// within a process, including snapshots restored from a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlameId(u64);

impl BlameId {
    fn fresh() -> Self {
        BlameId(NEXT_BLAME_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Reuse an id read back from a checkpoint, keeping later fresh ids above it.
    pub(crate) fn restore(raw: u64) -> Self {
        NEXT_BLAME_ID.fetch_max(raw.saturating_add(1), Ordering::Relaxed);
        BlameId(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// One line of a file and the commit that last touched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub content: Vec<u8>,
    pub owner: CommitId,
}

impl Line {
    pub fn new(content: impl Into<Vec<u8>>, owner: CommitId) -> Self {
        Self {
            content: content.into(),
            owner,
        }
    }
}

/// Ownership snapshot of one file at one commit.
#[derive(Debug)]
pub struct Blame {
    id: BlameId,
    commit: CommitId,
    is_binary: bool,
    lines: Vec<Arc<Line>>,
}

impl Blame {
    /// Text snapshot built by `commit`.
    pub fn new(commit: CommitId, lines: Vec<Arc<Line>>) -> Self {
        Self {
            id: BlameId::fresh(),
            commit,
            is_binary: false,
            lines,
        }
    }

    /// Snapshot of a file whose content is binary at `commit`. Carries no lines.
    pub fn binary(commit: CommitId) -> Self {
        Self {
            id: BlameId::fresh(),
            commit,
            is_binary: true,
            lines: Vec::new(),
        }
    }

    /// Empty snapshot recorded for a file deleted by `commit`.
    pub fn tombstone(commit: CommitId) -> Self {
        Self::new(commit, Vec::new())
    }

    pub(crate) fn restore(
        id: BlameId,
        commit: CommitId,
        is_binary: bool,
        lines: Vec<Arc<Line>>,
    ) -> Self {
        Self {
            id,
            commit,
            is_binary,
            lines,
        }
    }

    pub fn id(&self) -> BlameId {
        self.id
    }

    /// Commit that built this snapshot.
    pub fn commit(&self) -> &CommitId {
        &self.commit
    }

    pub fn is_binary(&self) -> bool {
        self.is_binary
    }

    pub fn lines(&self) -> &[Arc<Line>] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Owners of every line, in file order.
    pub fn owners(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|line| line.owner.as_ref())
    }

    /// True when both snapshots hold the same ordered `(owner, content)` pairs.
    pub fn same_lines(&self, other: &Blame) -> bool {
        self.is_binary == other.is_binary
            && self.lines.len() == other.lines.len()
            && self
                .lines
                .iter()
                .zip(&other.lines)
                .all(|(a, b)| Arc::ptr_eq(a, b) || a == b)
    }
}

/// Renders one `owner<TAB>content` row per line.
impl fmt::Display for Blame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_binary {
            return writeln!(f, "{}\t<binary>", self.commit);
        }
        for line in &self.lines {
            writeln!(
                f,
                "{}\t{}",
                line.owner,
                String::from_utf8_lossy(&line.content)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn id(s: &str) -> CommitId {
        Arc::from(s)
    }

    #[test]
    fn fresh_ids_are_distinct() {
        let a = Blame::tombstone(id("c1"));
        let b = Blame::tombstone(id("c1"));
        assert!(a.id() != b.id());
    }

    #[test]
    fn restored_ids_stay_below_fresh_ones() {
        let restored = BlameId::restore(1_000_000);
        let next = Blame::tombstone(id("c1"));
        assert!(next.id() > restored);
    }

    #[test]
    fn binary_snapshot_has_no_lines() {
        let blame = Blame::binary(id("c1"));
        assert!(blame.is_binary());
        assert!(blame.is_empty());
        assert_eq!(blame.to_string(), "c1\t<binary>\n");
    }

    #[test]
    fn same_lines_compares_owner_and_content() {
        let shared = Arc::new(Line::new("a", id("c1")));
        let left = Blame::new(id("c2"), vec![shared.clone()]);
        let right = Blame::new(id("c3"), vec![Arc::new(Line::new("a", id("c1")))]);
        let other = Blame::new(id("c3"), vec![Arc::new(Line::new("a", id("c3")))]);
        assert!(left.same_lines(&right));
        assert!(!left.same_lines(&other));
    }

    #[test]
    fn render_rows() {
        let blame = Blame::new(
            id("c2"),
            vec![
                Arc::new(Line::new("fn main() {", id("c1"))),
                Arc::new(Line::new("}", id("c2"))),
            ],
        );
        assert_eq!(blame.to_string(), "c1\tfn main() {\nc2\t}\n");
    }
}
