//! Parent links of every processed commit.

use crate::InconsistencyError;
use crate::model::CommitId;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct CommitGraph {
    parents: HashMap<CommitId, Vec<CommitId>>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, commit: CommitId, parents: Vec<CommitId>) {
        self.parents.insert(commit, parents);
    }

    pub fn parents(&self, commit: &str) -> Option<&[CommitId]> {
        self.parents.get(commit).map(Vec::as_slice)
    }

    pub fn contains(&self, commit: &str) -> bool {
        self.parents.contains_key(commit)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CommitId, &[CommitId])> {
        self.parents.iter().map(|(c, p)| (c, p.as_slice()))
    }

    /// Nearest commit that is an ancestor of (or equal to) every head.
    ///
    /// All heads walk back one generation at a time, so the first commit
    /// reached from every head is the nearest one. Ties go to the commit
    /// discovered first.
    pub fn last_common_parent(&self, heads: &[CommitId]) -> Result<CommitId, InconsistencyError> {
        let incomplete = || InconsistencyError::GraphIncomplete {
            heads: heads.join(", "),
        };
        if heads.is_empty() {
            return Err(incomplete());
        }
        if let Some(unknown) = heads.iter().find(|h| !self.contains(h)) {
            return Err(InconsistencyError::CommitNotInGraph {
                commit: unknown.to_string(),
            });
        }

        let mut reached: HashMap<&CommitId, Vec<bool>> = HashMap::new();
        let mut frontier: Vec<(&CommitId, usize)> = heads.iter().zip(0..).collect();

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for (commit, head) in frontier {
                let marks = reached
                    .entry(commit)
                    .or_insert_with(|| vec![false; heads.len()]);
                if marks[head] {
                    continue;
                }
                marks[head] = true;
                if marks.iter().all(|m| *m) {
                    return Ok(commit.clone());
                }
                if let Some(parents) = self.parents.get(commit) {
                    next.extend(parents.iter().map(|p| (p, head)));
                }
            }
            frontier = next;
        }

        Err(incomplete())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;
    use std::sync::Arc;

    fn graph(edges: &[(&str, &[&str])]) -> CommitGraph {
        let mut graph = CommitGraph::new();
        for (commit, parents) in edges {
            graph.insert(
                Arc::from(*commit),
                parents.iter().map(|p| Arc::from(*p)).collect(),
            );
        }
        graph
    }

    fn heads(names: &[&str]) -> Vec<CommitId> {
        names.iter().map(|n| Arc::from(*n)).collect()
    }

    #[test]
    fn diamond() {
        let g = graph(&[
            ("r", &[]),
            ("a", &["r"]),
            ("b1", &["r"]),
            ("b2", &["b1"]),
        ]);
        assert_eq!(&*g.last_common_parent(&heads(&["a", "b2"])).unwrap(), "r");
    }

    #[test]
    fn ancestor_head_is_its_own_answer() {
        let g = graph(&[("r", &[]), ("a", &["r"]), ("b", &["a"])]);
        assert_eq!(&*g.last_common_parent(&heads(&["b", "a"])).unwrap(), "a");
        assert_eq!(&*g.last_common_parent(&heads(&["b"])).unwrap(), "b");
    }

    #[test]
    fn nearest_ancestor_wins() {
        // r <- m <- x, r <- y, and both heads also reach r directly.
        let g = graph(&[
            ("r", &[]),
            ("m", &["r"]),
            ("x", &["m"]),
            ("y", &["m", "r"]),
        ]);
        assert_eq!(&*g.last_common_parent(&heads(&["x", "y"])).unwrap(), "m");
    }

    #[test]
    fn octopus_heads() {
        let g = graph(&[
            ("r", &[]),
            ("s", &["r"]),
            ("a", &["s"]),
            ("b", &["s"]),
            ("c", &["r"]),
        ]);
        assert_eq!(&*g.last_common_parent(&heads(&["a", "b", "c"])).unwrap(), "r");
    }

    #[test]
    fn disjoint_roots_are_incomplete() {
        let g = graph(&[("r1", &[]), ("r2", &[]), ("a", &["r1"]), ("b", &["r2"])]);
        let err = g.last_common_parent(&heads(&["a", "b"])).unwrap_err();
        assert_eq!(err.to_string(), "No common ancestor of a, b");
    }

    #[test]
    fn unknown_head() {
        let g = graph(&[("r", &[])]);
        assert!(matches!(
            g.last_common_parent(&heads(&["r", "zz"])),
            Err(InconsistencyError::CommitNotInGraph { commit }) if commit == "zz"
        ));
    }
}
