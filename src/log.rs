//! Splitting `git log -p` output into commits.
//!
//! The log is expected in the form produced by
//! `--pretty=format:'!Hash: %H%n!Parents: %P'`: a hash line, a parents line,
//! then zero or more `diff ...` blocks. With `-m`, git repeats the header for
//! every parent of a merge; those repeats are folded into one [`Commit`].

use crate::BlameError;
use crate::diff::ParseError;
use crate::model::CommitId;
use crossbeam_channel::{Receiver, bounded};
use std::io::BufRead;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

const HASH_PREFIX: &[u8] = b"!Hash: ";
const PARENTS_PREFIX: &[u8] = b"!Parents:";

/// One commit and the raw text of its file diffs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub hash: CommitId,
    pub parents: Vec<CommitId>,
    /// One group of raw `diff ...` blocks per header git printed for this
    /// commit: a single group for `-c` output, one per parent for `-m`.
    /// Headers followed by no diff contribute no group.
    pub groups: Vec<Vec<Vec<u8>>>,
}

impl Commit {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingCommitHeader,
    AwaitingParentsLine,
    AwaitingDiffOrBlank,
    InsideDiffBlock,
}

/// One header and the blocks under it, before `-m` repeats are folded.
struct Record {
    hash: CommitId,
    parents: Vec<CommitId>,
    blocks: Vec<Vec<u8>>,
}

/// Iterator over the commits of a log stream.
///
/// A commit is yielded only once the header of the next commit (or the end
/// of input) has been read, so all its diff blocks are complete.
pub struct CommitLogParser<R> {
    reader: R,
    /// Hash line read while finishing the previous record
    carried_hash: Option<CommitId>,
    /// Record read ahead to check for an `-m` repeat
    pending: Option<Record>,
    failed: bool,
}

impl<R: BufRead> CommitLogParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            carried_hash: None,
            pending: None,
            failed: false,
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>, ParseError> {
        let mut hash = self.carried_hash.take();
        let mut parents = Vec::new();
        let mut blocks = Vec::new();
        let mut block: Vec<u8> = Vec::new();
        let mut state = if hash.is_some() {
            State::AwaitingParentsLine
        } else {
            State::AwaitingCommitHeader
        };

        let mut raw = Vec::new();
        loop {
            raw.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut raw)
                .map_err(|e| ParseError::LogReadFailed {
                    message: e.to_string(),
                })?;
            if read == 0 {
                break;
            }
            let line = raw.strip_suffix(b"\n").unwrap_or(&raw);

            match state {
                State::AwaitingCommitHeader => {
                    if line.is_empty() {
                        continue;
                    }
                    hash = Some(parse_hash(line)?);
                    state = State::AwaitingParentsLine;
                }
                State::AwaitingParentsLine => {
                    let rest = line
                        .strip_prefix(PARENTS_PREFIX)
                        .ok_or_else(|| unexpected(line))?;
                    parents = String::from_utf8_lossy(rest)
                        .split_whitespace()
                        .map(Arc::from)
                        .collect();
                    state = State::AwaitingDiffOrBlank;
                }
                State::AwaitingDiffOrBlank | State::InsideDiffBlock => {
                    if line.starts_with(HASH_PREFIX) {
                        self.carried_hash = Some(parse_hash(line)?);
                        break;
                    }
                    if line.starts_with(b"diff ") {
                        if state == State::InsideDiffBlock {
                            blocks.push(finish_block(std::mem::take(&mut block)));
                        }
                        state = State::InsideDiffBlock;
                    } else if state == State::AwaitingDiffOrBlank {
                        if line.is_empty() {
                            continue;
                        }
                        return Err(unexpected(line));
                    }
                    block.extend_from_slice(line);
                    block.push(b'\n');
                }
            }
        }

        let Some(hash) = hash else {
            return Ok(None);
        };
        if state == State::AwaitingParentsLine {
            return Err(ParseError::UnexpectedLogLine {
                line: format!("end of log after hash {hash}"),
            });
        }
        if state == State::InsideDiffBlock {
            blocks.push(finish_block(block));
        }
        Ok(Some(Record {
            hash,
            parents,
            blocks,
        }))
    }

    fn next_commit(&mut self) -> Result<Option<Commit>, ParseError> {
        let first = match self.pending.take() {
            Some(record) => record,
            None => match self.next_record()? {
                Some(record) => record,
                None => return Ok(None),
            },
        };

        let mut commit = Commit {
            hash: first.hash,
            parents: first.parents,
            groups: Vec::new(),
        };
        if !first.blocks.is_empty() {
            commit.groups.push(first.blocks);
        }

        while let Some(record) = self.next_record()? {
            if record.hash != commit.hash {
                self.pending = Some(record);
                break;
            }
            if !record.blocks.is_empty() {
                commit.groups.push(record.blocks);
            }
        }
        Ok(Some(commit))
    }
}

impl<R: BufRead> Iterator for CommitLogParser<R> {
    type Item = Result<Commit, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = self.next_commit();
        self.failed = next.is_err();
        next.transpose()
    }
}

/// Parse `reader` on its own thread, handing commits over a queue of at most
/// `capacity` entries. The first error is sent as the last item.
pub fn spawn_log_parser<R>(
    reader: R,
    capacity: usize,
) -> (Receiver<Result<Commit, BlameError>>, JoinHandle<()>)
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = bounded(capacity.max(1));
    let handle = thread::spawn(move || {
        let mut count = 0usize;
        for commit in CommitLogParser::new(reader) {
            if let Ok(commit) = &commit {
                debug!(commit = %commit.hash, groups = commit.groups.len(), "parsed commit");
                count += 1;
            }
            if tx.send(commit.map_err(BlameError::from)).is_err() {
                debug!("commit consumer went away, stopping log parser");
                return;
            }
        }
        info!(commits = count, "commit log parsed");
    });
    (rx, handle)
}

fn parse_hash(line: &[u8]) -> Result<CommitId, ParseError> {
    let hash = line
        .strip_prefix(HASH_PREFIX)
        .map(|h| String::from_utf8_lossy(h).trim().to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| unexpected(line))?;
    Ok(Arc::from(hash))
}

fn finish_block(mut block: Vec<u8>) -> Vec<u8> {
    while block.ends_with(b"\n\n") {
        block.pop();
    }
    block
}

fn unexpected(line: &[u8]) -> ParseError {
    ParseError::UnexpectedLogLine {
        line: String::from_utf8_lossy(line).into_owned(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn parse(text: &str) -> Vec<Commit> {
        CommitLogParser::new(text.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn text(block: &[u8]) -> &str {
        std::str::from_utf8(block).unwrap()
    }

    const LOG: &str = "!Hash: c1
!Parents:

diff --git a/a.txt b/a.txt
new file mode 100644
index 0000000..1111111
--- /dev/null
+++ b/a.txt
@@ -0,0 +1 @@
+hello
diff --git a/b.txt b/b.txt
new file mode 100644
--- /dev/null
+++ b/b.txt
@@ -0,0 +1 @@
+world

!Hash: c2
!Parents: c1

!Hash: c3
!Parents: c2
diff --git a/a.txt b/a.txt
--- a/a.txt
+++ b/a.txt
@@ -1 +1 @@
-hello
+hi
";

    #[test]
    fn splits_commits_and_blocks() {
        let commits = parse(LOG);
        assert_eq!(commits.len(), 3);

        assert_eq!(&*commits[0].hash, "c1");
        assert!(commits[0].parents.is_empty());
        assert_eq!(commits[0].groups.len(), 1);
        assert_eq!(commits[0].groups[0].len(), 2);
        assert!(text(&commits[0].groups[0][0]).ends_with("+hello\n"));
        assert_eq!(
            text(&commits[0].groups[0][1]).lines().next(),
            Some("diff --git a/b.txt b/b.txt")
        );
        assert!(text(&commits[0].groups[0][1]).ends_with("+world\n"));

        assert_eq!(&*commits[1].parents[0], "c1");
        assert!(commits[1].groups.is_empty());

        assert_eq!(commits[2].groups[0].len(), 1);
        assert!(text(&commits[2].groups[0][0]).ends_with("+hi\n"));
    }

    #[test]
    fn repeated_headers_become_groups() {
        let log = "!Hash: m
!Parents: p1 p2

diff --git a/f b/f
--- a/f
+++ b/f
@@ -1 +1 @@
-one
+merged

!Hash: m
!Parents: p1 p2

diff --git a/f b/f
--- a/f
+++ b/f
@@ -1 +1 @@
-two
+merged
!Hash: n
!Parents: m
";
        let commits = parse(log);
        assert_eq!(commits.len(), 2);
        assert!(commits[0].is_merge());
        assert_eq!(commits[0].groups.len(), 2);
        assert!(text(&commits[0].groups[1][0]).contains("-two\n"));
        assert_eq!(&*commits[1].hash, "n");
    }

    #[test]
    fn garbage_before_header() {
        let err = CommitLogParser::new(&b"commit abc\n"[..])
            .next()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.to_string(), "Unexpected line in commit log: commit abc");
    }

    #[test]
    fn missing_parents_line() {
        let mut parser = CommitLogParser::new(&b"!Hash: c1\ndiff --git a/x b/x\n"[..]);
        assert!(matches!(
            parser.next(),
            Some(Err(ParseError::UnexpectedLogLine { .. }))
        ));
        assert!(parser.next().is_none());
    }

    #[test]
    fn truncated_after_hash() {
        let mut parser = CommitLogParser::new(&b"!Hash: c1\n"[..]);
        assert!(matches!(parser.next(), Some(Err(_))));
    }

    #[test]
    fn producer_thread_delivers_in_order() {
        let (rx, handle) = spawn_log_parser(std::io::Cursor::new(LOG.as_bytes().to_vec()), 1);
        let hashes: Vec<String> = rx.iter().map(|c| c.unwrap().hash.to_string()).collect();
        handle.join().unwrap();
        assert_eq!(hashes, vec!["c1", "c2", "c3"]);
    }
}
