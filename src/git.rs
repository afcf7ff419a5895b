//! The git subprocesses: the history log that drives a run and the
//! whole-file blame used to reseed files the log cannot follow.

use crate::GitCommandError;
use crate::model::{Blame, CommitId, Line};
use crate::orchestrator::{FullBlameSource, MergeDiffs};
use std::collections::HashMap;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Bytes git inspects when deciding whether content is binary.
const BINARY_PROBE: usize = 8000;

/// A running `git log -p`, oldest commit first.
pub struct GitLog {
    child: Child,
    /// Collects stderr while stdout is being read, so git never blocks on it
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl GitLog {
    pub fn spawn(repo: impl AsRef<Path>, merge_diffs: MergeDiffs) -> Result<Self, GitCommandError> {
        let repo = repo.as_ref();
        let mut child = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args([
                "log",
                "-p",
                "-M",
                merge_diffs.log_flag(),
                "--reverse",
                "--topo-order",
                "--no-abbrev-commit",
                "--no-ext-diff",
                "--no-color",
                "--pretty=format:!Hash: %H%n!Parents: %P",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GitCommandError::SpawnFailed {
                command: "log".to_string(),
                message: e.to_string(),
            })?;

        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        info!(repo = %repo.display(), flag = merge_diffs.log_flag(), "spawned git log");
        Ok(Self { child, stderr })
    }

    /// The log text. Can be taken once.
    pub fn take_stdout(&mut self) -> Result<BufReader<ChildStdout>, GitCommandError> {
        self.child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| GitCommandError::StdoutUnavailable {
                command: "log".to_string(),
            })
    }

    /// Wait for git to exit and check its status.
    pub fn wait(mut self) -> Result<(), GitCommandError> {
        // Unread output would keep git blocked on a full pipe.
        drop(self.child.stdout.take());
        let status = self.child.wait().map_err(|e| GitCommandError::WaitFailed {
            command: "log".to_string(),
            message: e.to_string(),
        })?;
        let stderr = self
            .stderr
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        check_status("log", status, &stderr)
    }
}

/// Reseeds files from `git blame` at the commit in question.
#[derive(Debug, Clone)]
pub struct GitBlameSource {
    repo: PathBuf,
}

impl GitBlameSource {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    fn git(&self, command: &str, args: &[&str]) -> Result<Vec<u8>, GitCommandError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .arg(command)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| GitCommandError::SpawnFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;
        check_status(command, output.status, &output.stderr)?;
        Ok(output.stdout)
    }

    fn blame(&self, commit: &CommitId, path: &str) -> Result<Option<Blame>, GitCommandError> {
        let content = self.git("show", &[format!("{commit}:{path}").as_str()])?;
        if is_binary(&content) {
            return Ok(None);
        }
        let porcelain = self.git("blame", &["--line-porcelain", &**commit, "--", path])?;
        Ok(Some(Blame::new(commit.clone(), parse_porcelain(&porcelain))))
    }
}

impl FullBlameSource for GitBlameSource {
    fn full_blame(&self, commit: &CommitId, path: &str) -> Option<Blame> {
        match self.blame(commit, path) {
            Ok(Some(blame)) => {
                debug!(%commit, path, lines = blame.len(), "git blame");
                Some(blame)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(%commit, path, %err, "git blame failed, keeping file as binary");
                None
            }
        }
    }
}

fn check_status(command: &str, status: ExitStatus, stderr: &[u8]) -> Result<(), GitCommandError> {
    if !status.success() {
        return Err(GitCommandError::ExitError {
            command: command.to_string(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        });
    }
    Ok(())
}

/// git's own heuristic: a NUL byte near the start.
fn is_binary(content: &[u8]) -> bool {
    content[..content.len().min(BINARY_PROBE)].contains(&0)
}

/// Lines of `git blame --line-porcelain` output with their commits.
///
/// Every line starts with a `<hash> <orig> <final> [<count>]` header, then
/// `key value` fields, then the content behind a tab.
fn parse_porcelain(output: &[u8]) -> Vec<Arc<Line>> {
    let mut owners: HashMap<&[u8], CommitId> = HashMap::new();
    let mut current: Option<CommitId> = None;
    let mut lines = Vec::new();

    for row in output.split(|b| *b == b'\n') {
        if let Some(content) = row.strip_prefix(b"\t") {
            if let Some(owner) = &current {
                lines.push(Arc::new(Line::new(content, owner.clone())));
            }
            continue;
        }
        let Some(token) = row.split(|b| *b == b' ').next() else {
            continue;
        };
        if is_hash(token) {
            let owner = owners
                .entry(token)
                .or_insert_with(|| Arc::from(&*String::from_utf8_lossy(token)));
            current = Some(owner.clone());
        }
    }
    lines
}

fn is_hash(token: &[u8]) -> bool {
    matches!(token.len(), 40 | 64) && token.iter().all(u8::is_ascii_hexdigit)
}
