//! Saving and restoring the snapshot store.
//!
//! A checkpoint is a format marker and a header followed by record streams,
//! each written with `bincode`:
//!
//! | stream    | record                                   |
//! |-----------|------------------------------------------|
//! | names     | commit hash                              |
//! | paths     | file path                                |
//! | line data | distinct line contents                   |
//! | lines     | (owner name, line data) pairs            |
//! | blames    | id, commit name, binary flag, line refs  |
//! | commits   | commit name and parent names             |
//! | rows      | (commit name, path, blame) per store entry |
//!
//! Line data and lines are written once per distinct content; blames once
//! per [`BlameId`]. Reading rebuilds one shared [`Blame`] per record, so
//! entries that were carried forward from a parent are still shared, and
//! still id-equal, after a reload.

use crate::graph::CommitGraph;
use crate::model::{Blame, BlameId, CommitId, Line};
use crate::orchestrator::{FullBlameSource, Orchestrator};
use crate::store::{Snapshot, SnapshotStore};
use error_set::error_set;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::hash::Hash;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const FORMAT: [u8; 8] = *b"GITLINEG";
const VERSION: u32 = 1;

error_set! {
    /// Errors from writing or reading a checkpoint
    CheckpointError := {
        #[display("Failed to write checkpoint {path}: {message}")]
        WriteFailed { path: String, message: String },
        #[display("Failed to read checkpoint {path}: {message}")]
        ReadFailed { path: String, message: String },
        #[display("Failed to encode checkpoint: {message}")]
        EncodeFailed { message: String },
        #[display("Failed to decode checkpoint: {message}")]
        DecodeFailed { message: String },
        #[display("Not a checkpoint file")]
        BadFormat,
        #[display("Unsupported checkpoint version {version}")]
        UnsupportedVersion { version: u32 },
        #[display("Checkpoint refers to missing {table} record {index}")]
        DanglingReference { table: String, index: u32 },
        #[display("Too many {table} records for a checkpoint")]
        TooManyRecords { table: String },
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    version: u32,
    last_commit: Option<u32>,
    names: u32,
    paths: u32,
    data: u32,
    lines: u32,
    blames: u32,
    commits: u32,
    rows: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LineRecord {
    owner: u32,
    data: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlameRecord {
    id: u64,
    commit: u32,
    is_binary: bool,
    lines: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitRecord {
    commit: u32,
    parents: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RowRecord {
    commit: u32,
    path: u32,
    blame: u32,
}

/// Distinct values in first-seen order, each with its record index.
struct Table<K> {
    name: &'static str,
    index: HashMap<K, u32>,
    items: Vec<K>,
}

impl<K: Hash + Eq + Clone> Table<K> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            index: HashMap::new(),
            items: Vec::new(),
        }
    }

    fn intern(&mut self, key: K) -> Result<u32, CheckpointError> {
        if let Some(i) = self.index.get(&key) {
            return Ok(*i);
        }
        let i = record_index(self.items.len(), self.name)?;
        self.items.push(key.clone());
        self.index.insert(key, i);
        Ok(i)
    }

    fn len(&self) -> Result<u32, CheckpointError> {
        record_index(self.items.len(), self.name)
    }
}

fn record_index(len: usize, table: &str) -> Result<u32, CheckpointError> {
    u32::try_from(len).map_err(|_| CheckpointError::TooManyRecords {
        table: table.to_string(),
    })
}

/// Everything needed to resume a run.
#[derive(Debug, Default)]
pub struct Checkpoint {
    pub store: SnapshotStore,
    pub graph: CommitGraph,
    pub last_commit: Option<CommitId>,
}

impl Checkpoint {
    pub fn into_orchestrator(self, source: Box<dyn FullBlameSource>) -> Orchestrator {
        Orchestrator::from_parts(self.store, self.graph, self.last_commit, source)
    }
}

/// Write `store` and `graph` to `writer`.
///
/// Must not run while the store is being modified; the orchestrator's
/// exclusive ownership of its store guarantees this.
pub fn write_checkpoint<W: Write>(
    writer: &mut W,
    store: &SnapshotStore,
    graph: &CommitGraph,
    last_commit: Option<&CommitId>,
) -> Result<(), CheckpointError> {
    let mut names: Table<CommitId> = Table::new("name");
    let mut paths: Table<&str> = Table::new("path");
    let mut data: Table<&[u8]> = Table::new("line data");
    let mut lines: Table<(u32, u32)> = Table::new("line");
    let mut blame_index: HashMap<BlameId, u32> = HashMap::new();
    let mut blames: Vec<BlameRecord> = Vec::new();
    let mut commits: Vec<CommitRecord> = Vec::new();
    let mut rows: Vec<RowRecord> = Vec::new();

    let mut graph_commits: Vec<_> = graph.iter().collect();
    graph_commits.sort_by(|a, b| a.0.cmp(b.0));
    for (commit, parents) in graph_commits {
        let commit = names.intern(commit.clone())?;
        let parents = parents
            .iter()
            .map(|p| names.intern(p.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        commits.push(CommitRecord { commit, parents });
    }

    let mut stored: Vec<_> = store.iter().collect();
    stored.sort_by(|a, b| a.0.cmp(b.0));
    for (commit, files) in stored {
        let commit = names.intern(commit.clone())?;
        let mut files: Vec<_> = files.iter().collect();
        files.sort_by(|a, b| a.0.cmp(b.0));

        for (path, blame) in files {
            let blame_ref = match blame_index.get(&blame.id()) {
                Some(i) => *i,
                None => {
                    let line_refs = blame
                        .lines()
                        .iter()
                        .map(|line| {
                            let owner = names.intern(line.owner.clone())?;
                            let content = data.intern(&line.content)?;
                            lines.intern((owner, content))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let i = record_index(blames.len(), "blame")?;
                    blames.push(BlameRecord {
                        id: blame.id().get(),
                        commit: names.intern(blame.commit().clone())?,
                        is_binary: blame.is_binary(),
                        lines: line_refs,
                    });
                    blame_index.insert(blame.id(), i);
                    i
                }
            };
            rows.push(RowRecord {
                commit,
                path: paths.intern(path.as_str())?,
                blame: blame_ref,
            });
        }
    }

    let last_commit = last_commit.map(|c| names.intern(c.clone())).transpose()?;
    let header = Header {
        version: VERSION,
        last_commit,
        names: names.len()?,
        paths: paths.len()?,
        data: data.len()?,
        lines: lines.len()?,
        blames: record_index(blames.len(), "blame")?,
        commits: record_index(commits.len(), "commit")?,
        rows: record_index(rows.len(), "row")?,
    };

    encode(writer, &FORMAT)?;
    encode(writer, &header)?;
    for name in &names.items {
        encode(writer, &name.as_ref())?;
    }
    for path in &paths.items {
        encode(writer, path)?;
    }
    for content in &data.items {
        encode(writer, content)?;
    }
    for (owner, content) in &lines.items {
        encode(writer, &LineRecord {
            owner: *owner,
            data: *content,
        })?;
    }
    for record in &blames {
        encode(writer, record)?;
    }
    for record in &commits {
        encode(writer, record)?;
    }
    for record in &rows {
        encode(writer, record)?;
    }
    Ok(())
}

/// Read a checkpoint written by [`write_checkpoint`].
pub fn read_checkpoint<R: Read>(reader: &mut R) -> Result<Checkpoint, CheckpointError> {
    let format: [u8; 8] = decode(reader)?;
    if format != FORMAT {
        return Err(CheckpointError::BadFormat);
    }
    let header: Header = decode(reader)?;
    if header.version != VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            version: header.version,
        });
    }

    let names: Vec<CommitId> = (0..header.names)
        .map(|_| decode::<_, String>(reader).map(Arc::from))
        .collect::<Result<_, _>>()?;
    let paths: Vec<String> = decode_all(reader, header.paths)?;
    let data: Vec<Vec<u8>> = decode_all(reader, header.data)?;

    let lines = (0..header.lines)
        .map(|_| {
            let record: LineRecord = decode(reader)?;
            Ok(Arc::new(Line::new(
                lookup(&data, record.data, "line data")?.clone(),
                lookup(&names, record.owner, "name")?.clone(),
            )))
        })
        .collect::<Result<Vec<_>, CheckpointError>>()?;

    let blames = (0..header.blames)
        .map(|_| {
            let record: BlameRecord = decode(reader)?;
            let lines = record
                .lines
                .iter()
                .map(|i| lookup(&lines, *i, "line").cloned())
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(Blame::restore(
                BlameId::restore(record.id),
                lookup(&names, record.commit, "name")?.clone(),
                record.is_binary,
                lines,
            )))
        })
        .collect::<Result<Vec<_>, CheckpointError>>()?;

    let mut graph = CommitGraph::new();
    for _ in 0..header.commits {
        let record: CommitRecord = decode(reader)?;
        let parents = record
            .parents
            .iter()
            .map(|p| lookup(&names, *p, "name").cloned())
            .collect::<Result<Vec<_>, _>>()?;
        graph.insert(lookup(&names, record.commit, "name")?.clone(), parents);
    }

    let mut snapshots: HashMap<CommitId, Snapshot> = graph
        .iter()
        .map(|(commit, _)| (commit.clone(), Snapshot::new()))
        .collect();
    for _ in 0..header.rows {
        let record: RowRecord = decode(reader)?;
        let commit = lookup(&names, record.commit, "name")?;
        snapshots.entry(commit.clone()).or_default().insert(
            lookup(&paths, record.path, "path")?.clone(),
            lookup(&blames, record.blame, "blame")?.clone(),
        );
    }

    let mut store = SnapshotStore::new();
    for (commit, files) in snapshots {
        store.insert(commit, files);
    }
    let last_commit = header
        .last_commit
        .map(|i| lookup(&names, i, "name").cloned())
        .transpose()?;

    Ok(Checkpoint {
        store,
        graph,
        last_commit,
    })
}

/// Write a checkpoint of `orchestrator` to `path`, replacing it atomically.
pub fn save_checkpoint(path: &Path, orchestrator: &Orchestrator) -> Result<(), CheckpointError> {
    let write_failed = |e: std::io::Error| CheckpointError::WriteFailed {
        path: path.display().to_string(),
        message: e.to_string(),
    };

    let partial = partial_path(path);
    let mut writer = BufWriter::new(File::create(&partial).map_err(write_failed)?);
    write_checkpoint(
        &mut writer,
        orchestrator.store(),
        orchestrator.graph(),
        orchestrator.last_commit(),
    )?;
    writer
        .into_inner()
        .map_err(|e| write_failed(e.into_error()))?
        .sync_all()
        .map_err(write_failed)?;
    fs::rename(&partial, path).map_err(write_failed)?;

    info!(
        path = %path.display(),
        commits = orchestrator.store().len(),
        "checkpoint saved"
    );
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let file = File::open(path).map_err(|e| CheckpointError::ReadFailed {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let checkpoint = read_checkpoint(&mut BufReader::new(file))?;
    info!(
        path = %path.display(),
        commits = checkpoint.store.len(),
        last_commit = checkpoint.last_commit.as_deref(),
        "checkpoint loaded"
    );
    Ok(checkpoint)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

fn encode<W: Write, T: Serialize + ?Sized>(writer: &mut W, value: &T) -> Result<(), CheckpointError> {
    bincode::serialize_into(writer, value).map_err(|e| CheckpointError::EncodeFailed {
        message: e.to_string(),
    })
}

fn decode<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, CheckpointError> {
    bincode::deserialize_from(reader).map_err(|e| CheckpointError::DecodeFailed {
        message: e.to_string(),
    })
}

fn decode_all<R: Read, T: DeserializeOwned>(reader: &mut R, count: u32) -> Result<Vec<T>, CheckpointError> {
    (0..count).map(|_| decode(reader)).collect()
}

fn lookup<'a, T>(items: &'a [T], index: u32, table: &str) -> Result<&'a T, CheckpointError> {
    items
        .get(index as usize)
        .ok_or_else(|| CheckpointError::DanglingReference {
            table: table.to_string(),
            index,
        })
}
