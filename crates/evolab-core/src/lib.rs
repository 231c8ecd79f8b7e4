//! Shared primitives for the evolab workspace: durable filesystem helpers,
//! run-directory naming, and the generic indexed time-series abstraction used
//! by every tool that touches experiment data files.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Write bytes to `path` and fsync the file. The file is visible under its
/// final name while being written; use [`atomic_write_bytes`] when readers
/// must never observe a partial file.
pub fn write_bytes_durable(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Write-temp-then-rename. A crash at any point leaves either the old file or
/// the new file under `path`, never a partial write.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Append a single newline-terminated line and fsync. Used for append-only
/// audit logs where each line is a commit marker.
pub fn append_line_durable(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    Ok(sha256_bytes(&fs::read(path)?))
}

/// Content digest of a directory tree: relative paths plus file bytes, in
/// sorted walk order. Two trees with identical payloads digest identically
/// regardless of where they live.
pub fn sha256_dir(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if entry.file_type().is_file() {
            hasher.update(fs::read(entry.path())?);
            hasher.update([0u8]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Name of a snapshot directory for a given index.
pub const SNAPSHOT_PREFIX: &str = "pop_";

/// Parse a snapshot directory name of the form `pop_<index>`. Rejects empty,
/// non-numeric, and leading-zero indices so each index has exactly one
/// spelling.
pub fn snapshot_index(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(SNAPSHOT_PREFIX)?;
    parse_strict_u64(digits)
}

pub fn snapshot_dir_name(index: u64) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, index)
}

/// Base-10 integer with no sign and no leading zeros beyond "0" itself.
pub fn parse_strict_u64(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

/// A base run directory name of the form `<treatment>__<runId>`.
///
/// The run id follows the final `__`; the treatment label is everything
/// before it. Parsed once at discovery time so malformed names fail fast
/// instead of being re-split at each use site.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunName {
    pub treatment: String,
    pub run_id: String,
}

impl RunName {
    pub fn parse(name: &str) -> Option<Self> {
        // A colon marks a continuation directory, never a base run.
        if name.contains(':') {
            return None;
        }
        let (treatment, run_id) = name.rsplit_once("__")?;
        if treatment.is_empty() || run_id.is_empty() {
            return None;
        }
        Some(RunName {
            treatment: treatment.to_string(),
            run_id: run_id.to_string(),
        })
    }

    pub fn dir_name(&self) -> String {
        format!("{}__{}", self.treatment, self.run_id)
    }
}

impl fmt::Display for RunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}__{}", self.treatment, self.run_id)
    }
}

/// Enumerate base run directories under an experiment root, sorted by name.
/// Entries that do not parse as run names (continuations included) are
/// skipped.
pub fn list_runs(root: &Path) -> io::Result<Vec<(RunName, PathBuf)>> {
    let mut runs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(run) = RunName::parse(name) {
            runs.push((run, entry.path()));
        }
    }
    runs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(runs)
}

#[derive(Debug, Error)]
pub enum SeriesError {
    #[error("failed to read series {path}: {source}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },
    #[error("series {path} is missing its header line")]
    MissingHeader { path: PathBuf },
    #[error("{path}:{line}: record has {found} fields, schema has {expected}")]
    FieldCount {
        path: PathBuf,
        line: usize,
        found: usize,
        expected: usize,
    },
    #[error("{path}:{line}: invalid index field {value:?}")]
    BadIndex {
        path: PathBuf,
        line: usize,
        value: String,
    },
    #[error("{path}:{line}: index {index} does not increase over {prev}")]
    NonMonotonic {
        path: PathBuf,
        line: usize,
        index: u64,
        prev: u64,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Pluggable record serializer for indexed series files. The first schema
/// field is always the index field.
pub trait RecordCodec {
    fn parse_header(&self, line: &str) -> Vec<String>;
    fn parse_fields(&self, line: &str) -> Vec<String>;
    fn render_header(&self, schema: &[String]) -> String;
    fn render_fields(&self, fields: &[String]) -> String;
}

/// Plain comma-separated text with no quoting or embedded commas, the format
/// every experiment executable emits.
pub struct CommaSeparated;

impl RecordCodec for CommaSeparated {
    fn parse_header(&self, line: &str) -> Vec<String> {
        line.split(',').map(|f| f.trim().to_string()).collect()
    }

    fn parse_fields(&self, line: &str) -> Vec<String> {
        line.split(',').map(|f| f.trim().to_string()).collect()
    }

    fn render_header(&self, schema: &[String]) -> String {
        schema.join(",")
    }

    fn render_fields(&self, fields: &[String]) -> String {
        fields.join(",")
    }
}

/// One record of an indexed series: the index plus the remaining field values
/// in schema order, kept opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRecord {
    pub index: u64,
    pub values: Vec<String>,
}

/// An indexed time series: a fixed schema (ordered field names, index field
/// first) and records with strictly increasing indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedSeries {
    pub schema: Vec<String>,
    pub records: Vec<SeriesRecord>,
}

impl IndexedSeries {
    pub fn new(schema: Vec<String>) -> Self {
        IndexedSeries {
            schema,
            records: Vec::new(),
        }
    }

    pub fn parse(text: &str, path: &Path, codec: &dyn RecordCodec) -> Result<Self, SeriesError> {
        let mut lines = text.lines().enumerate();
        let Some((_, header)) = lines.next() else {
            return Err(SeriesError::MissingHeader {
                path: path.to_path_buf(),
            });
        };
        let schema = codec.parse_header(header);
        if schema.is_empty() || schema.iter().any(|f| f.is_empty()) {
            return Err(SeriesError::MissingHeader {
                path: path.to_path_buf(),
            });
        }
        let mut records: Vec<SeriesRecord> = Vec::new();
        for (i, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields = codec.parse_fields(line);
            if fields.len() != schema.len() {
                return Err(SeriesError::FieldCount {
                    path: path.to_path_buf(),
                    line: i + 1,
                    found: fields.len(),
                    expected: schema.len(),
                });
            }
            let index = parse_strict_u64(&fields[0]).ok_or_else(|| SeriesError::BadIndex {
                path: path.to_path_buf(),
                line: i + 1,
                value: fields[0].clone(),
            })?;
            if let Some(last) = records.last() {
                if index <= last.index {
                    return Err(SeriesError::NonMonotonic {
                        path: path.to_path_buf(),
                        line: i + 1,
                        index,
                        prev: last.index,
                    });
                }
            }
            records.push(SeriesRecord {
                index,
                values: fields[1..].to_vec(),
            });
        }
        Ok(IndexedSeries { schema, records })
    }

    pub fn read(path: &Path, codec: &dyn RecordCodec) -> Result<Self, SeriesError> {
        let text = fs::read_to_string(path).map_err(|source| SeriesError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path, codec)
    }

    pub fn render(&self, codec: &dyn RecordCodec) -> String {
        let mut out = codec.render_header(&self.schema);
        out.push('\n');
        for record in &self.records {
            let mut fields = Vec::with_capacity(self.schema.len());
            fields.push(record.index.to_string());
            fields.extend(record.values.iter().cloned());
            out.push_str(&codec.render_fields(&fields));
            out.push('\n');
        }
        out
    }

    pub fn write_atomic(&self, path: &Path, codec: &dyn RecordCodec) -> Result<(), SeriesError> {
        atomic_write_bytes(path, self.render(codec).as_bytes())?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&SeriesRecord> {
        self.records.last()
    }

    pub fn record_at(&self, index: u64) -> Option<&SeriesRecord> {
        self.records
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|i| &self.records[i])
    }

    /// Look up a field of a record by header name. Position 0 is the index
    /// field, rendered back to its decimal form.
    pub fn field_value(&self, record: &SeriesRecord, name: &str) -> Option<String> {
        let pos = self.schema.iter().position(|f| f == name)?;
        if pos == 0 {
            return Some(record.index.to_string());
        }
        record.values.get(pos - 1).cloned()
    }
}
