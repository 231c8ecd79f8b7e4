//! The stitching subsystem: reconciles a continuation run (a resubmitted job
//! that restarted from a checkpoint and numbers its own updates from zero)
//! with its base run into one consistent timeline.
//!
//! A continuation directory is named `<baseRunDir>:<offset>`, where `offset`
//! is the absolute update the continuation started from. Stitching translates
//! the continuation's local indices by `offset`, merges its time-series files
//! into the base run's, relocates its `pop_<index>` checkpoint snapshots, and
//! moves its remaining artifacts, committing each step via atomic renames so
//! a crash never corrupts the base run. An append-only audit line
//! `stitch@<offset>` in the base run's `stitch.log` is the single point of no
//! return; only after it lands is the continuation directory deleted.

use chrono::{DateTime, Utc};
use evolab_core::{
    append_line_durable, sha256_dir, snapshot_dir_name, snapshot_index, write_bytes_durable,
    CommaSeparated, IndexedSeries, RunName, SeriesError, SeriesRecord,
};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const AUDIT_LOG: &str = "stitch.log";
pub const RUN_LOG: &str = "run.log";
const LOCK_FILE: &str = ".stitch.lock";

#[derive(Debug, Error)]
pub enum StitchError {
    #[error("discovery: {0}")]
    Discovery(String),
    #[error("invalid index: {0}")]
    InvalidIndex(String),
    #[error("schema mismatch merging {file}: base [{base}] vs continuation [{continuation}]")]
    SchemaMismatch {
        file: String,
        base: String,
        continuation: String,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("stitch already in progress: lock held at {}", .0.display())]
    InProgress(PathBuf),
    #[error(transparent)]
    Series(#[from] SeriesError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A parsed continuation directory name `<baseRunDir>:<offset>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationDescriptor {
    pub base: RunName,
    pub offset: u64,
}

impl ContinuationDescriptor {
    /// Parse a continuation directory name. The offset follows the final
    /// colon and must be a positive base-10 integer with no leading zeros;
    /// offset 0 would mean the continuation restarted from the beginning and
    /// is rejected as malformed.
    pub fn parse(name: &str) -> Result<Self, StitchError> {
        let (base_name, offset_str) = name
            .rsplit_once(':')
            .ok_or_else(|| StitchError::Discovery(format!("{name}: missing `:<offset>` suffix")))?;
        let offset = evolab_core::parse_strict_u64(offset_str).ok_or_else(|| {
            StitchError::Discovery(format!("{name}: offset {offset_str:?} is not a valid integer"))
        })?;
        if offset == 0 {
            return Err(StitchError::Discovery(format!(
                "{name}: offset 0 is degenerate"
            )));
        }
        let base = RunName::parse(base_name).ok_or_else(|| {
            StitchError::Discovery(format!("{name}: base {base_name:?} is not a run name"))
        })?;
        Ok(ContinuationDescriptor { base, offset })
    }

    pub fn dir_name(&self) -> String {
        format!("{}:{}", self.base.dir_name(), self.offset)
    }
}

/// A discovered continuation with its directory and resolved base directory.
#[derive(Debug, Clone)]
pub struct Continuation {
    pub descriptor: ContinuationDescriptor,
    pub dir: PathBuf,
    pub base_dir: PathBuf,
}

impl Continuation {
    pub fn offset(&self) -> u64 {
        self.descriptor.offset
    }
}

/// A continuation directory that could not be processed: kept out of the
/// stitch but reported at the end.
#[derive(Debug, Clone)]
pub struct DiscoverySkip {
    pub name: String,
    pub reason: String,
}

/// Enumerate continuation directories under an experiment root and resolve
/// each one's base directory. Malformed names and unresolved bases are
/// skipped, not fatal: the remaining continuations still proceed.
pub fn discover_continuations(
    root: &Path,
) -> Result<(Vec<Continuation>, Vec<DiscoverySkip>), StitchError> {
    let mut continuations = Vec::new();
    let mut skipped = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.contains(':') {
            continue;
        }
        match ContinuationDescriptor::parse(name) {
            Ok(descriptor) => {
                let base_dir = root.join(descriptor.base.dir_name());
                if base_dir.is_dir() {
                    continuations.push(Continuation {
                        descriptor,
                        dir: entry.path(),
                        base_dir,
                    });
                } else {
                    skipped.push(DiscoverySkip {
                        name: name.to_string(),
                        reason: format!("base run directory {} not found", base_dir.display()),
                    });
                }
            }
            Err(err) => skipped.push(DiscoverySkip {
                name: name.to_string(),
                reason: err.to_string(),
            }),
        }
    }
    continuations.sort_by(|a, b| a.dir.cmp(&b.dir));
    Ok((continuations, skipped))
}

/// Translate a continuation-local index into the base run's absolute index
/// space. Pure arithmetic; overflow is the only failure mode since
/// non-negativity is carried by the types.
pub fn absolute_index(relative: u64, offset: u64) -> Result<u64, StitchError> {
    relative.checked_add(offset).ok_or_else(|| {
        StitchError::InvalidIndex(format!("{relative} + offset {offset} overflows u64"))
    })
}

/// Merge a base series with a continuation series under `offset`.
///
/// Continuation records are translated by `offset`; base records at or beyond
/// the splice point (`offset` itself, the first absolute index the
/// continuation can occupy) are dropped as a superseded, incomplete tail. The
/// result is strictly increasing by construction and inherits the base
/// schema.
pub fn merge_series(
    base: &IndexedSeries,
    continuation: &IndexedSeries,
    offset: u64,
    file: &str,
) -> Result<IndexedSeries, StitchError> {
    if base.schema != continuation.schema {
        return Err(StitchError::SchemaMismatch {
            file: file.to_string(),
            base: base.schema.join(","),
            continuation: continuation.schema.join(","),
        });
    }
    let mut merged = IndexedSeries::new(base.schema.clone());
    merged.records = base
        .records
        .iter()
        .filter(|r| r.index < offset)
        .cloned()
        .collect();
    for record in &continuation.records {
        merged.records.push(SeriesRecord {
            index: absolute_index(record.index, offset)?,
            values: record.values.clone(),
        });
    }
    Ok(merged)
}

#[derive(Debug)]
struct RelocationStep {
    local: u64,
    src: PathBuf,
    dest: PathBuf,
    already_present: bool,
}

fn list_snapshots(dir: &Path) -> Result<Vec<(u64, PathBuf)>, StitchError> {
    let mut snapshots = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(index) = snapshot_index(name) {
            snapshots.push((index, entry.path()));
        }
    }
    snapshots.sort_by_key(|(index, _)| *index);
    Ok(snapshots)
}

/// Classify every snapshot move before touching anything. A destination that
/// already exists with an identical content digest is a prior completed
/// transfer; one with a differing digest is a genuine conflict that aborts
/// the plan with nothing moved.
fn plan_relocation(
    cont_dir: &Path,
    base_dir: &Path,
    offset: u64,
) -> Result<Vec<RelocationStep>, StitchError> {
    let mut plan = Vec::new();
    for (local, src) in list_snapshots(cont_dir)? {
        let absolute = absolute_index(local, offset)?;
        let dest = base_dir.join(snapshot_dir_name(absolute));
        let already_present = if dest.exists() {
            if sha256_dir(&dest)? == sha256_dir(&src)? {
                true
            } else {
                return Err(StitchError::Conflict(format!(
                    "snapshot {} already exists with different content (from local {})",
                    dest.display(),
                    snapshot_dir_name(local),
                )));
            }
        } else {
            false
        };
        plan.push(RelocationStep {
            local,
            src,
            dest,
            already_present,
        });
    }
    Ok(plan)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RelocationSummary {
    pub moved: usize,
    pub already_present: usize,
}

/// Move every checkpoint snapshot of the continuation into the base directory
/// under its absolute-index name, in strictly increasing local order. A
/// source snapshot is only removed once its destination is confirmed present.
pub fn relocate_snapshots(
    cont_dir: &Path,
    base_dir: &Path,
    offset: u64,
) -> Result<RelocationSummary, StitchError> {
    let plan = plan_relocation(cont_dir, base_dir, offset)?;
    let mut summary = RelocationSummary::default();
    for step in plan {
        if step.already_present {
            debug!(
                local = step.local,
                dest = %step.dest.display(),
                "snapshot already transferred, removing source"
            );
            fs::remove_dir_all(&step.src)?;
            summary.already_present += 1;
        } else {
            fs::rename(&step.src, &step.dest)?;
            if !step.dest.is_dir() {
                return Err(StitchError::Conflict(format!(
                    "snapshot {} missing after move",
                    step.dest.display()
                )));
            }
            summary.moved += 1;
        }
    }
    Ok(summary)
}

/// Exclusive-ownership marker for a base run directory. Held for the duration
/// of one continuation's stitch; a second stitch against the same base fails
/// fast instead of interleaving writes.
#[derive(Debug)]
pub struct StitchLock {
    path: PathBuf,
}

impl Drop for StitchLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn acquire_stitch_lock(base_dir: &Path) -> Result<StitchLock, StitchError> {
    let lock_path = base_dir.join(LOCK_FILE);
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(StitchLock { path: lock_path })
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(StitchError::InProgress(lock_path))
        }
        Err(e) => Err(e.into()),
    }
}

fn audit_line(offset: u64) -> String {
    format!("stitch@{offset}")
}

/// Whether the base run's audit log already records a stitch at `offset`.
/// This is how a re-run distinguishes "already stitched, delete the residue"
/// from work still to do: the marker, not re-derived file contents.
pub fn is_recorded(base_dir: &Path, offset: u64) -> Result<bool, StitchError> {
    let path = base_dir.join(AUDIT_LOG);
    if !path.is_file() {
        return Ok(false);
    }
    let content = fs::read_to_string(&path)?;
    Ok(content.lines().any(|l| l.trim() == audit_line(offset)))
}

fn record_stitch(base_dir: &Path, offset: u64) -> Result<(), StitchError> {
    append_line_durable(&base_dir.join(AUDIT_LOG), &audit_line(offset))?;
    Ok(())
}

/// Which series files and executable artifacts a stitch should look for.
#[derive(Debug, Clone)]
pub struct StitchConfig {
    pub series_files: Vec<String>,
    pub executables: Vec<String>,
}

impl Default for StitchConfig {
    fn default() -> Self {
        StitchConfig {
            series_files: vec!["fitness.csv".to_string(), "systematics.csv".to_string()],
            executables: vec![
                "consensus".to_string(),
                "pattern_matching".to_string(),
                "changing_environment".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchState {
    Discovered,
    SeriesStaged,
    SeriesCommitted,
    SnapshotsRelocated,
    ArtifactsRelocated,
    Logged,
    Cleaned,
}

impl StitchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StitchState::Discovered => "discovered",
            StitchState::SeriesStaged => "series_staged",
            StitchState::SeriesCommitted => "series_committed",
            StitchState::SnapshotsRelocated => "snapshots_relocated",
            StitchState::ArtifactsRelocated => "artifacts_relocated",
            StitchState::Logged => "logged",
            StitchState::Cleaned => "cleaned",
        }
    }
}

#[derive(Debug)]
pub struct StitchOutcome {
    pub continuation: String,
    pub base: String,
    pub offset: u64,
    pub state: StitchState,
    pub already_stitched: bool,
    pub series_merged: Vec<String>,
    pub snapshots_moved: usize,
    pub stitched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct StitchReport {
    pub stitched: Vec<StitchOutcome>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<DiscoverySkip>,
}

fn stage_file_prefix(kind: &str) -> String {
    format!(".{kind}.stage.")
}

fn stage_path(base_dir: &Path, kind: &str) -> PathBuf {
    base_dir.join(format!(
        "{}{}.{}",
        stage_file_prefix(kind),
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

/// Remove staging leftovers from a crashed prior attempt. Staged files are
/// invisible to every reader (they never carry a series file's final name),
/// so deleting them is always safe.
fn clear_stale_stage_files(base_dir: &Path, series_files: &[String]) -> Result<(), StitchError> {
    for entry in fs::read_dir(base_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if series_files
            .iter()
            .any(|kind| name.starts_with(&stage_file_prefix(kind)))
        {
            warn!(file = name, "removing stale staged series file");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn dir_display_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

/// Stitch one continuation into its base run.
///
/// State machine: `Discovered -> SeriesStaged -> SeriesCommitted ->
/// SnapshotsRelocated -> ArtifactsRelocated -> Logged -> Cleaned`. Every
/// step's visible effect is an atomic rename or a single durable append, so
/// killing the process anywhere leaves a state a re-run recovers from: the
/// merge is idempotent over its own output, relocation treats an identical
/// destination as already transferred, and the audit record gates deletion.
pub fn stitch_continuation(
    continuation: &Continuation,
    config: &StitchConfig,
) -> Result<StitchOutcome, StitchError> {
    let name = dir_display_name(&continuation.dir);
    let offset = continuation.offset();
    let _lock = acquire_stitch_lock(&continuation.base_dir)?;

    if is_recorded(&continuation.base_dir, offset)? {
        info!(continuation = %name, offset, "already recorded in audit log, removing residue");
        fs::remove_dir_all(&continuation.dir)?;
        return Ok(StitchOutcome {
            continuation: name,
            base: continuation.descriptor.base.dir_name(),
            offset,
            state: StitchState::Cleaned,
            already_stitched: true,
            series_merged: Vec::new(),
            snapshots_moved: 0,
            stitched_at: Utc::now(),
        });
    }

    clear_stale_stage_files(&continuation.base_dir, &config.series_files)?;
    let mut state = StitchState::Discovered;
    debug!(continuation = %name, state = state.as_str(), "begin");

    // Stage every series merge to temp files first: no visible mutation until
    // all merges have succeeded.
    let codec = CommaSeparated;
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut series_merged = Vec::new();
    for kind in &config.series_files {
        let cont_path = continuation.dir.join(kind);
        if !cont_path.is_file() {
            continue;
        }
        let cont_series = IndexedSeries::read(&cont_path, &codec)?;
        let base_path = continuation.base_dir.join(kind);
        let base_series = if base_path.is_file() {
            IndexedSeries::read(&base_path, &codec)?
        } else {
            IndexedSeries::new(cont_series.schema.clone())
        };
        let merged = merge_series(&base_series, &cont_series, offset, kind)?;
        let tmp = stage_path(&continuation.base_dir, kind);
        write_bytes_durable(&tmp, merged.render(&codec).as_bytes())?;
        staged.push((tmp, base_path));
        series_merged.push(kind.clone());
    }
    state = StitchState::SeriesStaged;
    debug!(continuation = %name, state = state.as_str(), files = series_merged.len(), "staged");

    // Commit: rename every staged file into place. Interruption mid-loop
    // leaves a mix of old and new series files, each internally consistent.
    for (tmp, final_path) in &staged {
        fs::rename(tmp, final_path)?;
    }
    state = StitchState::SeriesCommitted;
    debug!(continuation = %name, state = state.as_str(), "series committed");

    let relocation = relocate_snapshots(&continuation.dir, &continuation.base_dir, offset)?;
    state = StitchState::SnapshotsRelocated;
    debug!(
        continuation = %name,
        state = state.as_str(),
        moved = relocation.moved,
        already_present = relocation.already_present,
        "snapshots relocated"
    );

    // Remaining artifacts: the run executable keeps its name, the execution
    // transcript is renamed to carry the offset.
    for exe in &config.executables {
        let src = continuation.dir.join(exe);
        if src.is_file() {
            fs::rename(&src, continuation.base_dir.join(exe))?;
        }
    }
    let run_log = continuation.dir.join(RUN_LOG);
    if run_log.is_file() {
        fs::rename(
            &run_log,
            continuation.base_dir.join(format!("run:{offset}.log")),
        )?;
    }
    state = StitchState::ArtifactsRelocated;
    debug!(continuation = %name, state = state.as_str(), "artifacts relocated");

    // Verify every snapshot actually left the continuation before the point
    // of no return. Deleting the directory with a snapshot still inside would
    // be silent data loss.
    let leftovers = list_snapshots(&continuation.dir)?;
    if !leftovers.is_empty() {
        return Err(StitchError::Conflict(format!(
            "{} snapshots still present in {} after relocation",
            leftovers.len(),
            continuation.dir.display()
        )));
    }

    record_stitch(&continuation.base_dir, offset)?;
    state = StitchState::Logged;
    debug!(continuation = %name, state = state.as_str(), "audit record appended");

    // The only step destructive of the continuation's own data, gated on the
    // audit record above.
    fs::remove_dir_all(&continuation.dir)?;
    state = StitchState::Cleaned;
    info!(
        continuation = %name,
        offset,
        snapshots = relocation.moved,
        series = series_merged.len(),
        "stitched"
    );

    Ok(StitchOutcome {
        continuation: name,
        base: continuation.descriptor.base.dir_name(),
        offset,
        state,
        already_stitched: false,
        series_merged,
        snapshots_moved: relocation.moved,
        stitched_at: Utc::now(),
    })
}

/// Stitch every continuation under an experiment root, one at a time. A
/// failing continuation is reported and left intact for inspection; the
/// others still proceed.
pub fn stitch_experiment(root: &Path, config: &StitchConfig) -> Result<StitchReport, StitchError> {
    let (continuations, skipped) = discover_continuations(root)?;
    for skip in &skipped {
        warn!(continuation = %skip.name, reason = %skip.reason, "skipping continuation");
    }
    let mut report = StitchReport {
        skipped,
        ..Default::default()
    };
    for continuation in continuations {
        let name = dir_display_name(&continuation.dir);
        match stitch_continuation(&continuation, config) {
            Ok(outcome) => report.stitched.push(outcome),
            Err(err) => {
                warn!(continuation = %name, error = %err, "stitch failed");
                report.failed.push((name, err.to_string()));
            }
        }
    }
    Ok(report)
}
