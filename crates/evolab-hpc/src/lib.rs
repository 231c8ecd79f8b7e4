//! HPC housekeeping around the experiment runs: surveying which jobs died
//! before their final update, generating qsub resubmission scripts that
//! restart them from their latest checkpoint snapshot (producing the
//! `<run>:<offset>` continuation directories the stitcher later reconciles),
//! batch submission, and cleanup of stale intermediate snapshots.

use anyhow::{anyhow, Result};
use evolab_core::{
    atomic_write_bytes, ensure_dir, list_runs, snapshot_index, CommaSeparated, IndexedSeries,
    RunName,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

pub const DEFAULT_QSUB_DIR: &str = "generated_qsubs";
pub const SUBMITTED_DIR: &str = "submitted";

fn default_walltime() -> String {
    "04:00:00:00".to_string()
}

fn default_feature() -> String {
    "intel16".to_string()
}

fn default_mem() -> String {
    "8gb".to_string()
}

fn default_final_update() -> u64 {
    50_000
}

/// Resubmission parameter table, loaded from YAML: scheduler resources plus
/// the per-benchmark, per-treatment command-line parameters each restarted
/// job must run with.
#[derive(Debug, Clone, Deserialize)]
pub struct ResubConfig {
    #[serde(default = "default_walltime")]
    pub walltime: String,
    #[serde(default = "default_feature")]
    pub feature: String,
    #[serde(default = "default_mem")]
    pub mem: String,
    #[serde(default = "default_final_update")]
    pub final_update: u64,
    #[serde(default)]
    pub benchmarks: BTreeMap<String, BTreeMap<String, BTreeMap<String, serde_yaml::Value>>>,
}

impl Default for ResubConfig {
    fn default() -> Self {
        ResubConfig {
            walltime: default_walltime(),
            feature: default_feature(),
            mem: default_mem(),
            final_update: default_final_update(),
            benchmarks: BTreeMap::new(),
        }
    }
}

pub fn load_resub_config(path: &Path) -> Result<ResubConfig> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read resub config {}: {}", path.display(), e))?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Status of one base run with respect to a target final update.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub run: RunName,
    pub dir: PathBuf,
    /// Last update the fitness series reached; None when the series is
    /// missing or empty.
    pub last_update: Option<u64>,
    /// Index of the most recent checkpoint snapshot, if any.
    pub last_snapshot: Option<u64>,
    pub finished: bool,
}

/// Survey every base run under the experiment root. A run is finished once
/// its fitness series reaches `final_update`.
pub fn survey_runs(root: &Path, final_update: u64, fitness_file: &str) -> Result<Vec<RunStatus>> {
    let mut statuses = Vec::new();
    for (run, dir) in list_runs(root)? {
        let fitness_path = dir.join(fitness_file);
        let last_update = if fitness_path.is_file() {
            IndexedSeries::read(&fitness_path, &CommaSeparated)
                .map_err(|e| anyhow!("run {}: {}", run, e))?
                .last()
                .map(|r| r.index)
        } else {
            None
        };
        let mut last_snapshot = None;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(index) = entry.file_name().to_str().and_then(snapshot_index) {
                if entry.file_type()?.is_dir() {
                    last_snapshot = last_snapshot.max(Some(index));
                }
            }
        }
        let finished = last_update.is_some_and(|u| u >= final_update);
        statuses.push(RunStatus {
            run,
            dir,
            last_update,
            last_snapshot,
            finished,
        });
    }
    Ok(statuses)
}

// Placeholders: [walltime] [feature] [mem] [job_name] [benchmark]
// [pop_update] [random_seed] [generations] [run_parameters]
const QSUB_TEMPLATE: &str = r#"#!/bin/bash -login
### Configure job:
#PBS -l walltime=[walltime]
#PBS -l feature=[feature]
#PBS -l mem=[mem]
#PBS -N [job_name]

### Load modules:
module load powertools
module load GNU/5.2

### Setup some variables.
BENCHMARK=[benchmark]
BENCHMARK_DIR=${PBS_O_WORKDIR}/${BENCHMARK}
BASE_RUN_DIR=${BENCHMARK_DIR}/${PBS_JOBNAME}
RUN_DIR=${BASE_RUN_DIR}:[pop_update]
CODE_DIR=${HOME}/devo_ws/signal-gp-benchmarking/${BENCHMARK}

### Change to working directory, do work.
mkdir -p ${RUN_DIR}

cd ${BENCHMARK_DIR}
cp ${BASE_RUN_DIR}/configs.cfg ${RUN_DIR}
cp ${CODE_DIR}/${BENCHMARK} ${RUN_DIR}
cd ${RUN_DIR}

./${BENCHMARK} -RANDOM_SEED [random_seed] -GENERATIONS [generations] -RUN_FROM_EXISTING_POP 1 -EXISTING_POP_LOC ${BASE_RUN_DIR}/pop_[pop_update][run_parameters] > run.log
"#;

/// Replace each `[key]` placeholder with its substitution.
pub fn render_template(template: &str, substitutions: &BTreeMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in substitutions {
        out = out.replace(&format!("[{key}]"), value);
    }
    out
}

fn render_yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => {
            if *b {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        other => format!("{other:?}"),
    }
}

/// Render a treatment's parameter map as ` -KEY value` pairs, leading space
/// included so an empty map substitutes to nothing.
pub fn format_run_parameters(params: &BTreeMap<String, serde_yaml::Value>) -> String {
    let mut out = String::new();
    for (key, value) in params {
        out.push_str(&format!(" -{} {}", key, render_yaml_scalar(value)));
    }
    out
}

#[derive(Debug, Clone)]
pub struct GeneratedQsub {
    pub run: String,
    pub pop_update: u64,
    pub path: PathBuf,
}

/// Generate one qsub file per unfinished run of `benchmark`, each restarting
/// from the run's latest snapshot. The job name matches the base run
/// directory so the scheduler recreates the `<run>:<offset>` layout the
/// stitcher expects. Runs without any snapshot cannot be restarted and are
/// reported, not fatal.
pub fn generate_resub_qsubs(
    root: &Path,
    benchmark: &str,
    config: &ResubConfig,
    fitness_file: &str,
    out_dir: &Path,
) -> Result<Vec<GeneratedQsub>> {
    let benchmark_params = config
        .benchmarks
        .get(benchmark)
        .ok_or_else(|| anyhow!("benchmark {benchmark:?} not in resub config"))?;
    ensure_dir(out_dir)?;
    let mut generated = Vec::new();
    for status in survey_runs(root, config.final_update, fitness_file)? {
        if status.finished {
            continue;
        }
        let run_name = status.run.dir_name();
        let Some(snapshot) = status.last_snapshot else {
            warn!(run = %run_name, "unfinished run has no snapshot to restart from");
            continue;
        };
        let treatment_params = benchmark_params
            .get(&status.run.treatment)
            .ok_or_else(|| anyhow!("treatment {:?} not in resub config", status.run.treatment))?;
        let generations = config.final_update.saturating_sub(snapshot);
        let substitutions = BTreeMap::from([
            ("walltime", config.walltime.clone()),
            ("feature", config.feature.clone()),
            ("mem", config.mem.clone()),
            ("job_name", run_name.clone()),
            ("benchmark", benchmark.to_string()),
            ("pop_update", snapshot.to_string()),
            ("random_seed", status.run.run_id.clone()),
            ("generations", generations.to_string()),
            ("run_parameters", format_run_parameters(treatment_params)),
        ]);
        let qsub = render_template(QSUB_TEMPLATE, &substitutions);
        let path = out_dir.join(format!("{run_name}:{snapshot}.qsub"));
        atomic_write_bytes(&path, qsub.as_bytes())?;
        info!(run = %run_name, pop_update = snapshot, "generated resubmission qsub");
        generated.push(GeneratedQsub {
            run: run_name,
            pop_update: snapshot,
            path,
        });
    }
    Ok(generated)
}

/// Move every `.qsub` in `dir` into `submitted/` and hand it to `qsub`.
/// Returns the number submitted.
pub fn submit_qsubs(dir: &Path) -> Result<usize> {
    let mut qsubs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file()
            && entry.path().extension().is_some_and(|e| e == "qsub")
        {
            qsubs.push(entry.path());
        }
    }
    qsubs.sort();
    let submitted_dir = dir.join(SUBMITTED_DIR);
    ensure_dir(&submitted_dir)?;
    let mut submitted = 0;
    for qsub in qsubs {
        let name = qsub
            .file_name()
            .ok_or_else(|| anyhow!("qsub path has no file name: {}", qsub.display()))?;
        let dest = submitted_dir.join(name);
        fs::rename(&qsub, &dest)?;
        let status = Command::new("qsub").arg(&dest).status()?;
        if !status.success() {
            return Err(anyhow!("qsub failed for {}: {}", dest.display(), status));
        }
        info!(qsub = %dest.display(), "submitted");
        submitted += 1;
    }
    Ok(submitted)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupSummary {
    pub snapshots_removed: usize,
    pub executables_removed: usize,
}

/// Delete every snapshot except the final one, plus any run executable, from
/// one run directory. Series files and logs are never touched.
pub fn cleanup_run(
    run_dir: &Path,
    final_update: u64,
    executables: &[String],
) -> Result<CleanupSummary> {
    let mut summary = CleanupSummary::default();
    for entry in fs::read_dir(run_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if entry.file_type()?.is_dir() {
            if let Some(index) = snapshot_index(name) {
                if index != final_update {
                    fs::remove_dir_all(entry.path())?;
                    summary.snapshots_removed += 1;
                }
            }
        } else if executables.iter().any(|e| e == name) {
            fs::remove_file(entry.path())?;
            summary.executables_removed += 1;
        }
    }
    Ok(summary)
}

pub fn cleanup_experiment(
    root: &Path,
    final_update: u64,
    executables: &[String],
) -> Result<CleanupSummary> {
    let mut total = CleanupSummary::default();
    for (run, dir) in list_runs(root)? {
        let summary = cleanup_run(&dir, final_update, executables)?;
        info!(
            run = %run,
            snapshots = summary.snapshots_removed,
            executables = summary.executables_removed,
            "cleaned"
        );
        total.snapshots_removed += summary.snapshots_removed;
        total.executables_removed += summary.executables_removed;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "evolab_hpc_{}_{}_{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    fn write_run(root: &Path, name: &str, last_update: u64, snapshots: &[u64]) -> PathBuf {
        let dir = root.join(name);
        ensure_dir(&dir).expect("run dir");
        fs::write(
            dir.join("fitness.csv"),
            format!("update,mean_fitness,max_fitness\n{last_update},1.0,2.0\n"),
        )
        .expect("fitness");
        for snapshot in snapshots {
            ensure_dir(&dir.join(format!("pop_{snapshot}"))).expect("snapshot");
        }
        dir
    }

    #[test]
    fn survey_separates_finished_from_unfinished() {
        let root = scratch_dir("survey");
        write_run(&root, "Treat__1", 50_000, &[0, 10_000]);
        write_run(&root, "Treat__2", 30_000, &[0, 20_000]);

        let statuses = survey_runs(&root, 50_000, "fitness.csv").expect("survey");
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].finished);
        assert!(!statuses[1].finished);
        assert_eq!(statuses[1].last_update, Some(30_000));
        assert_eq!(statuses[1].last_snapshot, Some(20_000));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn render_template_substitutes_bracketed_keys() {
        let subs = BTreeMap::from([
            ("walltime", "01:00:00:00".to_string()),
            ("job_name", "Treat__3".to_string()),
        ]);
        let out = render_template("walltime=[walltime] name=[job_name] [missing]", &subs);
        assert_eq!(out, "walltime=01:00:00:00 name=Treat__3 [missing]");
    }

    #[test]
    fn run_parameters_render_as_flag_value_pairs() {
        let params = BTreeMap::from([
            (
                "EVENT_DRIVEN".to_string(),
                serde_yaml::Value::Number(1.into()),
            ),
            (
                "FORK_ON_MESSAGE".to_string(),
                serde_yaml::Value::Number(0.into()),
            ),
        ]);
        assert_eq!(
            format_run_parameters(&params),
            " -EVENT_DRIVEN 1 -FORK_ON_MESSAGE 0"
        );
        assert_eq!(format_run_parameters(&BTreeMap::new()), "");
    }

    #[test]
    fn generate_writes_qsubs_for_unfinished_runs_only() {
        let root = scratch_dir("generate");
        write_run(&root, "EventDriven__1", 50_000, &[40_000]);
        write_run(&root, "EventDriven__2", 30_000, &[0, 30_000]);

        let config: ResubConfig = serde_yaml::from_str(
            "final_update: 50000\n\
             benchmarks:\n\
             \x20 consensus:\n\
             \x20   EventDriven:\n\
             \x20     EVENT_DRIVEN: 1\n",
        )
        .expect("config");
        let out_dir = root.join("generated_qsubs");
        let generated =
            generate_resub_qsubs(&root, "consensus", &config, "fitness.csv", &out_dir)
                .expect("generate");
        assert_eq!(generated.len(), 1);
        assert_eq!(generated[0].run, "EventDriven__2");
        assert_eq!(generated[0].pop_update, 30_000);

        let content = fs::read_to_string(&generated[0].path).expect("qsub");
        assert!(content.contains("#PBS -N EventDriven__2"));
        assert!(content.contains("-RANDOM_SEED 2"));
        assert!(content.contains("-GENERATIONS 20000"));
        assert!(content.contains("pop_30000 -EVENT_DRIVEN 1"));
        assert!(!content.contains('['), "unsubstituted placeholder:\n{content}");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn generate_requires_known_benchmark() {
        let root = scratch_dir("unknown");
        let err = generate_resub_qsubs(
            &root,
            "consensus",
            &ResubConfig::default(),
            "fitness.csv",
            &root.join("out"),
        )
        .expect_err("unknown benchmark");
        assert!(err.to_string().contains("not in resub config"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cleanup_keeps_only_final_snapshot() {
        let root = scratch_dir("cleanup");
        let dir = write_run(&root, "Treat__1", 50_000, &[0, 25_000, 50_000]);
        fs::write(dir.join("consensus"), b"binary").expect("exe");

        let summary = cleanup_experiment(&root, 50_000, &["consensus".to_string()])
            .expect("cleanup");
        assert_eq!(summary.snapshots_removed, 2);
        assert_eq!(summary.executables_removed, 1);
        assert!(dir.join("pop_50000").is_dir());
        assert!(!dir.join("pop_0").exists());
        assert!(!dir.join("consensus").exists());
        assert!(dir.join("fitness.csv").is_file());
        let _ = fs::remove_dir_all(root);
    }
}
