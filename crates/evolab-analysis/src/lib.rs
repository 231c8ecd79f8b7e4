//! Run-aggregation reducers: fold each base run's fitness series into
//! experiment-wide summary tables. These operate on already-stitched,
//! well-formed runs; nothing here mutates a run directory.

use anyhow::{anyhow, Result};
use evolab_core::{atomic_write_bytes, ensure_dir, list_runs, CommaSeparated, IndexedSeries};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_FITNESS_FILE: &str = "fitness.csv";
pub const DEFAULT_AGGREGATE_DIR: &str = "aggregated_data";

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub benchmark: String,
    pub fitness_file: String,
    /// Pull the record at this update; the last record when absent.
    pub update: Option<u64>,
}

impl AggregateOptions {
    pub fn new(benchmark: &str) -> Self {
        AggregateOptions {
            benchmark: benchmark.to_string(),
            fitness_file: DEFAULT_FITNESS_FILE.to_string(),
            update: None,
        }
    }
}

/// One row per base run: the fitness summary at a single update.
/// Writes `<out_dir>/<benchmark>/final_fitness.csv` and returns its path.
pub fn aggregate_final_fitness(
    root: &Path,
    out_dir: &Path,
    opts: &AggregateOptions,
) -> Result<PathBuf> {
    let runs = list_runs(root)?;
    let mut out = String::from("benchmark,treatment,run_id,update,mean_fitness,max_fitness\n");
    for (run, dir) in runs {
        let path = dir.join(&opts.fitness_file);
        let series = IndexedSeries::read(&path, &CommaSeparated)
            .map_err(|e| anyhow!("run {}: {}", run, e))?;
        let record = match opts.update {
            Some(update) => series
                .record_at(update)
                .ok_or_else(|| anyhow!("run {}: no record at update {}", run, update))?,
            None => series
                .last()
                .ok_or_else(|| anyhow!("run {}: {} has no records", run, opts.fitness_file))?,
        };
        let mean = series
            .field_value(record, "mean_fitness")
            .ok_or_else(|| anyhow!("run {}: missing mean_fitness column", run))?;
        let max = series
            .field_value(record, "max_fitness")
            .ok_or_else(|| anyhow!("run {}: missing max_fitness column", run))?;
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            opts.benchmark, run.treatment, run.run_id, record.index, mean, max
        ));
    }
    let dump = out_dir.join(&opts.benchmark);
    ensure_dir(&dump)?;
    let out_path = dump.join("final_fitness.csv");
    atomic_write_bytes(&out_path, out.as_bytes())?;
    info!(path = %out_path.display(), "wrote final fitness table");
    Ok(out_path)
}

/// Concatenate every run's full fitness series, each row prefixed with
/// benchmark, treatment, and run id. All runs must share one schema.
/// Writes `<out_dir>/<benchmark>/fitness_over_time.csv` and returns its path.
pub fn aggregate_fitness_over_time(
    root: &Path,
    out_dir: &Path,
    opts: &AggregateOptions,
) -> Result<PathBuf> {
    let runs = list_runs(root)?;
    let mut out = String::new();
    let mut schema: Option<Vec<String>> = None;
    for (run, dir) in runs {
        let path = dir.join(&opts.fitness_file);
        let series = IndexedSeries::read(&path, &CommaSeparated)
            .map_err(|e| anyhow!("run {}: {}", run, e))?;
        match &schema {
            None => {
                out.push_str(&format!(
                    "benchmark,treatment,run_id,{}\n",
                    series.schema.join(",")
                ));
                schema = Some(series.schema.clone());
            }
            Some(expected) if *expected != series.schema => {
                return Err(anyhow!(
                    "run {}: schema [{}] differs from [{}]",
                    run,
                    series.schema.join(","),
                    expected.join(",")
                ));
            }
            Some(_) => {}
        }
        for record in &series.records {
            out.push_str(&format!(
                "{},{},{},{}",
                opts.benchmark, run.treatment, run.run_id, record.index
            ));
            for value in &record.values {
                out.push(',');
                out.push_str(value);
            }
            out.push('\n');
        }
    }
    if schema.is_none() {
        return Err(anyhow!("no runs found under {}", root.display()));
    }
    let dump = out_dir.join(&opts.benchmark);
    ensure_dir(&dump)?;
    let out_path = dump.join("fitness_over_time.csv");
    atomic_write_bytes(&out_path, out.as_bytes())?;
    info!(path = %out_path.display(), "wrote fitness-over-time table");
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "evolab_analysis_{}_{}_{}",
            tag,
            std::process::id(),
            chrono_stamp()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    fn chrono_stamp() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_micros()
    }

    fn write_run(root: &Path, name: &str, rows: &str) {
        let dir = root.join(name);
        ensure_dir(&dir).expect("run dir");
        fs::write(
            dir.join("fitness.csv"),
            format!("update,mean_fitness,max_fitness\n{rows}"),
        )
        .expect("fitness");
    }

    #[test]
    fn final_fitness_uses_last_record_by_default() {
        let root = scratch_dir("final");
        write_run(&root, "TreatA__1", "0,1.0,2.0\n100,3.0,4.0\n");
        write_run(&root, "TreatB__2", "0,5.0,6.0\n");

        let out_dir = root.join("aggregated_data");
        let opts = AggregateOptions::new("consensus");
        let path = aggregate_final_fitness(&root, &out_dir, &opts).expect("aggregate");
        let content = fs::read_to_string(path).expect("read");
        assert_eq!(
            content,
            "benchmark,treatment,run_id,update,mean_fitness,max_fitness\n\
             consensus,TreatA,1,100,3.0,4.0\n\
             consensus,TreatB,2,0,5.0,6.0\n"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn final_fitness_at_requested_update() {
        let root = scratch_dir("at_update");
        write_run(&root, "TreatA__1", "0,1.0,2.0\n100,3.0,4.0\n");

        let out_dir = root.join("aggregated_data");
        let mut opts = AggregateOptions::new("consensus");
        opts.update = Some(0);
        let path = aggregate_final_fitness(&root, &out_dir, &opts).expect("aggregate");
        let content = fs::read_to_string(path).expect("read");
        assert!(content.contains("consensus,TreatA,1,0,1.0,2.0\n"));

        opts.update = Some(50);
        let err = aggregate_final_fitness(&root, &out_dir, &opts).expect_err("missing update");
        assert!(err.to_string().contains("no record at update 50"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn over_time_concatenates_all_runs() {
        let root = scratch_dir("over_time");
        write_run(&root, "TreatA__1", "0,1.0,2.0\n100,3.0,4.0\n");
        write_run(&root, "TreatB__2", "0,5.0,6.0\n");

        let out_dir = root.join("aggregated_data");
        let opts = AggregateOptions::new("consensus");
        let path = aggregate_fitness_over_time(&root, &out_dir, &opts).expect("aggregate");
        let content = fs::read_to_string(path).expect("read");
        assert_eq!(
            content,
            "benchmark,treatment,run_id,update,mean_fitness,max_fitness\n\
             consensus,TreatA,1,0,1.0,2.0\n\
             consensus,TreatA,1,100,3.0,4.0\n\
             consensus,TreatB,2,0,5.0,6.0\n"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn over_time_rejects_mixed_schemas() {
        let root = scratch_dir("mixed");
        write_run(&root, "TreatA__1", "0,1.0,2.0\n");
        let dir = root.join("TreatB__2");
        ensure_dir(&dir).expect("run dir");
        fs::write(dir.join("fitness.csv"), "update,other\n0,1\n").expect("fitness");

        let out_dir = root.join("aggregated_data");
        let opts = AggregateOptions::new("consensus");
        let err = aggregate_fitness_over_time(&root, &out_dir, &opts).expect_err("mixed schema");
        assert!(err.to_string().contains("differs from"));
        let _ = fs::remove_dir_all(root);
    }
}
