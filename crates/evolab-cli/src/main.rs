use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use evolab_analysis::AggregateOptions;
use evolab_hpc::ResubConfig;
use evolab_stitch::StitchConfig;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "evolab", version, about = "Experiment run stitching and housekeeping")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stitch every continuation run under an experiment directory back into
    /// its base run.
    Stitch {
        directory: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Aggregate per-run fitness series into summary tables.
    Aggregate {
        directory: PathBuf,
        benchmark: String,
        #[arg(long)]
        update: Option<u64>,
        #[arg(long, default_value = evolab_analysis::DEFAULT_FITNESS_FILE)]
        fitness_file: String,
        #[arg(long)]
        over_time: bool,
        #[arg(long, default_value = evolab_analysis::DEFAULT_AGGREGATE_DIR)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Generate qsub resubmission scripts for unfinished runs.
    Resub {
        directory: PathBuf,
        benchmark: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        final_update: Option<u64>,
        #[arg(long)]
        walltime: Option<String>,
        #[arg(long)]
        feature: Option<String>,
        #[arg(long)]
        mem: Option<String>,
        #[arg(long, default_value = evolab_hpc::DEFAULT_QSUB_DIR)]
        out: PathBuf,
        /// Only print run statuses, generate nothing.
        #[arg(long)]
        list: bool,
        #[arg(long)]
        json: bool,
    },
    /// Submit every generated qsub in a directory.
    Submit {
        directory: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Delete stale snapshots and run executables from finished runs.
    Cleanup {
        directory: PathBuf,
        #[arg(long)]
        update: u64,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Stitch { directory, json } => {
            let report = evolab_stitch::stitch_experiment(&directory, &StitchConfig::default())?;
            if json {
                let value = json!({
                    "stitched": report.stitched.iter().map(|o| json!({
                        "continuation": o.continuation,
                        "base": o.base,
                        "offset": o.offset,
                        "state": o.state.as_str(),
                        "already_stitched": o.already_stitched,
                        "series_merged": o.series_merged,
                        "snapshots_moved": o.snapshots_moved,
                        "stitched_at": o.stitched_at.to_rfc3339(),
                    })).collect::<Vec<_>>(),
                    "failed": report.failed.iter().map(|(name, reason)| json!({
                        "continuation": name,
                        "reason": reason,
                    })).collect::<Vec<_>>(),
                    "skipped": report.skipped.iter().map(|s| json!({
                        "continuation": s.name,
                        "reason": s.reason,
                    })).collect::<Vec<_>>(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                for outcome in &report.stitched {
                    if outcome.already_stitched {
                        println!("already stitched: {} (residue removed)", outcome.continuation);
                    } else {
                        println!(
                            "stitched: {} -> {} (offset {}, {} series, {} snapshots)",
                            outcome.continuation,
                            outcome.base,
                            outcome.offset,
                            outcome.series_merged.len(),
                            outcome.snapshots_moved
                        );
                    }
                }
                for skip in &report.skipped {
                    println!("skipped: {}: {}", skip.name, skip.reason);
                }
                for (name, reason) in &report.failed {
                    println!("failed: {}: {}", name, reason);
                }
            }
            if !report.failed.is_empty() {
                return Err(anyhow!("{} continuations failed", report.failed.len()));
            }
            Ok(())
        }
        Commands::Aggregate {
            directory,
            benchmark,
            update,
            fitness_file,
            over_time,
            out,
            json,
        } => {
            let opts = AggregateOptions {
                benchmark,
                fitness_file,
                update,
            };
            let path = if over_time {
                evolab_analysis::aggregate_fitness_over_time(&directory, &out, &opts)?
            } else {
                evolab_analysis::aggregate_final_fitness(&directory, &out, &opts)?
            };
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "out": path.display().to_string() }))?
                );
            } else {
                println!("out: {}", path.display());
            }
            Ok(())
        }
        Commands::Resub {
            directory,
            benchmark,
            config,
            final_update,
            walltime,
            feature,
            mem,
            out,
            list,
            json,
        } => {
            let mut resub_config = match config {
                Some(path) => evolab_hpc::load_resub_config(&path)?,
                None => ResubConfig::default(),
            };
            if let Some(final_update) = final_update {
                resub_config.final_update = final_update;
            }
            if let Some(walltime) = walltime {
                resub_config.walltime = walltime;
            }
            if let Some(feature) = feature {
                resub_config.feature = feature;
            }
            if let Some(mem) = mem {
                resub_config.mem = mem;
            }

            if list {
                let statuses = evolab_hpc::survey_runs(
                    &directory,
                    resub_config.final_update,
                    evolab_analysis::DEFAULT_FITNESS_FILE,
                )?;
                if json {
                    let value = statuses
                        .iter()
                        .map(|s| {
                            json!({
                                "run": s.run.dir_name(),
                                "finished": s.finished,
                                "last_update": s.last_update,
                                "last_snapshot": s.last_snapshot,
                            })
                        })
                        .collect::<Vec<_>>();
                    println!("{}", serde_json::to_string_pretty(&value)?);
                } else {
                    let mut per_treatment: BTreeMap<String, (usize, usize)> = BTreeMap::new();
                    for status in &statuses {
                        let counts =
                            per_treatment.entry(status.run.treatment.clone()).or_default();
                        counts.1 += 1;
                        if status.finished {
                            counts.0 += 1;
                        }
                        println!(
                            "run: {} finished: {} last_update: {} last_snapshot: {}",
                            status.run.dir_name(),
                            status.finished,
                            status
                                .last_update
                                .map_or("none".to_string(), |u| u.to_string()),
                            status
                                .last_snapshot
                                .map_or("none".to_string(), |u| u.to_string()),
                        );
                    }
                    for (treatment, (finished, total)) in per_treatment {
                        println!("treatment: {} finished: {}/{}", treatment, finished, total);
                    }
                }
                return Ok(());
            }

            let generated = evolab_hpc::generate_resub_qsubs(
                &directory,
                &benchmark,
                &resub_config,
                evolab_analysis::DEFAULT_FITNESS_FILE,
                &out,
            )?;
            if json {
                let value = generated
                    .iter()
                    .map(|g| {
                        json!({
                            "run": g.run,
                            "pop_update": g.pop_update,
                            "qsub": g.path.display().to_string(),
                        })
                    })
                    .collect::<Vec<_>>();
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                for g in &generated {
                    println!("generated: {} (restart from pop_{})", g.path.display(), g.pop_update);
                }
                println!("generated_count: {}", generated.len());
            }
            Ok(())
        }
        Commands::Submit { directory, json } => {
            let submitted = evolab_hpc::submit_qsubs(&directory)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "submitted": submitted }))?
                );
            } else {
                println!("submitted: {}", submitted);
            }
            Ok(())
        }
        Commands::Cleanup {
            directory,
            update,
            json,
        } => {
            let executables = StitchConfig::default().executables;
            let summary = evolab_hpc::cleanup_experiment(&directory, update, &executables)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "snapshots_removed": summary.snapshots_removed,
                        "executables_removed": summary.executables_removed,
                    }))?
                );
            } else {
                println!("snapshots_removed: {}", summary.snapshots_removed);
                println!("executables_removed: {}", summary.executables_removed);
            }
            Ok(())
        }
    }
}
