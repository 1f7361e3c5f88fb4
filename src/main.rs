//! sweepctl CLI - Staged data reduction for multi-sweep diffraction experiments.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sweepctl::analysis::{detect_onset, estimate, wilson_cutoff, Criterion, DoseAxis, ResolutionLimit};
use sweepctl::models::{BatchStatistic, MergingStats, Sweep};
use sweepctl::{
    Backends, BravaisTable, Config, ReductionPipeline, ReflectionStore, ReflectionTable, SweepKey,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Resolution shells used for the Wilson check on unmerged reflections.
const WILSON_SHELLS: usize = 20;

#[derive(Parser)]
#[command(name = "sweepctl")]
#[command(author = "Infernet <dev@infernet.org>")]
#[command(version)]
#[command(about = "Staged data-reduction controller for multi-sweep diffraction experiments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reduce every configured sweep and write a JSON report
    Run {
        /// Report path (overrides output.report)
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Checkpoint directory (overrides output.checkpoint_dir)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Seed the run from an existing checkpoint
        #[arg(long)]
        resume: bool,

        /// Hide integration progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,

    /// Estimate a resolution limit from a merging-statistics JSON file
    Resolution {
        /// Merging statistics (`{"bins": [...]}`)
        stats: PathBuf,

        /// Sweep the statistics belong to, as project/crystal/dataset/sweep
        #[arg(short, long)]
        sweep: Option<String>,

        /// Unmerged reflections (JSON lines) for the Wilson check
        #[arg(long)]
        reflections: Option<PathBuf>,
    },

    /// Detect radiation damage onset from a per-batch statistics JSON file
    Damage {
        /// Array of per-batch statistics
        batches: PathBuf,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# sweepctl configuration file

[controller]
max_retries = 8

[resolution]
completeness = 0.5
rmerge = 1.0
isigma = 1.0
misigma = 2.0
tolerance = 0.005
# disabled = ["rmerge"]
# overrides = { "AUTOMATIC/DEFAULT/NATIVE/SWEEP1" = 1.8 }

[scaling]
convergence_margin = 1.0
# corrections = { decay = true, absorption = true, partiality = false }

[damage]
bin_width = 5.0
leading_offset = 1
sigma_floor = 0.01
chi_squared_threshold = 2.0
wilson_trigger_isigma = 5.0

[integration]
chunks = 4
max_parallel = 4

# Each backend is run as `program args.. request.json result.json`
# and writes {"ok": <result>} or {"error": "<why>"} to result.json
[backends.indexer]
program = "index-job"
work_dir = "work"

[backends.refiner]
program = "refine-job"
work_dir = "work"

[backends.integrater]
program = "integrate-job"
args = ["--threads", "${INTEGRATE_THREADS}"]
work_dir = "work"

[backends.scaler]
program = "scale-job"
work_dir = "work"

[output]
report = "output/report.json"
# checkpoint_dir = "checkpoints/"

[[sweeps]]
name = "SWEEP1"
epoch = 0.0
first_image = 1
last_image = 360
oscillation = 0.5
payload = { template = "sweep1_####.cbf" }

[[sweeps]]
name = "SWEEP2"
epoch = 1.0
first_image = 1
last_image = 180
oscillation = 0.5
payload = { template = "sweep2_####.cbf" }
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::from_file(path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Config for the standalone analysis commands: defaults when no file exists.
fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        info!(path = %path.display(), "No config file, using default thresholds");
        Ok(Config::default())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}

/// Sweeps spanned by a batch table, in order of first appearance.
fn sweeps_from_batches(batches: &[BatchStatistic]) -> Vec<Sweep> {
    let mut spans: Vec<(SweepKey, u32, u32)> = Vec::new();
    for b in batches {
        match spans.iter_mut().find(|(key, _, _)| key == &b.sweep) {
            Some((_, first, last)) => {
                *first = (*first).min(b.batch);
                *last = (*last).max(b.batch);
            }
            None => spans.push((b.sweep.clone(), b.batch, b.batch)),
        }
    }
    spans
        .into_iter()
        .enumerate()
        .map(|(i, (key, first, last))| {
            let mut sweep = Sweep::new(key, first, last);
            sweep.epoch = i as f64;
            sweep
        })
        .collect()
}

fn estimate_resolution(
    config: &Config,
    stats_path: &Path,
    sweep: Option<String>,
    reflections: Option<PathBuf>,
) -> Result<ResolutionLimit> {
    let stats: MergingStats = read_json(stats_path)?;
    let key = match sweep {
        Some(s) => s.parse::<SweepKey>().map_err(anyhow::Error::msg)?,
        None => SweepKey::new("AUTOMATIC", "DEFAULT", "NATIVE", "SWEEP1"),
    };

    let limit = estimate(&key, &stats, &config.resolution)?;
    let Some(path) = reflections else {
        return Ok(limit);
    };
    if limit.criterion != Criterion::FullResolution {
        return Ok(limit);
    }

    let table = ReflectionTable::load(&path)?;
    let shells = table.resolution_shells(WILSON_SHELLS)?;
    match wilson_cutoff(&shells, config.damage.wilson_trigger_isigma)? {
        Some(d) if d > limit.d_min => Ok(ResolutionLimit {
            d_min: d,
            criterion: Criterion::Wilson,
            ..limit
        }),
        _ => Ok(limit),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            config
                .require_backends()
                .context("Backend configuration incomplete")?;
            let sweeps = config.sweeps().context("Invalid sweep definitions")?;

            info!("Configuration is valid");
            info!("  Sweeps: {}", sweeps.len());
            for sweep in &sweeps {
                info!(
                    "    {} images {}-{} ({:.1}°)",
                    sweep.key,
                    sweep.first_image,
                    sweep.last_image,
                    sweep.total_rotation()
                );
            }
            info!(
                "  Integration: {} chunk(s), {} in parallel",
                config.integration.chunks, config.integration.max_parallel
            );
            match config.scaling.corrections {
                Some(c) => info!("  Corrections: {} (manual)", c),
                None => info!("  Corrections: automatic selection"),
            }
            return Ok(());
        }

        Commands::Run {
            report,
            checkpoint,
            resume,
            no_progress,
        } => {
            let config = load_config(&cli.config)?;
            let backends = Backends::from_config(&config).context("Failed to set up backends")?;

            let mut pipeline = ReductionPipeline::new(&config, &backends, Arc::new(BravaisTable))?
                .with_progress(!no_progress);

            match checkpoint.or_else(|| config.output.checkpoint_dir.clone()) {
                Some(dir) => pipeline
                    .enable_checkpoint(&dir, resume)
                    .context("Failed to initialize checkpoint")?,
                None if resume => bail!("--resume needs --checkpoint or output.checkpoint_dir"),
                None => {}
            }

            let outcome = pipeline.run();
            let summary = pipeline.report(outcome.as_ref().err());
            let report_path = report.unwrap_or_else(|| config.output.report.clone());
            if let Err(e) = summary.save(&report_path) {
                warn!(error = %e, "Failed to write report");
            }

            let output = outcome.context("Reduction failed")?;

            println!("\n=== Reduction Complete ===");
            println!("Lattice:      {}", output.lattice);
            println!("Corrections:  {}", output.corrections);
            println!("Residual:     {:.4}", output.result.merging_residual);
            let limits: BTreeMap<SweepKey, f64> = pipeline.get_resolution_limits();
            for (key, d_min) in &limits {
                match pipeline.get_damage_cutoff(key) {
                    Some(dose) => println!("{key}: d_min {d_min:.2} Å, damage from dose {dose:.1}"),
                    None => println!("{key}: d_min {d_min:.2} Å"),
                }
            }
            println!("Report:       {report_path:?}");
        }

        Commands::Resolution {
            stats,
            sweep,
            reflections,
        } => {
            let config = load_config_or_default(&cli.config)?;
            let limit = estimate_resolution(&config, &stats, sweep, reflections)?;
            println!("{}", serde_json::to_string_pretty(&limit)?);
        }

        Commands::Damage { batches } => {
            let config = load_config_or_default(&cli.config)?;
            let batches: Vec<BatchStatistic> = read_json(&batches)?;

            let sweeps = if config.sweeps.is_empty() {
                sweeps_from_batches(&batches)
            } else {
                config.sweeps()?
            };
            let axis = DoseAxis::from_sweeps(&sweeps);
            let analysis = detect_onset(&axis.samples(&batches), &config.damage)?;

            println!("{}", serde_json::to_string_pretty(&analysis)?);
            if let Some(dose) = analysis.onset_dose {
                for sweep in &sweeps {
                    if let Some(batch) = axis.batch_at(&sweep.key, dose) {
                        println!("{}: damaged from batch {batch}", sweep.key);
                    }
                }
            }
        }
    }

    Ok(())
}
