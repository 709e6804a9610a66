//! mocap-reduce - motion-capture trial reduction
//!
//! Reads raw trial recordings, fills gaps, trims idle tails, averages trials
//! and participants and smooths the experiment means.

use std::path::Path;

use anyhow::{bail, Context};
use mocap_reduce::cli::{Cli, Commands, ConfigAction};
use mocap_reduce::reference::rank_candidates;
use mocap_reduce::{Pipeline, PipelineConfig, Recording};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    // --verbose enables debug-level output; RUST_LOG overrides both
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let init = matches!(
        cli.command,
        Commands::Config {
            action: ConfigAction::Init { .. }
        }
    );
    let config = match &cli.config {
        Some(path) if !init => PipelineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        _ => PipelineConfig::default(),
    };

    match &cli.command {
        Commands::Run { input, output } => run_pipeline(input, output, config)?,
        Commands::Score { input, experiment } => run_score(input, experiment.as_deref(), config)?,
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", config.to_toml()?),
            ConfigAction::Init { force } => run_init(&cli.config_path(), *force, &config)?,
        },
    }

    Ok(())
}

fn run_pipeline(input: &Path, output: &Path, config: PipelineConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(config).context("invalid configuration")?;
    let result = pipeline
        .run_directory(input, output)
        .with_context(|| format!("processing {}", input.display()))?;

    let report = &result.report;
    for skipped in &report.skipped {
        warn!(source = %skipped.source, "skipped: {}", skipped.reason);
    }
    for (experiment, marker) in &report.unresolved_references {
        warn!(experiment, %marker, "boundary gaps left open: no reference");
    }
    info!(
        recordings = report.recordings.len(),
        participants = result.participant_means.len(),
        experiments = result.smoothed.len(),
        skipped = report.skipped.len(),
        synthetic = report.synthetic_samples(),
        "done"
    );
    Ok(())
}

fn run_score(input: &Path, experiment: Option<&str>, config: PipelineConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(config).context("invalid configuration")?;
    let (recordings, skipped) = pipeline
        .load_directory(input)
        .with_context(|| format!("reading {}", input.display()))?;
    for s in &skipped {
        warn!(source = %s.source, "skipped: {}", s.reason);
    }

    let (cleaned, _) = pipeline.clean(recordings);
    let cleaned: Vec<Recording> = cleaned.into_iter().map(|(r, _)| r).collect();
    let all: Vec<&Recording> = cleaned.iter().collect();

    let mut experiments: Vec<&str> = all.iter().map(|r| r.key().experiment.as_str()).collect();
    experiments.sort_unstable();
    experiments.dedup();
    if let Some(wanted) = experiment {
        if !experiments.contains(&wanted) {
            bail!("experiment {wanted} not found under {}", input.display());
        }
        experiments.retain(|e| *e == wanted);
    }

    let config = pipeline.config();
    for experiment in experiments {
        for &marker in &config.reference.anchor_markers {
            let ranked = rank_candidates(experiment, &all, marker, config);
            if ranked.is_empty() {
                continue;
            }
            println!("{experiment} marker {marker}");
            println!("  {:>4}  {:<24} {:>8} {:>6} {:>6} {:>8}", "rank", "recording", "valid", "gaps", "run", "score");
            for (rank, c) in ranked.iter().enumerate() {
                println!(
                    "  {:>4}  {:<24} {:>7.1}% {:>6} {:>6} {:>8.4}",
                    rank + 1,
                    c.recording.key().to_string(),
                    c.metric.valid_fraction * 100.0,
                    c.metric.gap_runs,
                    c.metric.longest_valid_run,
                    c.score
                );
            }
        }
    }
    Ok(())
}

fn run_init(path: &Path, force: bool, config: &PipelineConfig) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    config
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Configuration written to {}", path.display());
    Ok(())
}
