//! WSI Dataset - manifests, tile extraction and validation splits.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsi_dataset::{
    config::{Cli, Command, ExtractConfig, ManifestConfig, SplitConfig},
    extract::{ExtractionScheduler, ProcessWorker, SlideOutcome},
    source::path_to_name,
    split::SplitPlanner,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Manifest(config) => run_manifest(config),
        Command::Extract(config) => run_extract(config).await,
        Command::Split(config) => run_split(config),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "wsi_dataset=debug"
    } else {
        "wsi_dataset=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Manifest Command
// =============================================================================

fn run_manifest(config: ManifestConfig) -> ExitCode {
    init_logging(config.dataset.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let dataset = match config.dataset.open() {
        Ok(dataset) => dataset,
        Err(e) => {
            error!("Unable to load dataset: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = dataset.update_manifest(config.force) {
        error!("Unable to update manifest: {}", e);
        return ExitCode::FAILURE;
    }

    let manifest = match dataset.manifest() {
        Ok(manifest) => manifest,
        Err(e) => {
            error!("Unable to read manifest: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut total = 0;
    for (shard, entry) in &manifest {
        println!("{}\t{}", path_to_name(shard), entry.total);
        total += entry.total;
    }
    println!();
    println!("Total: {} tiles in {} shard(s)", total, manifest.len());

    ExitCode::SUCCESS
}

// =============================================================================
// Extract Command
// =============================================================================

async fn run_extract(config: ExtractConfig) -> ExitCode {
    init_logging(config.dataset.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let Some(scheduler_config) = config.scheduler_config() else {
        error!("Configuration error: missing tile geometry");
        return ExitCode::FAILURE;
    };

    let dataset = match config.dataset.open() {
        Ok(dataset) => dataset,
        Err(e) => {
            error!("Unable to load dataset: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Configuration:");
    info!("  Worker: {}", config.worker_program.display());
    info!("  Concurrent slides: {}", scheduler_config.worker_count);
    if let Some(ref buffer) = scheduler_config.buffer_dir {
        info!("  Buffer: {}", buffer.display());
    }

    let worker = ProcessWorker::new(&config.worker_program).with_args(config.worker_args.clone());
    let scheduler = ExtractionScheduler::new(worker, scheduler_config);

    let summaries = match scheduler.run(&dataset).await {
        Ok(summaries) => summaries,
        Err(e) => {
            error!("Extraction failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut failed = 0;
    for summary in &summaries {
        info!(
            "{}: {} done ({} retried), {} skipped, {} failed, {} already extracted, {} tiles",
            summary.source,
            summary.count(SlideOutcome::Done),
            summary.retried(),
            summary.count(SlideOutcome::Skipped),
            summary.count(SlideOutcome::Failed),
            summary.already_extracted,
            summary.extracted_tiles
        );
        failed += summary.count(SlideOutcome::Failed);
    }

    if summaries.iter().any(|s| s.cancelled) {
        warn!("Extraction was cancelled before every slide was processed");
        return ExitCode::FAILURE;
    }
    if failed > 0 {
        warn!("{} slide(s) failed extraction", failed);
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Split Command
// =============================================================================

fn run_split(config: SplitConfig) -> ExitCode {
    init_logging(config.dataset.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let dataset = match config.dataset.open() {
        Ok(dataset) => dataset,
        Err(e) => {
            error!("Unable to load dataset: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let planner = SplitPlanner::new().with_span(dataset.span().clone());
    let split = match planner.split(&dataset, &config.split_options()) {
        Ok(split) => split,
        Err(e) => {
            error!("Unable to split dataset: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let tiles = |view: &wsi_dataset::Dataset| view.num_tiles().unwrap_or(0);
    println!("Strategy: {}", config.strategy);
    if let Some(ref key) = split.plan_key {
        let origin = if split.reused { "reused" } else { "new" };
        println!("Plan: {} ({})", key, origin);
    }
    println!(
        "Training: {} slides, {} tiles",
        split.training_slides.len(),
        tiles(&split.training)
    );
    println!(
        "Validation: {} slides, {} tiles",
        split.validation_slides.len(),
        tiles(&split.validation)
    );

    ExitCode::SUCCESS
}
