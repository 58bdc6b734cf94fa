//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - initializes logging and `.env` configuration
//! - parses CLI arguments
//! - aggregates person-level files into the cell store
//! - runs the batch pipeline and prints reports
//! - writes optional exports

use std::fs::File;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{AggregateArgs, Command, RunArgs};
use crate::data::aggregate::aggregate_person_csv;
use crate::data::store::DirCellStore;
use crate::domain::{ModelOptions, RunConfig};
use crate::error::AppError;

pub mod pipeline;

/// Environment variable naming the default cell-store directory.
pub const STORE_DIR_ENV: &str = "XM_STORE_DIR";

const DEFAULT_STORE_DIR: &str = "cache";

/// Entry point for the `xm` binary.
pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = crate::cli::Cli::parse();
    match cli.command {
        Command::Aggregate(args) => handle_aggregate(args),
        Command::Run(args) => handle_run(args, OutputMode::Full),
        Command::Rank(args) => handle_run(args, OutputMode::RankOnly),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Full,
    RankOnly,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second init (e.g. in tests) is harmless; keep the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn handle_aggregate(args: AggregateArgs) -> Result<(), AppError> {
    let file = File::open(&args.input)
        .map_err(|e| AppError::new(2, format!("Failed to open '{}': {e}", args.input.display())))?;
    let output = aggregate_person_csv(file, &args.input.display().to_string(), args.year)?;

    let store = DirCellStore::new(resolve_store_dir(args.store));
    let path = store.put(args.year, &output.cells)?;
    info!(path = %path.display(), "cell store updated");

    let total: u64 = output.cells.iter().map(|c| c.death_count).sum();
    println!(
        "Aggregated {} of {} rows into {} cells ({} deaths) -> {}",
        output.rows_read.saturating_sub(output.row_errors.len()),
        output.rows_read,
        output.cells.len(),
        total,
        path.display()
    );
    Ok(())
}

fn handle_run(args: RunArgs, mode: OutputMode) -> Result<(), AppError> {
    let config = run_config_from_args(&args);
    let store = DirCellStore::new(&config.store_dir);
    let cache = pipeline::BatchCache::new();
    let run = pipeline::run_batch(&config, &store, &cache)?;

    match mode {
        OutputMode::Full => {
            println!("{}", crate::report::format_run_summary(&run, &config));
        }
        OutputMode::RankOnly => {}
    }
    println!("{}", crate::report::format_ranking(&run.ranking, config.top_n));

    // Optional exports.
    if let Some(path) = &config.export_excess {
        let records: Vec<_> = run
            .batch
            .outcomes
            .iter()
            .filter_map(|o| match o {
                crate::report::CohortOutcome::Computed(c) => Some(c.records.iter().cloned()),
                crate::report::CohortOutcome::Excluded { .. } => None,
            })
            .flatten()
            .collect();
        crate::io::export::write_excess_csv(path, &records)?;
        info!(path = %path.display(), rows = records.len(), "exported excess records");
    }
    if let Some(path) = &config.export_ranking {
        crate::io::export::write_ranking_csv(path, &run.ranking)?;
        info!(path = %path.display(), "exported ranking");
    }
    if let Some(path) = &config.export_forecasts {
        crate::io::forecast::write_forecasts_json(path, &run.batch.outcomes, &run.ranking.excluded, &config)?;
        info!(path = %path.display(), "exported forecasts");
    }

    Ok(())
}

/// CLI flag, then `$XM_STORE_DIR` (possibly from `.env`), then `cache`.
fn resolve_store_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(STORE_DIR_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR))
}

pub fn run_config_from_args(args: &RunArgs) -> RunConfig {
    RunConfig {
        store_dir: resolve_store_dir(args.store.clone()),
        labeled_source: args.labeled.clone(),
        label_table: args.label_table.clone(),
        training_years: args.train.clone(),
        test_years: args.test.clone(),
        forecast_horizon_months: args.horizon,
        grouping: args.grouping,
        model: ModelOptions {
            fourier_order: args.fourier_order,
            max_changepoints: args.max_changepoints,
            changepoint_range: args.changepoint_range,
            changepoint_prior_scale: args.changepoint_prior_scale,
            seasonality_prior_scale: args.seasonality_prior_scale,
            robust: args.robust,
            robust_iters: args.robust_iters,
            robust_k: args.robust_k,
            uncertainty_samples: args.samples,
            interval_width: args.interval_width,
            seed: args.seed,
        },
        estimate_missing: args.estimate_missing,
        top_n: args.top,
        export_excess: args.export_excess.clone(),
        export_ranking: args.export_ranking.clone(),
        export_forecasts: args.export_forecasts.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;

    #[test]
    fn explicit_store_flag_wins() {
        assert_eq!(
            resolve_store_dir(Some(PathBuf::from("/tmp/xm"))),
            PathBuf::from("/tmp/xm")
        );
    }

    #[test]
    fn config_from_args_carries_model_options() {
        let cli = Cli::parse_from([
            "xm",
            "run",
            "--store",
            "data",
            "--train",
            "2010-2019",
            "--test",
            "2020",
            "--fourier-order",
            "3",
            "--robust",
            "huber",
            "--samples",
            "0",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = run_config_from_args(&args);
        assert_eq!(config.store_dir, PathBuf::from("data"));
        assert_eq!(config.training_years.len(), 10);
        assert_eq!(config.model.fourier_order, 3);
        assert_eq!(config.model.robust, crate::domain::RobustKind::Huber);
        assert_eq!(config.model.uncertainty_samples, 0);
        assert!(config.validate().is_ok());
    }
}
