//! Command-line parsing for the excess-mortality pipeline.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the modeling/math code.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::{GroupingKey, RobustKind};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "xm", version, about = "Cohort excess mortality from trend + seasonality baselines")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Aggregate a person-level mortality file into one year of cohort cells.
    Aggregate(AggregateArgs),
    /// Fit baselines, compute excess, print diagnostics/ranking and optionally export.
    Run(RunArgs),
    /// Print the ranking table only (useful for scripting).
    Rank(RunArgs),
}

/// Options for `xm aggregate`.
#[derive(Debug, Args, Clone)]
pub struct AggregateArgs {
    /// Person-level CSV with `ager12`, `monthdth` and `sex` columns.
    #[arg(long, value_name = "CSV")]
    pub input: PathBuf,

    /// Data year of the file.
    #[arg(long)]
    pub year: i32,

    /// Cell store directory (defaults to `$XM_STORE_DIR`, then `cache`).
    #[arg(long, value_name = "DIR")]
    pub store: Option<PathBuf>,
}

/// Common options for running and ranking.
#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Cell store directory (defaults to `$XM_STORE_DIR`, then `cache`).
    #[arg(long, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// Secondary source with coarse age labels (`year,month,sex,age_group,death_count`).
    #[arg(long, value_name = "CSV")]
    pub labeled: Option<PathBuf>,

    /// Label table for the secondary source (`label,age_bracket`); built-in if omitted.
    #[arg(long, value_name = "CSV")]
    pub label_table: Option<PathBuf>,

    /// Training years, e.g. `2000-2019` or `2015,2016,2017`.
    #[arg(long, value_parser = parse_year_set, default_value = "2000-2019")]
    pub train: BTreeSet<i32>,

    /// Test years, e.g. `2020-2021`.
    #[arg(long, value_parser = parse_year_set, default_value = "2020,2021")]
    pub test: BTreeSet<i32>,

    /// Months to project past the last training month.
    #[arg(long, default_value_t = 25)]
    pub horizon: usize,

    /// Ranking granularity.
    #[arg(long, value_enum, default_value_t = GroupingKey::Cohort)]
    pub grouping: GroupingKey,

    /// Yearly Fourier order (1..=6).
    #[arg(long, default_value_t = 4)]
    pub fourier_order: usize,

    /// Largest changepoint count considered.
    #[arg(long, default_value_t = 25)]
    pub max_changepoints: usize,

    /// Share of training history eligible for changepoints.
    #[arg(long, default_value_t = 0.8)]
    pub changepoint_range: f64,

    /// Ridge prior scale of changepoint deltas.
    #[arg(long, default_value_t = 0.05)]
    pub changepoint_prior_scale: f64,

    /// Ridge prior scale of seasonal coefficients.
    #[arg(long, default_value_t = 10.0)]
    pub seasonality_prior_scale: f64,

    /// Robust fitting mode (outlier downweighting).
    #[arg(long, value_enum, default_value_t = RobustKind::None)]
    pub robust: RobustKind,

    /// Number of IRLS reweight iterations (robust mode).
    #[arg(long, default_value_t = 3)]
    pub robust_iters: usize,

    /// Huber tuning constant (robust mode).
    #[arg(long, default_value_t = 1.5)]
    pub robust_k: f64,

    /// Simulated paths for uncertainty bounds (0 disables bounds).
    #[arg(long, default_value_t = 1000)]
    pub samples: usize,

    /// Central coverage of the uncertainty bounds.
    #[arg(long, default_value_t = 0.8)]
    pub interval_width: f64,

    /// Random seed for the uncertainty simulation.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Substitute model-estimated cells for test years missing from the store.
    #[arg(long)]
    pub estimate_missing: bool,

    /// Show the top-N ranked rows.
    #[arg(long, default_value_t = 20)]
    pub top: usize,

    /// Export per cohort-month excess records to CSV.
    #[arg(long, value_name = "CSV")]
    pub export_excess: Option<PathBuf>,

    /// Export the full ranking (plus exclusions) to CSV.
    #[arg(long, value_name = "CSV")]
    pub export_ranking: Option<PathBuf>,

    /// Export fitted baselines and forecasts to JSON.
    #[arg(long, value_name = "JSON")]
    pub export_forecasts: Option<PathBuf>,
}

/// Parse `2000-2019`, `2020,2021` or a mix such as `2000-2009,2012`.
pub fn parse_year_set(s: &str) -> Result<BTreeSet<i32>, String> {
    let mut years = BTreeSet::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((a, b)) => {
                let a: i32 = a.trim().parse().map_err(|_| format!("invalid year '{a}'"))?;
                let b: i32 = b.trim().parse().map_err(|_| format!("invalid year '{b}'"))?;
                if a > b {
                    return Err(format!("year range {a}-{b} is reversed"));
                }
                years.extend(a..=b);
            }
            None => {
                years.insert(part.parse().map_err(|_| format!("invalid year '{part}'"))?);
            }
        }
    }
    if years.is_empty() {
        return Err("year set is empty".to_string());
    }
    Ok(years)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_sets_parse_ranges_and_lists() {
        assert_eq!(parse_year_set("2000-2003").unwrap(), (2000..=2003).collect());
        assert_eq!(parse_year_set("2020, 2021").unwrap(), [2020, 2021].into_iter().collect());
        assert_eq!(
            parse_year_set("2000-2001,2005").unwrap(),
            [2000, 2001, 2005].into_iter().collect()
        );
        assert!(parse_year_set("2021-2020").is_err());
        assert!(parse_year_set("").is_err());
        assert!(parse_year_set("20x0").is_err());
    }

    #[test]
    fn run_defaults_parse() {
        let cli = Cli::parse_from(["xm", "run", "--train", "2015-2019", "--test", "2020"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.train.len(), 5);
        assert_eq!(args.horizon, 25);
        assert_eq!(args.grouping, GroupingKey::Cohort);
        assert!(!args.estimate_missing);
    }

    #[test]
    fn grouping_accepts_kebab_case() {
        let cli = Cli::parse_from(["xm", "rank", "--grouping", "cohort-month"]);
        let Command::Rank(args) = cli.command else {
            panic!("expected rank");
        };
        assert_eq!(args.grouping, GroupingKey::CohortMonth);
    }
}
