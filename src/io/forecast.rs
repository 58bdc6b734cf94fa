//! Forecast JSON export.
//!
//! The file captures each cohort's fitted baseline (model parameters, fit
//! quality, projected points with bounds) plus the cohorts that were excluded,
//! so a run can be inspected or re-plotted without refitting.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{BaselineForecast, RunConfig};
use crate::error::PipelineError;
use crate::report::excess::CohortOutcome;
use crate::report::rank::Exclusion;

/// Serializable run metadata stored next to the forecasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastRunMeta {
    pub tool: String,
    pub training_years: BTreeSet<i32>,
    pub test_years: BTreeSet<i32>,
    pub forecast_horizon_months: usize,
    pub fourier_order: usize,
    pub interval_width: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ForecastFile<'a> {
    run: ForecastRunMeta,
    forecasts: Vec<&'a BaselineForecast>,
    excluded: &'a [Exclusion],
}

/// Write every computed forecast plus the exclusion list as pretty JSON.
pub fn write_forecasts_json(
    path: &Path,
    outcomes: &[CohortOutcome],
    excluded: &[Exclusion],
    config: &RunConfig,
) -> Result<(), PipelineError> {
    let mut forecasts: Vec<&BaselineForecast> = outcomes
        .iter()
        .filter_map(|o| match o {
            CohortOutcome::Computed(c) => Some(&c.forecast),
            CohortOutcome::Excluded { .. } => None,
        })
        .collect();
    forecasts.sort_by_key(|f| f.cohort);

    let file = ForecastFile {
        run: ForecastRunMeta {
            tool: "xm".to_string(),
            training_years: config.training_years.clone(),
            test_years: config.test_years.clone(),
            forecast_horizon_months: config.forecast_horizon_months,
            fourier_order: config.model.fourier_order,
            interval_width: config.model.interval_width,
            seed: config.model.seed,
        },
        forecasts,
        excluded,
    };

    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &file)?;
    Ok(())
}
