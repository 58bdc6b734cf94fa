//! Baseline forecasting for one cohort.
//!
//! Workflow:
//! 1. take the training split of a cohort series
//! 2. scale counts by `max |y|` and fit trend + seasonality (BIC over changepoints)
//! 3. project one expected value per month across the horizon
//! 4. optionally simulate uncertainty bounds (seeded, reproducible)
//!
//! Point forecasts are deterministic: repeated fits on identical inputs agree to
//! within 1e-9 relative. Bounds depend on the seed only.

use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Exp, Normal};
use tracing::debug;

use crate::data::dataset::CohortSeries;
use crate::domain::{
    BaselineForecast, BaselineModel, CellSource, Cohort, CohortCell, FitQuality, ForecastPoint,
    MIN_TRAINING_YEARS, ModelOptions, YearMonth,
};
use crate::error::PipelineError;
use crate::fit::fitter::FitOptions;
use crate::fit::selection::fit_and_select;
use crate::models::{predict, time_of};

/// Fit a cohort's baseline on `training_years` and project `horizon_months` past
/// the last training month.
pub fn forecast_cohort(
    series: &CohortSeries,
    training_years: &BTreeSet<i32>,
    horizon_months: usize,
    opts: &ModelOptions,
) -> Result<BaselineForecast, PipelineError> {
    let cohort = series.cohort;
    let training: Vec<&CohortCell> = series
        .cells()
        .iter()
        .filter(|c| training_years.contains(&c.year))
        .collect();

    let distinct_years = training.iter().map(|c| c.year).collect::<BTreeSet<_>>().len();
    if distinct_years < MIN_TRAINING_YEARS {
        return Err(PipelineError::InsufficientTrainingData {
            cohort,
            distinct_years,
            required: MIN_TRAINING_YEARS,
        });
    }

    // Series cells are sorted by (year, month), so first/last are the window ends.
    let (Some(first), Some(last)) = (training.first(), training.last()) else {
        return Err(PipelineError::InsufficientTrainingData {
            cohort,
            distinct_years: 0,
            required: MIN_TRAINING_YEARS,
        });
    };
    let origin = first.period();
    let training_end = last.period();

    let ts: Vec<f64> = training.iter().map(|c| time_of(origin, c.period())).collect();
    let raw: Vec<f64> = training.iter().map(|c| c.death_count as f64).collect();
    let max_abs = raw.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let y_scale = if max_abs > 0.0 { max_abs } else { 1.0 };
    let y: Vec<f64> = raw.iter().map(|v| v / y_scale).collect();

    let fit_opts = FitOptions::from(opts);
    let selection = fit_and_select(&ts, &y, opts.max_changepoints, &fit_opts)
        .map_err(|message| PipelineError::Fit { cohort, message })?;
    for (count, reason) in &selection.skipped {
        debug!(%cohort, count, reason = reason.as_str(), "changepoint candidate skipped");
    }

    let best = selection.best;
    let n = ts.len();
    let model = BaselineModel {
        origin,
        y_scale,
        changepoints: best.fit.changepoints.clone(),
        fourier_order: opts.fourier_order,
        betas: best.fit.betas.clone(),
    };

    let periods: Vec<YearMonth> = (1..=horizon_months as i64)
        .map(|h| training_end.plus_months(h))
        .collect();
    let expected: Vec<f64> = periods.iter().map(|&p| model.expected_at(p)).collect();
    if expected.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::Fit {
            cohort,
            message: "non-finite forecast value".to_string(),
        });
    }

    let bounds = simulate_bounds(
        &model,
        &periods,
        n,
        best.fit.sse,
        best.fit.k,
        opts,
        cohort_seed(opts.seed, cohort),
    );

    let points = periods
        .iter()
        .zip(expected.iter())
        .enumerate()
        .map(|(h, (&period, &value))| ForecastPoint {
            period,
            date: period.first_day(),
            expected: value,
            lower: bounds.as_ref().map(|b| b[h].0),
            upper: bounds.as_ref().map(|b| b[h].1),
        })
        .collect();

    // Report fit quality in death-count units.
    let scale_sq = y_scale * y_scale;
    let quality = FitQuality {
        sse: best.quality.sse * scale_sq,
        rmse: best.quality.rmse * y_scale,
        bic: best.quality.bic + n as f64 * scale_sq.ln(),
        n,
    };

    debug!(
        %cohort,
        changepoints = model.changepoints.len(),
        rmse = quality.rmse,
        "baseline fitted"
    );

    Ok(BaselineForecast {
        cohort,
        training_end,
        model,
        quality,
        points,
    })
}

/// Convert forecasts into estimated cells for `years` (the dataset fallback).
///
/// Counts are rounded and floored at zero; every cell is tagged `Estimated`.
pub fn estimated_cells(forecasts: &[BaselineForecast], years: &BTreeSet<i32>) -> Vec<CohortCell> {
    forecasts
        .iter()
        .flat_map(|f| {
            f.points
                .iter()
                .filter(|p| years.contains(&p.period.year))
                .map(move |p| CohortCell {
                    year: p.period.year,
                    month: p.period.month,
                    age_bracket: f.cohort.age_bracket,
                    sex: f.cohort.sex,
                    death_count: p.expected.max(0.0).round() as u64,
                    source: CellSource::Estimated,
                })
        })
        .collect()
}

/// Deterministic per-cohort seed derived from the configured base seed.
fn cohort_seed(seed: u64, cohort: Cohort) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    cohort.hash(&mut hasher);
    hasher.finish()
}

/// Simulate `(lower, upper)` bounds per horizon month, in death-count units.
///
/// Each path adds future trend changes (changepoints arriving at the historical
/// rate with Laplace magnitudes) and Gaussian residual noise to the point forecast.
fn simulate_bounds(
    model: &BaselineModel,
    periods: &[YearMonth],
    n_train: usize,
    sse: f64,
    k: usize,
    opts: &ModelOptions,
    seed: u64,
) -> Option<Vec<(f64, f64)>> {
    if opts.uncertainty_samples == 0 || periods.is_empty() {
        return None;
    }

    let dof = n_train.saturating_sub(k).max(1) as f64;
    let sigma = (sse / dof).sqrt();
    let n_cp = model.changepoints.len();
    let deltas = &model.betas[2..2 + n_cp];
    let mean_abs_delta = if n_cp > 0 {
        deltas.iter().map(|d| d.abs()).sum::<f64>() / n_cp as f64
    } else {
        0.0
    };
    let change_prob = n_cp as f64 / n_train.max(1) as f64;

    let noise = Normal::new(0.0, sigma.max(0.0)).ok()?;
    let jump = if mean_abs_delta > 0.0 {
        Exp::new(1.0 / mean_abs_delta).ok()
    } else {
        None
    };

    let base: Vec<f64> = periods
        .iter()
        .map(|&p| {
            let t = time_of(model.origin, p);
            predict(t, &model.changepoints, model.fourier_order, &model.betas)
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples: Vec<Vec<f64>> = vec![Vec::with_capacity(opts.uncertainty_samples); periods.len()];
    for _ in 0..opts.uncertainty_samples {
        let mut slope_dev = 0.0;
        let mut level_dev = 0.0;
        for (h, &yhat) in base.iter().enumerate() {
            if let Some(jump) = &jump {
                if rng.r#gen::<f64>() < change_prob {
                    let magnitude = jump.sample(&mut rng);
                    slope_dev += if rng.r#gen::<bool>() { magnitude } else { -magnitude };
                }
            }
            level_dev += slope_dev / 12.0;
            samples[h].push(yhat + level_dev + noise.sample(&mut rng));
        }
    }

    let lo_q = (1.0 - opts.interval_width) / 2.0;
    let hi_q = 1.0 - lo_q;
    Some(
        samples
            .into_iter()
            .map(|mut values| {
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                (
                    quantile_sorted(&values, lo_q) * model.y_scale,
                    quantile_sorted(&values, hi_q) * model.y_scale,
                )
            })
            .collect(),
    )
}

/// Linear-interpolated quantile of an ascending slice.
fn quantile_sorted(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    values[lo] + (values[hi] - values[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgeBracket, Sex};

    fn series(cohort: Cohort, years: std::ops::RangeInclusive<i32>) -> CohortSeries {
        let cells: Vec<CohortCell> = years
            .flat_map(|year| {
                (1..=12u32).map(move |month| {
                    let t = (year - 2000) as f64 + (month - 1) as f64 / 12.0;
                    let seasonal = 60.0 * (std::f64::consts::TAU * t).cos();
                    let value = 1000.0 + 8.0 * t + seasonal + ((year as u32 * 31 + month * 17) % 7) as f64;
                    CohortCell {
                        year,
                        month,
                        age_bracket: cohort.age_bracket,
                        sex: cohort.sex,
                        death_count: value.round() as u64,
                        source: CellSource::Observed,
                    }
                })
            })
            .collect();
        CohortSeries::from_cells(cohort, cells)
    }

    fn train(years: std::ops::RangeInclusive<i32>) -> BTreeSet<i32> {
        years.collect()
    }

    fn opts() -> ModelOptions {
        ModelOptions {
            uncertainty_samples: 200,
            max_changepoints: 5,
            ..ModelOptions::default()
        }
    }

    #[test]
    fn horizon_has_one_point_per_month_on_first_day() {
        let cohort = Cohort::new(AgeBracket::Age65To74, Sex::M);
        let s = series(cohort, 2010..=2019);
        let f = forecast_cohort(&s, &train(2010..=2019), 25, &opts()).unwrap();

        assert_eq!(f.points.len(), 25);
        assert_eq!(f.training_end, YearMonth::new(2019, 12).unwrap());
        assert_eq!(f.points[0].period, YearMonth::new(2020, 1).unwrap());
        assert_eq!(f.points[24].period, YearMonth::new(2022, 1).unwrap());
        for p in &f.points {
            assert_eq!(p.date, p.period.first_day());
            let (lo, hi) = (p.lower.unwrap(), p.upper.unwrap());
            assert!(lo <= p.expected + 1e-6 && p.expected <= hi + 1e-6);
        }
        assert!(f.point(YearMonth::new(2021, 6).unwrap()).is_some());
        assert!(f.point(YearMonth::new(2019, 6).unwrap()).is_none());
    }

    #[test]
    fn forecast_tracks_trend_and_season() {
        let cohort = Cohort::new(AgeBracket::Age75To84, Sex::F);
        let s = series(cohort, 2005..=2019);
        let f = forecast_cohort(&s, &train(2005..=2019), 12, &opts()).unwrap();
        // Truth at 2020-01 ≈ 1000 + 8*20 + 60 + noise(0..6).
        let jan = f.points[0].expected;
        assert!((jan - 1223.0).abs() < 15.0, "jan forecast {jan}");
        // Winter peak above summer trough.
        assert!(f.points[0].expected > f.points[6].expected);
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let cohort = Cohort::new(AgeBracket::Age45To54, Sex::M);
        let s = series(cohort, 2012..=2019);
        let a = forecast_cohort(&s, &train(2012..=2019), 24, &opts()).unwrap();
        let b = forecast_cohort(&s, &train(2012..=2019), 24, &opts()).unwrap();
        for (pa, pb) in a.points.iter().zip(&b.points) {
            let tol = 1e-9 * pa.expected.abs().max(1.0);
            assert!((pa.expected - pb.expected).abs() <= tol);
            assert_eq!(pa.lower, pb.lower);
            assert_eq!(pa.upper, pb.upper);
        }
    }

    #[test]
    fn single_training_year_is_rejected() {
        let cohort = Cohort::new(AgeBracket::Age25To34, Sex::F);
        let s = series(cohort, 2019..=2019);
        let err = forecast_cohort(&s, &train(2010..=2019), 12, &opts()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientTrainingData { distinct_years: 1, required: 2, .. }
        ));
    }

    #[test]
    fn zero_samples_disables_bounds() {
        let cohort = Cohort::new(AgeBracket::Age55To64, Sex::M);
        let s = series(cohort, 2015..=2019);
        let o = ModelOptions {
            uncertainty_samples: 0,
            ..opts()
        };
        let f = forecast_cohort(&s, &train(2015..=2019), 6, &o).unwrap();
        assert!(f.points.iter().all(|p| p.lower.is_none() && p.upper.is_none()));
    }

    #[test]
    fn estimated_cells_are_tagged_and_filtered_by_year() {
        let cohort = Cohort::new(AgeBracket::Age85Plus, Sex::F);
        let s = series(cohort, 2015..=2019);
        let f = forecast_cohort(&s, &train(2015..=2019), 24, &opts()).unwrap();
        let cells = estimated_cells(&[f], &[2021].into_iter().collect());
        assert_eq!(cells.len(), 12);
        assert!(cells.iter().all(|c| c.year == 2021 && c.source == CellSource::Estimated));
    }

    #[test]
    fn quantile_interpolates() {
        let v = [0.0, 10.0];
        assert!((quantile_sorted(&v, 0.5) - 5.0).abs() < 1e-12);
        assert_eq!(quantile_sorted(&v, 0.0), 0.0);
        assert_eq!(quantile_sorted(&v, 1.0), 10.0);
    }
}
