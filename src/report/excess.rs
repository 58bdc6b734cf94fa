//! Excess mortality per cohort-month: actual minus expected deaths.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::data::dataset::CohortSeries;
use crate::domain::{BaselineForecast, Cohort, ExcessRecord, YearMonth};
use crate::error::PipelineError;

/// Why a cohort produced no comparable output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    /// Residual "age not stated" bucket; not a demographic cohort.
    AgeNotStated,
    /// No realized test months.
    NoTestData,
    InsufficientTrainingData { distinct_years: usize, required: usize },
    UnalignedForecast { period: YearMonth },
    FitFailed { message: String },
}

impl From<&PipelineError> for ExclusionReason {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::InsufficientTrainingData {
                distinct_years,
                required,
                ..
            } => ExclusionReason::InsufficientTrainingData {
                distinct_years: *distinct_years,
                required: *required,
            },
            PipelineError::UnalignedForecast { period, .. } => ExclusionReason::UnalignedForecast { period: *period },
            PipelineError::Fit { message, .. } => ExclusionReason::FitFailed {
                message: message.clone(),
            },
            other => ExclusionReason::FitFailed {
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::AgeNotStated => write!(f, "age not stated"),
            ExclusionReason::NoTestData => write!(f, "no data in the test window"),
            ExclusionReason::InsufficientTrainingData {
                distinct_years,
                required,
            } => write!(f, "insufficient training data ({distinct_years} of {required} years)"),
            ExclusionReason::UnalignedForecast { period } => write!(f, "no forecast for {period}"),
            ExclusionReason::FitFailed { message } => write!(f, "fit failed: {message}"),
        }
    }
}

/// A cohort's forecast plus its excess records.
#[derive(Debug, Clone)]
pub struct CohortExcess {
    pub cohort: Cohort,
    pub forecast: BaselineForecast,
    pub records: Vec<ExcessRecord>,
}

/// Result of the per-cohort stage of a batch.
#[derive(Debug, Clone)]
pub enum CohortOutcome {
    Computed(CohortExcess),
    Excluded { cohort: Cohort, reason: ExclusionReason },
}

impl CohortOutcome {
    pub fn cohort(&self) -> Cohort {
        match self {
            CohortOutcome::Computed(c) => c.cohort,
            CohortOutcome::Excluded { cohort, .. } => *cohort,
        }
    }
}

/// One record per realized test month of `series`, matched to `forecast` by period.
///
/// Test months without an actual count are dropped. A realized month the forecast
/// does not cover is an `UnalignedForecast` error.
pub fn compute_excess(
    series: &CohortSeries,
    test_years: &BTreeSet<i32>,
    forecast: &BaselineForecast,
) -> Result<Vec<ExcessRecord>, PipelineError> {
    series
        .cells()
        .iter()
        .filter(|c| test_years.contains(&c.year))
        .map(|cell| {
            let period = cell.period();
            let point = forecast
                .point(period)
                .ok_or(PipelineError::UnalignedForecast {
                    cohort: series.cohort,
                    period,
                })?;
            let actual = cell.death_count;
            Ok(ExcessRecord {
                age_bracket: cell.age_bracket,
                sex: cell.sex,
                year: cell.year,
                month: cell.month,
                actual_death_count: actual,
                expected_death_count: point.expected,
                excess: actual as f64 - point.expected,
                source: cell.source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AgeBracket, BaselineModel, CellSource, CohortCell, FitQuality, ForecastPoint, Sex,
    };

    fn forecast(cohort: Cohort, end: YearMonth, expected: &[f64]) -> BaselineForecast {
        let points = expected
            .iter()
            .enumerate()
            .map(|(h, &v)| {
                let period = end.plus_months(h as i64 + 1);
                ForecastPoint {
                    period,
                    date: period.first_day(),
                    expected: v,
                    lower: None,
                    upper: None,
                }
            })
            .collect();
        BaselineForecast {
            cohort,
            training_end: end,
            model: BaselineModel {
                origin: end,
                y_scale: 1.0,
                changepoints: vec![],
                fourier_order: 1,
                betas: vec![0.0; 4],
            },
            quality: FitQuality { sse: 0.0, rmse: 0.0, bic: 0.0, n: 24 },
            points,
        }
    }

    fn series(cohort: Cohort, cells: &[(i32, u32, u64)]) -> CohortSeries {
        CohortSeries::from_cells(
            cohort,
            cells
                .iter()
                .map(|&(year, month, n)| CohortCell {
                    year,
                    month,
                    age_bracket: cohort.age_bracket,
                    sex: cohort.sex,
                    death_count: n,
                    source: CellSource::Observed,
                })
                .collect(),
        )
    }

    #[test]
    fn excess_sign_follows_actual_minus_expected() {
        let cohort = Cohort::new(AgeBracket::Age75To84, Sex::M);
        let end = YearMonth::new(2019, 12).unwrap();
        let f = forecast(cohort, end, &[100.0, 100.0]);
        let s = series(cohort, &[(2019, 12, 90), (2020, 1, 120), (2020, 2, 80)]);

        let records = compute_excess(&s, &[2020].into_iter().collect(), &f).unwrap();
        assert_eq!(records.len(), 2);
        assert!((records[0].excess - 20.0).abs() < 1e-12);
        assert!((records[1].excess + 20.0).abs() < 1e-12);
        assert_eq!(records[0].actual_death_count, 120);
    }

    #[test]
    fn months_without_actuals_are_dropped() {
        let cohort = Cohort::new(AgeBracket::Age1To4, Sex::F);
        let end = YearMonth::new(2019, 12).unwrap();
        let f = forecast(cohort, end, &[5.0; 12]);
        let s = series(cohort, &[(2020, 3, 6)]);
        let records = compute_excess(&s, &[2020].into_iter().collect(), &f).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].month, 3);
    }

    #[test]
    fn uncovered_month_is_unaligned() {
        let cohort = Cohort::new(AgeBracket::Age1To4, Sex::F);
        let end = YearMonth::new(2019, 12).unwrap();
        let f = forecast(cohort, end, &[5.0; 6]);
        let s = series(cohort, &[(2020, 3, 6), (2020, 9, 7)]);
        let err = compute_excess(&s, &[2020].into_iter().collect(), &f).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UnalignedForecast { period, .. } if period == YearMonth::new(2020, 9).unwrap()
        ));
    }

    #[test]
    fn exclusion_reason_carries_upstream_detail() {
        let err = PipelineError::InsufficientTrainingData {
            cohort: Cohort::new(AgeBracket::Under1, Sex::M),
            distinct_years: 1,
            required: 2,
        };
        let reason = ExclusionReason::from(&err);
        assert_eq!(
            reason,
            ExclusionReason::InsufficientTrainingData {
                distinct_years: 1,
                required: 2
            }
        );
        assert!(reason.to_string().contains("1 of 2"));
    }
}
