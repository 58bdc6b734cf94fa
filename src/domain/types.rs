//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during aggregation, fitting and ranking
//! - exported to CSV/JSON
//! - reloaded later from the per-year cell store

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// The NCHS 12-bracket age recode (`ager12`).
///
/// Codes are ordinal (`1..=12`); code 12 is the residual "age not stated" bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AgeBracket {
    Under1,
    Age1To4,
    Age5To14,
    Age15To24,
    Age25To34,
    Age35To44,
    Age45To54,
    Age55To64,
    Age65To74,
    Age75To84,
    Age85Plus,
    NotStated,
}

impl AgeBracket {
    pub const ALL: [AgeBracket; 12] = [
        AgeBracket::Under1,
        AgeBracket::Age1To4,
        AgeBracket::Age5To14,
        AgeBracket::Age15To24,
        AgeBracket::Age25To34,
        AgeBracket::Age35To44,
        AgeBracket::Age45To54,
        AgeBracket::Age55To64,
        AgeBracket::Age65To74,
        AgeBracket::Age75To84,
        AgeBracket::Age85Plus,
        AgeBracket::NotStated,
    ];

    /// Ordinal recode value (`1..=12`).
    pub fn code(self) -> u8 {
        match self {
            AgeBracket::Under1 => 1,
            AgeBracket::Age1To4 => 2,
            AgeBracket::Age5To14 => 3,
            AgeBracket::Age15To24 => 4,
            AgeBracket::Age25To34 => 5,
            AgeBracket::Age35To44 => 6,
            AgeBracket::Age45To54 => 7,
            AgeBracket::Age55To64 => 8,
            AgeBracket::Age65To74 => 9,
            AgeBracket::Age75To84 => 10,
            AgeBracket::Age85Plus => 11,
            AgeBracket::NotStated => 12,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        code.checked_sub(1)
            .and_then(|idx| Self::ALL.get(idx as usize))
            .copied()
    }

    /// Human-readable label for terminal output.
    pub fn display_name(self) -> &'static str {
        match self {
            AgeBracket::Under1 => "Under 1 year",
            AgeBracket::Age1To4 => "1-4 years",
            AgeBracket::Age5To14 => "5-14 years",
            AgeBracket::Age15To24 => "15-24 years",
            AgeBracket::Age25To34 => "25-34 years",
            AgeBracket::Age35To44 => "35-44 years",
            AgeBracket::Age45To54 => "45-54 years",
            AgeBracket::Age55To64 => "55-64 years",
            AgeBracket::Age65To74 => "65-74 years",
            AgeBracket::Age75To84 => "75-84 years",
            AgeBracket::Age85Plus => "85 years and over",
            AgeBracket::NotStated => "Age not stated",
        }
    }

    /// Whether this bracket is a comparable demographic cohort.
    pub fn is_stated(self) -> bool {
        self != AgeBracket::NotStated
    }
}

impl TryFrom<u8> for AgeBracket {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("age bracket code {code} is outside 1..=12"))
    }
}

impl From<AgeBracket> for u8 {
    fn from(value: AgeBracket) -> Self {
        value.code()
    }
}

/// Sex as recorded on the cohort cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Sex {
    M,
    F,
}

impl Sex {
    pub const ALL: [Sex; 2] = [Sex::M, Sex::F];

    pub fn as_str(self) -> &'static str {
        match self {
            Sex::M => "M",
            Sex::F => "F",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Sex::M => "Males",
            Sex::F => "Females",
        }
    }

    /// Map a numeric source code: `1 → M`, everything else `→ F`.
    ///
    /// This mirrors the public-use mortality file encoding and is not a general
    /// classifier: any code other than `1` (including `0`, `2`, `9`) becomes `F`.
    pub fn from_numeric_code(code: i64) -> Self {
        if code == 1 { Sex::M } else { Sex::F }
    }

    /// Pass through an already-symbolic value (`M` / `F`).
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "M" => Some(Sex::M),
            "F" => Some(Sex::F),
            _ => None,
        }
    }
}

/// A demographic cohort: one age bracket for one sex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cohort {
    pub sex: Sex,
    pub age_bracket: AgeBracket,
}

impl Cohort {
    pub fn new(age_bracket: AgeBracket, sex: Sex) -> Self {
        Self { sex, age_bracket }
    }

    /// All 24 cohorts, males first, then by ascending age code.
    pub fn all() -> Vec<Cohort> {
        Sex::ALL
            .iter()
            .flat_map(|&sex| AgeBracket::ALL.iter().map(move |&age| Cohort::new(age, sex)))
            .collect()
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} aged {}", self.sex.display_name(), self.age_bracket.display_name())
    }
}

/// A calendar month.
///
/// Field order matters: the derived `Ord` sorts by year, then month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// Months since year 0 (`year * 12 + month - 1`).
    pub fn index(self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    pub fn from_index(index: i64) -> Self {
        Self {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    /// The month `n` months after this one.
    pub fn plus_months(self, n: i64) -> Self {
        Self::from_index(self.index() + n)
    }

    /// Signed number of months from `self` to `other`.
    pub fn months_until(self, other: YearMonth) -> i64 {
        other.index() - self.index()
    }

    /// First calendar day of the month.
    pub fn first_day(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Whether a cell was counted from records or substituted from a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellSource {
    #[default]
    Observed,
    Estimated,
}

/// One (year, month, age bracket, sex) death count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CohortCell {
    pub year: i32,
    pub month: u32,
    pub age_bracket: AgeBracket,
    pub sex: Sex,
    pub death_count: u64,
    #[serde(default)]
    pub source: CellSource,
}

impl CohortCell {
    pub fn cohort(&self) -> Cohort {
        Cohort::new(self.age_bracket, self.sex)
    }

    pub fn period(&self) -> YearMonth {
        YearMonth {
            year: self.year,
            month: self.month,
        }
    }
}

/// Ranking granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum GroupingKey {
    /// One row per cohort (totals over the whole test window).
    Cohort,
    /// One row per cohort and test month.
    CohortMonth,
}

/// Outlier-robust fitting mode.
///
/// When enabled, the fitter iteratively reweights observations based on residuals
/// (Huber IRLS). This keeps a single anomalous training month (a heat wave, a bad
/// flu season) from bending the whole baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RobustKind {
    /// Ordinary least squares (no robust reweighting).
    None,
    /// Huber M-estimator via iterative reweighted least squares.
    Huber,
}

/// One projected month of a baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub period: YearMonth,
    /// First day of `period`.
    pub date: NaiveDate,
    pub expected: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// Fit quality diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitQuality {
    pub sse: f64,
    pub rmse: f64,
    pub bic: f64,
    pub n: usize,
}

/// Fitted trend + seasonality parameters.
///
/// `t` is measured in years since `origin`; `betas` are in scaled units and
/// multiplied by `y_scale` on prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineModel {
    pub origin: YearMonth,
    pub y_scale: f64,
    pub changepoints: Vec<f64>,
    pub fourier_order: usize,
    pub betas: Vec<f64>,
}

/// A cohort's fitted baseline projected across the forecast horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineForecast {
    pub cohort: Cohort,
    /// Last training month; every point lies strictly after it.
    pub training_end: YearMonth,
    pub model: BaselineModel,
    pub quality: FitQuality,
    pub points: Vec<ForecastPoint>,
}

impl BaselineForecast {
    pub fn point(&self, period: YearMonth) -> Option<&ForecastPoint> {
        let offset = self.training_end.months_until(period);
        if offset < 1 {
            return None;
        }
        self.points
            .get(offset as usize - 1)
            .filter(|p| p.period == period)
    }
}

/// One cohort-month comparison of actual vs expected deaths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcessRecord {
    pub age_bracket: AgeBracket,
    pub sex: Sex,
    pub year: i32,
    pub month: u32,
    pub actual_death_count: u64,
    pub expected_death_count: f64,
    /// `actual - expected`; positive means more deaths than expected.
    pub excess: f64,
    pub source: CellSource,
}

impl ExcessRecord {
    pub fn cohort(&self) -> Cohort {
        Cohort::new(self.age_bracket, self.sex)
    }

    pub fn period(&self) -> YearMonth {
        YearMonth {
            year: self.year,
            month: self.month,
        }
    }
}

/// How a cohort's ranking output was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CohortStatus {
    /// Every actual count in the group was observed.
    Complete,
    /// At least one actual count came from the estimated-cell fallback.
    Estimated,
    /// The cohort has no comparable output (see the exclusion reason).
    Excluded,
}

impl CohortStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CohortStatus::Complete => "complete",
            CohortStatus::Estimated => "estimated",
            CohortStatus::Excluded => "excluded",
        }
    }
}

/// Cross-cohort summary row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRow {
    pub cohort: Cohort,
    /// Set only for cohort×month grouping.
    pub period: Option<YearMonth>,
    pub status: CohortStatus,
    pub expected_total: f64,
    pub excess_total: f64,
    /// Percent deviation; `None` when `expected_total` is zero.
    pub percent_excess: Option<f64>,
}

/// Baseline model options.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOptions {
    /// Number of yearly Fourier harmonics (1..=6 on monthly data).
    pub fourier_order: usize,
    /// Upper bound of the changepoint-count grid.
    pub max_changepoints: usize,
    /// Share of training history over which changepoints are placed.
    pub changepoint_range: f64,
    /// Prior scale (ridge) of changepoint slope deltas, in scaled units per year.
    pub changepoint_prior_scale: f64,
    /// Prior scale (ridge) of seasonal coefficients, in scaled units.
    pub seasonality_prior_scale: f64,

    pub robust: RobustKind,
    /// Number of IRLS reweight iterations.
    pub robust_iters: usize,
    /// Huber tuning constant (larger = less downweighting).
    pub robust_k: f64,

    /// Simulated paths for uncertainty bounds (0 disables bounds).
    pub uncertainty_samples: usize,
    /// Central coverage of the bounds, e.g. `0.8`.
    pub interval_width: f64,
    /// Base seed for the uncertainty simulation.
    pub seed: u64,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            fourier_order: 4,
            max_changepoints: 25,
            changepoint_range: 0.8,
            changepoint_prior_scale: 0.05,
            seasonality_prior_scale: 10.0,
            robust: RobustKind::None,
            robust_iters: 3,
            robust_k: 1.5,
            uncertainty_samples: 1000,
            interval_width: 0.8,
            seed: 42,
        }
    }
}

/// Minimum number of distinct training years needed to identify a trend.
pub const MIN_TRAINING_YEARS: usize = 2;

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags (plus defaults and `.env`).
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub store_dir: PathBuf,
    /// Optional secondary source with coarse age labels.
    pub labeled_source: Option<PathBuf>,
    /// Optional externally maintained label table (defaults to the built-in one).
    pub label_table: Option<PathBuf>,

    pub training_years: BTreeSet<i32>,
    pub test_years: BTreeSet<i32>,
    pub forecast_horizon_months: usize,
    pub grouping: GroupingKey,
    pub model: ModelOptions,

    /// Substitute model-estimated cells for test years missing from the store.
    pub estimate_missing: bool,

    pub top_n: usize,
    pub export_excess: Option<PathBuf>,
    pub export_ranking: Option<PathBuf>,
    pub export_forecasts: Option<PathBuf>,
}

impl RunConfig {
    /// Check cross-field constraints that clap cannot express.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let (Some(&last_train), Some(&first_test)) =
            (self.training_years.last(), self.test_years.first())
        else {
            return Err(PipelineError::InvalidConfig(
                "training and test year sets must both be non-empty".to_string(),
            ));
        };
        if last_train >= first_test {
            return Err(PipelineError::InvalidConfig(format!(
                "training years must precede test years (last training year {last_train}, first test year {first_test})"
            )));
        }
        if self.forecast_horizon_months == 0 {
            return Err(PipelineError::InvalidConfig(
                "forecast horizon must be at least one month".to_string(),
            ));
        }
        let m = &self.model;
        if !(1..=6).contains(&m.fourier_order) {
            return Err(PipelineError::InvalidConfig(format!(
                "fourier order {} is outside 1..=6",
                m.fourier_order
            )));
        }
        if m.max_changepoints > 100 {
            return Err(PipelineError::InvalidConfig(format!(
                "max changepoints {} is unreasonably large for monthly data",
                m.max_changepoints
            )));
        }
        if !(m.changepoint_range.is_finite() && m.changepoint_range > 0.0 && m.changepoint_range <= 1.0) {
            return Err(PipelineError::InvalidConfig(
                "changepoint range must be in (0, 1]".to_string(),
            ));
        }
        if !(m.changepoint_prior_scale.is_finite() && m.changepoint_prior_scale > 0.0)
            || !(m.seasonality_prior_scale.is_finite() && m.seasonality_prior_scale > 0.0)
        {
            return Err(PipelineError::InvalidConfig(
                "prior scales must be finite and > 0".to_string(),
            ));
        }
        if !(m.interval_width.is_finite() && m.interval_width > 0.0 && m.interval_width < 1.0) {
            return Err(PipelineError::InvalidConfig(
                "interval width must be in (0, 1)".to_string(),
            ));
        }
        if !(m.robust_k.is_finite() && m.robust_k > 0.0) {
            return Err(PipelineError::InvalidConfig("robust k must be > 0".to_string()));
        }
        Ok(())
    }

    /// Months from the end of training needed to reach the last test month.
    pub fn months_to_cover_tests(&self) -> Option<usize> {
        let last_train = *self.training_years.last()?;
        let last_test = *self.test_years.last()?;
        let end = YearMonth { year: last_train, month: 12 };
        let stop = YearMonth { year: last_test, month: 12 };
        usize::try_from(end.months_until(stop)).ok()
    }
}
