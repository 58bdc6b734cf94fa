//! Model evaluation for the trend + seasonality baseline.
//!
//! The fitter relies on two primitive operations:
//! - build a design row for a given time and changepoint set (for least squares)
//! - predict y(t) given fitted betas (for residuals and forecasts)
//!
//! Coefficient layout:
//!
//! ```text
//! [ intercept, slope, δ_1 .. δ_C, sin_1, cos_1, .. sin_K, cos_K ]
//! ```

use crate::domain::{BaselineModel, YearMonth};
use crate::math::{fourier, hinge};

/// Which part of the model a coefficient belongs to (drives the ridge penalty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoefKind {
    Level,
    Slope,
    Changepoint,
    Seasonal,
}

/// Number of coefficients for `changepoints` changepoints and `order` harmonics.
pub fn beta_len(changepoints: usize, order: usize) -> usize {
    2 + changepoints + 2 * order
}

/// Coefficient kinds in layout order.
pub fn coef_kinds(changepoints: usize, order: usize) -> Vec<CoefKind> {
    let mut out = Vec::with_capacity(beta_len(changepoints, order));
    out.push(CoefKind::Level);
    out.push(CoefKind::Slope);
    out.extend(std::iter::repeat_n(CoefKind::Changepoint, changepoints));
    out.extend(std::iter::repeat_n(CoefKind::Seasonal, 2 * order));
    out
}

/// Fill a design row at time `t` (years since the model origin).
///
/// # Panics
/// Panics if `out` is shorter than `beta_len(changepoints.len(), order)`.
pub fn fill_design_row(t: f64, changepoints: &[f64], order: usize, out: &mut [f64]) {
    out[0] = 1.0;
    out[1] = t;
    let mut j = 2;
    for &c in changepoints {
        out[j] = hinge(t, c);
        j += 1;
    }
    for k in 1..=order {
        let (s, c) = fourier(t, k);
        out[j] = s;
        out[j + 1] = c;
        j += 2;
    }
}

/// Trend component only (level + slope + changepoint deltas).
pub fn predict_trend(t: f64, changepoints: &[f64], betas: &[f64]) -> f64 {
    let mut y = betas[0] + betas[1] * t;
    for (j, &c) in changepoints.iter().enumerate() {
        y += betas[2 + j] * hinge(t, c);
    }
    y
}

/// Seasonal component only.
pub fn predict_seasonal(t: f64, changepoints: usize, order: usize, betas: &[f64]) -> f64 {
    let base = 2 + changepoints;
    (1..=order)
        .map(|k| {
            let (s, c) = fourier(t, k);
            betas[base + 2 * (k - 1)] * s + betas[base + 2 * (k - 1) + 1] * c
        })
        .sum()
}

/// Predict `y(t)` in scaled units.
pub fn predict(t: f64, changepoints: &[f64], order: usize, betas: &[f64]) -> f64 {
    predict_trend(t, changepoints, betas) + predict_seasonal(t, changepoints.len(), order, betas)
}

/// Time coordinate (years) of `period` relative to `origin`.
pub fn time_of(origin: YearMonth, period: YearMonth) -> f64 {
    origin.months_until(period) as f64 / 12.0
}

impl BaselineModel {
    /// Expected deaths for `period`, in original (unscaled) units.
    pub fn expected_at(&self, period: YearMonth) -> f64 {
        let t = time_of(self.origin, period);
        self.y_scale * predict(t, &self.changepoints, self.fourier_order, &self.betas)
    }
}
