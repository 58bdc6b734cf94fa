//! Low-level fitting routines for a single changepoint configuration.
//!
//! Given:
//! - times `t_i` (years since the first training month)
//! - scaled observed deaths `y_i`
//! - a fixed changepoint set and Fourier order
//!
//! we solve a ridge-penalized least squares problem for the betas and return
//! the resulting SSE. Robust mode wraps this in Huber IRLS.

use tracing::debug;

use crate::domain::{ModelOptions, RobustKind};
use crate::math::solve_penalized;
use crate::models::{CoefKind, beta_len, coef_kinds, fill_design_row, predict};

/// Fitting options that affect how each candidate is calibrated.
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub fourier_order: usize,
    /// Share of history eligible for changepoints.
    pub changepoint_range: f64,
    pub changepoint_prior_scale: f64,
    pub seasonality_prior_scale: f64,

    /// Robust fitting mode (outlier downweighting).
    pub robust: RobustKind,
    /// Number of IRLS reweight iterations.
    pub robust_iters: usize,
    /// Huber tuning constant.
    pub robust_k: f64,
}

impl From<&ModelOptions> for FitOptions {
    fn from(m: &ModelOptions) -> Self {
        Self {
            fourier_order: m.fourier_order,
            changepoint_range: m.changepoint_range,
            changepoint_prior_scale: m.changepoint_prior_scale,
            seasonality_prior_scale: m.seasonality_prior_scale,
            robust: m.robust,
            robust_iters: m.robust_iters,
            robust_k: m.robust_k,
        }
    }
}

/// Best fit for a single changepoint configuration.
#[derive(Debug, Clone)]
pub struct ModelFit {
    pub changepoints: Vec<f64>,
    pub betas: Vec<f64>,
    /// Unweighted SSE in scaled units.
    pub sse: f64,
    /// Effective parameter count (betas).
    pub k: usize,
}

/// Fit the model for one changepoint set.
pub fn fit_model(ts: &[f64], y: &[f64], changepoints: &[f64], opts: &FitOptions) -> Result<ModelFit, String> {
    if ts.is_empty() || ts.len() != y.len() {
        return Err("no data points to fit".to_string());
    }
    if ts.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err("non-finite training data".to_string());
    }

    let p = beta_len(changepoints.len(), opts.fourier_order);
    let rows = design_rows(ts, changepoints, opts.fourier_order);
    let penalties = ridge_penalties(changepoints.len(), opts);

    // Robust fitting is a small number of outer iterations:
    //
    // - start with uniform weights
    // - solve the penalized regression
    // - compute residuals
    // - update weights (Huber) and repeat
    let w_base = vec![1.0; ts.len()];
    let mut w_work = w_base.clone();

    let n_refits = match opts.robust {
        RobustKind::None => 1,
        RobustKind::Huber => opts.robust_iters.saturating_add(1).max(1),
    };

    let mut betas: Option<Vec<f64>> = None;
    for iter in 0..n_refits {
        let Some(candidate) = solve_penalized(&rows, y, &w_work, &penalties) else {
            return Err(format!(
                "least squares failed with {} changepoint(s)",
                changepoints.len()
            ));
        };

        if opts.robust == RobustKind::None {
            betas = Some(candidate);
            break;
        }

        let residuals = compute_residuals(ts, y, changepoints, opts.fourier_order, &candidate);
        w_work = huber_reweight(&w_base, &residuals, opts.robust_k);
        debug!(iter, changepoints = changepoints.len(), "huber reweight");
        betas = Some(candidate);
    }

    let Some(betas) = betas else {
        return Err("no fit produced".to_string());
    };

    let sse: f64 = compute_residuals(ts, y, changepoints, opts.fourier_order, &betas)
        .iter()
        .map(|r| r * r)
        .sum();
    if !sse.is_finite() {
        return Err("non-finite SSE".to_string());
    }

    Ok(ModelFit {
        changepoints: changepoints.to_vec(),
        betas,
        sse,
        k: p,
    })
}

fn design_rows(ts: &[f64], changepoints: &[f64], order: usize) -> Vec<Vec<f64>> {
    let p = beta_len(changepoints.len(), order);
    ts.iter()
        .map(|&t| {
            let mut row = vec![0.0; p];
            fill_design_row(t, changepoints, order, &mut row);
            row
        })
        .collect()
}

/// Ridge weights `λ = 1 / scale²` per coefficient; level and slope are free.
fn ridge_penalties(changepoints: usize, opts: &FitOptions) -> Vec<f64> {
    let cp = 1.0 / (opts.changepoint_prior_scale * opts.changepoint_prior_scale);
    let seasonal = 1.0 / (opts.seasonality_prior_scale * opts.seasonality_prior_scale);
    coef_kinds(changepoints, opts.fourier_order)
        .into_iter()
        .map(|kind| match kind {
            CoefKind::Level | CoefKind::Slope => 0.0,
            CoefKind::Changepoint => cp,
            CoefKind::Seasonal => seasonal,
        })
        .collect()
}

pub(crate) fn compute_residuals(
    ts: &[f64],
    y: &[f64],
    changepoints: &[f64],
    order: usize,
    betas: &[f64],
) -> Vec<f64> {
    ts.iter()
        .zip(y.iter())
        .map(|(&t, &yi)| yi - predict(t, changepoints, order, betas))
        .collect()
}

fn huber_reweight(w_base: &[f64], residuals: &[f64], k: f64) -> Vec<f64> {
    // Scale via MAD (median absolute deviation); no RNG involved.
    let mut abs: Vec<f64> = residuals.iter().map(|r| r.abs()).filter(|v| v.is_finite()).collect();
    let mad = median_mut(&mut abs).unwrap_or(0.0);
    let scale = (mad / 0.6745).max(1e-12);
    let cutoff = (k.max(1e-6)) * scale;

    let min_factor = 1e-3;
    w_base
        .iter()
        .zip(residuals.iter())
        .map(|(&w0, &r)| {
            let ar = r.abs();
            let factor = if ar <= cutoff || !ar.is_finite() { 1.0 } else { cutoff / ar };
            (w0 * factor).max(w0 * min_factor)
        })
        .collect()
}

fn median_mut(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}
