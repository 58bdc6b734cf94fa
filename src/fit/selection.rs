//! Changepoint-count selection using BIC with guardrails.
//!
//! Each feasible changepoint count is fitted (in parallel) and scored with:
//! - SSE (scaled units)
//! - BIC = n * ln(SSE/n) + k * ln(n)
//!
//! Selection rules:
//! 1. Exclude underdetermined candidates: require `n >= k + 5`
//! 2. Choose the candidate with minimum BIC
//! 3. If a simpler candidate is within 2 BIC points of the best, pick the simpler one

use rayon::prelude::*;
use tracing::debug;

use crate::domain::FitQuality;
use crate::fit::changepoint_grid::feasible_counts;
use crate::fit::fitter::{FitOptions, ModelFit, fit_model};
use crate::math::place_changepoints;
use crate::models::beta_len;

/// Minimum number of extra observations beyond parameter count.
const MIN_N_BUFFER: usize = 5;

/// BIC slack within which the simpler candidate wins.
const BIC_SLACK: f64 = 2.0;

/// One scored candidate.
#[derive(Debug, Clone)]
pub struct ScoredFit {
    pub fit: ModelFit,
    pub quality: FitQuality,
}

/// Output of fitting + selection.
#[derive(Debug, Clone)]
pub struct FitSelection {
    pub best: ScoredFit,
    /// Every attempted candidate, in grid order.
    pub fits: Vec<ScoredFit>,
    /// Candidates that failed to fit and why (for diagnostics).
    pub skipped: Vec<(usize, String)>,
}

/// Fit every feasible changepoint count and select the best by BIC.
pub fn fit_and_select(
    ts: &[f64],
    y: &[f64],
    max_changepoints: usize,
    opts: &FitOptions,
) -> Result<FitSelection, String> {
    let n = ts.len();
    let fixed = beta_len(0, opts.fourier_order);
    let counts = feasible_counts(max_changepoints, n, fixed, MIN_N_BUFFER)?;

    // Evaluate each count independently (parallel); keep grid order for ties.
    let results: Vec<(usize, Result<ModelFit, String>)> = counts
        .par_iter()
        .map(|&count| {
            let cps = place_changepoints(ts, count, opts.changepoint_range);
            (count, fit_model(ts, y, &cps, opts))
        })
        .collect();

    let mut fits = Vec::new();
    let mut skipped = Vec::new();
    for (count, result) in results {
        match result {
            Ok(fit) => {
                let quality = FitQuality {
                    sse: fit.sse,
                    rmse: (fit.sse / n as f64).sqrt(),
                    bic: bic(n, fit.sse, fit.k),
                    n,
                };
                debug!(changepoints = fit.changepoints.len(), bic = quality.bic, "candidate");
                fits.push(ScoredFit { fit, quality });
            }
            Err(e) => skipped.push((count, e)),
        }
    }

    if fits.is_empty() {
        let reasons: Vec<String> = skipped.iter().map(|(c, e)| format!("{c}: {e}")).collect();
        return Err(format!("no viable candidates ({})", reasons.join("; ")));
    }

    let best = select_by_bic(&fits);
    Ok(FitSelection { best, fits, skipped })
}

fn bic(n: usize, sse: f64, k: usize) -> f64 {
    let n_f = n as f64;
    let sse_per = (sse / n_f).max(1e-12);
    n_f * sse_per.ln() + (k as f64) * n_f.ln()
}

fn select_by_bic(fits: &[ScoredFit]) -> ScoredFit {
    let best_bic = fits
        .iter()
        .map(|f| f.quality.bic)
        .fold(f64::INFINITY, f64::min);

    // `fits` is in increasing complexity; pick the first one close enough to the best.
    fits.iter()
        .find(|f| f.quality.bic <= best_bic + BIC_SLACK)
        .unwrap_or(&fits[0])
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RobustKind;

    fn opts() -> FitOptions {
        FitOptions {
            fourier_order: 3,
            changepoint_range: 0.8,
            changepoint_prior_scale: 0.5,
            seasonality_prior_scale: 10.0,
            robust: RobustKind::None,
            robust_iters: 0,
            robust_k: 1.5,
        }
    }

    fn scored(k: usize, bic: f64) -> ScoredFit {
        ScoredFit {
            fit: ModelFit {
                changepoints: vec![0.0; k],
                betas: vec![],
                sse: 1.0,
                k,
            },
            quality: FitQuality { sse: 1.0, rmse: 1.0, bic, n: 100 },
        }
    }

    #[test]
    fn bic_prefers_simpler_when_close() {
        let fits = vec![scored(0, 10.0), scored(1, 8.5), scored(2, 3.0)];
        assert_eq!(select_by_bic(&fits).fit.changepoints.len(), 2);

        let fits = vec![scored(0, 10.0), scored(1, 11.5), scored(2, 9.0)];
        assert_eq!(select_by_bic(&fits).fit.changepoints.len(), 0);
    }

    #[test]
    fn linear_data_selects_no_changepoints() {
        let ts: Vec<f64> = (0..120).map(|m| m as f64 / 12.0).collect();
        let y: Vec<f64> = ts
            .iter()
            .enumerate()
            .map(|(i, &t)| 1.0 + 0.03 * t + 0.05 * (std::f64::consts::TAU * t).sin() + 0.001 * ((i * 7 % 11) as f64 - 5.0))
            .collect();
        let sel = fit_and_select(&ts, &y, 8, &opts()).unwrap();
        assert!(sel.best.fit.changepoints.is_empty());
    }

    #[test]
    fn trend_break_selects_changepoints() {
        let ts: Vec<f64> = (0..120).map(|m| m as f64 / 12.0).collect();
        let y: Vec<f64> = ts
            .iter()
            .map(|&t| 1.0 + if t < 4.0 { 0.0 } else { 0.2 * (t - 4.0) })
            .collect();
        let sel = fit_and_select(&ts, &y, 8, &opts()).unwrap();
        assert!(!sel.best.fit.changepoints.is_empty());
        assert_eq!(sel.fits.len(), 6);
    }

    #[test]
    fn too_few_points_is_an_error() {
        let ts: Vec<f64> = (0..8).map(|m| m as f64 / 12.0).collect();
        let y = vec![1.0; 8];
        assert!(fit_and_select(&ts, &y, 3, &opts()).is_err());
    }
}
