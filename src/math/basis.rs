//! Basis functions for the trend + yearly seasonality baseline.
//!
//! - `hinge(t, c) = max(0, t - c)` adds a slope change at changepoint `c`, so a
//!   linear combination of hinges is a continuous piecewise-linear trend.
//! - `fourier(t, k)` is the `k`-th yearly harmonic `(sin 2πkt, cos 2πkt)` with `t`
//!   measured in years.
//!
//! Numerical notes:
//! - `t` is built from integer month offsets divided by 12, so `2πkt` lands on
//!   multiples of `π/6`. At `k = 6` the sine term is zero up to rounding; we snap
//!   tiny values to exactly zero so the column is cleanly rank-deficient rather
//!   than noise.

use std::f64::consts::TAU;

/// Values below this magnitude are treated as exact zeros.
const SNAP_EPS: f64 = 1e-12;

/// Slope-change basis for a changepoint at `c`.
pub fn hinge(t: f64, c: f64) -> f64 {
    (t - c).max(0.0)
}

/// The `k`-th yearly Fourier pair `(sin, cos)` at time `t` (years).
pub fn fourier(t: f64, k: usize) -> (f64, f64) {
    let x = TAU * k as f64 * t;
    (snap(x.sin()), snap(x.cos()))
}

fn snap(v: f64) -> f64 {
    if v.abs() < SNAP_EPS { 0.0 } else { v }
}

/// Evenly place `count` changepoints over the first `range` share of `ts`.
///
/// `ts` must be sorted ascending. Positions are taken at observed times (never
/// the very first point), so each changepoint has data on both sides.
pub fn place_changepoints(ts: &[f64], count: usize, range: f64) -> Vec<f64> {
    if count == 0 || ts.len() < 3 {
        return Vec::new();
    }
    let hist = ((ts.len() as f64) * range.clamp(0.0, 1.0)).floor() as usize;
    let hist = hist.clamp(2, ts.len());
    let last = (hist - 1) as f64;

    let mut out: Vec<f64> = (1..=count)
        .map(|i| {
            let idx = (last * i as f64 / count as f64).round() as usize;
            ts[idx.min(ts.len() - 1)]
        })
        .collect();
    out.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
    out
}
