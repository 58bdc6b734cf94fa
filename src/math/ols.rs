//! Penalized least squares solver.
//!
//! Every baseline fit solves a small linear regression of the form:
//!
//! ```text
//! minimize Σ w_i (y_i - x_i^T β)^2 + Σ_j λ_j β_j^2
//! ```
//!
//! Implementation choices:
//! - Observation rows are scaled by `sqrt(w_i)`.
//! - The ridge term is expressed as one synthetic zero-valued row per penalized
//!   coefficient (`sqrt(λ_j)` on the diagonal), so the augmented system is a plain
//!   least-squares problem.
//! - We solve with SVD because the design is tall and may be rank-deficient
//!   (e.g. the 6th yearly harmonic has an all-zero sine column on monthly data).
//!   Nalgebra's `QR::solve` is intended for square systems.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if the strict solve fails.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Weighted, ridge-penalized least squares.
///
/// - `rows`: unweighted design rows (all of length `p`)
/// - `penalties`: per-coefficient ridge weight `λ_j` (length `p`, `0.0` = unpenalized)
pub fn solve_penalized(
    rows: &[Vec<f64>],
    y: &[f64],
    weights: &[f64],
    penalties: &[f64],
) -> Option<Vec<f64>> {
    let n = rows.len();
    let p = penalties.len();
    if n == 0 || p == 0 || y.len() != n || weights.len() != n {
        return None;
    }

    let penalized: Vec<(usize, f64)> = penalties
        .iter()
        .enumerate()
        .filter(|(_, lambda)| **lambda > 0.0)
        .map(|(j, &lambda)| (j, lambda.sqrt()))
        .collect();

    let m = n + penalized.len();
    let mut xw = DMatrix::<f64>::zeros(m, p);
    let mut yw = DVector::<f64>::zeros(m);

    for (i, row) in rows.iter().enumerate() {
        if row.len() != p {
            return None;
        }
        let sw = weights[i].sqrt();
        for (j, &v) in row.iter().enumerate() {
            xw[(i, j)] = v * sw;
        }
        yw[i] = y[i] * sw;
    }
    for (k, &(j, s)) in penalized.iter().enumerate() {
        xw[(n + k, j)] = s;
    }

    solve_least_squares(&xw, &yw).map(|beta| beta.iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn penalty_shrinks_only_penalized_coefficients() {
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![1.0, i as f64]).collect();
        let y: Vec<f64> = (0..10).map(|i| 1.0 + 0.5 * i as f64).collect();
        let w = vec![1.0; 10];

        let free = solve_penalized(&rows, &y, &w, &[0.0, 0.0]).unwrap();
        assert!((free[1] - 0.5).abs() < 1e-9);

        let shrunk = solve_penalized(&rows, &y, &w, &[0.0, 1e6]).unwrap();
        assert!(shrunk[1].abs() < 0.01, "slope should be shrunk, got {}", shrunk[1]);
    }

    #[test]
    fn rank_deficient_column_is_handled() {
        // Second column is identically zero; ridge keeps the system solvable.
        let rows: Vec<Vec<f64>> = (0..6).map(|_| vec![1.0, 0.0]).collect();
        let y = vec![4.0; 6];
        let w = vec![1.0; 6];
        let beta = solve_penalized(&rows, &y, &w, &[0.0, 0.01]).unwrap();
        assert!((beta[0] - 4.0).abs() < 1e-9);
        assert!(beta[1].abs() < 1e-9);
    }
}
