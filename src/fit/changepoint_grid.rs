//! Changepoint-count grid generation.
//!
//! The trend is piecewise linear with evenly spaced changepoints. Rather than
//! optimizing changepoint locations (nonlinear, with local minima), we fit a
//! deterministic grid of candidate counts and let BIC pick one.

/// Candidate changepoint counts, roughly geometric so long histories can bend
/// several times while short ones stay near-linear.
const COUNT_LADDER: [usize; 9] = [0, 1, 2, 3, 5, 8, 12, 18, 25];

/// Counts from the ladder up to `max`, always including `max` itself.
pub fn changepoint_counts(max: usize) -> Vec<usize> {
    let mut out: Vec<usize> = COUNT_LADDER.iter().copied().filter(|&c| c <= max).collect();
    if out.last() != Some(&max) {
        out.push(max);
    }
    out
}

/// Counts that leave at least `buffer` residual degrees of freedom for `n`
/// observations with `fixed` non-changepoint coefficients.
pub fn feasible_counts(
    max: usize,
    n: usize,
    fixed: usize,
    buffer: usize,
) -> Result<Vec<usize>, String> {
    let out: Vec<usize> = changepoint_counts(max)
        .into_iter()
        .filter(|&c| n >= fixed + c + buffer)
        .collect();
    if out.is_empty() {
        return Err(format!(
            "underdetermined: n={n} < k+{buffer}={}",
            fixed + buffer
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_include_zero_and_max() {
        assert_eq!(changepoint_counts(0), vec![0]);
        assert_eq!(changepoint_counts(4), vec![0, 1, 2, 3, 4]);
        assert_eq!(changepoint_counts(25), COUNT_LADDER.to_vec());
    }

    #[test]
    fn feasible_counts_respect_degrees_of_freedom() {
        // 24 points, 10 fixed coefficients, buffer 5 -> at most 9 changepoints.
        let counts = feasible_counts(25, 24, 10, 5).unwrap();
        assert_eq!(counts, vec![0, 1, 2, 3, 5, 8]);
        assert!(feasible_counts(25, 12, 10, 5).is_err());
    }
}
