//! Baseline fitting orchestration.
//!
//! Responsibilities:
//!
//! - generate the changepoint-count grid
//! - fit each candidate configuration (parallel)
//! - select the best candidate using BIC + guardrails
//! - project forecasts and uncertainty bounds per cohort

pub mod changepoint_grid;
pub mod fitter;
pub mod forecast;
pub mod selection;

pub use changepoint_grid::*;
pub use fitter::*;
pub use forecast::*;
pub use selection::*;
