//! Mathematical utilities: basis functions and penalized least squares.

pub mod basis;
pub mod ols;

pub use basis::*;
pub use ols::*;
