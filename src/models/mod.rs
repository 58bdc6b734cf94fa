//! Baseline model implementation.
//!
//! The model is implemented as small, pure functions so that fitting/search code can
//! stay generic over the changepoint set.

pub mod model;

pub use model::*;
