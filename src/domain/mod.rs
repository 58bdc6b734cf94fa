//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - cohort keys (`AgeBracket`, `Sex`, `Cohort`, `YearMonth`)
//! - aggregated count cells (`CohortCell`, tagged observed vs estimated)
//! - forecaster, excess and ranking outputs
//! - the run configuration (`RunConfig`, `ModelOptions`)

pub mod types;

pub use types::*;
