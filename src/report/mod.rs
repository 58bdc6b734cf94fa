//! Reporting: excess per cohort-month, cross-cohort ranking, terminal output.

pub mod excess;
pub mod format;
pub mod rank;

pub use excess::*;
pub use format::*;
pub use rank::*;
