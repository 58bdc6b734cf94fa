//! Input/output helpers.
//!
//! - CSV ingest + validation (`ingest`)
//! - excess/ranking CSV exports (`export`)
//! - forecast JSON export (`forecast`)

pub mod export;
pub mod forecast;
pub mod ingest;

pub use export::*;
pub use forecast::*;
pub use ingest::*;
