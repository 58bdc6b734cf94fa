//! Data layer: aggregation, label reconciliation, dataset assembly and storage.

pub mod aggregate;
pub mod dataset;
pub mod labels;
pub mod store;

pub use aggregate::*;
pub use dataset::*;
pub use labels::*;
pub use store::*;
