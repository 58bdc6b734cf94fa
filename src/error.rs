use thiserror::Error;

use crate::domain::{Cohort, YearMonth};

/// Typed failures raised by the aggregation/forecast/excess pipeline.
///
/// Ingestion errors (schema, labels, duplicates) abort the run. Per-cohort errors
/// (`InsufficientTrainingData`, `UnalignedForecast`, `Fit`) only exclude that cohort.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Schema error in {source_name}: {message}")]
    Schema { source_name: String, message: String },

    #[error("Unknown cohort label '{label}' in {source_name}")]
    UnknownCohortLabel { source_name: String, label: String },

    #[error("Insufficient training data for {cohort}: {distinct_years} distinct year(s), need {required}")]
    InsufficientTrainingData {
        cohort: Cohort,
        distinct_years: usize,
        required: usize,
    },

    #[error("No forecast point for {cohort} at {period}")]
    UnalignedForecast { cohort: Cohort, period: YearMonth },

    #[error("Invalid label table: {0}")]
    InvalidLabelTable(String),

    #[error("Duplicate cell for {cohort} at {period} in {source_name}")]
    DuplicateCell {
        source_name: String,
        cohort: Cohort,
        period: YearMonth,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Fit failed for {cohort}: {message}")]
    Fit { cohort: Cohort, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether the failure is confined to a single cohort's fit/excess computation.
    pub fn is_cohort_local(&self) -> bool {
        matches!(
            self,
            PipelineError::InsufficientTrainingData { .. }
                | PipelineError::UnalignedForecast { .. }
                | PipelineError::Fit { .. }
        )
    }

    /// Process exit code used when this error ends the run.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Schema { .. }
            | PipelineError::UnknownCohortLabel { .. }
            | PipelineError::InvalidLabelTable(_)
            | PipelineError::DuplicateCell { .. }
            | PipelineError::InvalidConfig(_)
            | PipelineError::Io(_)
            | PipelineError::Csv(_)
            | PipelineError::Json(_) => 2,
            PipelineError::InsufficientTrainingData { .. } => 3,
            PipelineError::UnalignedForecast { .. } | PipelineError::Fit { .. } => 4,
        }
    }
}

/// Error surfaced by the `xm` binary: a message plus a process exit code.
#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError::new(err.exit_code(), err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}
