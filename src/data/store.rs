//! Per-year cohort cell storage.
//!
//! The pipeline only depends on the `CellStore` trait; `DirCellStore` is the
//! on-disk adapter (`<dir>/<year>.csv`), `MemoryCellStore` an in-process one.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::data::dataset::LabeledCell;
use crate::domain::CohortCell;
use crate::error::PipelineError;
use crate::io::ingest;

/// Source of aggregated cohort cells, one year at a time.
pub trait CellStore: Sync {
    /// `Ok(None)` means the year is not available in this store.
    fn fetch_cohort_cells(&self, year: i32) -> Result<Option<Vec<CohortCell>>, PipelineError>;

    /// Stable name of the data behind this store; part of the batch cache key.
    ///
    /// Two stores with the same identity must serve the same cells.
    fn identity(&self) -> String;
}

/// Directory of `<year>.csv` files with columns
/// `year,month,age_bracket,sex,death_count[,source]`.
#[derive(Debug, Clone)]
pub struct DirCellStore {
    dir: PathBuf,
}

impl DirCellStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, year: i32) -> PathBuf {
        self.dir.join(format!("{year}.csv"))
    }

    /// Write (or replace) one year of cells. Returns the file path.
    pub fn put(&self, year: i32, cells: &[CohortCell]) -> Result<PathBuf, PipelineError> {
        if let Some(bad) = cells.iter().find(|c| c.year != year) {
            return Err(PipelineError::Schema {
                source_name: self.path_for(year).display().to_string(),
                message: format!("cell for year {} written into year {year}", bad.year),
            });
        }
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(year);
        let mut writer = csv::Writer::from_path(&path)?;
        for cell in cells {
            writer.serialize(cell)?;
        }
        writer.flush()?;
        debug!(path = %path.display(), cells = cells.len(), "wrote cohort cells");
        Ok(path)
    }
}

impl CellStore for DirCellStore {
    fn fetch_cohort_cells(&self, year: i32) -> Result<Option<Vec<CohortCell>>, PipelineError> {
        let path = self.path_for(year);
        if !path.exists() {
            return Ok(None);
        }

        let source_name = path.display().to_string();
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(&path)?;
        let mut cells = Vec::new();
        for (idx, row) in reader.deserialize::<CohortCell>().enumerate() {
            let cell = row.map_err(|e| PipelineError::Schema {
                source_name: source_name.clone(),
                message: format!("line {}: {e}", idx + 2),
            })?;
            if cell.year != year {
                return Err(PipelineError::Schema {
                    source_name,
                    message: format!("line {}: year {} in file for {year}", idx + 2, cell.year),
                });
            }
            cells.push(cell);
        }
        debug!(year, cells = cells.len(), "loaded cohort cells");
        Ok(Some(cells))
    }

    fn identity(&self) -> String {
        format!("dir:{}", self.dir.display())
    }
}

/// In-memory store keyed by year.
#[derive(Debug, Clone, Default)]
pub struct MemoryCellStore {
    years: BTreeMap<i32, Vec<CohortCell>>,
}

impl MemoryCellStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, year: i32, cells: Vec<CohortCell>) {
        self.years.insert(year, cells);
    }
}

impl CellStore for MemoryCellStore {
    fn fetch_cohort_cells(&self, year: i32) -> Result<Option<Vec<CohortCell>>, PipelineError> {
        Ok(self.years.get(&year).cloned())
    }

    /// Content digest, so a changed or different store never shares a key.
    fn identity(&self) -> String {
        let mut h = DefaultHasher::new();
        self.years.hash(&mut h);
        format!("memory:{:016x}", h.finish())
    }
}

/// Read a secondary labeled source from disk, logging skipped rows.
pub fn read_labeled_csv(path: &Path) -> Result<Vec<LabeledCell>, PipelineError> {
    let source_name = path.display().to_string();
    let file = File::open(path)?;
    let (rows, row_errors) = ingest::read_labeled_csv(file, &source_name)?;
    for e in row_errors.iter().take(10) {
        warn!(source = %source_name, line = e.line, "{}", e.message);
    }
    if !row_errors.is_empty() {
        warn!(
            source = %source_name,
            skipped = row_errors.len(),
            kept = rows.len(),
            "skipped rows in labeled source"
        );
    }
    Ok(rows)
}
