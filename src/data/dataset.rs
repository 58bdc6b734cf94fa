//! Cohort dataset assembly.
//!
//! A `DatasetBuilder` merges cells from one or more sources into a single
//! cohort×month table:
//!
//! - observed cells from the per-year store (`add_cells`)
//! - secondary sources with coarse age labels (`add_labeled`)
//! - model-estimated cells for years with no observed data (`add_estimated`)
//!
//! `build` freezes the result into an immutable `CohortDataset`.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{info, warn};

use crate::data::labels::{LabelMatch, LabelTable};
use crate::domain::{CellSource, Cohort, CohortCell, Sex, YearMonth};
use crate::error::PipelineError;

type CellKey = (Cohort, YearMonth);

/// A row from a secondary source before label reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledCell {
    pub year: i32,
    pub month: u32,
    pub sex: Sex,
    pub label: String,
    pub death_count: u64,
}

/// One cohort's cells, sorted by (year, month) with at most one cell per month.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortSeries {
    pub cohort: Cohort,
    cells: Vec<CohortCell>,
}

impl CohortSeries {
    /// Keep the cells belonging to `cohort`, sorted by period.
    ///
    /// If a period appears twice the first occurrence is kept.
    pub fn from_cells(cohort: Cohort, cells: Vec<CohortCell>) -> Self {
        let mut cells: Vec<CohortCell> = cells.into_iter().filter(|c| c.cohort() == cohort).collect();
        cells.sort_by_key(CohortCell::period);
        cells.dedup_by_key(|c| c.period());
        Self { cohort, cells }
    }

    pub fn cells(&self) -> &[CohortCell] {
        &self.cells
    }

    pub fn get(&self, period: YearMonth) -> Option<&CohortCell> {
        self.cells
            .binary_search_by_key(&period, CohortCell::period)
            .ok()
            .map(|idx| &self.cells[idx])
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Accumulates cells from several sources.
#[derive(Debug, Clone, Default)]
pub struct DatasetBuilder {
    cells: Vec<CohortCell>,
    index: HashMap<CellKey, usize>,
    observed_years: BTreeSet<i32>,
    conflicts: usize,
}

impl DatasetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add observed cells from one source. Returns the number of cells kept.
    ///
    /// A key repeated inside `cells` is a `DuplicateCell` error. A key already
    /// supplied by an earlier source is skipped (the earlier source wins).
    pub fn add_cells(&mut self, source_name: &str, cells: Vec<CohortCell>) -> Result<usize, PipelineError> {
        let mut seen: HashSet<CellKey> = HashSet::with_capacity(cells.len());
        for cell in &cells {
            if YearMonth::new(cell.year, cell.month).is_none() {
                return Err(PipelineError::Schema {
                    source_name: source_name.to_string(),
                    message: format!("month {} is outside 1..=12", cell.month),
                });
            }
            if cell.source != CellSource::Observed {
                return Err(PipelineError::Schema {
                    source_name: source_name.to_string(),
                    message: format!("estimated cell for {} {} in an observed source", cell.cohort(), cell.period()),
                });
            }
            let key = (cell.cohort(), cell.period());
            if !seen.insert(key) {
                return Err(PipelineError::DuplicateCell {
                    source_name: source_name.to_string(),
                    cohort: key.0,
                    period: key.1,
                });
            }
        }

        let mut added = 0;
        let mut conflicts = 0;
        for cell in cells {
            let key = (cell.cohort(), cell.period());
            if self.index.contains_key(&key) {
                conflicts += 1;
                continue;
            }
            self.observed_years.insert(cell.year);
            self.index.insert(key, self.cells.len());
            self.cells.push(cell);
            added += 1;
        }

        if conflicts > 0 {
            warn!(
                source = source_name,
                conflicts, "cells already supplied by an earlier source were skipped"
            );
        }
        self.conflicts += conflicts;
        Ok(added)
    }

    /// Add a secondary source, mapping its age labels through `table`.
    ///
    /// Ignored aggregate labels are counted and logged. An unmapped label fails
    /// the whole source.
    pub fn add_labeled(
        &mut self,
        source_name: &str,
        rows: Vec<LabeledCell>,
        table: &LabelTable,
    ) -> Result<usize, PipelineError> {
        let mut cells = Vec::with_capacity(rows.len());
        let mut ignored = 0usize;
        for row in rows {
            match table.resolve(source_name, &row.label)? {
                LabelMatch::Bracket(age_bracket) => cells.push(CohortCell {
                    year: row.year,
                    month: row.month,
                    age_bracket,
                    sex: row.sex,
                    death_count: row.death_count,
                    source: CellSource::Observed,
                }),
                LabelMatch::Ignored => ignored += 1,
            }
        }
        if ignored > 0 {
            info!(source = source_name, ignored, "skipped rows with aggregate age labels");
        }
        self.add_cells(source_name, cells)
    }

    /// Requested years with no observed cells.
    pub fn missing_years(&self, requested: &BTreeSet<i32>) -> BTreeSet<i32> {
        requested.difference(&self.observed_years).copied().collect()
    }

    /// Add model-estimated cells for years that have no observed data.
    ///
    /// The batch is validated as a whole; on error the builder is unchanged.
    pub fn add_estimated(&mut self, cells: Vec<CohortCell>) -> Result<usize, PipelineError> {
        let mut seen: HashSet<CellKey> = HashSet::with_capacity(cells.len());
        for cell in &cells {
            if cell.source != CellSource::Estimated {
                return Err(PipelineError::InvalidConfig(format!(
                    "fallback cell for {} {} is not tagged estimated",
                    cell.cohort(),
                    cell.period()
                )));
            }
            if self.observed_years.contains(&cell.year) {
                return Err(PipelineError::InvalidConfig(format!(
                    "year {} has observed data and cannot be estimated",
                    cell.year
                )));
            }
            let key = (cell.cohort(), cell.period());
            if self.index.contains_key(&key) || !seen.insert(key) {
                return Err(PipelineError::DuplicateCell {
                    source_name: "estimated".to_string(),
                    cohort: key.0,
                    period: key.1,
                });
            }
        }

        let added = cells.len();
        for cell in cells {
            self.index.insert((cell.cohort(), cell.period()), self.cells.len());
            self.cells.push(cell);
        }
        Ok(added)
    }

    /// Number of cells skipped because an earlier source supplied them.
    pub fn conflicts(&self) -> usize {
        self.conflicts
    }

    /// Freeze the cells that fall in `years`.
    pub fn build(self, years: &BTreeSet<i32>) -> CohortDataset {
        let cells: Vec<CohortCell> = self.cells.into_iter().filter(|c| years.contains(&c.year)).collect();
        let estimated_years = cells
            .iter()
            .filter(|c| c.source == CellSource::Estimated)
            .map(|c| c.year)
            .collect();
        let observed_years = self
            .observed_years
            .intersection(years)
            .copied()
            .collect();
        CohortDataset {
            cells,
            observed_years,
            estimated_years,
        }
    }
}

/// Immutable cohort×month table for one run.
#[derive(Debug, Clone, Default)]
pub struct CohortDataset {
    cells: Vec<CohortCell>,
    observed_years: BTreeSet<i32>,
    estimated_years: BTreeSet<i32>,
}

impl CohortDataset {
    /// One cohort's cells, sorted by (year, month).
    pub fn series(&self, cohort: Cohort) -> CohortSeries {
        let cells = self.cells.iter().filter(|c| c.cohort() == cohort).cloned().collect();
        CohortSeries::from_cells(cohort, cells)
    }

    /// Cohorts with at least one cell.
    pub fn cohorts(&self) -> BTreeSet<Cohort> {
        self.cells.iter().map(CohortCell::cohort).collect()
    }

    pub fn cells(&self) -> &[CohortCell] {
        &self.cells
    }

    pub fn observed_years(&self) -> &BTreeSet<i32> {
        &self.observed_years
    }

    pub fn estimated_years(&self) -> &BTreeSet<i32> {
        &self.estimated_years
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
