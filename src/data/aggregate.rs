//! Cohort aggregation: person-level death records → cohort-month count cells.

use std::collections::BTreeMap;
use std::io::Read;

use tracing::{info, warn};

use crate::domain::{AgeBracket, CellSource, CohortCell, Sex};
use crate::error::PipelineError;
use crate::io::ingest::{RowError, read_person_csv};

/// One person-level record after parsing and sex normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersonRecord {
    pub age_bracket: AgeBracket,
    pub month: u32,
    pub sex: Sex,
}

/// How the `sex` column of a source is encoded.
///
/// Decided once per source column, not per value: older public-use files code sex
/// numerically, newer ones use `M`/`F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SexEncoding {
    /// `1 → M`, every other code `→ F`.
    Numeric,
    /// `M` / `F` pass through unchanged.
    Symbolic,
}

impl SexEncoding {
    /// Numeric iff every non-empty value parses as an integer.
    pub fn detect<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut any = false;
        for v in values {
            let v = v.trim();
            if v.is_empty() {
                continue;
            }
            any = true;
            if v.parse::<i64>().is_err() {
                return SexEncoding::Symbolic;
            }
        }
        if any { SexEncoding::Numeric } else { SexEncoding::Symbolic }
    }

    pub fn normalize(self, raw: &str) -> Option<Sex> {
        let raw = raw.trim();
        match self {
            SexEncoding::Numeric => raw.parse::<i64>().ok().map(Sex::from_numeric_code),
            SexEncoding::Symbolic => Sex::from_symbol(raw),
        }
    }
}

/// Aggregation output for one source-year.
#[derive(Debug, Clone)]
pub struct AggregateOutput {
    pub year: i32,
    pub cells: Vec<CohortCell>,
    pub encoding: SexEncoding,
    pub rows_read: usize,
    pub row_errors: Vec<RowError>,
}

/// Group records by (age bracket, month, sex) and count them.
///
/// Every produced cell is `Observed`; the sum of counts equals the number of records.
pub fn aggregate_records(year: i32, records: impl IntoIterator<Item = PersonRecord>) -> Vec<CohortCell> {
    let mut counts: BTreeMap<(AgeBracket, u32, Sex), u64> = BTreeMap::new();
    for r in records {
        *counts.entry((r.age_bracket, r.month, r.sex)).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .map(|((age_bracket, month, sex), death_count)| CohortCell {
            year,
            month,
            age_bracket,
            sex,
            death_count,
            source: CellSource::Observed,
        })
        .collect()
}

/// Read a person-level CSV and aggregate it for `year`.
///
/// Fails with `Schema` if the age-bracket, month or sex column is absent.
/// Unparseable rows are skipped and reported in `row_errors`.
pub fn aggregate_person_csv<R: Read>(
    reader: R,
    source_name: &str,
    year: i32,
) -> Result<AggregateOutput, PipelineError> {
    let batch = read_person_csv(reader, source_name)?;
    for e in batch.row_errors.iter().take(10) {
        warn!(source = source_name, line = e.line, "{}", e.message);
    }
    if batch.row_errors.len() > 10 {
        warn!(
            source = source_name,
            skipped = batch.row_errors.len(),
            "more rows skipped (showing first 10)"
        );
    }

    let cells = aggregate_records(year, batch.records.iter().copied());
    info!(
        source = source_name,
        year,
        rows = batch.rows_read,
        used = batch.records.len(),
        cells = cells.len(),
        encoding = ?batch.encoding,
        "aggregated person records"
    );

    Ok(AggregateOutput {
        year,
        cells,
        encoding: batch.encoding,
        rows_read: batch.rows_read,
        row_errors: batch.row_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_sum_to_number_of_records() {
        let mut records = Vec::new();
        for i in 0..500u32 {
            records.push(PersonRecord {
                age_bracket: AgeBracket::ALL[(i % 12) as usize],
                month: i % 12 + 1,
                sex: if i % 3 == 0 { Sex::M } else { Sex::F },
            });
        }
        let cells = aggregate_records(2019, records.clone());
        let total: u64 = cells.iter().map(|c| c.death_count).sum();
        assert_eq!(total, 500);

        // Keys are unique and every cell is observed.
        let mut keys: Vec<_> = cells.iter().map(|c| (c.age_bracket, c.month, c.sex)).collect();
        keys.dedup();
        assert_eq!(keys.len(), cells.len());
        assert!(cells.iter().all(|c| c.year == 2019 && c.source == CellSource::Observed));
    }

    #[test]
    fn identical_records_collapse_into_one_cell() {
        let r = PersonRecord {
            age_bracket: AgeBracket::Age85Plus,
            month: 1,
            sex: Sex::F,
        };
        let cells = aggregate_records(2020, vec![r; 7]);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].death_count, 7);
    }

    #[test]
    fn sex_encoding_detection_is_column_wide() {
        assert_eq!(SexEncoding::detect(["1", "2", " 1 "]), SexEncoding::Numeric);
        assert_eq!(SexEncoding::detect(["M", "F"]), SexEncoding::Symbolic);
        assert_eq!(SexEncoding::detect(["1", "F"]), SexEncoding::Symbolic);
    }

    #[test]
    fn numeric_encoding_maps_non_one_to_female() {
        let enc = SexEncoding::Numeric;
        assert_eq!(enc.normalize("1"), Some(Sex::M));
        assert_eq!(enc.normalize("2"), Some(Sex::F));
        assert_eq!(enc.normalize("0"), Some(Sex::F));
        assert_eq!(enc.normalize("9"), Some(Sex::F));

        let sym = SexEncoding::Symbolic;
        assert_eq!(sym.normalize("M"), Some(Sex::M));
        assert_eq!(sym.normalize("F"), Some(Sex::F));
        assert_eq!(sym.normalize("1"), None);
    }

    #[test]
    fn person_csv_aggregates_and_counts() {
        let csv = "ager12,monthdth,sex,other\n5,1,1,x\n5,1,2,x\n5,1,1,x\n11,12,2,x\n";
        let out = aggregate_person_csv(csv.as_bytes(), "mort2001", 2001).unwrap();
        assert_eq!(out.encoding, SexEncoding::Numeric);
        assert_eq!(out.rows_read, 4);
        let total: u64 = out.cells.iter().map(|c| c.death_count).sum();
        assert_eq!(total, 4);
        let males = out
            .cells
            .iter()
            .find(|c| c.age_bracket == AgeBracket::Age25To34 && c.sex == Sex::M)
            .unwrap();
        assert_eq!(males.death_count, 2);
    }

    #[test]
    fn missing_month_column_is_a_schema_error() {
        let csv = "ager12,sex\n5,M\n";
        let err = aggregate_person_csv(csv.as_bytes(), "mort2019", 2019).unwrap_err();
        match err {
            PipelineError::Schema { message, .. } => assert!(message.contains("monthdth")),
            other => panic!("expected schema error, got {other:?}"),
        }
    }
}
