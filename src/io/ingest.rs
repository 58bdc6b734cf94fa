//! CSV ingest and normalization.
//!
//! This module turns two kinds of CSV into typed rows:
//!
//! - NCHS person-level mortality files (`ager12`, `monthdth`, `sex`, ...)
//! - secondary aggregated sources with coarse age labels
//!   (`year`, `month`, `sex`, `age_group`, `death_count`)
//!
//! Design goals:
//! - **Strict schema** for required columns (missing column = `Schema` error)
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Separation of concerns**: no aggregation or fitting logic here

use std::collections::HashMap;
use std::io::Read;

use csv::StringRecord;

use crate::data::aggregate::{PersonRecord, SexEncoding};
use crate::data::dataset::LabeledCell;
use crate::domain::{AgeBracket, Sex};
use crate::error::PipelineError;

pub const COL_AGE: &str = "ager12";
pub const COL_MONTH: &str = "monthdth";
pub const COL_SEX: &str = "sex";

/// A row-level error encountered during ingest.
#[derive(Debug, Clone)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

/// Parsed person-level rows.
#[derive(Debug, Clone)]
pub struct PersonBatch {
    pub records: Vec<PersonRecord>,
    pub encoding: SexEncoding,
    pub rows_read: usize,
    pub row_errors: Vec<RowError>,
}

/// Read a person-level mortality CSV.
pub fn read_person_csv<R: Read>(reader: R, source_name: &str) -> Result<PersonBatch, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let header_map = build_header_map(&headers);
    ensure_columns(source_name, &header_map, &[COL_AGE, COL_MONTH, COL_SEX])?;

    // Sex encoding is a property of the whole column: parse the other fields now
    // and hold only the raw sex value until the column has been seen.
    let mut pending: Vec<PendingPerson> = Vec::new();
    let mut row_errors = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        // +2: records start after the header, and lines are 1-based.
        let line = idx + 2;
        match result {
            Ok(r) => pending.push(PendingPerson {
                line,
                age_month: parse_age_month(&r, &header_map),
                sex: get_optional(&r, &header_map, COL_SEX).map(str::to_string),
            }),
            Err(e) => row_errors.push(RowError {
                line,
                message: format!("CSV parse error: {e}"),
            }),
        }
    }
    let rows_read = pending.len() + row_errors.len();

    let encoding = SexEncoding::detect(pending.iter().filter_map(|p| p.sex.as_deref()));

    let mut records = Vec::with_capacity(pending.len());
    for row in pending {
        match row.finish(encoding) {
            Ok(r) => records.push(r),
            Err(message) => row_errors.push(RowError { line: row.line, message }),
        }
    }
    row_errors.sort_by_key(|e| e.line);

    Ok(PersonBatch {
        records,
        encoding,
        rows_read,
        row_errors,
    })
}

/// A person row waiting for the column-wide sex encoding.
struct PendingPerson {
    line: usize,
    age_month: Result<(AgeBracket, u32), String>,
    sex: Option<String>,
}

impl PendingPerson {
    fn finish(&self, encoding: SexEncoding) -> Result<PersonRecord, String> {
        let (age_bracket, month) = self.age_month.clone()?;
        let sex_raw = self
            .sex
            .as_deref()
            .ok_or_else(|| format!("Missing required value: `{COL_SEX}`"))?;
        let sex = encoding
            .normalize(sex_raw)
            .ok_or_else(|| format!("Invalid `{COL_SEX}` value '{sex_raw}' for {encoding:?} encoding."))?;
        Ok(PersonRecord {
            age_bracket,
            month,
            sex,
        })
    }
}

fn parse_age_month(record: &StringRecord, header_map: &HashMap<String, usize>) -> Result<(AgeBracket, u32), String> {
    let age_raw = get_required(record, header_map, COL_AGE)?;
    let age_bracket = age_raw
        .parse::<u8>()
        .ok()
        .and_then(AgeBracket::from_code)
        .ok_or_else(|| format!("Invalid `{COL_AGE}` value '{age_raw}' (expected 1..=12)."))?;

    let month_raw = get_required(record, header_map, COL_MONTH)?;
    let month = month_raw
        .parse::<u32>()
        .ok()
        .filter(|m| (1..=12).contains(m))
        .ok_or_else(|| format!("Invalid `{COL_MONTH}` value '{month_raw}' (expected 1..=12)."))?;

    Ok((age_bracket, month))
}

/// Read a secondary source whose age groups are coarse text labels.
///
/// Rows with an aggregate sex (e.g. `All Sexes`) or a suppressed/blank count are
/// skipped and reported; label reconciliation happens later against a `LabelTable`.
pub fn read_labeled_csv<R: Read>(
    reader: R,
    source_name: &str,
) -> Result<(Vec<LabeledCell>, Vec<RowError>), PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let header_map = build_header_map(&headers);
    ensure_columns(
        source_name,
        &header_map,
        &["year", "month", "sex", "age_group", "death_count"],
    )?;

    let mut cells = Vec::new();
    let mut row_errors = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };
        match parse_labeled(&record, &header_map) {
            Ok(cell) => cells.push(cell),
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }

    Ok((cells, row_errors))
}

fn parse_labeled(record: &StringRecord, header_map: &HashMap<String, usize>) -> Result<LabeledCell, String> {
    let year = get_required(record, header_map, "year")?
        .parse::<i32>()
        .map_err(|_| "Invalid `year`.".to_string())?;
    let month = get_required(record, header_map, "month")?
        .parse::<u32>()
        .ok()
        .filter(|m| (1..=12).contains(m))
        .ok_or_else(|| "Invalid `month` (expected 1..=12).".to_string())?;
    let sex_raw = get_required(record, header_map, "sex")?;
    let sex = parse_sex_label(sex_raw).ok_or_else(|| format!("Unsupported `sex` value '{sex_raw}'."))?;
    let label = get_required(record, header_map, "age_group")?.to_string();
    let death_count = get_required(record, header_map, "death_count")?
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| "Invalid `death_count` (expected a non-negative number).".to_string())?;

    Ok(LabeledCell {
        year,
        month,
        sex,
        label,
        death_count: death_count.round() as u64,
    })
}

fn parse_sex_label(s: &str) -> Option<Sex> {
    match s.to_ascii_lowercase().as_str() {
        "m" | "male" => Some(Sex::M),
        "f" | "female" => Some(Sex::F),
        _ => None,
    }
}

fn ensure_columns(
    source_name: &str,
    header_map: &HashMap<String, usize>,
    required: &[&str],
) -> Result<(), PipelineError> {
    for name in required {
        if !header_map.contains_key(*name) {
            return Err(PipelineError::Schema {
                source_name: source_name.to_string(),
                message: format!("Missing required column: `{name}`"),
            });
        }
    }
    Ok(())
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports sometimes prefix the first header with a UTF-8 BOM; if we
    // don't strip it, schema validation reports the first column as missing.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn get_required<'a>(
    record: &'a StringRecord,
    header_map: &HashMap<String, usize>,
    name: &str,
) -> Result<&'a str, String> {
    let idx = header_map
        .get(name)
        .ok_or_else(|| format!("Missing required column: `{name}`"))?;
    record
        .get(*idx)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Missing required value: `{name}`"))
}

fn get_optional<'a>(record: &'a StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Option<&'a str> {
    let idx = header_map.get(name)?;
    record.get(*idx).map(str::trim).filter(|s| !s.is_empty())
}
