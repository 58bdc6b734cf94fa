//! Export excess records and rankings to CSV.
//!
//! The exports are meant to be easy to consume in spreadsheets or downstream scripts.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::domain::{CellSource, ExcessRecord, RankingRow};
use crate::error::PipelineError;
use crate::report::rank::Ranking;

/// Write per cohort-month excess records, ordered by cohort then period.
pub fn write_excess_csv(path: &Path, records: &[ExcessRecord]) -> Result<(), PipelineError> {
    let mut file = BufWriter::new(File::create(path)?);
    write_excess(&mut file, records)?;
    file.flush()?;
    Ok(())
}

fn write_excess<W: Write>(out: &mut W, records: &[ExcessRecord]) -> Result<(), PipelineError> {
    let mut sorted: Vec<&ExcessRecord> = records.iter().collect();
    sorted.sort_by_key(|r| (r.cohort(), r.period()));

    writeln!(
        out,
        "age_bracket,sex,year,month,actual_death_count,expected_death_count,excess,source"
    )?;
    for r in sorted {
        writeln!(
            out,
            "{},{},{},{},{},{:.4},{:.4},{}",
            r.age_bracket.code(),
            r.sex.as_str(),
            r.year,
            r.month,
            r.actual_death_count,
            r.expected_death_count,
            r.excess,
            match r.source {
                CellSource::Observed => "observed",
                CellSource::Estimated => "estimated",
            },
        )?;
    }
    Ok(())
}

/// Write ranked rows followed by excluded cohorts (with empty numeric fields).
pub fn write_ranking_csv(path: &Path, ranking: &Ranking) -> Result<(), PipelineError> {
    let mut file = BufWriter::new(File::create(path)?);
    write_ranking(&mut file, ranking)?;
    file.flush()?;
    Ok(())
}

fn write_ranking<W: Write>(out: &mut W, ranking: &Ranking) -> Result<(), PipelineError> {
    writeln!(
        out,
        "rank,age_bracket,sex,period,status,expected_total,excess_total,percent_excess,reason"
    )?;
    for (idx, row) in ranking.rows.iter().enumerate() {
        write_row(out, idx + 1, row)?;
    }
    for e in &ranking.excluded {
        writeln!(
            out,
            ",{},{},,excluded,,,,\"{}\"",
            e.cohort.age_bracket.code(),
            e.cohort.sex.as_str(),
            e.reason.to_string().replace('"', "'"),
        )?;
    }
    Ok(())
}

fn write_row<W: Write>(out: &mut W, rank: usize, row: &RankingRow) -> Result<(), PipelineError> {
    writeln!(
        out,
        "{},{},{},{},{},{:.4},{:.4},{},",
        rank,
        row.cohort.age_bracket.code(),
        row.cohort.sex.as_str(),
        row.period.map(|p| p.to_string()).unwrap_or_default(),
        row.status.as_str(),
        row.expected_total,
        row.excess_total,
        row.percent_excess.map(|v| format!("{v:.4}")).unwrap_or_default(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgeBracket, Cohort, CohortStatus, GroupingKey, Sex};
    use crate::report::excess::ExclusionReason;
    use crate::report::rank::Exclusion;

    #[test]
    fn excess_csv_has_header_and_sorted_rows() {
        let rec = |age: AgeBracket, month: u32| ExcessRecord {
            age_bracket: age,
            sex: Sex::M,
            year: 2020,
            month,
            actual_death_count: 120,
            expected_death_count: 100.0,
            excess: 20.0,
            source: CellSource::Observed,
        };
        let mut buf = Vec::new();
        write_excess(&mut buf, &[rec(AgeBracket::Age85Plus, 2), rec(AgeBracket::Under1, 1)]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("age_bracket,sex,year,month"));
        assert_eq!(lines[1], "1,M,2020,1,120,100.0000,20.0000,observed");
    }

    #[test]
    fn ranking_csv_lists_exclusions_and_blank_undefined_percent() {
        let ranking = Ranking {
            grouping: GroupingKey::Cohort,
            rows: vec![RankingRow {
                cohort: Cohort::new(AgeBracket::Age1To4, Sex::F),
                period: None,
                status: CohortStatus::Complete,
                expected_total: 0.0,
                excess_total: 3.0,
                percent_excess: None,
            }],
            excluded: vec![Exclusion {
                cohort: Cohort::new(AgeBracket::NotStated, Sex::M),
                reason: ExclusionReason::AgeNotStated,
            }],
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranking.csv");
        write_ranking_csv(&path, &ranking).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "1,2,F,,complete,0.0000,3.0000,,");
        assert_eq!(lines[2], ",12,M,,excluded,,,,\"age not stated\"");
    }
}
