//! Cross-cohort ranking by percent excess.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::{CellSource, Cohort, CohortStatus, ExcessRecord, GroupingKey, RankingRow, YearMonth};
use crate::report::excess::{CohortOutcome, ExclusionReason};

/// A cohort left out of the ranked rows, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exclusion {
    pub cohort: Cohort,
    pub reason: ExclusionReason,
}

/// Ranked rows plus every cohort that could not be ranked.
#[derive(Debug, Clone)]
pub struct Ranking {
    pub grouping: GroupingKey,
    /// Sorted by percent excess, descending; undefined percentages last.
    pub rows: Vec<RankingRow>,
    pub excluded: Vec<Exclusion>,
}

impl Ranking {
    /// Status of `cohort` in this batch; `None` if the batch never saw it.
    pub fn status_of(&self, cohort: Cohort) -> Option<CohortStatus> {
        if self.excluded.iter().any(|e| e.cohort == cohort) {
            return Some(CohortStatus::Excluded);
        }
        let mut statuses = self.rows.iter().filter(|r| r.cohort == cohort).map(|r| r.status);
        let first = statuses.next()?;
        if first == CohortStatus::Estimated || statuses.any(|s| s == CohortStatus::Estimated) {
            Some(CohortStatus::Estimated)
        } else {
            Some(first)
        }
    }

    pub fn top(&self, n: usize) -> &[RankingRow] {
        &self.rows[..n.min(self.rows.len())]
    }
}

/// `((excess + expected) / expected - 1) * 100`, undefined for zero expected.
pub fn percent_excess(excess_total: f64, expected_total: f64) -> Option<f64> {
    if expected_total == 0.0 || !expected_total.is_finite() {
        return None;
    }
    Some(((excess_total + expected_total) / expected_total - 1.0) * 100.0)
}

/// Rank every computed cohort and account for the rest as exclusions.
pub fn rank(outcomes: &[CohortOutcome], grouping: GroupingKey) -> Ranking {
    let mut rows = Vec::new();
    let mut excluded = Vec::new();

    for outcome in outcomes {
        let computed = match outcome {
            CohortOutcome::Excluded { cohort, reason } => {
                excluded.push(Exclusion {
                    cohort: *cohort,
                    reason: reason.clone(),
                });
                continue;
            }
            CohortOutcome::Computed(c) => c,
        };

        if !computed.cohort.age_bracket.is_stated() {
            excluded.push(Exclusion {
                cohort: computed.cohort,
                reason: ExclusionReason::AgeNotStated,
            });
            continue;
        }
        if computed.records.is_empty() {
            excluded.push(Exclusion {
                cohort: computed.cohort,
                reason: ExclusionReason::NoTestData,
            });
            continue;
        }

        match grouping {
            GroupingKey::Cohort => rows.push(group_row(computed.cohort, None, &computed.records)),
            GroupingKey::CohortMonth => {
                let mut by_month: BTreeMap<YearMonth, Vec<ExcessRecord>> = BTreeMap::new();
                for r in &computed.records {
                    by_month.entry(r.period()).or_default().push(r.clone());
                }
                for (period, records) in by_month {
                    rows.push(group_row(computed.cohort, Some(period), &records));
                }
            }
        }
    }

    rows.sort_by(compare_rows);
    excluded.sort_by_key(|e| e.cohort);

    Ranking {
        grouping,
        rows,
        excluded,
    }
}

fn group_row(cohort: Cohort, period: Option<YearMonth>, records: &[ExcessRecord]) -> RankingRow {
    let expected_total: f64 = records.iter().map(|r| r.expected_death_count).sum();
    let excess_total: f64 = records.iter().map(|r| r.excess).sum();
    let status = if records.iter().any(|r| r.source == CellSource::Estimated) {
        CohortStatus::Estimated
    } else {
        CohortStatus::Complete
    };
    RankingRow {
        cohort,
        period,
        status,
        expected_total,
        excess_total,
        percent_excess: percent_excess(excess_total, expected_total),
    }
}

fn compare_rows(a: &RankingRow, b: &RankingRow) -> Ordering {
    let by_percent = match (a.percent_excess, b.percent_excess) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_percent
        .then_with(|| a.cohort.cmp(&b.cohort))
        .then_with(|| a.period.cmp(&b.period))
}
