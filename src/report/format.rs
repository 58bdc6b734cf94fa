//! Formatted terminal output: run summary and ranking tables.
//!
//! We keep formatting code in one place so:
//! - the fitting/excess code stays clean and testable
//! - output changes are localized

use std::collections::BTreeSet;

use crate::app::pipeline::RunOutput;
use crate::domain::{RobustKind, RunConfig};
use crate::report::excess::CohortOutcome;
use crate::report::rank::Ranking;

/// Format the full run summary (windows, dataset stats, per-cohort fit diagnostics).
pub fn format_run_summary(run: &RunOutput, config: &RunConfig) -> String {
    let mut out = String::new();
    let ds = &run.batch.dataset;

    out.push_str("=== xm - Excess Mortality by Cohort ===\n");
    out.push_str(&format!(
        "Training: {} | Test: {}\n",
        fmt_years(&config.training_years),
        fmt_years(&config.test_years)
    ));
    out.push_str(&format!(
        "Horizon: {} months | Grouping: {:?}\n",
        config.forecast_horizon_months, config.grouping
    ));
    out.push_str(&format!(
        "Dataset: cells={} | cohorts={} | observed={}\n",
        ds.cells,
        ds.cohorts,
        fmt_years(&ds.observed_years)
    ));
    if !ds.estimated_years.is_empty() {
        out.push_str(&format!("Estimated years: {}\n", fmt_years(&ds.estimated_years)));
    }
    if !ds.missing_years.is_empty() {
        out.push_str(&format!("Missing years: {}\n", fmt_years(&ds.missing_years)));
    }
    if ds.conflicts > 0 {
        out.push_str(&format!("Source conflicts skipped: {}\n", ds.conflicts));
    }

    let m = &config.model;
    out.push_str(&format!(
        "Model: fourier={} | max_changepoints={} | priors cp={} season={}{}\n",
        m.fourier_order,
        m.max_changepoints,
        m.changepoint_prior_scale,
        m.seasonality_prior_scale,
        match m.robust {
            RobustKind::None => String::new(),
            RobustKind::Huber => format!(" | huber k={} iters={}", m.robust_k, m.robust_iters),
        }
    ));
    if m.uncertainty_samples > 0 {
        out.push_str(&format!(
            "Bounds: {:.0}% from {} samples (seed {})\n",
            m.interval_width * 100.0,
            m.uncertainty_samples,
            m.seed
        ));
    }

    out.push_str("\nFit diagnostics:\n");
    out.push_str(&format!(
        "{:<36} {:>5} {:>4} {:>10} {:>12} {:>12}\n",
        "cohort", "n", "cps", "rmse", "bic", "excess"
    ));
    out.push_str(&format!(
        "{:-<36} {:-<5} {:-<4} {:-<10} {:-<12} {:-<12}\n",
        "", "", "", "", "", ""
    ));
    let mut computed: Vec<_> = run
        .batch
        .outcomes
        .iter()
        .filter_map(|o| match o {
            CohortOutcome::Computed(c) => Some(c),
            CohortOutcome::Excluded { .. } => None,
        })
        .collect();
    computed.sort_by_key(|c| c.cohort);
    for c in computed {
        let excess: f64 = c.records.iter().map(|r| r.excess).sum();
        out.push_str(&format!(
            "{:<36} {:>5} {:>4} {:>10.2} {:>12.2} {:>12.1}\n",
            truncate(&c.cohort.to_string(), 36),
            c.forecast.quality.n,
            c.forecast.model.changepoints.len(),
            c.forecast.quality.rmse,
            c.forecast.quality.bic,
            excess
        ));
    }
    out.push('\n');

    out
}

/// Format the top `top_n` ranked rows, followed by every excluded cohort.
pub fn format_ranking(ranking: &Ranking, top_n: usize) -> String {
    let mut out = String::new();
    out.push_str("Top cohorts by percent excess:\n");
    out.push_str(
        format!(
            "{:>4} {:<36} {:<8} {:<10} {:>12} {:>12} {:>9}\n",
            "#", "cohort", "period", "status", "expected", "excess", "pct"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(
        format!(
            "{:-<4} {:-<36} {:-<8} {:-<10} {:-<12} {:-<12} {:-<9}\n",
            "", "", "", "", "", "", ""
        )
        .trim_end(),
    );
    out.push('\n');

    for (idx, row) in ranking.top(top_n).iter().enumerate() {
        out.push_str(
            format!(
                "{:>4} {:<36} {:<8} {:<10} {:>12.1} {:>12.1} {:>9}\n",
                idx + 1,
                truncate(&row.cohort.to_string(), 36),
                row.period.map(|p| p.to_string()).unwrap_or_default(),
                row.status.as_str(),
                row.expected_total,
                row.excess_total,
                fmt_percent(row.percent_excess),
            )
            .trim_end(),
        );
        out.push('\n');
    }
    if ranking.rows.len() > top_n {
        out.push_str(&format!("({} more rows)\n", ranking.rows.len() - top_n));
    }

    if !ranking.excluded.is_empty() {
        out.push_str("\nExcluded cohorts:\n");
        for e in &ranking.excluded {
            out.push_str(&format!("- {}: {}\n", e.cohort, e.reason));
        }
    }

    out
}

fn fmt_percent(v: Option<f64>) -> String {
    match v {
        Some(p) => format!("{p:+.2}%"),
        None => "n/a".to_string(),
    }
}

/// Compress a year set into runs: `2000-2019, 2021`.
fn fmt_years(years: &BTreeSet<i32>) -> String {
    if years.is_empty() {
        return "-".to_string();
    }
    let mut runs: Vec<(i32, i32)> = Vec::new();
    for &y in years {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == y => *end = y,
            _ => runs.push((y, y)),
        }
    }
    let parts: Vec<String> = runs
        .into_iter()
        .map(|(a, b)| if a == b { a.to_string() } else { format!("{a}-{b}") })
        .collect();
    parts.join(", ")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        if i + 1 >= max {
            break;
        }
        out.push(ch);
    }
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgeBracket, Cohort, CohortStatus, GroupingKey, RankingRow, Sex};
    use crate::report::excess::ExclusionReason;
    use crate::report::rank::Exclusion;

    #[test]
    fn years_compress_into_runs() {
        let years: BTreeSet<i32> = (2000..=2019).chain([2021, 2023, 2024]).collect();
        assert_eq!(fmt_years(&years), "2000-2019, 2021, 2023-2024");
        assert_eq!(fmt_years(&BTreeSet::new()), "-");
    }

    #[test]
    fn ranking_table_marks_undefined_percent() {
        let row = |age, pct| RankingRow {
            cohort: Cohort::new(age, Sex::F),
            period: None,
            status: CohortStatus::Complete,
            expected_total: 100.0,
            excess_total: 5.0,
            percent_excess: pct,
        };
        let ranking = Ranking {
            grouping: GroupingKey::Cohort,
            rows: vec![row(AgeBracket::Age85Plus, Some(5.0)), row(AgeBracket::Under1, None)],
            excluded: vec![],
        };
        let text = format_ranking(&ranking, 1);
        assert!(text.contains("+5.00%"));
        assert!(!text.contains("n/a"));
        assert!(text.contains("(1 more rows)"));
        assert!(format_ranking(&ranking, 5).contains("n/a"));
    }

    #[test]
    fn ranking_lists_excluded_cohorts_even_without_rows() {
        let cohort = Cohort::new(AgeBracket::Age1To4, Sex::M);
        let ranking = Ranking {
            grouping: GroupingKey::Cohort,
            rows: vec![],
            excluded: vec![Exclusion {
                cohort,
                reason: ExclusionReason::InsufficientTrainingData {
                    distinct_years: 1,
                    required: 2,
                },
            }],
        };
        let text = format_ranking(&ranking, 20);
        assert!(text.contains("Excluded cohorts:"));
        assert!(text.contains(&format!("- {cohort}: insufficient training data (1 of 2 years)")));
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate("abcdef", 4), "abc.");
        assert_eq!(truncate("abc", 4), "abc");
    }
}
