//! Shared batch pipeline used by the `run` and `rank` commands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! cell store -> dataset (+ estimated fallback) -> per-cohort forecast/excess -> ranking
//!
//! The CLI can then focus on presentation (printing vs exports).

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::data::dataset::{CohortDataset, DatasetBuilder};
use crate::data::labels::LabelTable;
use crate::data::store::{CellStore, read_labeled_csv};
use crate::domain::{Cohort, CohortCell, RunConfig};
use crate::error::PipelineError;
use crate::fit::forecast::{estimated_cells, forecast_cohort};
use crate::report::excess::{CohortExcess, CohortOutcome, ExclusionReason, compute_excess};
use crate::report::rank::{Ranking, rank};

/// Dataset statistics reported alongside the ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSummary {
    pub cells: usize,
    pub cohorts: usize,
    pub observed_years: BTreeSet<i32>,
    pub estimated_years: BTreeSet<i32>,
    /// Requested years with neither observed nor estimated data.
    pub missing_years: BTreeSet<i32>,
    /// Cells skipped because an earlier source already supplied them.
    pub conflicts: usize,
}

/// Per-cohort results of one batch (independent of ranking granularity).
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub dataset: DatasetSummary,
    pub outcomes: Vec<CohortOutcome>,
}

/// All computed outputs of a single `xm run`.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub batch: Arc<BatchOutcome>,
    pub ranking: Ranking,
}

/// Cache identity of a batch: data store, inputs, windows, horizon and model options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey(u64);

impl BatchKey {
    pub fn new(config: &RunConfig, store: &dyn CellStore) -> Self {
        let mut h = DefaultHasher::new();
        store.identity().hash(&mut h);
        config.labeled_source.hash(&mut h);
        config.label_table.hash(&mut h);
        config.training_years.hash(&mut h);
        config.test_years.hash(&mut h);
        config.forecast_horizon_months.hash(&mut h);
        config.estimate_missing.hash(&mut h);

        let m = &config.model;
        m.fourier_order.hash(&mut h);
        m.max_changepoints.hash(&mut h);
        m.changepoint_range.to_bits().hash(&mut h);
        m.changepoint_prior_scale.to_bits().hash(&mut h);
        m.seasonality_prior_scale.to_bits().hash(&mut h);
        m.robust.hash(&mut h);
        m.robust_iters.hash(&mut h);
        m.robust_k.to_bits().hash(&mut h);
        m.uncertainty_samples.hash(&mut h);
        m.interval_width.to_bits().hash(&mut h);
        m.seed.hash(&mut h);
        Self(h.finish())
    }
}

/// Memoized batch outcomes; each key is computed at most once and then shared.
#[derive(Debug, Default)]
pub struct BatchCache {
    slots: Mutex<HashMap<BatchKey, Arc<OnceLock<Arc<BatchOutcome>>>>>,
}

impl BatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: BatchKey) -> Option<Arc<BatchOutcome>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&key).and_then(|slot| slot.get().cloned())
    }

    /// Return the cached outcome for `key`, computing it on first use.
    ///
    /// A failed computation is not cached.
    pub fn get_or_compute(
        &self,
        key: BatchKey,
        compute: impl FnOnce() -> Result<BatchOutcome, PipelineError>,
    ) -> Result<Arc<BatchOutcome>, PipelineError> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key).or_default())
        };
        if let Some(done) = slot.get() {
            return Ok(Arc::clone(done));
        }

        let computed = Arc::new(compute()?);
        // First writer wins; later writers get the stored value.
        let _ = slot.set(Arc::clone(&computed));
        Ok(slot.get().cloned().unwrap_or(computed))
    }
}

/// Execute the full batch and rank it with the configured grouping.
pub fn run_batch(config: &RunConfig, store: &dyn CellStore, cache: &BatchCache) -> Result<RunOutput, PipelineError> {
    config.validate()?;

    let key = BatchKey::new(config, store);
    let batch = cache.get_or_compute(key, || compute_batch(config, store))?;
    let ranking = rank(&batch.outcomes, config.grouping);

    info!(
        ranked = ranking.rows.len(),
        excluded = ranking.excluded.len(),
        grouping = ?config.grouping,
        "ranking complete"
    );
    Ok(RunOutput { batch, ranking })
}

fn compute_batch(config: &RunConfig, store: &dyn CellStore) -> Result<BatchOutcome, PipelineError> {
    if let Some(needed) = config.months_to_cover_tests() {
        if config.forecast_horizon_months < needed {
            warn!(
                horizon = config.forecast_horizon_months,
                needed, "forecast horizon ends before the test window; late months will be unaligned"
            );
        }
    }

    let (dataset, conflicts) = load_dataset(config, store)?;
    let cohorts: Vec<Cohort> = dataset.cohorts().into_iter().collect();
    info!(
        cells = dataset.len(),
        cohorts = cohorts.len(),
        estimated_years = ?dataset.estimated_years(),
        "dataset ready"
    );

    // Each cohort only reads its own series; results are joined before ranking.
    let outcomes: Vec<CohortOutcome> = cohorts
        .par_iter()
        .map(|&cohort| process_cohort(&dataset, cohort, config))
        .collect::<Result<_, _>>()?;

    let all_years: BTreeSet<i32> = config.training_years.union(&config.test_years).copied().collect();
    let covered: BTreeSet<i32> = dataset
        .observed_years()
        .union(dataset.estimated_years())
        .copied()
        .collect();

    Ok(BatchOutcome {
        dataset: DatasetSummary {
            cells: dataset.len(),
            cohorts: cohorts.len(),
            observed_years: dataset.observed_years().clone(),
            estimated_years: dataset.estimated_years().clone(),
            missing_years: all_years.difference(&covered).copied().collect(),
            conflicts,
        },
        outcomes,
    })
}

/// Cohort-local failures become exclusions; anything else ends the batch.
fn process_cohort(
    dataset: &CohortDataset,
    cohort: Cohort,
    config: &RunConfig,
) -> Result<CohortOutcome, PipelineError> {
    let series = dataset.series(cohort);
    let result = forecast_cohort(
        &series,
        &config.training_years,
        config.forecast_horizon_months,
        &config.model,
    )
    .and_then(|forecast| {
        let records = compute_excess(&series, &config.test_years, &forecast)?;
        Ok(CohortExcess {
            cohort,
            forecast,
            records,
        })
    });

    match result {
        Ok(computed) => Ok(CohortOutcome::Computed(computed)),
        Err(err) if err.is_cohort_local() => {
            warn!(%cohort, error = %err, "cohort excluded");
            Ok(CohortOutcome::Excluded {
                cohort,
                reason: ExclusionReason::from(&err),
            })
        }
        Err(err) => Err(err),
    }
}

/// Assemble the run's dataset from the store, the optional labeled source and
/// (when enabled) estimated cells for missing test years.
fn load_dataset(config: &RunConfig, store: &dyn CellStore) -> Result<(CohortDataset, usize), PipelineError> {
    let all_years: BTreeSet<i32> = config.training_years.union(&config.test_years).copied().collect();
    let mut builder = DatasetBuilder::new();

    for &year in &all_years {
        match store.fetch_cohort_cells(year)? {
            Some(cells) => {
                let added = builder.add_cells(&format!("store:{year}"), cells)?;
                info!(year, cells = added, "loaded year from store");
            }
            None => info!(year, "year not in store"),
        }
    }

    if let Some(path) = &config.labeled_source {
        let table = match &config.label_table {
            Some(table_path) => LabelTable::from_csv(File::open(table_path)?)?,
            None => LabelTable::nchs(),
        };
        let rows: Vec<_> = read_labeled_csv(path)?
            .into_iter()
            .filter(|r| all_years.contains(&r.year))
            .collect();
        let added = builder.add_labeled(&path.display().to_string(), rows, &table)?;
        info!(source = %path.display(), cells = added, "merged labeled source");
    }

    let missing_training = builder.missing_years(&config.training_years);
    if !missing_training.is_empty() {
        warn!(years = ?missing_training, "training years with no data");
    }

    let missing_test = builder.missing_years(&config.test_years);
    if !missing_test.is_empty() {
        if config.estimate_missing {
            let estimated = estimate_missing_years(&builder, config, &missing_test)?;
            let added = builder.add_estimated(estimated)?;
            warn!(years = ?missing_test, cells = added, "substituted estimated cells for missing test years");
        } else {
            warn!(years = ?missing_test, "test years with no data");
        }
    }

    let conflicts = builder.conflicts();
    Ok((builder.build(&all_years), conflicts))
}

/// Fit each cohort on the training years and project cells for `years`.
fn estimate_missing_years(
    builder: &DatasetBuilder,
    config: &RunConfig,
    years: &BTreeSet<i32>,
) -> Result<Vec<CohortCell>, PipelineError> {
    let training = builder.clone().build(&config.training_years);
    // Training may end before December; pad so the last requested year is covered.
    let horizon = config.months_to_cover_tests().unwrap_or(0).max(config.forecast_horizon_months) + 12;

    let cohorts: Vec<Cohort> = training.cohorts().into_iter().collect();
    let forecasts: Vec<Option<_>> = cohorts
        .par_iter()
        .map(|&cohort| {
            match forecast_cohort(&training.series(cohort), &config.training_years, horizon, &config.model) {
                Ok(f) => Ok(Some(f)),
                Err(err) if err.is_cohort_local() => {
                    warn!(%cohort, error = %err, "no estimate for cohort");
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        })
        .collect::<Result<_, _>>()?;
    let forecasts: Vec<_> = forecasts.into_iter().flatten().collect();

    Ok(estimated_cells(&forecasts, years))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::data::store::MemoryCellStore;
    use crate::domain::{
        AgeBracket, CellSource, CohortCell, CohortStatus, GroupingKey, ModelOptions, Sex,
    };

    fn config(train: std::ops::RangeInclusive<i32>, test: &[i32]) -> RunConfig {
        RunConfig {
            store_dir: PathBuf::from("unused"),
            labeled_source: None,
            label_table: None,
            training_years: train.collect(),
            test_years: test.iter().copied().collect(),
            forecast_horizon_months: 24,
            grouping: GroupingKey::Cohort,
            model: ModelOptions {
                max_changepoints: 3,
                uncertainty_samples: 0,
                ..ModelOptions::default()
            },
            estimate_missing: false,
            top_n: 10,
            export_excess: None,
            export_ranking: None,
            export_forecasts: None,
        }
    }

    fn year_cells(cohort: Cohort, year: i32, level: f64, bump: f64) -> Vec<CohortCell> {
        (1..=12u32)
            .map(|month| {
                let season = 0.1 * level * (std::f64::consts::TAU * (month - 1) as f64 / 12.0).cos();
                CohortCell {
                    year,
                    month,
                    age_bracket: cohort.age_bracket,
                    sex: cohort.sex,
                    death_count: (level * bump + season).round() as u64,
                    source: CellSource::Observed,
                }
            })
            .collect()
    }

    fn store(cohorts: &[(Cohort, f64, std::ops::RangeInclusive<i32>)], test_bump: f64) -> MemoryCellStore {
        let mut by_year: HashMap<i32, Vec<CohortCell>> = HashMap::new();
        for (cohort, level, years) in cohorts {
            for year in years.clone() {
                let bump = if year >= 2020 { test_bump } else { 1.0 };
                by_year
                    .entry(year)
                    .or_default()
                    .extend(year_cells(*cohort, year, *level, bump));
            }
        }
        let mut store = MemoryCellStore::new();
        for (year, cells) in by_year {
            store.insert(year, cells);
        }
        store
    }

    #[test]
    fn failing_cohort_is_isolated() {
        let good = [
            Cohort::new(AgeBracket::Age55To64, Sex::M),
            Cohort::new(AgeBracket::Age65To74, Sex::M),
            Cohort::new(AgeBracket::Age75To84, Sex::F),
            Cohort::new(AgeBracket::Age85Plus, Sex::F),
        ];
        let thin = Cohort::new(AgeBracket::Age1To4, Sex::F);

        let mut layout: Vec<(Cohort, f64, std::ops::RangeInclusive<i32>)> =
            good.iter().map(|&c| (c, 1000.0, 2015..=2020)).collect();
        layout.push((thin, 40.0, 2019..=2020));
        let store = store(&layout, 1.2);

        let out = run_batch(&config(2015..=2019, &[2020]), &store, &BatchCache::new()).unwrap();
        assert_eq!(out.ranking.rows.len(), 4);
        assert_eq!(out.ranking.excluded.len(), 1);
        assert_eq!(out.ranking.status_of(thin), Some(CohortStatus::Excluded));
        assert!(matches!(
            out.ranking.excluded[0].reason,
            ExclusionReason::InsufficientTrainingData { distinct_years: 1, required: 2 }
        ));
        for row in &out.ranking.rows {
            assert_eq!(row.status, CohortStatus::Complete);
            let pct = row.percent_excess.unwrap();
            assert!((pct - 20.0).abs() < 3.0, "{}: {pct}", row.cohort);
        }
    }

    #[test]
    fn missing_test_year_is_estimated_when_enabled() {
        let cohort = Cohort::new(AgeBracket::Age75To84, Sex::M);
        let store = store(&[(cohort, 800.0, 2014..=2019)], 1.0);

        let mut cfg = config(2014..=2019, &[2020]);
        let out = run_batch(&cfg, &store, &BatchCache::new()).unwrap();
        assert!(out.ranking.rows.is_empty());
        assert_eq!(out.batch.dataset.missing_years, [2020].into_iter().collect());

        cfg.estimate_missing = true;
        let out = run_batch(&cfg, &store, &BatchCache::new()).unwrap();
        assert_eq!(out.batch.dataset.estimated_years, [2020].into_iter().collect());
        assert_eq!(out.ranking.rows.len(), 1);
        let row = &out.ranking.rows[0];
        assert_eq!(row.status, CohortStatus::Estimated);
        // Estimated actuals are rounded forecasts, so excess stays near zero.
        assert!(row.percent_excess.unwrap().abs() < 0.5);
    }

    #[test]
    fn cache_returns_the_same_batch_for_the_same_key() {
        let cohort = Cohort::new(AgeBracket::Age65To74, Sex::F);
        let store = store(&[(cohort, 500.0, 2016..=2020)], 1.1);
        let cache = BatchCache::new();

        let mut cfg = config(2016..=2019, &[2020]);
        let a = run_batch(&cfg, &store, &cache).unwrap();
        cfg.grouping = GroupingKey::CohortMonth;
        let b = run_batch(&cfg, &store, &cache).unwrap();
        assert!(Arc::ptr_eq(&a.batch, &b.batch));
        assert_eq!(b.ranking.rows.len(), 12);

        cfg.model.seed = 7;
        assert!(cache.get(BatchKey::new(&cfg, &store)).is_none());
    }

    #[test]
    fn cache_does_not_share_batches_between_stores() {
        let cohort = Cohort::new(AgeBracket::Age65To74, Sex::F);
        let flat = store(&[(cohort, 500.0, 2016..=2020)], 1.0);
        let doubled = store(&[(cohort, 500.0, 2016..=2020)], 2.0);
        let cache = BatchCache::new();
        let cfg = config(2016..=2019, &[2020]);

        let a = run_batch(&cfg, &flat, &cache).unwrap();
        let b = run_batch(&cfg, &doubled, &cache).unwrap();
        assert!(!Arc::ptr_eq(&a.batch, &b.batch));

        let pct_a = a.ranking.rows[0].percent_excess.unwrap();
        let pct_b = b.ranking.rows[0].percent_excess.unwrap();
        assert!(pct_a.abs() < 3.0, "{pct_a}");
        assert!((pct_b - 100.0).abs() < 10.0, "{pct_b}");

        let again = run_batch(&cfg, &flat, &cache).unwrap();
        assert!(Arc::ptr_eq(&a.batch, &again.batch));
    }

    fn labeled_csv(path: &std::path::Path, label: &str, level: f64, years: std::ops::RangeInclusive<i32>) {
        let mut out = String::from("year,month,sex,age_group,death_count\n");
        for year in years {
            let bump = if year >= 2020 { 1.1 } else { 1.0 };
            for month in 1..=12u32 {
                let season = 0.1 * level * (std::f64::consts::TAU * (month - 1) as f64 / 12.0).cos();
                let count = (level * bump + season).round() as u64;
                out.push_str(&format!("{year},{month},Female,{label},{count}\n"));
                out.push_str(&format!("{year},{month},Female,Total,{}\n", count * 10));
            }
        }
        std::fs::write(path, out).unwrap();
    }

    #[test]
    fn labeled_source_with_custom_table_feeds_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let table_path = dir.path().join("labels.csv");
        let mut table = String::from("label,age_bracket\n");
        for age in AgeBracket::ALL {
            let label = if age == AgeBracket::Age85Plus {
                "85+".to_string()
            } else {
                format!("group {}", age.code())
            };
            table.push_str(&format!("{label},{}\n", age.code()));
        }
        table.push_str("Total,ignore\n");
        std::fs::write(&table_path, table).unwrap();

        let source = dir.path().join("cdc.csv");
        labeled_csv(&source, "85+", 1000.0, 2016..=2020);

        let mut cfg = config(2016..=2019, &[2020]);
        cfg.labeled_source = Some(source);
        cfg.label_table = Some(table_path);
        let out = run_batch(&cfg, &MemoryCellStore::new(), &BatchCache::new()).unwrap();

        let cohort = Cohort::new(AgeBracket::Age85Plus, Sex::F);
        assert_eq!(out.ranking.rows.len(), 1);
        assert_eq!(out.ranking.rows[0].cohort, cohort);
        let pct = out.ranking.rows[0].percent_excess.unwrap();
        assert!((pct - 10.0).abs() < 3.0, "{pct}");
    }

    #[test]
    fn unknown_label_in_labeled_source_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("cdc.csv");
        // "Total" is not one of the built-in ignored aggregates.
        labeled_csv(&source, "85 years and over", 1000.0, 2016..=2020);

        let mut cfg = config(2016..=2019, &[2020]);
        cfg.labeled_source = Some(source);
        let err = run_batch(&cfg, &MemoryCellStore::new(), &BatchCache::new()).unwrap_err();
        assert!(
            matches!(&err, PipelineError::UnknownCohortLabel { label, .. } if label == "Total"),
            "{err}"
        );
    }

    #[test]
    fn malformed_store_file_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let disk = crate::data::store::DirCellStore::new(dir.path());
        let cohort = Cohort::new(AgeBracket::Age55To64, Sex::M);
        for year in 2016..=2020 {
            disk.put(year, &year_cells(cohort, year, 300.0, 1.0)).unwrap();
        }
        std::fs::write(
            disk.path_for(2018),
            "year,month,age_bracket,sex,death_count\n2018,1,13,M,300\n",
        )
        .unwrap();

        let err = run_batch(&config(2016..=2019, &[2020]), &disk, &BatchCache::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Schema { .. }), "{err}");
    }

    #[test]
    fn invalid_config_fails_before_loading() {
        let store = MemoryCellStore::new();
        let err = run_batch(&config(2015..=2020, &[2020]), &store, &BatchCache::new()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }
}
