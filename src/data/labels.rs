//! Reconciliation between canonical age-bracket codes and coarse external labels.
//!
//! Secondary sources (e.g. provisional CDC extracts) name age groups with text
//! such as `"85 years and over"`. A `LabelTable` maps those labels onto the
//! 12-bracket recode. Tables are immutable values passed to the dataset builder;
//! there is no global lookup state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;

use crate::domain::AgeBracket;
use crate::error::PipelineError;

/// Outcome of resolving one external label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMatch {
    Bracket(AgeBracket),
    /// An aggregate or overlapping group the table explicitly skips.
    Ignored,
}

/// Total, invertible mapping between age-bracket codes and external labels.
#[derive(Debug, Clone)]
pub struct LabelTable {
    labels: BTreeMap<AgeBracket, String>,
    codes: HashMap<String, AgeBracket>,
    ignored: HashSet<String>,
}

/// Aggregate or overlapping groups published alongside the 12-bracket labels.
const NCHS_IGNORED: [&str; 8] = [
    "All Ages",
    "0-17 years",
    "18-29 years",
    "30-39 years",
    "40-49 years",
    "50-64 years",
    "30-49 years",
    "18-64 years",
];

impl LabelTable {
    /// Build and validate a table.
    ///
    /// Fails unless every bracket has exactly one label and no label is used twice
    /// (including between mapped and ignored labels).
    pub fn new(
        entries: impl IntoIterator<Item = (AgeBracket, String)>,
        ignored: impl IntoIterator<Item = String>,
    ) -> Result<Self, PipelineError> {
        let mut labels = BTreeMap::new();
        let mut codes = HashMap::new();

        for (age, label) in entries {
            let key = normalize_label(&label);
            if key.is_empty() {
                return Err(PipelineError::InvalidLabelTable(format!(
                    "empty label for age bracket {}",
                    age.code()
                )));
            }
            if labels.insert(age, label.trim().to_string()).is_some() {
                return Err(PipelineError::InvalidLabelTable(format!(
                    "age bracket {} has more than one label",
                    age.code()
                )));
            }
            if codes.insert(key, age).is_some() {
                return Err(PipelineError::InvalidLabelTable(format!(
                    "label '{}' maps to more than one age bracket",
                    label.trim()
                )));
            }
        }

        let missing: Vec<String> = AgeBracket::ALL
            .iter()
            .filter(|age| !labels.contains_key(age))
            .map(|age| age.code().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::InvalidLabelTable(format!(
                "no label for age bracket(s) {}",
                missing.join(", ")
            )));
        }

        let mut ignored_set = HashSet::new();
        for label in ignored {
            let key = normalize_label(&label);
            if codes.contains_key(&key) {
                return Err(PipelineError::InvalidLabelTable(format!(
                    "label '{}' is both mapped and ignored",
                    label.trim()
                )));
            }
            ignored_set.insert(key);
        }

        Ok(Self {
            labels,
            codes,
            ignored: ignored_set,
        })
    }

    /// The built-in NCHS/CDC labels.
    pub fn nchs() -> Self {
        let labels: BTreeMap<AgeBracket, String> = AgeBracket::ALL
            .iter()
            .map(|&age| (age, age.display_name().to_string()))
            .collect();
        let codes = labels
            .iter()
            .map(|(&age, label)| (normalize_label(label), age))
            .collect();
        let ignored = NCHS_IGNORED.iter().map(|l| normalize_label(l)).collect();
        Self {
            labels,
            codes,
            ignored,
        }
    }

    /// Load an externally maintained table with columns `label,age_bracket`.
    ///
    /// A blank `age_bracket` (or `ignore`) marks the label as an ignored aggregate.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self, PipelineError> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

        let headers = reader.headers()?.clone();
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim_start_matches('\u{feff}').eq_ignore_ascii_case(name))
                .ok_or_else(|| PipelineError::InvalidLabelTable(format!("missing column `{name}`")))
        };
        let label_idx = find("label")?;
        let code_idx = find("age_bracket")?;

        let mut entries = Vec::new();
        let mut ignored = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            let line = idx + 2;
            let label = record.get(label_idx).unwrap_or("").to_string();
            let code = record.get(code_idx).unwrap_or("");
            if code.is_empty() || code.eq_ignore_ascii_case("ignore") {
                ignored.push(label);
                continue;
            }
            let age = code
                .parse::<u8>()
                .ok()
                .and_then(AgeBracket::from_code)
                .ok_or_else(|| {
                    PipelineError::InvalidLabelTable(format!(
                        "line {line}: age bracket '{code}' is outside 1..=12"
                    ))
                })?;
            entries.push((age, label));
        }

        Self::new(entries, ignored)
    }

    pub fn to_label(&self, age: AgeBracket) -> &str {
        self.labels.get(&age).map(String::as_str).unwrap_or("")
    }

    /// Case-insensitive, whitespace-trimmed reverse lookup.
    pub fn to_code(&self, label: &str) -> Option<AgeBracket> {
        self.codes.get(&normalize_label(label)).copied()
    }

    /// Resolve a label from `source_name`; unmapped, non-ignored labels are errors.
    pub fn resolve(&self, source_name: &str, label: &str) -> Result<LabelMatch, PipelineError> {
        let key = normalize_label(label);
        if let Some(&age) = self.codes.get(&key) {
            return Ok(LabelMatch::Bracket(age));
        }
        if self.ignored.contains(&key) {
            return Ok(LabelMatch::Ignored);
        }
        Err(PipelineError::UnknownCohortLabel {
            source_name: source_name.to_string(),
            label: label.trim().to_string(),
        })
    }
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}
