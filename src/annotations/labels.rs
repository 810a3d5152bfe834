//! Outcome label extraction from annotation columns.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::table::{AnnotationRow, AnnotationTable};
use crate::error::DatasetError;

/// Number of per-patient conflict messages logged before summarizing.
const LABEL_WARN_THRESHOLD: usize = 3;

/// How column values are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelMode {
    /// Values are categories, mapped to sorted indices
    #[default]
    Categorical,
    /// Values must parse as floats
    Continuous,
    /// Continuous if every value parses as a float, else categorical
    Auto,
}

impl FromStr for LabelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "categorical" => Ok(Self::Categorical),
            "continuous" | "float" => Ok(Self::Continuous),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown label mode '{other}'")),
        }
    }
}

/// A slide's outcome label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutcomeLabel {
    /// Index into the sorted unique category names
    Category(usize),
    /// Continuous outcome value
    Value(f64),
}

impl OutcomeLabel {
    pub fn category(&self) -> Option<usize> {
        match self {
            OutcomeLabel::Category(c) => Some(*c),
            OutcomeLabel::Value(_) => None,
        }
    }
}

impl fmt::Display for OutcomeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeLabel::Category(c) => write!(f, "c:{c}"),
            OutcomeLabel::Value(v) => write!(f, "f:{v}"),
        }
    }
}

/// Labels for a set of slides.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SlideLabels {
    /// Slide name → label
    pub labels: BTreeMap<String, OutcomeLabel>,

    /// Sorted category names (empty for continuous outcomes)
    pub unique: Vec<String>,
}

impl AnnotationTable {
    fn rows_for<'a>(
        &'a self,
        slides: &'a BTreeSet<String>,
    ) -> impl Iterator<Item = &'a AnnotationRow> + 'a {
        self.rows()
            .iter()
            .filter(move |row| slides.contains(row.slide()))
    }

    /// Whether every value of `column` among `slides` parses as a finite float.
    pub fn is_float(&self, column: &str, slides: &BTreeSet<String>) -> Result<bool, DatasetError> {
        if !self.has_column(column) {
            return Err(DatasetError::UnknownColumn(column.to_string()));
        }
        Ok(self
            .rows_for(slides)
            .all(|row| parse_finite(row.get(column).unwrap_or("")).is_some()))
    }

    /// Category key of a row over several columns, joined with `-`.
    pub fn category_of(row: &AnnotationRow, columns: &[String]) -> Result<String, DatasetError> {
        let parts = columns
            .iter()
            .map(|column| {
                row.get(column)
                    .ok_or_else(|| DatasetError::UnknownColumn(column.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join("-"))
    }

    /// Map each of `slides` to its label in `column`.
    ///
    /// Patients whose slides disagree are logged; the planner rejects them
    /// when building a split.
    pub fn labels(
        &self,
        column: &str,
        mode: LabelMode,
        slides: &BTreeSet<String>,
    ) -> Result<SlideLabels, DatasetError> {
        if !self.has_column(column) {
            error!("Unable to find column {} in annotation file", column);
            return Err(DatasetError::UnknownColumn(column.to_string()));
        }

        let numeric = self.is_float(column, slides)?;
        let continuous = match mode {
            LabelMode::Continuous if !numeric => {
                return Err(DatasetError::NonNumeric(column.to_string()))
            }
            LabelMode::Continuous => true,
            LabelMode::Categorical => false,
            LabelMode::Auto => numeric,
        };

        let unique: Vec<String> = if continuous {
            Vec::new()
        } else {
            let set: BTreeSet<&str> = self
                .rows_for(slides)
                .map(|row| row.get(column).unwrap_or(""))
                .collect();
            set.into_iter().map(str::to_string).collect()
        };

        if !continuous {
            debug!("Assigning label descriptors in column '{}' to numerical values", column);
            for (i, name) in unique.iter().enumerate() {
                let count = self
                    .rows_for(slides)
                    .filter(|row| row.get(column) == Some(name.as_str()))
                    .count();
                info!("{} '{}' assigned to value '{}' [{} slides]", column, name, i, count);
            }
        }

        let mut labels = BTreeMap::new();
        let mut patient_labels: BTreeMap<&str, OutcomeLabel> = BTreeMap::new();
        let mut num_warned = 0;
        for row in self.rows_for(slides) {
            let raw = row.get(column).unwrap_or("");
            let label = if continuous {
                let value = parse_finite(raw)
                    .ok_or_else(|| DatasetError::NonNumeric(column.to_string()))?;
                OutcomeLabel::Value(value)
            } else {
                let idx = unique.iter().position(|u| u == raw).unwrap_or_default();
                OutcomeLabel::Category(idx)
            };

            match patient_labels.get(row.patient()) {
                Some(existing) if *existing != label => {
                    if num_warned < LABEL_WARN_THRESHOLD {
                        error!(
                            "Multiple labels in column {} found for patient {}: {}, {}",
                            column,
                            row.patient(),
                            existing,
                            label
                        );
                    }
                    num_warned += 1;
                }
                Some(_) => {}
                None => {
                    patient_labels.insert(row.patient(), label);
                }
            }

            labels.entry(row.slide().to_string()).or_insert(label);
        }
        if num_warned > LABEL_WARN_THRESHOLD {
            warn!("...{} total label conflicts in column {}", num_warned, column);
        }

        Ok(SlideLabels { labels, unique })
    }
}

/// Parse a numeric cell; `nan` and infinities are not numbers here.
fn parse_finite(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
