//! Slide filters.
//!
//! [`Filters`] is an immutable value: every builder method returns a new set.
//! Values listed for one column are alternatives; separate columns must all
//! match.

use std::collections::{BTreeMap, HashMap};

use tracing::error;

use crate::annotations::{is_blank, shortname, AnnotationRow, AnnotationTable, PATIENT_COLUMN};
use crate::error::DatasetError;

/// Active filters of a dataset view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    /// Column → accepted values
    columns: BTreeMap<String, Vec<String>>,

    /// Columns that must not be blank
    blank: Vec<String>,

    /// Minimum tile count per shard
    min_tiles: Option<usize>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept only rows whose `column` equals one of `values`.
    pub fn with_column<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.columns
            .insert(column.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Exclude rows whose `column` is blank.
    pub fn with_blank(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        if !self.blank.contains(&column) {
            self.blank.push(column);
        }
        self
    }

    /// Exclude shards with fewer than `min_tiles` tiles.
    pub fn with_min_tiles(mut self, min_tiles: usize) -> Self {
        self.min_tiles = Some(min_tiles);
        self
    }

    pub fn columns(&self) -> &BTreeMap<String, Vec<String>> {
        &self.columns
    }

    pub fn blank(&self) -> &[String] {
        &self.blank
    }

    /// Effective minimum tile count (0 when unset).
    pub fn min_tiles(&self) -> usize {
        self.min_tiles.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.blank.is_empty() && self.min_tiles() == 0
    }

    /// Layer `other` on top of these filters.
    ///
    /// Column values are replaced per column, blank columns are appended and
    /// `min_tiles` is replaced when `other` sets it.
    pub fn merge(&self, other: &Filters) -> Filters {
        let mut merged = self.clone();
        for (column, values) in &other.columns {
            merged.columns.insert(column.clone(), values.clone());
        }
        for column in &other.blank {
            if !merged.blank.contains(column) {
                merged.blank.push(column.clone());
            }
        }
        if other.min_tiles.is_some() {
            merged.min_tiles = other.min_tiles;
        }
        merged
    }

    /// Remove the named column filters and blank filters.
    ///
    /// Naming a filter that is not active is an error.
    pub fn without(&self, columns: &[&str], blank: &[&str]) -> Result<Filters, DatasetError> {
        let mut remaining = self.clone();
        for column in columns {
            if remaining.columns.remove(*column).is_none() {
                return Err(DatasetError::UnknownFilter {
                    name: column.to_string(),
                    active: self.columns.keys().cloned().collect::<Vec<_>>().join(","),
                });
            }
        }
        for column in blank {
            let Some(idx) = remaining.blank.iter().position(|b| b == column) else {
                return Err(DatasetError::UnknownFilter {
                    name: column.to_string(),
                    active: self.blank.join(","),
                });
            };
            remaining.blank.remove(idx);
        }
        Ok(remaining)
    }

    /// Check every referenced column exists in `table`.
    fn check_columns(&self, table: &AnnotationTable) -> Result<(), DatasetError> {
        for column in self.columns.keys().chain(self.blank.iter()) {
            if !table.has_column(column) {
                error!("Filter header {} not found in annotations file", column);
                return Err(DatasetError::UnknownColumn(column.clone()));
            }
        }
        Ok(())
    }

    /// Whether a row passes every column and blank filter.
    pub fn matches(&self, row: &AnnotationRow) -> bool {
        let columns_match = self.columns.iter().all(|(column, accepted)| {
            let value = row.get(column).unwrap_or("");
            if column == PATIENT_COLUMN {
                accepted.iter().any(|a| patient_alias_match(value, a))
            } else {
                accepted.iter().any(|a| a == value)
            }
        });
        columns_match
            && self
                .blank
                .iter()
                .all(|column| !is_blank(row.get(column).unwrap_or("")))
    }
}

/// Case-insensitive patient match on full or short identifiers.
///
/// Equal full forms always have equal short forms, so comparing short forms
/// covers every full/short combination.
pub fn patient_alias_match(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    shortname(&a) == shortname(&b)
}

/// Slide names of every row passing `filters`, in table order.
///
/// Duplicates are kept so callers can detect them. Rows with a blank slide are
/// ignored; a slide without a patient, or assigned to two patients, is an error.
pub fn select_slides(
    table: &AnnotationTable,
    filters: &Filters,
) -> Result<Vec<String>, DatasetError> {
    filters.check_columns(table)?;

    let mut slide_patient: HashMap<&str, &str> = HashMap::new();
    let mut slides = Vec::new();
    for row in table.rows() {
        let slide = row.slide();
        if is_blank(slide) {
            continue;
        }
        let patient = row.patient();
        if is_blank(patient) {
            return Err(DatasetError::MissingPatient(slide.to_string()));
        }
        match slide_patient.get(slide) {
            Some(existing) if *existing != patient => {
                error!("Multiple patients assigned to slide {}", slide);
                return Err(DatasetError::ConflictingPatient {
                    slide: slide.to_string(),
                    first: existing.to_string(),
                    second: patient.to_string(),
                });
            }
            Some(_) => {}
            None => {
                slide_patient.insert(slide, patient);
            }
        }
        if filters.matches(row) {
            slides.push(slide.to_string());
        }
    }
    Ok(slides)
}
