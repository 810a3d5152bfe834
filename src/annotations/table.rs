//! Annotation table loading and lookup.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::error::DatasetError;

/// Column holding the patient identifier.
pub const PATIENT_COLUMN: &str = "patient";

/// Column holding the slide name.
pub const SLIDE_COLUMN: &str = "slide";

/// Length of the short patient form used for alias matching.
pub const SHORTNAME_LEN: usize = 12;

/// Short form of a patient or slide identifier (its first 12 characters).
pub fn shortname(value: &str) -> &str {
    match value.char_indices().nth(SHORTNAME_LEN) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// Whether an annotation cell counts as blank.
pub fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

// =============================================================================
// AnnotationRow
// =============================================================================

/// A single annotation row: column name → value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnnotationRow {
    values: BTreeMap<String, String>,
}

impl AnnotationRow {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Patient identifier, empty string if the column is absent.
    pub fn patient(&self) -> &str {
        self.get(PATIENT_COLUMN).unwrap_or("")
    }

    /// Slide name, empty string if the column is absent.
    pub fn slide(&self) -> &str {
        self.get(SLIDE_COLUMN).unwrap_or("")
    }
}

// =============================================================================
// AnnotationTable
// =============================================================================

/// Ordered annotation rows loaded from a delimited file.
#[derive(Debug, Clone, Default)]
pub struct AnnotationTable {
    header: Vec<String>,
    rows: Vec<AnnotationRow>,
}

impl AnnotationTable {
    /// Load a comma-delimited annotation file.
    ///
    /// Headers must be unique and include the patient column. A missing
    /// slide column is allowed here; see [`AnnotationTable::has_slide_column`].
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| DatasetError::io(path, e))?;

        let header: Vec<String> = reader
            .headers()
            .map_err(|e| DatasetError::io(path, e))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| DatasetError::io(path, e))?;
            let values = header
                .iter()
                .enumerate()
                .map(|(i, column)| (column.clone(), record.get(i).unwrap_or("").to_string()))
                .collect();
            rows.push(AnnotationRow::new(values));
        }

        Self::from_parts(header, rows)
    }

    /// Build a table from an in-memory header and rows, applying the same checks as [`load`](Self::load).
    pub fn from_parts(header: Vec<String>, rows: Vec<AnnotationRow>) -> Result<Self, DatasetError> {
        let mut seen = HashSet::new();
        for column in &header {
            if !seen.insert(column.as_str()) {
                return Err(DatasetError::DuplicateHeader(column.clone()));
            }
        }
        if !seen.contains(PATIENT_COLUMN) {
            return Err(DatasetError::MissingColumn(PATIENT_COLUMN.to_string()));
        }
        Ok(Self { header, rows })
    }

    /// Build a table from string rows, mostly for tests and small fixtures.
    pub fn from_records<H, R, V>(header: H, records: R) -> Result<Self, DatasetError>
    where
        H: IntoIterator,
        H::Item: Into<String>,
        R: IntoIterator<Item = V>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        let header: Vec<String> = header.into_iter().map(Into::into).collect();
        let rows = records
            .into_iter()
            .map(|record| {
                let values = header
                    .iter()
                    .cloned()
                    .zip(record.into_iter().map(Into::into))
                    .collect();
                AnnotationRow::new(values)
            })
            .collect();
        Self::from_parts(header, rows)
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn rows(&self) -> &[AnnotationRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.header.iter().any(|h| h == column)
    }

    pub fn has_slide_column(&self) -> bool {
        self.has_column(SLIDE_COLUMN)
    }

    /// First row annotating `slide`.
    pub fn row_for_slide(&self, slide: &str) -> Option<&AnnotationRow> {
        self.rows.iter().find(|row| row.slide() == slide)
    }
}
