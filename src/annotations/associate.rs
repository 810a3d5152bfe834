//! Best-effort association of slide files with annotated patients.
//!
//! Used when an annotation table has no slide column, or has blank slide
//! cells. Slide names are matched against patient identifiers by full name or
//! short form; ambiguous matches are skipped. The original file is kept as
//! `<file>.backup`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::table::{shortname, PATIENT_COLUMN, SLIDE_COLUMN};
use crate::error::DatasetError;
use crate::source::path_to_name;

/// Result of an association pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociationSummary {
    /// Rows that received a slide name
    pub updated: usize,
    /// Rows left without a slide
    pub missing: usize,
    /// Slides skipped because of ambiguous matches
    pub ambiguous: usize,
}

/// Backup path for an annotation file.
pub fn backup_path(annotations: &Path) -> PathBuf {
    let mut name = annotations.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

/// Fill in the slide column of `annotations` from `slide_paths`.
pub fn associate_slides(
    annotations: &Path,
    slide_paths: &[PathBuf],
) -> Result<AssociationSummary, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(annotations)
        .map_err(|e| DatasetError::io(annotations, e))?;

    let mut header: Vec<String> = reader
        .headers()
        .map_err(|e| DatasetError::io(annotations, e))?
        .iter()
        .map(str::to_string)
        .collect();
    let patient_idx = header
        .iter()
        .position(|h| h == PATIENT_COLUMN)
        .ok_or_else(|| DatasetError::MissingColumn(PATIENT_COLUMN.to_string()))?;

    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| DatasetError::io(annotations, e))?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    let patients: HashSet<&str> = rows
        .iter()
        .filter_map(|row| row.get(patient_idx).map(String::as_str))
        .collect();
    debug!("Number of patients in annotations: {}", patients.len());
    debug!("Slides found: {}", slide_paths.len());

    let slide_names: Vec<String> = slide_paths.iter().map(|p| path_to_name(p)).collect();
    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    for name in &slide_names {
        *occurrences.entry(shortname(name)).or_default() += 1;
    }

    let mut summary = AssociationSummary::default();
    let mut patient_slide: BTreeMap<String, String> = BTreeMap::new();
    for name in &slide_names {
        let short = shortname(name);
        if occurrences[short] > 1 {
            warn!(
                "Unable to associate slide {} due to ambiguity; multiple slides match to patient {}; skipping",
                name, short
            );
            summary.ambiguous += 1;
            continue;
        }
        if name != short && patients.contains(name.as_str()) && patients.contains(short) {
            warn!(
                "Unable to associate slide {} due to ambiguity; both {} and {} are patients; skipping",
                name, name, short
            );
            summary.ambiguous += 1;
            continue;
        }
        if patients.contains(name.as_str()) {
            patient_slide.insert(name.clone(), name.clone());
        } else if patients.contains(short) {
            patient_slide.insert(short.to_string(), name.clone());
        }
    }

    let slide_idx = match header.iter().position(|h| h == SLIDE_COLUMN) {
        Some(idx) => idx,
        None => {
            header.push(SLIDE_COLUMN.to_string());
            header.len() - 1
        }
    };

    for row in &mut rows {
        row.resize(header.len(), String::new());
        if !row[slide_idx].trim().is_empty() {
            continue;
        }
        match patient_slide.get(&row[patient_idx]) {
            Some(slide) => {
                row[slide_idx] = slide.clone();
                summary.updated += 1;
            }
            None => summary.missing += 1,
        }
    }

    let staging = annotations.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&staging).map_err(|e| DatasetError::io(&staging, e))?;
        writer
            .write_record(&header)
            .map_err(|e| DatasetError::io(&staging, e))?;
        for row in &rows {
            writer
                .write_record(row)
                .map_err(|e| DatasetError::io(&staging, e))?;
        }
        writer.flush().map_err(|e| DatasetError::io(&staging, e))?;
    }

    let backup = backup_path(annotations);
    if backup.exists() {
        fs::remove_file(&backup).map_err(|e| DatasetError::io(&backup, e))?;
    }
    fs::rename(annotations, &backup).map_err(|e| DatasetError::io(annotations, e))?;
    fs::rename(&staging, annotations).map_err(|e| DatasetError::io(annotations, e))?;

    if summary.updated > 0 {
        info!(
            "Successfully associated slides with {} annotation entries",
            summary.updated
        );
        if summary.missing > 0 {
            info!("Slides not found for {} annotations", summary.missing);
        }
    } else if summary.missing > 0 {
        debug!(
            "No annotation updates performed. Slides not found for {} annotations",
            summary.missing
        );
    } else {
        debug!("Annotations up-to-date, no changes made");
    }

    Ok(summary)
}
