//! Per-slide outcomes and the batch summary written after extraction.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::worker::WorkerReport;
use crate::error::ExtractError;

/// Prefix of summary file names.
pub const SUMMARY_PREFIX: &str = "extraction_report";

/// Lifecycle of one slide in a batch.
///
/// ```text
/// Pending -> (Buffering) -> Extracting -> Done | Skipped | Failed
///                              |  ^
///                              v  |
///                          CorruptRetry
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlideOutcome {
    Pending,
    Buffering,
    Extracting,
    /// A corrupt tile was hit with downsampling on; re-extracting without it
    CorruptRetry,
    Done,
    /// The slide could not be loaded, or the batch was cancelled first
    Skipped,
    Failed,
}

impl SlideOutcome {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(self, next: SlideOutcome) -> bool {
        use SlideOutcome::*;
        match (self, next) {
            (Pending, Buffering | Extracting | Skipped) => true,
            (Buffering, Extracting | Skipped | Failed) => true,
            (Extracting, CorruptRetry | Done | Skipped | Failed) => true,
            (CorruptRetry, Extracting) => true,
            _ => false,
        }
    }
}

/// What happened to one slide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideReport {
    pub slide: String,

    /// Original slide path (not the buffered copy)
    pub path: PathBuf,

    pub outcome: SlideOutcome,

    /// Extracted on a second attempt without downsampling
    pub retried: bool,

    /// Tiles estimated before extraction
    pub estimated_tiles: u64,

    /// Worker report for a completed slide
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<WorkerReport>,

    /// Reason for a skipped or failed slide
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Every state the slide passed through
    pub history: Vec<SlideOutcome>,
}

impl SlideReport {
    pub fn new(slide: impl Into<String>, path: impl Into<PathBuf>, estimated_tiles: u64) -> Self {
        Self {
            slide: slide.into(),
            path: path.into(),
            outcome: SlideOutcome::Pending,
            retried: false,
            estimated_tiles,
            report: None,
            message: None,
            history: vec![SlideOutcome::Pending],
        }
    }

    /// Move to `next`. Illegal transitions are ignored and return `false`.
    pub fn transition(&mut self, next: SlideOutcome) -> bool {
        if !self.outcome.can_transition(next) {
            tracing::debug!(
                "Ignoring transition {:?} -> {:?} for slide {}",
                self.outcome,
                next,
                self.slide
            );
            return false;
        }
        if next == SlideOutcome::CorruptRetry {
            self.retried = true;
        }
        self.outcome = next;
        self.history.push(next);
        true
    }

    /// Terminal transition recording why the slide did not complete.
    pub fn fail_with(&mut self, outcome: SlideOutcome, err: &ExtractError) {
        self.transition(outcome);
        self.message = Some(err.to_string());
    }

    pub fn tiles(&self) -> u64 {
        self.report.as_ref().map_or(0, |r| r.tiles)
    }
}

/// Aggregate result of one extraction batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSummary {
    pub source: String,

    pub shard_dir: Option<PathBuf>,

    pub tile_px: u32,
    pub tile_um: u32,

    /// Slides skipped because their shards already existed
    pub already_extracted: usize,

    pub estimated_tiles: u64,

    /// Tiles counted from worker progress
    pub extracted_tiles: u64,

    pub cancelled: bool,

    /// One report per slide, sorted by slide name
    pub reports: Vec<SlideReport>,
}

impl ExtractionSummary {
    pub fn count(&self, outcome: SlideOutcome) -> usize {
        self.reports.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn retried(&self) -> usize {
        self.reports.iter().filter(|r| r.retried).count()
    }

    /// Write the summary as `extraction_report-<timestamp>.json` in `dir`.
    pub async fn write(&self, dir: &Path) -> Result<PathBuf, ExtractError> {
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{SUMMARY_PREFIX}-{timestamp}.json"));
        let json = serde_json::to_vec_pretty(self).map_err(|e| ExtractError::io(&path, e))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| ExtractError::io(&path, e))?;
        Ok(path)
    }
}
