//! Slide worker contract and the process-isolated implementation.
//!
//! The scheduler never parses slides itself. A [`SlideWorker`] estimates how
//! many tiles a slide will yield and performs the extraction, reporting tile
//! progress as it goes. [`ProcessWorker`] runs each call in a separate child
//! process so a crash or runaway allocation only takes down one slide.
//!
//! # Process protocol
//!
//! ```text
//! <program> estimate --slide <path> [params...]
//!     stdout: <estimated tile count>
//! <program> extract --slide <path> [params...]
//!     stdout: progress <n>          (n tiles written since the last line)
//!             {"tiles": ..., ...}   (final JSON report, last JSON line wins)
//! exit code:  0 done, 3 corrupt tile, 4 slide failed to load, other = failure
//! ```

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tracing::{debug, trace, warn};

use crate::error::ExtractError;

/// Exit code signalling a corrupt tile.
pub const EXIT_CORRUPT_TILE: i32 = 3;

/// Exit code signalling the slide could not be loaded.
pub const EXIT_LOAD_FAILED: i32 = 4;

/// Prefix of progress lines on a worker's stdout.
const PROGRESS_PREFIX: &str = "progress ";

// =============================================================================
// Parameters
// =============================================================================

/// How regions of interest restrict tile extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiMethod {
    /// Only extract tiles inside an ROI
    #[default]
    Inside,
    /// Only extract tiles outside every ROI
    Outside,
    /// Ignore ROIs
    Ignore,
}

impl FromStr for RoiMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inside" => Ok(Self::Inside),
            "outside" => Ok(Self::Outside),
            "ignore" => Ok(Self::Ignore),
            other => Err(format!("unknown ROI method '{other}'")),
        }
    }
}

impl fmt::Display for RoiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inside => "inside",
            Self::Outside => "outside",
            Self::Ignore => "ignore",
        })
    }
}

/// Per-batch extraction parameters passed through to workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionParams {
    pub tile_px: u32,
    pub tile_um: u32,

    /// Stride divisor: 1 for non-overlapping tiles, 2 for 50% overlap
    pub stride_div: u32,

    /// Read from downsampled pyramid levels
    pub enable_downsample: bool,

    pub roi_method: RoiMethod,

    /// Skip slides with no ROI file
    pub skip_missing_roi: bool,

    /// Randomize the grid origin
    pub randomize_origin: bool,
}

impl ExtractionParams {
    pub fn new(tile_px: u32, tile_um: u32) -> Self {
        Self {
            tile_px,
            tile_um,
            stride_div: 1,
            enable_downsample: false,
            roi_method: RoiMethod::default(),
            skip_missing_roi: true,
            randomize_origin: false,
        }
    }
}

/// One slide handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideJob {
    /// Slide name
    pub slide: String,

    /// Path the worker reads from (the buffered copy, when buffering)
    pub path: PathBuf,

    /// Shard output directory, if shards are written
    pub shard_dir: Option<PathBuf>,

    /// Loose tile output directory, if tiles are written
    pub tile_dir: Option<PathBuf>,

    pub roi_dir: PathBuf,

    pub params: ExtractionParams,
}

impl SlideJob {
    /// Same job with downsampling disabled.
    pub fn without_downsample(&self) -> SlideJob {
        let mut job = self.clone();
        job.params.enable_downsample = false;
        job
    }
}

/// Report returned by a worker after a successful extraction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Tiles written
    pub tiles: u64,

    /// Any further statistics the worker chose to report
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// Progress
// =============================================================================

/// Shared tile counter.
///
/// Each extraction attempt works on an [`attempt`](Self::attempt) handle, so
/// the tiles of an attempt that fails can be taken back out of the total.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter {
    total: Arc<AtomicU64>,
    attempt: Arc<AtomicU64>,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tiles: u64) {
        self.total.fetch_add(tiles, Ordering::Relaxed);
        self.attempt.fetch_add(tiles, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Handle sharing the total but tracking its own additions.
    pub fn attempt(&self) -> ProgressCounter {
        Self {
            total: Arc::clone(&self.total),
            attempt: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Remove this handle's additions from the total.
    pub fn rewind(&self) {
        let tiles = self.attempt.swap(0, Ordering::Relaxed);
        self.total.fetch_sub(tiles, Ordering::Relaxed);
    }
}

// =============================================================================
// SlideWorker
// =============================================================================

/// Extraction backend for a single slide.
///
/// `estimate` and `extract` signal an unreadable slide with
/// [`ExtractError::LoadFailed`] and a decode failure with
/// [`ExtractError::CorruptTile`]; the scheduler treats those two distinctly.
#[async_trait]
pub trait SlideWorker: Send + Sync {
    /// Check the slide loads and estimate the tiles it will yield.
    async fn estimate(&self, job: &SlideJob) -> Result<u64, ExtractError>;

    /// Extract tiles, adding to `progress` as tiles are written.
    async fn extract(
        &self,
        job: &SlideJob,
        progress: &ProgressCounter,
    ) -> Result<WorkerReport, ExtractError>;
}

// =============================================================================
// ProcessWorker
// =============================================================================

/// Runs an external program once per slide and call.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessWorker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the action name.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn command(&self, action: &str, job: &SlideJob) -> Command {
        let params = &job.params;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(action)
            .arg("--slide")
            .arg(&job.path)
            .arg("--tile-px")
            .arg(params.tile_px.to_string())
            .arg("--tile-um")
            .arg(params.tile_um.to_string())
            .arg("--stride-div")
            .arg(params.stride_div.to_string())
            .arg("--roi-method")
            .arg(params.roi_method.to_string())
            .arg("--roi-dir")
            .arg(&job.roi_dir);
        if params.enable_downsample {
            cmd.arg("--downsample");
        }
        if params.skip_missing_roi {
            cmd.arg("--skip-missing-roi");
        }
        if params.randomize_origin {
            cmd.arg("--randomize-origin");
        }
        if let Some(dir) = &job.shard_dir {
            cmd.arg("--shard-dir").arg(dir);
        }
        if let Some(dir) = &job.tile_dir {
            cmd.arg("--tile-dir").arg(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }

    fn status_error(job: &SlideJob, status: ExitStatus) -> ExtractError {
        match status.code() {
            Some(EXIT_CORRUPT_TILE) => ExtractError::CorruptTile(job.slide.clone()),
            Some(EXIT_LOAD_FAILED) => ExtractError::LoadFailed {
                slide: job.slide.clone(),
                message: "worker reported load failure".to_string(),
            },
            _ => ExtractError::Worker {
                slide: job.slide.clone(),
                message: format!("worker exited with {status}"),
            },
        }
    }

    fn spawn_error(&self, job: &SlideJob, err: std::io::Error) -> ExtractError {
        ExtractError::Worker {
            slide: job.slide.clone(),
            message: format!("unable to run {}: {}", self.program.display(), err),
        }
    }
}

/// Stream a worker's stdout, counting progress lines.
///
/// Returns the last JSON line. Stdout is dropped on return, so a worker still
/// writing after a read error sees a closed pipe.
async fn read_output(
    stdout: ChildStdout,
    job: &SlideJob,
    progress: &ProgressCounter,
) -> std::io::Result<Option<String>> {
    let mut report_line = None;
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if let Some(count) = line.strip_prefix(PROGRESS_PREFIX) {
            match count.trim().parse::<u64>() {
                Ok(n) => progress.add(n),
                Err(_) => trace!("Ignoring malformed progress line '{}'", line),
            }
        } else if line.starts_with('{') {
            report_line = Some(line.to_string());
        } else if !line.is_empty() {
            trace!("[{}] {}", job.slide, line);
        }
    }
    Ok(report_line)
}

#[async_trait]
impl SlideWorker for ProcessWorker {
    async fn estimate(&self, job: &SlideJob) -> Result<u64, ExtractError> {
        let output = self
            .command("estimate", job)
            .output()
            .await
            .map_err(|e| self.spawn_error(job, e))?;
        if !output.status.success() {
            return Err(Self::status_error(job, output.status));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        last.trim().parse::<u64>().map_err(|_| ExtractError::InvalidReport {
            slide: job.slide.clone(),
            message: format!("expected a tile count, got '{}'", last.trim()),
        })
    }

    async fn extract(
        &self,
        job: &SlideJob,
        progress: &ProgressCounter,
    ) -> Result<WorkerReport, ExtractError> {
        let mut child = self
            .command("extract", job)
            .spawn()
            .map_err(|e| self.spawn_error(job, e))?;
        debug!("Started worker for slide {} (pid {:?})", job.slide, child.id());

        let output = match child.stdout.take() {
            Some(stdout) => read_output(stdout, job, progress).await,
            None => Ok(None),
        };

        // The child is always reaped, even when its output was unreadable.
        let status = child.wait().await.map_err(|e| self.spawn_error(job, e))?;
        let report_line = output.map_err(|e| {
            warn!("Unable to read output of worker for slide {}: {}", job.slide, e);
            self.spawn_error(job, e)
        })?;
        if !status.success() {
            return Err(Self::status_error(job, status));
        }

        let line = report_line.ok_or_else(|| ExtractError::InvalidReport {
            slide: job.slide.clone(),
            message: "worker exited without a report".to_string(),
        })?;
        serde_json::from_str(&line).map_err(|e| ExtractError::InvalidReport {
            slide: job.slide.clone(),
            message: e.to_string(),
        })
    }
}
