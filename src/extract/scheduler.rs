//! Concurrent, process-isolated tile extraction.
//!
//! A batch runs in three phases:
//!
//! 1. Slides with a finished shard are skipped; slides with an `.unfinished`
//!    marker from an interrupted run are queued again.
//! 2. Every remaining slide is estimated sequentially. Slides that fail to
//!    load are dropped with a warning.
//! 3. `worker_count` dispatcher tasks pull slides from a shared queue and
//!    await one worker call at a time. With a buffer directory, the producer
//!    stages each slide there first and never holds more than
//!    `worker_count` staged slides in the queue.
//!
//! Reports flow back over a channel; the summary is written and the manifest
//! refreshed only after every dispatcher has exited.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::buffer::{SlideBuffer, DEFAULT_BUFFER_BACKOFF};
use super::report::{ExtractionSummary, SlideOutcome, SlideReport};
use super::worker::{ExtractionParams, ProgressCounter, SlideJob, SlideWorker, WorkerReport};
use crate::dataset::Dataset;
use crate::error::{DatasetError, ExtractError};
use crate::shard::{list_shards, shard_path, unfinished_marker, unfinished_slides};
use crate::source::{path_to_name, Source, TileGeometry};

/// Default number of concurrent workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default interval between progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

// =============================================================================
// Configuration
// =============================================================================

/// Settings for an extraction run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub params: ExtractionParams,

    /// Number of slides extracted at once
    pub worker_count: usize,

    /// Stage slides here before extraction
    pub buffer_dir: Option<PathBuf>,

    /// Wait between failed buffer copies
    pub buffer_backoff: Duration,

    /// Write shard files
    pub save_shards: bool,

    /// Write loose tile images
    pub save_tiles: bool,

    /// Skip slides whose shard already exists
    pub skip_extracted: bool,

    /// Only extract from this source
    pub source: Option<String>,

    pub progress_interval: Duration,

    /// Cancel the run on Ctrl-C
    pub handle_ctrl_c: bool,
}

impl SchedulerConfig {
    pub fn new(params: ExtractionParams) -> Self {
        Self {
            params,
            worker_count: DEFAULT_WORKER_COUNT,
            buffer_dir: None,
            buffer_backoff: DEFAULT_BUFFER_BACKOFF,
            save_shards: true,
            save_tiles: false,
            skip_extracted: true,
            source: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            handle_ctrl_c: true,
        }
    }

    pub fn validate(&self) -> Result<(), ExtractError> {
        if !self.save_shards && !self.save_tiles {
            error!("Either shard or tile output must be enabled to extract tiles");
            return Err(ExtractError::NoOutput);
        }
        if self.worker_count == 0 {
            return Err(
                DatasetError::InvalidArgument("worker_count must be at least 1".to_string()).into(),
            );
        }
        if self.params.stride_div == 0 {
            return Err(
                DatasetError::InvalidArgument("stride_div must be at least 1".to_string()).into(),
            );
        }
        Ok(())
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Stops a running scheduler from taking new slides.
///
/// In-flight workers run to completion.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// A slide waiting in the queue.
struct QueuedSlide {
    job: SlideJob,
    report: SlideReport,
    buffered: bool,
}

/// State shared by the dispatcher tasks of one batch.
struct Dispatcher<W> {
    worker: Arc<W>,
    buffer: Option<Arc<SlideBuffer>>,
    progress: ProgressCounter,
    cancel: watch::Receiver<bool>,
}

impl<W: SlideWorker + 'static> Dispatcher<W> {
    /// Pull slides until the queue closes.
    async fn run(
        self: Arc<Self>,
        id: usize,
        queue: Arc<Mutex<mpsc::Receiver<QueuedSlide>>>,
        results: mpsc::UnboundedSender<SlideReport>,
    ) {
        loop {
            let next = queue.lock().await.recv().await;
            let Some(item) = next else {
                break;
            };
            let report = if *self.cancel.borrow() {
                self.abandon(item).await
            } else {
                debug!("Dispatcher {} took slide {}", id, item.job.slide);
                self.process(item).await
            };
            if results.send(report).is_err() {
                break;
            }
        }
        debug!("Dispatcher {} finished", id);
    }

    async fn abandon(&self, item: QueuedSlide) -> SlideReport {
        let QueuedSlide {
            job,
            mut report,
            buffered,
        } = item;
        report.transition(SlideOutcome::Skipped);
        report.message = Some("cancelled".to_string());
        self.release(&job, buffered).await;
        report
    }

    async fn release(&self, job: &SlideJob, buffered: bool) {
        if let (true, Some(buffer)) = (buffered, &self.buffer) {
            buffer.release(&job.path).await;
        }
    }

    /// One worker call; tiles streamed by a failed call are not counted.
    async fn attempt(&self, job: &SlideJob) -> Result<WorkerReport, ExtractError> {
        let progress = self.progress.attempt();
        let result = self.worker.extract(job, &progress).await;
        if result.is_err() {
            progress.rewind();
        }
        result
    }

    async fn process(&self, item: QueuedSlide) -> SlideReport {
        let QueuedSlide {
            job,
            mut report,
            buffered,
        } = item;
        report.transition(SlideOutcome::Extracting);

        let marker = job
            .shard_dir
            .as_ref()
            .map(|dir| unfinished_marker(dir, &job.slide));
        if let Some(marker) = &marker {
            if let Err(e) = tokio::fs::write(marker, b"").await {
                warn!("Unable to write marker {}: {}", marker.display(), e);
            }
        }

        let result = match self.attempt(&job).await {
            Err(ExtractError::CorruptTile(_)) if job.params.enable_downsample => {
                warn!(
                    "Corrupt tile in {}; will try disabling downsampling",
                    job.slide
                );
                report.transition(SlideOutcome::CorruptRetry);
                report.transition(SlideOutcome::Extracting);
                self.attempt(&job.without_downsample()).await
            }
            other => other,
        };

        match result {
            Ok(worker_report) => {
                debug!("Finished slide {} ({} tiles)", job.slide, worker_report.tiles);
                report.report = Some(worker_report);
                report.transition(SlideOutcome::Done);
                if let Some(marker) = &marker {
                    remove_if_exists(marker).await;
                }
            }
            Err(e) => {
                match &e {
                    ExtractError::LoadFailed { .. } => {
                        warn!("Skipping slide {}: {}", job.slide, e);
                        report.fail_with(SlideOutcome::Skipped, &e);
                    }
                    ExtractError::CorruptTile(_) => {
                        error!("Corrupt tile in {}; skipping slide", job.slide);
                        report.fail_with(SlideOutcome::Failed, &e);
                    }
                    _ => {
                        error!("Extraction failed for slide {}: {}", job.slide, e);
                        report.fail_with(SlideOutcome::Failed, &e);
                    }
                }
                if let Some(dir) = &job.shard_dir {
                    remove_if_exists(&shard_path(dir, &job.slide)).await;
                }
                if let Some(marker) = &marker {
                    remove_if_exists(marker).await;
                }
            }
        }

        self.release(&job, buffered).await;
        report
    }
}

async fn remove_if_exists(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Unable to remove {}: {}", path.display(), e),
    }
}

// =============================================================================
// ExtractionScheduler
// =============================================================================

/// Drives extraction of every eligible slide in a dataset.
pub struct ExtractionScheduler<W: SlideWorker + 'static> {
    worker: Arc<W>,
    config: SchedulerConfig,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    span: Span,
}

impl<W: SlideWorker + 'static> ExtractionScheduler<W> {
    pub fn new(worker: W, config: SchedulerConfig) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            worker: Arc::new(worker),
            config,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            span: info_span!("extract"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel_tx))
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Extract every eligible slide of `dataset`, one batch per source.
    pub async fn run(&self, dataset: &Dataset) -> Result<Vec<ExtractionSummary>, ExtractError> {
        self.config.validate()?;
        {
            let _enter = self.span.enter();
            dataset.verify_annotations_slides()?;
        }

        let sources: Vec<Source> = match &self.config.source {
            Some(name) => vec![dataset.sources().get(name)?.clone()],
            None => dataset.sources().iter().cloned().collect(),
        };

        let interrupt = self.config.handle_ctrl_c.then(|| {
            let cancel = self.cancel_handle();
            tokio::spawn(
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupt received; finishing slides in progress");
                        cancel.cancel();
                    }
                }
                .instrument(self.span.clone()),
            )
        });

        let mut summaries = Vec::new();
        let mut outcome = Ok(());
        for source in &sources {
            if self.is_cancelled() {
                break;
            }
            match self
                .run_source(dataset, source)
                .instrument(self.span.clone())
                .await
            {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if let Some(handle) = interrupt {
            handle.abort();
        }
        outcome.map(|()| summaries)
    }

    async fn run_source(
        &self,
        dataset: &Dataset,
        source: &Source,
    ) -> Result<ExtractionSummary, ExtractError> {
        let params = &self.config.params;
        let geometry = TileGeometry::new(params.tile_px, params.tile_um);
        let (Some(shard_dir), Some(tile_dir)) = (source.shard_dir(), source.tile_dir()) else {
            return Err(DatasetError::InvalidArgument(format!(
                "source '{}' has no tile geometry",
                source.name
            ))
            .into());
        };
        if source.label.as_deref() != Some(geometry.label().as_str()) {
            return Err(DatasetError::InvalidArgument(format!(
                "extraction geometry {} does not match dataset geometry {}",
                geometry.label(),
                source.label.as_deref().unwrap_or("none")
            ))
            .into());
        }
        info!("Working on dataset source {}", source.name);

        if self.config.save_shards {
            tokio::fs::create_dir_all(&shard_dir)
                .await
                .map_err(|e| ExtractError::io(&shard_dir, e))?;
        }
        if self.config.save_tiles {
            tokio::fs::create_dir_all(&tile_dir)
                .await
                .map_err(|e| ExtractError::io(&tile_dir, e))?;
        }

        let mut slide_paths = dataset.slide_paths(Some(&source.name), true)?;
        let mut already_extracted = 0;
        if self.config.skip_extracted && self.config.save_shards {
            let interrupted: HashSet<String> = unfinished_slides(&shard_dir).into_iter().collect();
            if !interrupted.is_empty() {
                info!(
                    "Interrupted tile extraction in {} shards, will re-extract slides",
                    interrupted.len()
                );
            }
            let done: HashSet<String> = list_shards(&shard_dir)
                .iter()
                .map(|p| path_to_name(p))
                .filter(|name| !interrupted.contains(name))
                .collect();
            let before = slide_paths.len();
            slide_paths.retain(|path| !done.contains(&path_to_name(path)));
            already_extracted = before - slide_paths.len();
            if already_extracted > 0 {
                info!("Skipping {} slides; shards already generated", already_extracted);
            }
        }
        info!(
            "Extracting tiles from {} slides ({} um, {} px)",
            slide_paths.len(),
            params.tile_um,
            params.tile_px
        );

        let jobs: Vec<SlideJob> = slide_paths
            .into_iter()
            .map(|path| SlideJob {
                slide: path_to_name(&path),
                path,
                shard_dir: self.config.save_shards.then(|| shard_dir.clone()),
                tile_dir: self.config.save_tiles.then(|| tile_dir.clone()),
                roi_dir: source.roi.clone(),
                params: params.clone(),
            })
            .collect();

        let mut summary = self.run_batch(jobs).await;
        summary.source = source.name.clone();
        summary.shard_dir = self.config.save_shards.then(|| shard_dir.clone());
        summary.already_extracted = already_extracted;

        let summary_dir = if self.config.save_shards { &shard_dir } else { &tile_dir };
        let path = summary.write(summary_dir).await?;
        info!("Extraction summary saved to {}", path.display());

        if self.config.save_shards {
            let rewritten: Vec<String> = summary
                .reports
                .iter()
                .filter(|r| r.outcome == SlideOutcome::Done)
                .map(|r| r.slide.clone())
                .collect();
            dataset.manifest_cache().rescan_slides(&shard_dir, &rewritten)?;
        }
        Ok(summary)
    }

    /// Estimate, queue and extract `jobs`.
    pub async fn run_batch(&self, jobs: Vec<SlideJob>) -> ExtractionSummary {
        let params = &self.config.params;
        let mut reports = Vec::new();

        // Sequential pre-scan
        info!("Verifying slides...");
        let mut estimated_tiles = 0;
        let mut pending = Vec::new();
        for job in jobs {
            match self.worker.estimate(&job).await {
                Ok(estimate) => {
                    debug!("Estimated tiles for slide {}: {}", job.slide, estimate);
                    estimated_tiles += estimate;
                    let report = SlideReport::new(&job.slide, &job.path, estimate);
                    pending.push((job, report));
                }
                Err(e) => {
                    warn!("Unable to load slide {}; skipping: {}", job.slide, e);
                    let mut report = SlideReport::new(&job.slide, &job.path, 0);
                    report.fail_with(SlideOutcome::Skipped, &e);
                    reports.push(report);
                }
            }
        }
        info!("Total estimated tiles to extract: {}", estimated_tiles);

        let progress = ProgressCounter::new();
        if !pending.is_empty() {
            reports.extend(self.dispatch(pending, &progress, estimated_tiles).await);
        }
        let cancelled = self.is_cancelled();

        reports.sort_by(|a, b| a.slide.cmp(&b.slide));
        ExtractionSummary {
            source: String::new(),
            shard_dir: None,
            tile_px: params.tile_px,
            tile_um: params.tile_um,
            already_extracted: 0,
            estimated_tiles,
            extracted_tiles: progress.get(),
            cancelled,
            reports,
        }
    }

    async fn dispatch(
        &self,
        pending: Vec<(SlideJob, SlideReport)>,
        progress: &ProgressCounter,
        estimated_tiles: u64,
    ) -> Vec<SlideReport> {
        let worker_count = self.config.worker_count.max(1);
        let buffer = self.config.buffer_dir.as_ref().map(|dir| {
            Arc::new(SlideBuffer::new(dir).with_backoff(self.config.buffer_backoff))
        });
        let capacity = if buffer.is_some() {
            worker_count
        } else {
            pending.len().max(1)
        };

        let (queue_tx, queue_rx) = mpsc::channel::<QueuedSlide>(capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(Dispatcher {
            worker: Arc::clone(&self.worker),
            buffer: buffer.clone(),
            progress: progress.clone(),
            cancel: self.cancel_rx.clone(),
        });
        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|id| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(
                    dispatcher
                        .run(id, Arc::clone(&queue_rx), results_tx.clone())
                        .instrument(Span::current()),
                )
            })
            .collect();
        drop(results_tx);

        let reporter = {
            let progress = progress.clone();
            let interval = self.config.progress_interval.max(Duration::from_millis(1));
            tokio::spawn(
                async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        info!("Extracted {}/{} tiles", progress.get(), estimated_tiles);
                    }
                }
                .instrument(Span::current()),
            )
        };

        // Producer
        let mut unsent = Vec::new();
        for (mut job, mut report) in pending {
            if self.is_cancelled() {
                report.transition(SlideOutcome::Skipped);
                report.message = Some("cancelled".to_string());
                unsent.push(report);
                continue;
            }
            match &buffer {
                Some(buffer) => {
                    let Ok(permit) = queue_tx.reserve().await else {
                        error!("Dispatchers exited early; {} not queued", job.slide);
                        break;
                    };
                    report.transition(SlideOutcome::Buffering);
                    match buffer.stage(&job.path, &self.cancel_rx).await {
                        Some(staged) => {
                            job.path = staged;
                            permit.send(QueuedSlide {
                                job,
                                report,
                                buffered: true,
                            });
                        }
                        None => {
                            report.transition(SlideOutcome::Skipped);
                            report.message = Some("cancelled while buffering".to_string());
                            unsent.push(report);
                        }
                    }
                }
                None => {
                    let item = QueuedSlide {
                        job,
                        report,
                        buffered: false,
                    };
                    if let Err(e) = queue_tx.send(item).await {
                        error!("Dispatchers exited early; {} not queued", e.0.job.slide);
                        break;
                    }
                }
            }
        }
        drop(queue_tx);

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Dispatcher task failed: {}", e);
            }
        }
        reporter.abort();
        info!("Extracted {}/{} tiles", progress.get(), estimated_tiles);

        let mut reports = unsent;
        while let Some(report) = results_rx.recv().await {
            reports.push(report);
        }
        reports
    }
}

// =============================================================================
// Tests
// =============================================================================
