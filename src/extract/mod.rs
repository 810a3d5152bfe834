//! Tile extraction.
//!
//! The [`ExtractionScheduler`] fans slides out over a fixed pool of
//! dispatchers, each driving one [`SlideWorker`] call at a time. Slide parsing
//! lives behind the worker; [`ProcessWorker`] isolates it in a child process.

mod buffer;
mod export;
mod report;
mod scheduler;
mod worker;

pub use buffer::{SlideBuffer, DEFAULT_BUFFER_BACKOFF};
pub use export::export_tiles;
pub use report::{ExtractionSummary, SlideOutcome, SlideReport, SUMMARY_PREFIX};
pub use scheduler::{
    CancelHandle, ExtractionScheduler, SchedulerConfig, DEFAULT_PROGRESS_INTERVAL,
    DEFAULT_WORKER_COUNT,
};
pub use worker::{
    ExtractionParams, ProcessWorker, ProgressCounter, RoiMethod, SlideJob, SlideWorker,
    WorkerReport, EXIT_CORRUPT_TILE, EXIT_LOAD_FAILED,
};
