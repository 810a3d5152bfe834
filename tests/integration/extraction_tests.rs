//! Extraction scheduler integration tests.
//!
//! Tests verify:
//! - Bounded concurrency and the corrupt-tile retry without downsampling
//! - Per-slide outcomes and cleanup of partial output
//! - Skipping finished shards and re-queuing interrupted ones
//! - Slide buffering and cooperative cancellation

use std::fs;
use std::time::Duration;

use wsi_dataset::extract::{
    ExtractionParams, ExtractionScheduler, SchedulerConfig, SlideOutcome, SUMMARY_PREFIX,
};
use wsi_dataset::shard::{list_shards, shard_path, unfinished_marker};
use wsi_dataset::source::path_to_name;
use wsi_dataset::ExtractError;

use super::test_utils::{Behavior, Fixture, MockWorker, TILE_PX, TILE_UM};

fn fixture_with_slides(slides: &[&str]) -> Fixture {
    let fixture = Fixture::new();
    let rows: Vec<(String, &str)> = slides
        .iter()
        .enumerate()
        .map(|(i, slide)| (format!("P{i}"), *slide))
        .collect();
    let annotations: Vec<(&str, &str, &str)> = rows
        .iter()
        .map(|(patient, slide)| (patient.as_str(), *slide, "A"))
        .collect();
    fixture.write_annotations(&annotations);
    for slide in slides {
        fixture.add_slide(slide);
    }
    fixture
}

fn config(worker_count: usize, downsample: bool) -> SchedulerConfig {
    let mut params = ExtractionParams::new(TILE_PX, TILE_UM);
    params.enable_downsample = downsample;
    let mut config = SchedulerConfig::new(params);
    config.worker_count = worker_count;
    config.handle_ctrl_c = false;
    config.progress_interval = Duration::from_millis(10);
    config
}

fn summary_files(dir: &std::path::Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(SUMMARY_PREFIX))
        .count()
}

// =============================================================================
// Concurrency and Retry
// =============================================================================

#[tokio::test]
async fn test_corrupt_slide_retried_without_downsampling() {
    let fixture = fixture_with_slides(&["s1", "s2", "s3", "s4", "s5"]);
    let dataset = fixture.open();
    let worker = MockWorker::new().with_slide("s3", Behavior::CorruptWhenDownsampled(12));
    let scheduler = ExtractionScheduler::new(worker, config(2, true));

    let summaries = scheduler.run(&dataset).await.unwrap();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];

    assert_eq!(summary.reports.len(), 5);
    assert_eq!(summary.count(SlideOutcome::Done), 5);
    assert_eq!(summary.retried(), 1);
    let retried: Vec<&str> = summary
        .reports
        .iter()
        .filter(|r| r.retried)
        .map(|r| r.slide.as_str())
        .collect();
    assert_eq!(retried, vec!["s3"]);
    assert!(!summary.cancelled);

    let worker = scheduler.worker();
    assert!(worker.max_active() <= 2);
    let s3_calls: Vec<bool> = worker
        .calls()
        .into_iter()
        .filter(|(slide, _)| slide == "s3")
        .map(|(_, downsample)| downsample)
        .collect();
    assert_eq!(s3_calls, vec![true, false]);

    assert_eq!(summary.estimated_tiles, 4 * 10 + 12);
    // The failed first attempt on s3 streamed a tile that is not counted.
    assert_eq!(summary.extracted_tiles, 4 * 10 + 12);
    assert_eq!(summary_files(&fixture.shard_dir()), 1);

    // The manifest was refreshed from the new shards.
    assert_eq!(dataset.num_tiles().unwrap(), 52);
}

#[tokio::test]
async fn test_worker_pool_is_bounded() {
    let slides: Vec<String> = (0..8).map(|i| format!("slide{i}")).collect();
    let names: Vec<&str> = slides.iter().map(String::as_str).collect();
    let fixture = fixture_with_slides(&names);
    let dataset = fixture.open();
    let worker = MockWorker::new().with_delay(Duration::from_millis(30));
    let scheduler = ExtractionScheduler::new(worker, config(3, false));

    let summary = scheduler.run(&dataset).await.unwrap().remove(0);
    assert_eq!(summary.count(SlideOutcome::Done), 8);
    assert!(scheduler.worker().max_active() <= 3);
    assert!(scheduler.worker().max_active() >= 2);
}

// =============================================================================
// Outcomes and Cleanup
// =============================================================================

#[tokio::test]
async fn test_failed_and_skipped_slides_leave_no_output() {
    let fixture = fixture_with_slides(&["ok", "corrupt", "noroi", "unreadable"]);
    let dataset = fixture.open();
    let worker = MockWorker::new()
        .with_slide("corrupt", Behavior::Corrupt)
        .with_slide("noroi", Behavior::LoadFailure)
        .with_slide("unreadable", Behavior::Unreadable);
    let scheduler = ExtractionScheduler::new(worker, config(2, false));

    let summary = scheduler.run(&dataset).await.unwrap().remove(0);
    let outcome = |slide: &str| {
        summary
            .reports
            .iter()
            .find(|r| r.slide == slide)
            .map(|r| r.outcome)
            .unwrap()
    };
    assert_eq!(outcome("ok"), SlideOutcome::Done);
    assert_eq!(outcome("corrupt"), SlideOutcome::Failed);
    assert_eq!(outcome("noroi"), SlideOutcome::Skipped);
    assert_eq!(outcome("unreadable"), SlideOutcome::Skipped);

    // Corrupt without downsampling is not retried; unreadable never extracted.
    let calls: Vec<String> = scheduler.worker().calls().into_iter().map(|(s, _)| s).collect();
    assert_eq!(calls.iter().filter(|s| *s == "corrupt").count(), 1);
    assert!(!calls.contains(&"unreadable".to_string()));

    let shards: Vec<String> = list_shards(&fixture.shard_dir())
        .iter()
        .map(|p| path_to_name(p))
        .collect();
    assert_eq!(shards, vec!["ok"]);
    for slide in ["ok", "corrupt", "noroi"] {
        assert!(!unfinished_marker(&fixture.shard_dir(), slide).exists());
    }
    assert_eq!(dataset.num_tiles().unwrap(), 10);
    assert_eq!(summary.extracted_tiles, 10);
}

#[tokio::test]
async fn test_finished_shards_skipped_and_interrupted_requeued() {
    let fixture = fixture_with_slides(&["s1", "s2", "s3"]);
    fixture.write_shard("s1", 7);
    fixture.write_shard("s2", 3);
    fs::write(unfinished_marker(&fixture.shard_dir(), "s2"), b"").unwrap();
    let dataset = fixture.open();

    let scheduler = ExtractionScheduler::new(MockWorker::new(), config(2, false));
    let summary = scheduler.run(&dataset).await.unwrap().remove(0);

    assert_eq!(summary.already_extracted, 1);
    let slides: Vec<&str> = summary.reports.iter().map(|r| r.slide.as_str()).collect();
    assert_eq!(slides, vec!["s2", "s3"]);
    assert!(!unfinished_marker(&fixture.shard_dir(), "s2").exists());
    assert_eq!(dataset.num_tiles().unwrap(), 7 + 10 + 10);
}

#[tokio::test]
async fn test_overwrite_refreshes_manifest_counts() {
    let fixture = fixture_with_slides(&["s1", "s2"]);
    fixture.write_shard("s1", 7);
    let dataset = fixture.open();
    assert_eq!(dataset.num_tiles().unwrap(), 7);

    let mut config = config(2, false);
    config.skip_extracted = false;
    let scheduler = ExtractionScheduler::new(MockWorker::new(), config);
    let summary = scheduler.run(&dataset).await.unwrap().remove(0);

    assert_eq!(summary.already_extracted, 0);
    assert_eq!(summary.count(SlideOutcome::Done), 2);
    assert_eq!(dataset.num_tiles().unwrap(), 20);

    // The rewritten count is on disk, not only in memory.
    assert_eq!(fixture.open().num_tiles().unwrap(), 20);
}

#[tokio::test]
async fn test_no_output_is_rejected() {
    let fixture = fixture_with_slides(&["s1"]);
    let dataset = fixture.open();
    let mut config = config(1, false);
    config.save_shards = false;

    let scheduler = ExtractionScheduler::new(MockWorker::new(), config);
    let result = scheduler.run(&dataset).await;
    assert!(matches!(result, Err(ExtractError::NoOutput)));
    assert!(scheduler.worker().calls().is_empty());
}

#[tokio::test]
async fn test_tiles_only_writes_summary_to_tile_dir() {
    let fixture = fixture_with_slides(&["s1", "s2"]);
    let dataset = fixture.open();
    let mut config = config(2, false);
    config.save_shards = false;
    config.save_tiles = true;

    let scheduler = ExtractionScheduler::new(MockWorker::new(), config);
    let summary = scheduler.run(&dataset).await.unwrap().remove(0);

    assert_eq!(summary.count(SlideOutcome::Done), 2);
    assert!(summary.shard_dir.is_none());
    assert_eq!(summary_files(&fixture.tile_dir()), 1);
    assert!(!shard_path(&fixture.shard_dir(), "s1").exists());
}

// =============================================================================
// Buffering and Cancellation
// =============================================================================

#[tokio::test]
async fn test_buffered_slides_are_staged_and_released() {
    let fixture = fixture_with_slides(&["s1", "s2", "s3"]);
    let dataset = fixture.open();
    let buffer = tempfile::tempdir().unwrap();
    let mut config = config(2, false);
    config.buffer_dir = Some(buffer.path().to_path_buf());

    let scheduler = ExtractionScheduler::new(MockWorker::new(), config);
    let summary = scheduler.run(&dataset).await.unwrap().remove(0);

    assert_eq!(summary.count(SlideOutcome::Done), 3);
    for report in &summary.reports {
        assert_eq!(
            report.history,
            vec![
                SlideOutcome::Pending,
                SlideOutcome::Buffering,
                SlideOutcome::Extracting,
                SlideOutcome::Done
            ]
        );
    }
    let paths = scheduler.worker().paths();
    assert_eq!(paths.len(), 3);
    assert!(paths.iter().all(|p| p.starts_with(buffer.path())));
    assert_eq!(fs::read_dir(buffer.path()).unwrap().count(), 0);
    assert!(fixture.root().join("slides").join("s1.svs").exists());
}

#[tokio::test]
async fn test_cancel_finishes_in_flight_slides_only() {
    let fixture = fixture_with_slides(&["s1", "s2", "s3", "s4"]);
    let dataset = fixture.open();
    let worker = MockWorker::new().with_delay(Duration::from_millis(200));
    let scheduler = ExtractionScheduler::new(worker, config(1, false));

    let handle = scheduler.cancel_handle();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });

    let summary = scheduler.run(&dataset).await.unwrap().remove(0);
    canceller.await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.reports.len(), 4);
    assert_eq!(summary.count(SlideOutcome::Done), 1);
    assert_eq!(summary.count(SlideOutcome::Skipped), 3);
    assert_eq!(scheduler.worker().calls().len(), 1);
    assert_eq!(list_shards(&fixture.shard_dir()).len(), 1);
}
