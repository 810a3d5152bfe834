//! Test utilities for integration tests.
//!
//! This module provides an on-disk dataset fixture and a mock slide worker
//! with scripted per-slide behavior.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

use wsi_dataset::error::ExtractError;
use wsi_dataset::extract::{ProgressCounter, SlideJob, SlideWorker, WorkerReport};
use wsi_dataset::shard::{shard_path, FramedCodec, ShardCodec, TileRecord};
use wsi_dataset::{Dataset, TileGeometry};

pub const TILE_PX: u32 = 299;
pub const TILE_UM: u32 = 302;
pub const SOURCE: &str = "main";

pub fn geometry() -> TileGeometry {
    TileGeometry::new(TILE_PX, TILE_UM)
}

// =============================================================================
// Dataset Fixture
// =============================================================================

/// A single-source dataset laid out in a temporary directory.
pub struct Fixture {
    root: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let fixture = Self { root };
        for dir in ["slides", "tiles", "tfrecords", "roi"] {
            fs::create_dir_all(fixture.root().join(dir)).unwrap();
        }
        let config = serde_json::json!({
            "main": {
                "slides": fixture.root().join("slides"),
                "tiles": fixture.root().join("tiles"),
                "tfrecords": fixture.root().join("tfrecords"),
                "roi": fixture.root().join("roi"),
            }
        });
        fs::write(fixture.config_path(), config.to_string()).unwrap();
        fixture
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.root().join("sources.json")
    }

    pub fn annotations_path(&self) -> PathBuf {
        self.root().join("annotations.csv")
    }

    pub fn shard_dir(&self) -> PathBuf {
        self.root().join("tfrecords").join(geometry().label())
    }

    pub fn tile_dir(&self) -> PathBuf {
        self.root().join("tiles").join(geometry().label())
    }

    /// Create a fake slide file and return its path.
    pub fn add_slide(&self, name: &str) -> PathBuf {
        let path = self.root().join("slides").join(format!("{name}.svs"));
        fs::write(&path, format!("slide {name}")).unwrap();
        path
    }

    /// Write the annotation CSV from `(patient, slide, category)` rows.
    pub fn write_annotations(&self, rows: &[(&str, &str, &str)]) {
        let mut text = String::from("patient,slide,category\n");
        for (patient, slide, category) in rows {
            text.push_str(&format!("{patient},{slide},{category}\n"));
        }
        fs::write(self.annotations_path(), text).unwrap();
    }

    /// Write a shard with `n` records for `slide`.
    pub fn write_shard(&self, slide: &str, n: usize) {
        write_shard(&self.shard_dir(), slide, n);
    }

    /// Add slides, annotations and shards for `(patient, slide, category, tiles)`.
    pub fn populate(&self, rows: &[(&str, &str, &str, usize)]) {
        let annotations: Vec<(&str, &str, &str)> =
            rows.iter().map(|(p, s, c, _)| (*p, *s, *c)).collect();
        self.write_annotations(&annotations);
        for (_, slide, _, tiles) in rows {
            self.add_slide(slide);
            self.write_shard(slide, *tiles);
        }
    }

    pub fn open(&self) -> Dataset {
        Dataset::open(
            &self.config_path(),
            &[SOURCE.to_string()],
            Some(geometry()),
            Some(&self.annotations_path()),
        )
        .unwrap()
    }
}

pub fn write_shard(dir: &Path, slide: &str, n: usize) {
    fs::create_dir_all(dir).unwrap();
    let records: Vec<TileRecord> = (0..n)
        .map(|i| TileRecord::new(slide, vec![0xFF, 0xD8, i as u8]).with_location(i as i64, 0))
        .collect();
    FramedCodec
        .write_records(&shard_path(dir, slide), &records)
        .unwrap();
}

// =============================================================================
// Mock Worker
// =============================================================================

/// Scripted outcome of a slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Extracts this many tiles
    Tiles(usize),
    /// Hits a corrupt tile unless downsampling is off, then extracts
    CorruptWhenDownsampled(usize),
    /// Always hits a corrupt tile
    Corrupt,
    /// Fails to load during extraction
    LoadFailure,
    /// Fails the pre-scan
    Unreadable,
}

/// A worker that follows a per-slide script and tracks concurrency.
pub struct MockWorker {
    behaviors: HashMap<String, Behavior>,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: Mutex<Vec<(String, bool)>>,
    paths: Mutex<Vec<PathBuf>>,
}

impl MockWorker {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            delay: Duration::from_millis(20),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            paths: Mutex::new(Vec::new()),
        }
    }

    pub fn with_slide(mut self, slide: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(slide.to_string(), behavior);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Highest number of extractions seen running at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// `(slide, downsample)` for every extract call, in call order.
    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }

    /// Slide path handed to every extract call.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap().clone()
    }

    fn behavior(&self, slide: &str) -> Behavior {
        self.behaviors
            .get(slide)
            .copied()
            .unwrap_or(Behavior::Tiles(10))
    }
}

#[async_trait]
impl SlideWorker for MockWorker {
    async fn estimate(&self, job: &SlideJob) -> Result<u64, ExtractError> {
        match self.behavior(&job.slide) {
            Behavior::Unreadable => Err(ExtractError::LoadFailed {
                slide: job.slide.clone(),
                message: "unreadable".to_string(),
            }),
            Behavior::Tiles(n) | Behavior::CorruptWhenDownsampled(n) => Ok(n as u64),
            _ => Ok(10),
        }
    }

    async fn extract(
        &self,
        job: &SlideJob,
        progress: &ProgressCounter,
    ) -> Result<WorkerReport, ExtractError> {
        self.calls
            .lock()
            .unwrap()
            .push((job.slide.clone(), job.params.enable_downsample));
        self.paths.lock().unwrap().push(job.path.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        // Leave a partial shard behind and stream its tile, so cleanup and
        // progress rollback can be observed.
        let partial = match &job.shard_dir {
            Some(dir) => {
                write_shard(dir, &job.slide, 1);
                progress.add(1);
                1
            }
            None => 0,
        };
        tokio::time::sleep(self.delay).await;

        let result = match self.behavior(&job.slide) {
            Behavior::Tiles(n) => Ok(n),
            Behavior::CorruptWhenDownsampled(n) if !job.params.enable_downsample => Ok(n),
            Behavior::CorruptWhenDownsampled(_) | Behavior::Corrupt => {
                Err(ExtractError::CorruptTile(job.slide.clone()))
            }
            Behavior::LoadFailure | Behavior::Unreadable => Err(ExtractError::LoadFailed {
                slide: job.slide.clone(),
                message: "missing ROI".to_string(),
            }),
        };

        let result = result.map(|n| {
            if let Some(dir) = &job.shard_dir {
                write_shard(dir, &job.slide, n);
            }
            progress.add((n as u64).saturating_sub(partial));
            WorkerReport {
                tiles: n as u64,
                ..Default::default()
            }
        });
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
