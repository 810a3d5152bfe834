//! Dataset integration tests.
//!
//! Tests verify:
//! - Loading from a source config and annotation CSV
//! - Slide association when the annotation file has no slide column
//! - Filters, manifests, clipping and balancing over real shard files

use std::fs;

use wsi_dataset::annotations::backup_path;
use wsi_dataset::dataset::{BalanceStrategy, ClipOptions, ClipStrategy, Filters};
use wsi_dataset::manifest::MANIFEST_FILE;
use wsi_dataset::source::path_to_name;
use wsi_dataset::{Dataset, DatasetError};

use super::test_utils::{geometry, Fixture, SOURCE};

fn standard_fixture() -> Fixture {
    let fixture = Fixture::new();
    fixture.populate(&[
        ("P1", "s1", "A", 100),
        ("P1", "s2", "A", 40),
        ("P2", "s3", "B", 50),
        ("P3", "s4", "A", 10),
    ]);
    fixture
}

// =============================================================================
// Loading
// =============================================================================

#[test]
fn test_open_loads_sources_and_annotations() {
    let fixture = standard_fixture();
    let dataset = fixture.open();

    assert_eq!(dataset.sources().len(), 1);
    assert_eq!(dataset.slides().unwrap(), vec!["s1", "s2", "s3", "s4"]);
    assert_eq!(dataset.slide_paths(Some(SOURCE), true).unwrap().len(), 4);
    assert_eq!(dataset.patients().unwrap()["s2"], "P1");
    assert_eq!(dataset.shard_folders(), vec![fixture.shard_dir()]);
}

#[test]
fn test_open_associates_missing_slide_column() {
    let fixture = Fixture::new();
    fixture.add_slide("TCGA-A1-0001-01Z");
    fixture.add_slide("TCGA-B2-0002-01Z");
    fs::write(
        fixture.annotations_path(),
        "patient,category\nTCGA-A1-0001,A\nTCGA-B2-0002,B\nTCGA-C3-0003,A\n",
    )
    .unwrap();

    let dataset = fixture.open();

    assert!(dataset.annotations().has_slide_column());
    assert_eq!(
        dataset.slides().unwrap(),
        vec!["TCGA-A1-0001-01Z", "TCGA-B2-0002-01Z"]
    );
    assert!(backup_path(&fixture.annotations_path()).exists());
}

#[test]
fn test_open_without_annotation_file_is_empty() {
    let fixture = Fixture::new();
    let dataset = Dataset::open(
        &fixture.config_path(),
        &[],
        Some(geometry()),
        Some(&fixture.root().join("missing.csv")),
    )
    .unwrap();

    assert!(dataset.annotations().is_empty());
    assert!(dataset.slides().unwrap().is_empty());
}

#[test]
fn test_open_unknown_source() {
    let fixture = Fixture::new();
    let result = Dataset::open(
        &fixture.config_path(),
        &["missing".to_string()],
        Some(geometry()),
        None,
    );
    assert!(matches!(result, Err(DatasetError::UnknownSource { .. })));
}

// =============================================================================
// Filters and Manifests
// =============================================================================

#[test]
fn test_filtered_slides_are_a_subset() {
    let fixture = standard_fixture();
    let dataset = fixture.open();
    let all = dataset.slides().unwrap();

    for filters in [
        Filters::new().with_column("category", ["A"]),
        Filters::new().with_column("category", ["B", "C"]),
        Filters::new().with_column("patient", ["P1"]),
        Filters::new().with_blank("category"),
        Filters::new().with_column("category", ["missing"]),
    ] {
        let filtered = dataset.filter(&filters).slides().unwrap();
        assert!(filtered.iter().all(|s| all.contains(s)), "{filters:?}");
    }
}

#[test]
fn test_manifest_is_built_lazily_and_persisted() {
    let fixture = standard_fixture();
    let manifest_path = fixture.shard_dir().join(MANIFEST_FILE);
    assert!(!manifest_path.exists());

    let dataset = fixture.open();
    let manifest = dataset.manifest().unwrap();
    assert!(manifest_path.exists());

    let totals: Vec<(String, usize)> = manifest
        .iter()
        .map(|(path, entry)| (path_to_name(path), entry.total))
        .collect();
    assert_eq!(
        totals,
        vec![
            ("s1".to_string(), 100),
            ("s2".to_string(), 40),
            ("s3".to_string(), 50),
            ("s4".to_string(), 10),
        ]
    );
    assert_eq!(dataset.num_tiles().unwrap(), 200);
}

#[test]
fn test_min_tiles_filter_uses_manifest_totals() {
    let fixture = standard_fixture();
    let dataset = fixture.open();
    let view = dataset.filter(&Filters::new().with_min_tiles(45));

    let names: Vec<String> = view.shards().unwrap().iter().map(|p| path_to_name(p)).collect();
    assert_eq!(names, vec!["s1", "s3"]);
    assert_eq!(dataset.shards().unwrap().len(), 4);
}

#[test]
fn test_update_manifest_sees_new_shards() {
    let fixture = standard_fixture();
    let dataset = fixture.open();
    assert_eq!(dataset.num_tiles().unwrap(), 200);

    fixture.write_shard("s1", 120);
    dataset.update_manifest(true).unwrap();
    assert_eq!(dataset.num_tiles().unwrap(), 220);
}

#[test]
fn test_unfinished_shards_are_excluded() {
    let fixture = standard_fixture();
    fs::write(fixture.shard_dir().join("s4.unfinished"), b"").unwrap();

    let dataset = fixture.open();
    let names: Vec<String> = dataset.shards().unwrap().iter().map(|p| path_to_name(p)).collect();
    assert_eq!(names, vec!["s1", "s2", "s3"]);
}

// =============================================================================
// Clipping and Balancing
// =============================================================================

#[test]
fn test_slide_clip_without_cached_manifest() {
    let fixture = Fixture::new();
    fixture.populate(&[("P1", "shard1", "A", 100), ("P2", "shard2", "B", 50)]);
    let dataset = fixture.open();

    let clipped = dataset
        .clip(&ClipOptions::strategy(ClipStrategy::Slide).with_max_tiles(30))
        .unwrap();

    let manifest = clipped.manifest().unwrap();
    let clipped_counts: Vec<(String, usize)> = manifest
        .iter()
        .map(|(path, entry)| (path_to_name(path), entry.clipped))
        .collect();
    assert_eq!(
        clipped_counts,
        vec![("shard1".to_string(), 30), ("shard2".to_string(), 30)]
    );
    assert_eq!(clipped.num_tiles().unwrap(), 60);
    assert_eq!(clipped.unclip().num_tiles().unwrap(), 150);
}

#[test]
fn test_category_clip_equalizes_volume() {
    let fixture = standard_fixture();
    let dataset = fixture.open();
    let clipped = dataset
        .clip(&ClipOptions::strategy(ClipStrategy::Category).with_columns(["category"]))
        .unwrap();

    let manifest = clipped.manifest().unwrap();
    let volume = |slides: &[&str]| -> usize {
        manifest
            .iter()
            .filter(|(path, _)| slides.contains(&path_to_name(path).as_str()))
            .map(|(_, entry)| entry.clipped)
            .sum()
    };
    // Category B has the single 50-tile shard.
    let rounding = 3;
    assert!(volume(&["s1", "s2", "s4"]).abs_diff(50) < rounding);
    assert_eq!(volume(&["s3"]), 50);
}

#[test]
fn test_balance_weights_sum_to_one() {
    let fixture = standard_fixture();
    let dataset = fixture.open();
    let columns = vec!["category".to_string()];

    for strategy in [
        BalanceStrategy::Tile,
        BalanceStrategy::Slide,
        BalanceStrategy::Patient,
        BalanceStrategy::Category,
    ] {
        let balanced = dataset.balance(strategy, &columns, false).unwrap();
        let weights = balanced.prob_weights().unwrap();
        assert_eq!(weights.len(), 4, "{strategy}");
        let sum: f64 = weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9, "{strategy}: {sum}");
    }
    assert!(dataset.prob_weights().is_none());
}

#[test]
fn test_filter_after_balance_drops_weights() {
    let fixture = standard_fixture();
    let dataset = fixture.open();
    let balanced = dataset
        .balance(BalanceStrategy::Slide, &[], false)
        .unwrap()
        .clip(&ClipOptions::max_tiles(20))
        .unwrap();
    assert!(balanced.prob_weights().is_some());
    assert!(!balanced.clip_map().is_empty());

    let filtered = balanced.filter(&Filters::new().with_column("category", ["A"]));
    assert!(filtered.prob_weights().is_none());
    assert!(filtered.clip_map().is_empty());
}

