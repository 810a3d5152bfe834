//! Split planner integration tests.
//!
//! Tests verify:
//! - k-fold folds partition the patients and reuse one persisted plan
//! - Plan lookup is idempotent under identical inputs
//! - No patient contributes slides to both training and validation
//! - Errors for conflicting labels and too few patients

use std::collections::BTreeSet;

use wsi_dataset::annotations::LabelMode;
use wsi_dataset::split::{site_of, PlanLog, SplitOptions, SplitPlanner, SplitStrategy};
use wsi_dataset::{Dataset, SplitError};

use super::test_utils::Fixture;

fn scenario_fixture() -> Fixture {
    let fixture = Fixture::new();
    fixture.populate(&[
        ("P1", "s1", "A", 10),
        ("P1", "s2", "A", 10),
        ("P2", "s3", "B", 10),
        ("P3", "s4", "A", 10),
    ]);
    fixture
}

fn many_patients_fixture() -> Fixture {
    let fixture = Fixture::new();
    let rows: Vec<(String, String, &str)> = (0..12)
        .flat_map(|p| {
            let category = if p % 3 == 0 { "B" } else { "A" };
            (0..(1 + p % 2)).map(move |s| (format!("P{p:02}"), format!("p{p:02}s{s}"), category))
        })
        .collect();
    let rows: Vec<(&str, &str, &str, usize)> = rows
        .iter()
        .map(|(p, s, c)| (p.as_str(), s.as_str(), *c, 5))
        .collect();
    fixture.populate(&rows);
    fixture
}

fn set(slides: &[String]) -> BTreeSet<String> {
    slides.iter().cloned().collect()
}

fn patients_of(dataset: &Dataset, slides: &[String]) -> BTreeSet<String> {
    let patients = dataset.patients().unwrap();
    slides.iter().map(|s| patients[s].clone()).collect()
}

fn k_fold_options(fixture: &Fixture, k: usize, iter: usize) -> SplitOptions {
    SplitOptions::new(SplitStrategy::KFold, "category")
        .with_label_mode(LabelMode::Categorical)
        .with_k_fold(k, iter)
        .with_plan_log(fixture.root().join("validation_plans.json"))
        .with_seed(11)
}

// =============================================================================
// k-fold
// =============================================================================

#[test]
fn test_k_fold_scenario_folds_are_complementary() {
    let fixture = scenario_fixture();
    let dataset = fixture.open();
    let planner = SplitPlanner::new();

    let splits: Vec<_> = (1..=3)
        .map(|iter| planner.split(&dataset, &k_fold_options(&fixture, 3, iter)).unwrap())
        .collect();

    // One patient per fold; every slide validates exactly once.
    let validation: Vec<BTreeSet<String>> =
        splits.iter().map(|s| set(&s.validation_slides)).collect();
    for (i, fold) in validation.iter().enumerate() {
        assert_eq!(patients_of(&dataset, &splits[i].validation_slides).len(), 1);
        for other in &validation[i + 1..] {
            assert!(fold.is_disjoint(other));
        }
    }
    let union: BTreeSet<String> = validation.iter().flatten().cloned().collect();
    assert_eq!(union, set(&dataset.slides().unwrap()));

    let expected: BTreeSet<String> = validation[0].union(&validation[2]).cloned().collect();
    assert_eq!(set(&splits[1].training_slides), expected);

    // The same plan serves every iteration.
    assert!(!splits[0].reused);
    assert!(splits[1].reused && splits[2].reused);
    assert_eq!(splits[0].plan_key, splits[2].plan_key);
    let log = PlanLog::load(Some(&fixture.root().join("validation_plans.json"))).unwrap();
    assert_eq!(log.len(), 1);
}

#[test]
fn test_k_fold_views_match_slide_lists() {
    let fixture = many_patients_fixture();
    let dataset = fixture.open();

    for iter in 1..=4 {
        let split = SplitPlanner::new()
            .split(&dataset, &k_fold_options(&fixture, 4, iter))
            .unwrap();
        assert_eq!(split.training.shards().unwrap().len(), split.training_slides.len());
        assert_eq!(
            split.validation.shards().unwrap().len(),
            split.validation_slides.len()
        );
        let training = patients_of(&dataset, &split.training_slides);
        let validation = patients_of(&dataset, &split.validation_slides);
        assert!(training.is_disjoint(&validation));
        assert_eq!(training.len() + validation.len(), 12);
        assert_eq!(validation.len(), 3);
    }
}

#[test]
fn test_preserved_site_keeps_sites_in_one_group() {
    let fixture = Fixture::new();
    fixture.populate(&[
        ("TCGA-A1-0001", "a1", "A", 5),
        ("TCGA-A1-0002", "a2", "B", 5),
        ("TCGA-B2-0001", "b1", "A", 5),
        ("TCGA-B2-0002", "b2", "B", 5),
        ("TCGA-C3-0001", "c1", "A", 5),
        ("TCGA-D4-0001", "d1", "B", 5),
    ]);
    let dataset = fixture.open();

    for iter in 1..=2 {
        let options = SplitOptions::new(SplitStrategy::KFoldPreservedSite, "category")
            .with_k_fold(2, iter)
            .with_seed(3);
        let split = SplitPlanner::new().split(&dataset, &options).unwrap();
        let sites = |slides: &[String]| -> BTreeSet<String> {
            patients_of(&dataset, slides)
                .iter()
                .map(|p| site_of(p))
                .collect()
        };
        assert!(!split.validation_slides.is_empty());
        assert!(sites(&split.training_slides).is_disjoint(&sites(&split.validation_slides)));
    }
}

// =============================================================================
// Plan Reuse
// =============================================================================

#[test]
fn test_fixed_plan_is_reused_without_new_log_entry() {
    let fixture = many_patients_fixture();
    let dataset = fixture.open();
    let log_path = fixture.root().join("plans.json");
    let options = SplitOptions::new(SplitStrategy::Fixed, "category")
        .with_fraction(0.25)
        .with_plan_log(&log_path);

    let first = SplitPlanner::new().split(&dataset, &options).unwrap();
    let second = SplitPlanner::new().split(&dataset, &options).unwrap();

    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.validation_slides, second.validation_slides);
    assert_eq!(first.training_slides, second.training_slides);
    assert_eq!(patients_of(&dataset, &first.validation_slides).len(), 3);
    assert_eq!(PlanLog::load(Some(&log_path)).unwrap().len(), 1);

    // Different patients make a different plan.
    let subset = dataset.filter(&wsi_dataset::Filters::new().with_column("category", ["A"]));
    let third = SplitPlanner::new().split(&subset, &options).unwrap();
    assert!(!third.reused);
    assert_eq!(PlanLog::load(Some(&log_path)).unwrap().len(), 2);
}

#[test]
fn test_read_only_log_is_never_written() {
    let fixture = scenario_fixture();
    let dataset = fixture.open();
    let log_path = fixture.root().join("plans.json");
    let options = k_fold_options(&fixture, 3, 1)
        .with_plan_log(&log_path)
        .read_only(true);

    let split = SplitPlanner::new().split(&dataset, &options).unwrap();
    assert!(!split.reused);
    assert!(!log_path.exists());
}

#[test]
fn test_bootstrap_never_persists() {
    let fixture = many_patients_fixture();
    let dataset = fixture.open();
    let log_path = fixture.root().join("plans.json");
    let options = SplitOptions::new(SplitStrategy::Bootstrap, "category")
        .with_fraction(0.5)
        .with_plan_log(&log_path);

    let split = SplitPlanner::new().split(&dataset, &options).unwrap();
    assert!(split.plan_key.is_none());
    assert_eq!(patients_of(&dataset, &split.validation_slides).len(), 6);
    assert!(!log_path.exists());
}

// =============================================================================
// Outputs and Errors
// =============================================================================

#[test]
fn test_no_strategy_trains_on_everything() {
    let fixture = scenario_fixture();
    let dataset = fixture.open();
    let options = SplitOptions::new(SplitStrategy::None, "category");

    let (training, validation) = dataset.training_validation_split(&options).unwrap();
    assert_eq!(training.shards().unwrap().len(), 4);
    assert!(validation.shards().unwrap().is_empty());
}

#[test]
fn test_slides_without_shards_are_left_out() {
    let fixture = scenario_fixture();
    fixture.write_annotations(&[
        ("P1", "s1", "A"),
        ("P1", "s2", "A"),
        ("P2", "s3", "B"),
        ("P3", "s4", "A"),
        ("P4", "s5", "B"),
    ]);
    let dataset = fixture.open();

    let split = SplitPlanner::new()
        .split(&dataset, &SplitOptions::new(SplitStrategy::None, "category"))
        .unwrap();
    assert_eq!(
        set(&split.training_slides),
        set(&["s1", "s2", "s3", "s4"].map(String::from))
    );
}

#[test]
fn test_conflicting_patient_labels_are_fatal() {
    let fixture = Fixture::new();
    fixture.populate(&[
        ("P1", "s1", "A", 5),
        ("P1", "s2", "B", 5),
        ("P2", "s3", "A", 5),
    ]);
    let dataset = fixture.open();
    let options = SplitOptions::new(SplitStrategy::Fixed, "category").with_seed(1);

    let result = SplitPlanner::new().split(&dataset, &options);
    assert!(matches!(result, Err(SplitError::ConflictingLabels { .. })));
}

#[test]
fn test_too_few_patients_for_folds() {
    let fixture = Fixture::new();
    fixture.populate(&[("P1", "s1", "A", 5), ("P2", "s2", "B", 5)]);
    let dataset = fixture.open();

    let result = SplitPlanner::new().split(&dataset, &k_fold_options(&fixture, 3, 1));
    assert!(matches!(result, Err(SplitError::InsufficientPatients)));
    assert!(!fixture.root().join("validation_plans.json").exists());
}

#[test]
fn test_invalid_k_fold_iteration() {
    let fixture = scenario_fixture();
    let dataset = fixture.open();

    let result = SplitPlanner::new().split(&dataset, &k_fold_options(&fixture, 3, 4));
    assert!(matches!(result, Err(SplitError::InvalidKFold(_))));
}
