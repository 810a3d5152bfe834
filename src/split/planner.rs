//! Training/validation split resolution.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, info_span, warn, Span};

use super::partition::{
    overlapping_patients, partition_by_site, partition_patients, GreedySiteSolver, SiteSolver,
};
use super::plan::{
    content_key, fold_group, PatientEntry, PlanLog, SplitStrategy, ValidationPlan,
    TRAINING_GROUP, VALIDATION_GROUP,
};
use crate::annotations::{LabelMode, OutcomeLabel, SLIDE_COLUMN};
use crate::dataset::{Dataset, Filters};
use crate::error::SplitError;
use crate::source::path_to_name;

/// Default fraction of patients held out by `fixed` and `bootstrap`.
pub const DEFAULT_VAL_FRACTION: f64 = 0.2;

/// Parameters of one split request.
#[derive(Debug, Clone)]
pub struct SplitOptions {
    pub strategy: SplitStrategy,

    /// Annotation column holding the outcome
    pub outcome: String,

    pub label_mode: LabelMode,

    /// Fraction of patients held out by `fixed` and `bootstrap`
    pub val_fraction: f64,

    /// Number of folds
    pub k_fold: Option<usize>,

    /// Fold used for validation (1-based)
    pub k_fold_iter: Option<usize>,

    /// Plan log location; `None` never reuses or persists plans
    pub plan_log: Option<PathBuf>,

    /// Look up plans but never write the log
    pub read_only: bool,

    /// Shuffle seed; `None` seeds from entropy
    pub seed: Option<u64>,
}

impl SplitOptions {
    pub fn new(strategy: SplitStrategy, outcome: impl Into<String>) -> Self {
        Self {
            strategy,
            outcome: outcome.into(),
            label_mode: LabelMode::Auto,
            val_fraction: DEFAULT_VAL_FRACTION,
            k_fold: None,
            k_fold_iter: None,
            plan_log: None,
            read_only: false,
            seed: None,
        }
    }

    pub fn with_k_fold(mut self, k: usize, iter: usize) -> Self {
        self.k_fold = Some(k);
        self.k_fold_iter = Some(iter);
        self
    }

    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.val_fraction = fraction;
        self
    }

    pub fn with_plan_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.plan_log = Some(path.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_label_mode(mut self, mode: LabelMode) -> Self {
        self.label_mode = mode;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Check the parameters the strategy needs.
    pub fn validate(&self) -> Result<(), SplitError> {
        match self.strategy {
            SplitStrategy::KFold | SplitStrategy::KFoldPreservedSite => {
                let k = self.k_fold.ok_or_else(|| {
                    SplitError::InvalidKFold("k_fold is required for k-fold validation".to_string())
                })?;
                let iter = self.k_fold_iter.ok_or_else(|| {
                    SplitError::InvalidKFold(
                        "k_fold_iter is required for k-fold validation".to_string(),
                    )
                })?;
                if k < 2 {
                    return Err(SplitError::InvalidKFold(format!(
                        "k_fold must be at least 2, got {k}"
                    )));
                }
                if !(1..=k).contains(&iter) {
                    return Err(SplitError::InvalidKFold(format!(
                        "k_fold_iter must be in 1..={k}, got {iter}"
                    )));
                }
            }
            SplitStrategy::Fixed | SplitStrategy::Bootstrap => {
                if !(self.val_fraction > 0.0 && self.val_fraction < 1.0) {
                    return Err(SplitError::InvalidFraction(self.val_fraction));
                }
            }
            SplitStrategy::None => {}
        }
        Ok(())
    }
}

/// Result of a split.
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub training: Dataset,
    pub validation: Dataset,
    pub training_slides: Vec<String>,
    pub validation_slides: Vec<String>,

    /// Key of the plan used, if the strategy persists plans
    pub plan_key: Option<String>,

    /// Whether the plan came from the log
    pub reused: bool,
}

/// Resolves validation plans and builds training/validation views.
pub struct SplitPlanner {
    solver: Arc<dyn SiteSolver>,
    span: Span,
}

impl Default for SplitPlanner {
    fn default() -> Self {
        Self {
            solver: Arc::new(GreedySiteSolver),
            span: info_span!("split"),
        }
    }
}

impl SplitPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site_solver(mut self, solver: Arc<dyn SiteSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Split `dataset` into training and validation views.
    pub fn split(
        &self,
        dataset: &Dataset,
        options: &SplitOptions,
    ) -> Result<DatasetSplit, SplitError> {
        let _enter = self.span.enter();
        options.validate()?;

        let patients = self.patient_entries(dataset, options)?;
        if patients.is_empty() {
            return Err(SplitError::InsufficientPatients);
        }

        let mut rng = match options.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let mut order: Vec<String> = patients.keys().cloned().collect();
        order.shuffle(&mut rng);

        let (training_slides, validation_slides, plan_key, reused) = match options.strategy {
            SplitStrategy::None => {
                info!("No validation strategy; using every slide for training");
                let slides = patients.values().flat_map(|e| e.slides.clone()).collect();
                (slides, Vec::new(), None, false)
            }
            SplitStrategy::Bootstrap => {
                let plan = fraction_plan(SplitStrategy::Bootstrap, &order, patients, options)?;
                let (training, validation) = plan_groups(&plan, options)?;
                info!(
                    "Bootstrap split: {} training slides, {} validation slides",
                    training.len(),
                    validation.len()
                );
                (training, validation, None, false)
            }
            SplitStrategy::Fixed | SplitStrategy::KFold | SplitStrategy::KFoldPreservedSite => {
                let (plan, reused) = self.resolve_plan(&order, patients, options)?;
                let (training, validation) = plan_groups(&plan, options)?;
                (training, validation, Some(plan.key()), reused)
            }
        };

        check_leakage(dataset, &training_slides, &validation_slides)?;

        let training = view_of(dataset, &training_slides);
        let validation = view_of(dataset, &validation_slides);
        check_shard_count("training", &training, training_slides.len())?;
        check_shard_count("validation", &validation, validation_slides.len())?;

        Ok(DatasetSplit {
            training,
            validation,
            training_slides,
            validation_slides,
            plan_key,
            reused,
        })
    }

    /// Group labelled slides with shards by patient.
    fn patient_entries(
        &self,
        dataset: &Dataset,
        options: &SplitOptions,
    ) -> Result<BTreeMap<String, PatientEntry>, SplitError> {
        let labels = dataset.labels(&options.outcome, options.label_mode)?;
        let slide_patients = dataset.patients()?;
        let with_shards: HashSet<String> = dataset
            .shards()?
            .iter()
            .map(|shard| path_to_name(shard))
            .collect();

        let mut patients: BTreeMap<String, PatientEntry> = BTreeMap::new();
        let mut missing = 0;
        for (slide, label) in &labels.labels {
            if !with_shards.contains(slide) {
                debug!("Slide {} has no shard; excluded from split", slide);
                missing += 1;
                continue;
            }
            let patient = slide_patients.get(slide).unwrap_or(slide);
            match patients.get_mut(patient) {
                Some(entry) if entry.outcome_label != *label => {
                    return Err(SplitError::ConflictingLabels {
                        patient: patient.clone(),
                        first: entry.outcome_label.to_string(),
                        second: label.to_string(),
                    });
                }
                Some(entry) => entry.slides.push(slide.clone()),
                None => {
                    patients.insert(
                        patient.clone(),
                        PatientEntry {
                            outcome_label: *label,
                            slides: vec![slide.clone()],
                        },
                    );
                }
            }
        }
        if missing > 0 {
            warn!("Skipped {} slides without shards", missing);
        }
        Ok(patients)
    }

    /// Find a matching plan in the log, or generate and record a new one.
    fn resolve_plan(
        &self,
        order: &[String],
        patients: BTreeMap<String, PatientEntry>,
        options: &SplitOptions,
    ) -> Result<(ValidationPlan, bool), SplitError> {
        let k_fold = if options.strategy.is_k_fold() {
            options.k_fold
        } else {
            None
        };
        let key = content_key(options.strategy, k_fold, &patients);
        let mut log = PlanLog::load(options.plan_log.as_deref())?;
        if let Some(plan) = log.find(&key) {
            info!("Using existing {} validation plan {}", options.strategy, &key[..12]);
            return Ok((plan.clone(), true));
        }

        info!("No matching validation plan; generating a new {} plan", options.strategy);
        let plan = match options.strategy {
            SplitStrategy::Fixed => fraction_plan(SplitStrategy::Fixed, order, patients, options)?,
            _ => self.k_fold_plan(order, patients, options)?,
        };
        if options.read_only {
            debug!("Plan log is read-only; new plan not saved");
        } else if log.path().is_some() {
            log.append(plan.clone());
            log.save()?;
        }
        Ok((plan, false))
    }

    fn k_fold_plan(
        &self,
        order: &[String],
        patients: BTreeMap<String, PatientEntry>,
        options: &SplitOptions,
    ) -> Result<ValidationPlan, SplitError> {
        let k = options
            .k_fold
            .ok_or_else(|| SplitError::InvalidKFold("k_fold is required".to_string()))?;

        // Stratify only on categories.
        let categories: Option<BTreeMap<String, String>> = patients
            .values()
            .all(|e| matches!(e.outcome_label, OutcomeLabel::Category(_)))
            .then(|| {
                patients
                    .iter()
                    .map(|(p, e)| (p.clone(), e.outcome_label.to_string()))
                    .collect()
            });

        let folds = if options.strategy == SplitStrategy::KFoldPreservedSite {
            partition_by_site(order, categories.as_ref(), k, self.solver.as_ref())?
        } else {
            partition_patients(order, categories.as_ref(), k)
        };
        if folds.iter().any(Vec::is_empty) {
            return Err(SplitError::InsufficientPatients);
        }
        if let Some(patient) = overlapping_patients(&folds).into_iter().next() {
            return Err(SplitError::PatientLeakage(patient));
        }

        let mut plan = ValidationPlan::new(options.strategy, Some(k), patients);
        for (index, fold) in folds.iter().enumerate() {
            let slides = slides_of(&plan.patients, fold);
            plan.groups.insert(fold_group(index + 1), slides);
        }
        Ok(plan)
    }
}

/// Hold out the leading `floor(fraction * N)` patients of `order`.
fn fraction_plan(
    strategy: SplitStrategy,
    order: &[String],
    patients: BTreeMap<String, PatientEntry>,
    options: &SplitOptions,
) -> Result<ValidationPlan, SplitError> {
    let num_val = (options.val_fraction * order.len() as f64).floor() as usize;
    if num_val == 0 || num_val >= order.len() {
        return Err(SplitError::InsufficientPatients);
    }
    let (validation, training) = order.split_at(num_val);

    let mut plan = ValidationPlan::new(strategy, None, patients);
    let validation = slides_of(&plan.patients, validation);
    let training = slides_of(&plan.patients, training);
    plan.groups.insert(VALIDATION_GROUP.to_string(), validation);
    plan.groups.insert(TRAINING_GROUP.to_string(), training);
    Ok(plan)
}

fn slides_of(patients: &BTreeMap<String, PatientEntry>, group: &[String]) -> Vec<String> {
    group
        .iter()
        .filter_map(|p| patients.get(p))
        .flat_map(|e| e.slides.iter().cloned())
        .collect()
}

/// Training and validation slides of a plan.
fn plan_groups(
    plan: &ValidationPlan,
    options: &SplitOptions,
) -> Result<(Vec<String>, Vec<String>), SplitError> {
    if !plan.strategy.is_k_fold() {
        let training = plan.group(TRAINING_GROUP)?.to_vec();
        let validation = plan.group(VALIDATION_GROUP)?.to_vec();
        return Ok((training, validation));
    }

    let k = plan.k_fold.or(options.k_fold).unwrap_or(0);
    let iter = options
        .k_fold_iter
        .ok_or_else(|| SplitError::InvalidKFold("k_fold_iter is required".to_string()))?;
    let validation = plan.group(&fold_group(iter))?.to_vec();
    let mut training = Vec::new();
    for fold in (1..=k).filter(|fold| *fold != iter) {
        training.extend_from_slice(plan.group(&fold_group(fold))?);
    }
    info!(
        "Using k-fold iteration {}/{}: {} training slides, {} validation slides",
        iter,
        k,
        training.len(),
        validation.len()
    );
    Ok((training, validation))
}

fn check_leakage(
    dataset: &Dataset,
    training: &[String],
    validation: &[String],
) -> Result<(), SplitError> {
    let slide_patients = dataset.patients()?;
    let patient_of = |slide: &String| slide_patients.get(slide).unwrap_or(slide).clone();
    let training_patients: BTreeSet<String> = training.iter().map(patient_of).collect();
    match validation.iter().map(patient_of).find(|p| training_patients.contains(p)) {
        Some(patient) => Err(SplitError::PatientLeakage(patient)),
        None => Ok(()),
    }
}

fn view_of(dataset: &Dataset, slides: &[String]) -> Dataset {
    dataset.filter(&Filters::new().with_column(SLIDE_COLUMN, slides.to_vec()))
}

fn check_shard_count(
    group: &'static str,
    view: &Dataset,
    expected: usize,
) -> Result<(), SplitError> {
    let actual = view.shards()?.len();
    if actual != expected {
        return Err(SplitError::ShardCountMismatch {
            group,
            expected,
            actual,
        });
    }
    Ok(())
}

impl Dataset {
    /// Split into `(training, validation)` views with the default planner.
    pub fn training_validation_split(
        &self,
        options: &SplitOptions,
    ) -> Result<(Dataset, Dataset), SplitError> {
        let split = SplitPlanner::new()
            .with_span(self.span().clone())
            .split(self, options)?;
        Ok((split.training, split.validation))
    }
}
