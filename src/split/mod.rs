//! Reproducible training/validation splits.
//!
//! Splits are made at patient granularity so that no patient contributes
//! slides to both sides. Persistent strategies record their partition in a
//! [`PlanLog`] and reuse it whenever the same patients and labels come back.

mod partition;
mod plan;
mod planner;

pub use partition::{
    overlapping_patients, partition_by_site, partition_patients, site_of, split_evenly,
    GreedySiteSolver, SitePatient, SiteSolver,
};
pub use plan::{
    content_key, fold_group, PatientEntry, PlanLog, SplitStrategy, ValidationPlan, TRAINING_GROUP,
    VALIDATION_GROUP,
};
pub use planner::{DatasetSplit, SplitOptions, SplitPlanner, DEFAULT_VAL_FRACTION};
