//! Validation plans and the append-only plan log.
//!
//! A plan records which patients went into which group. Plans are keyed by a
//! SHA-256 over the strategy, fold count and sorted `patient=label` pairs, so
//! a later run with the same patients and labels finds its plan directly.
//!
//! The log is read, extended and rewritten as a whole. Concurrent writers are
//! not coordinated; the last writer wins.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::annotations::OutcomeLabel;
use crate::error::SplitError;

/// Group name of the training slides in a fixed plan.
pub const TRAINING_GROUP: &str = "training";

/// Group name of the validation slides in a fixed plan.
pub const VALIDATION_GROUP: &str = "validation";

/// Group name of fold `k` (1-based) in a k-fold plan.
pub fn fold_group(k: usize) -> String {
    format!("k-fold-{k}")
}

/// How patients are partitioned into training and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SplitStrategy {
    /// Every slide is used for training
    None,
    /// One persisted random split
    Fixed,
    /// A fresh random split on every call, never persisted
    Bootstrap,
    /// k folds, one of which is validation
    KFold,
    /// k folds where whole sites stay within one fold
    KFoldPreservedSite,
}

impl SplitStrategy {
    pub fn is_k_fold(self) -> bool {
        matches!(self, Self::KFold | Self::KFoldPreservedSite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fixed => "fixed",
            Self::Bootstrap => "bootstrap",
            Self::KFold => "k-fold",
            Self::KFoldPreservedSite => "k-fold-preserved-site",
        }
    }
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitStrategy {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "fixed" => Ok(Self::Fixed),
            "bootstrap" => Ok(Self::Bootstrap),
            "k-fold" => Ok(Self::KFold),
            "k-fold-preserved-site" => Ok(Self::KFoldPreservedSite),
            other => Err(SplitError::UnknownStrategy(other.to_string())),
        }
    }
}

/// A patient's outcome label and slides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientEntry {
    pub outcome_label: OutcomeLabel,
    pub slides: Vec<String>,
}

/// A persisted partition of patients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPlan {
    pub strategy: SplitStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k_fold: Option<usize>,

    /// Content key; recomputed when missing from older logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    pub patients: BTreeMap<String, PatientEntry>,

    /// Group name → slides
    pub groups: BTreeMap<String, Vec<String>>,
}

impl ValidationPlan {
    pub fn new(
        strategy: SplitStrategy,
        k_fold: Option<usize>,
        patients: BTreeMap<String, PatientEntry>,
    ) -> Self {
        let key = content_key(strategy, k_fold, &patients);
        Self {
            strategy,
            k_fold,
            key: Some(key),
            patients,
            groups: BTreeMap::new(),
        }
    }

    /// Stored key, or the key computed from the plan's contents.
    pub fn key(&self) -> String {
        self.key
            .clone()
            .unwrap_or_else(|| content_key(self.strategy, self.k_fold, &self.patients))
    }

    pub fn group(&self, name: &str) -> Result<&[String], SplitError> {
        self.groups
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| SplitError::PlanLog {
                path: PathBuf::new(),
                message: format!("plan {} has no group '{}'", self.key(), name),
            })
    }
}

/// Lookup key for a plan over `patients`.
pub fn content_key(
    strategy: SplitStrategy,
    k_fold: Option<usize>,
    patients: &BTreeMap<String, PatientEntry>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strategy.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(k_fold.map(|k| k.to_string()).unwrap_or_default().as_bytes());
    hasher.update(b"\n");
    for (patient, entry) in patients {
        hasher.update(format!("{}={}\n", patient, entry.outcome_label).as_bytes());
    }
    hex::encode(hasher.finalize())
}

// =============================================================================
// PlanLog
// =============================================================================

/// Append-only list of validation plans backed by a JSON file.
#[derive(Debug, Default)]
pub struct PlanLog {
    path: Option<PathBuf>,
    plans: Vec<ValidationPlan>,
    index: HashMap<String, usize>,
}

impl PlanLog {
    /// Load the log at `path`. A missing file or `None` gives an empty log.
    pub fn load(path: Option<&Path>) -> Result<Self, SplitError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let log_err = |message: String| SplitError::PlanLog {
            path: path.to_path_buf(),
            message,
        };

        let plans: Vec<ValidationPlan> = if path.exists() {
            let text = fs::read_to_string(path).map_err(|e| log_err(e.to_string()))?;
            serde_json::from_str(&text).map_err(|e| log_err(e.to_string()))?
        } else {
            Vec::new()
        };
        debug!("Loaded {} validation plans from {}", plans.len(), path.display());

        let mut log = Self {
            path: Some(path.to_path_buf()),
            plans: Vec::new(),
            index: HashMap::new(),
        };
        for plan in plans {
            log.push(plan);
        }
        Ok(log)
    }

    fn push(&mut self, plan: ValidationPlan) {
        let key = plan.key();
        if self.index.contains_key(&key) {
            warn!("Duplicate validation plan {} in log; keeping the first", key);
        } else {
            self.index.insert(key, self.plans.len());
        }
        self.plans.push(plan);
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn plans(&self) -> &[ValidationPlan] {
        &self.plans
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn find(&self, key: &str) -> Option<&ValidationPlan> {
        self.index.get(key).map(|idx| &self.plans[*idx])
    }

    pub fn append(&mut self, plan: ValidationPlan) {
        self.push(plan);
    }

    /// Rewrite the log file. Does nothing for a log without a path.
    pub fn save(&self) -> Result<(), SplitError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let log_err = |message: String| SplitError::PlanLog {
            path: path.clone(),
            message,
        };
        let json = serde_json::to_string_pretty(&self.plans).map_err(|e| log_err(e.to_string()))?;
        fs::write(path, json).map_err(|e| log_err(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patients() -> BTreeMap<String, PatientEntry> {
        [
            ("P1", 0, vec!["s1", "s2"]),
            ("P2", 1, vec!["s3"]),
        ]
        .into_iter()
        .map(|(p, label, slides)| {
            (
                p.to_string(),
                PatientEntry {
                    outcome_label: OutcomeLabel::Category(label),
                    slides: slides.into_iter().map(String::from).collect(),
                },
            )
        })
        .collect()
    }

    #[test]
    fn test_key_depends_on_strategy_folds_and_labels() {
        let base = content_key(SplitStrategy::KFold, Some(3), &patients());
        assert_eq!(base, content_key(SplitStrategy::KFold, Some(3), &patients()));
        assert_ne!(base, content_key(SplitStrategy::KFold, Some(4), &patients()));
        assert_ne!(base, content_key(SplitStrategy::Fixed, None, &patients()));

        let mut relabeled = patients();
        relabeled.get_mut("P2").unwrap().outcome_label = OutcomeLabel::Category(0);
        assert_ne!(base, content_key(SplitStrategy::KFold, Some(3), &relabeled));
    }

    #[test]
    fn test_strategy_names() {
        for name in ["none", "fixed", "bootstrap", "k-fold", "k-fold-preserved-site"] {
            assert_eq!(name.parse::<SplitStrategy>().unwrap().to_string(), name);
        }
        assert!(matches!(
            "kfold".parse::<SplitStrategy>(),
            Err(SplitError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_log_persists_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validation_plans.json");

        let mut log = PlanLog::load(Some(&path)).unwrap();
        assert!(log.is_empty());
        let mut plan = ValidationPlan::new(SplitStrategy::Fixed, None, patients());
        plan.groups.insert(VALIDATION_GROUP.to_string(), vec!["s3".to_string()]);
        let key = plan.key();
        log.append(plan);
        log.save().unwrap();

        let reloaded = PlanLog::load(Some(&path)).unwrap();
        assert_eq!(reloaded.len(), 1);
        let found = reloaded.find(&key).unwrap();
        assert_eq!(found.group(VALIDATION_GROUP).unwrap(), ["s3".to_string()]);
        assert!(found.group(TRAINING_GROUP).is_err());
    }

    #[test]
    fn test_plans_without_key_are_indexed_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plans.json");
        fs::write(
            &path,
            r#"[{"strategy": "k-fold", "k_fold": 2,
                 "patients": {"P1": {"outcome_label": 0, "slides": ["s1", "s2"]},
                              "P2": {"outcome_label": 1, "slides": ["s3"]}},
                 "groups": {"k-fold-1": ["s1", "s2"], "k-fold-2": ["s3"]}}]"#,
        )
        .unwrap();

        let log = PlanLog::load(Some(&path)).unwrap();
        let key = content_key(SplitStrategy::KFold, Some(2), &patients());
        assert!(log.find(&key).is_some());
    }
}
