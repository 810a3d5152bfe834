//! Patient partitioning into folds.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::SplitError;

/// Split `items` into `k` contiguous chunks.
///
/// Each chunk holds `len / k` items and the first `len % k` chunks hold one
/// more, so chunk sizes never differ by more than one.
pub fn split_evenly<T: Clone>(items: &[T], k: usize) -> Vec<Vec<T>> {
    split_evenly_from(items, k, 0)
}

/// Like [`split_evenly`], but the extra items go to the `len % k` chunks
/// starting at `offset` (wrapping), instead of the first ones.
fn split_evenly_from<T: Clone>(items: &[T], k: usize, offset: usize) -> Vec<Vec<T>> {
    if k == 0 {
        return Vec::new();
    }
    let (base, extra) = (items.len() / k, items.len() % k);
    let mut chunks = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let gets_extra = (fold + k - offset % k) % k < extra;
        let end = start + base + usize::from(gets_extra);
        chunks.push(items[start..end].to_vec());
        start = end;
    }
    chunks
}

/// Partition `patients` into `k` folds, keeping their order within each fold.
///
/// With `labels`, patients are stratified by label first and each stratum is
/// split on its own. Strata are visited in label order and the folds that take
/// a stratum's remainder continue round-robin from where the previous stratum
/// stopped, so small strata do not all pile into the first folds.
pub fn partition_patients(
    patients: &[String],
    labels: Option<&BTreeMap<String, String>>,
    k: usize,
) -> Vec<Vec<String>> {
    let Some(labels) = labels else {
        return split_evenly(patients, k);
    };

    let mut strata: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for patient in patients {
        let label = labels.get(patient).map(String::as_str).unwrap_or_default();
        strata.entry(label).or_default().push(patient.clone());
    }

    let mut folds = vec![Vec::new(); k];
    let mut offset = 0;
    for stratum in strata.values() {
        for (fold, chunk) in split_evenly_from(stratum, k, offset).into_iter().enumerate() {
            folds[fold].extend(chunk);
        }
        if k > 0 {
            offset = (offset + stratum.len() % k) % k;
        }
    }
    folds
}

/// Site of a patient: characters 5..7 of its identifier.
///
/// Shorter identifiers yield whatever characters fall in that range.
pub fn site_of(patient: &str) -> String {
    patient.chars().skip(5).take(2).collect()
}

/// A patient as seen by a [`SiteSolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitePatient {
    pub patient: String,
    pub site: String,
    /// Category key used for balancing; empty when unbalanced
    pub label: String,
}

/// Assigns whole sites to folds.
pub trait SiteSolver: Send + Sync {
    /// Returns `site → fold index` covering every site in `patients`.
    fn assign(
        &self,
        patients: &[SitePatient],
        k: usize,
    ) -> Result<BTreeMap<String, usize>, SplitError>;
}

/// Greedy site assignment.
///
/// Sites are placed largest first. Each goes to the fold whose current
/// category counts overlap least with the site's own, ties broken by fewest
/// patients and then lowest fold index.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySiteSolver;

impl SiteSolver for GreedySiteSolver {
    fn assign(
        &self,
        patients: &[SitePatient],
        k: usize,
    ) -> Result<BTreeMap<String, usize>, SplitError> {
        let mut sites: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();
        for p in patients {
            *sites
                .entry(p.site.as_str())
                .or_default()
                .entry(p.label.as_str())
                .or_default() += 1;
        }
        if sites.len() < k {
            return Err(SplitError::SiteSolver(format!(
                "{} sites cannot fill {} folds",
                sites.len(),
                k
            )));
        }

        let mut order: Vec<(&str, &BTreeMap<&str, usize>, usize)> = sites
            .iter()
            .map(|(site, counts)| (*site, counts, counts.values().sum()))
            .collect();
        order.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(b.0)));

        let mut fold_counts: Vec<BTreeMap<&str, usize>> = vec![BTreeMap::new(); k];
        let mut fold_totals = vec![0usize; k];
        let mut assignment = BTreeMap::new();

        for (index, (site, counts, total)) in order.into_iter().enumerate() {
            // Seed every fold with one site before balancing.
            let fold = if index < k {
                index
            } else {
                (0..k)
                    .min_by_key(|&fold| {
                        let overlap: usize = counts
                            .iter()
                            .map(|(label, n)| {
                                n * fold_counts[fold].get(label).copied().unwrap_or(0)
                            })
                            .sum();
                        (overlap, fold_totals[fold], fold)
                    })
                    .unwrap_or(0)
            };
            for (label, n) in counts {
                *fold_counts[fold].entry(*label).or_default() += n;
            }
            fold_totals[fold] += total;
            assignment.insert(site.to_string(), fold);
        }
        Ok(assignment)
    }
}

/// Partition `patients` into `k` folds without splitting any site.
pub fn partition_by_site(
    patients: &[String],
    labels: Option<&BTreeMap<String, String>>,
    k: usize,
    solver: &dyn SiteSolver,
) -> Result<Vec<Vec<String>>, SplitError> {
    let site_patients: Vec<SitePatient> = patients
        .iter()
        .map(|p| SitePatient {
            patient: p.clone(),
            site: site_of(p),
            label: labels
                .and_then(|l| l.get(p))
                .cloned()
                .unwrap_or_default(),
        })
        .collect();

    let assignment = solver.assign(&site_patients, k)?;
    let mut folds = vec![Vec::new(); k];
    for p in site_patients {
        let fold = *assignment
            .get(&p.site)
            .ok_or_else(|| SplitError::SiteSolver(format!("site '{}' was not assigned", p.site)))?;
        let slot = folds
            .get_mut(fold)
            .ok_or_else(|| SplitError::SiteSolver(format!("fold {} out of range", fold)))?;
        slot.push(p.patient);
    }
    Ok(folds)
}

/// Patients appearing in more than one fold.
pub fn overlapping_patients(folds: &[Vec<String>]) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut overlap = BTreeSet::new();
    for fold in folds {
        for patient in fold.iter().collect::<BTreeSet<_>>() {
            if !seen.insert(patient.clone()) {
                overlap.insert(patient.clone());
            }
        }
    }
    overlap
}
