//! Label agreement: Fleiss' Kappa over matched clusters.

use std::collections::{BTreeMap, BTreeSet};

use crate::matching::MatchedInstance;
use crate::record::AnnotatorId;
use crate::stats::mean;

use super::{AgreementScore, MetricKind, Scope};

/// `1 - P̄e` below this is treated as zero (kappa is 0/0).
const DEGENERATE_EPSILON: f64 = 1e-12;

/// Fleiss' Kappa of an items x categories count matrix.
///
/// Each row counts, per category, how many of the item's raters chose it.
/// Rater counts may differ between items; items with fewer than two raters
/// are ignored.
///
/// # Arguments
/// * `rows` - One row per item, all of the same width
///
/// # Returns
/// `None` when no item has two raters or when chance agreement is total
/// (a category with no variance). Otherwise a value `<= 1`, negative when
/// raters agree less than chance.
pub fn fleiss_kappa(rows: &[Vec<usize>]) -> Option<f64> {
    let rated: Vec<(&Vec<usize>, usize)> = rows
        .iter()
        .map(|row| (row, row.iter().sum::<usize>()))
        .filter(|(_, n)| *n >= 2)
        .collect();
    if rated.is_empty() {
        return None;
    }

    let categories = rated.iter().map(|(row, _)| row.len()).max().unwrap_or(0);
    let total_ratings: usize = rated.iter().map(|(_, n)| n).sum();

    let mut category_totals = vec![0usize; categories];
    let mut observed = 0.0;
    for (row, n) in &rated {
        let agreeing: usize = row.iter().map(|&c| c * c.saturating_sub(1)).sum();
        observed += agreeing as f64 / (n * (n - 1)) as f64;
        for (total, &c) in category_totals.iter_mut().zip(row.iter()) {
            *total += c;
        }
    }
    let p_bar = observed / rated.len() as f64;

    let p_e: f64 = category_totals
        .iter()
        .map(|&t| {
            let p = t as f64 / total_ratings as f64;
            p * p
        })
        .sum();

    if 1.0 - p_e < DEGENERATE_EPSILON {
        return None;
    }
    Some((p_bar - p_e) / (1.0 - p_e))
}

/// Label sets of one matched instance.
#[derive(Debug, Clone, PartialEq)]
struct KappaItem {
    raters: usize,
    /// Raters carrying each label.
    label_counts: BTreeMap<u32, usize>,
    /// Raters whose primary label is each label.
    primary_counts: BTreeMap<u32, usize>,
}

/// Items collected from matched clusters, ready for kappa at any scope.
///
/// Tables from different clips can be merged; the category universe is
/// recomputed from the merged items, so merge order does not matter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KappaTable {
    items: Vec<KappaItem>,
}

impl KappaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one item per cluster with at least two raters.
    pub fn add_instance(&mut self, instance: &MatchedInstance) {
        let label_sets: Vec<&BTreeSet<u32>> = instance
            .members()
            .values()
            .map(|r| &r.action_labels)
            .collect();
        self.add_label_sets(&label_sets);
    }

    /// Add one item from raw rater label sets.
    pub fn add_label_sets(&mut self, label_sets: &[&BTreeSet<u32>]) {
        if label_sets.len() < 2 {
            return;
        }
        let mut item = KappaItem {
            raters: label_sets.len(),
            label_counts: BTreeMap::new(),
            primary_counts: BTreeMap::new(),
        };
        for labels in label_sets {
            for &label in labels.iter() {
                *item.label_counts.entry(label).or_default() += 1;
            }
            if let Some(&primary) = labels.iter().next() {
                *item.primary_counts.entry(primary).or_default() += 1;
            }
        }
        self.items.push(item);
    }

    pub fn merge(&mut self, other: &KappaTable) {
        self.items.extend(other.items.iter().cloned());
    }

    /// Number of items (clusters with two or more raters).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Every label that occurs in any item.
    pub fn categories(&self) -> BTreeSet<u32> {
        self.items
            .iter()
            .flat_map(|item| item.label_counts.keys().copied())
            .collect()
    }

    /// Kappa over the single primary label of each rater.
    pub fn primary_kappa(&self) -> Option<f64> {
        let categories: Vec<u32> = self
            .items
            .iter()
            .flat_map(|item| item.primary_counts.keys().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let rows: Vec<Vec<usize>> = self
            .items
            .iter()
            .map(|item| {
                categories
                    .iter()
                    .map(|c| item.primary_counts.get(c).copied().unwrap_or(0))
                    .collect()
            })
            .collect();
        fleiss_kappa(&rows)
    }

    /// Kappa of one category as a binary present / absent judgement.
    pub fn category_kappa(&self, label: u32) -> Option<f64> {
        let rows: Vec<Vec<usize>> = self
            .items
            .iter()
            .map(|item| {
                let present = item.label_counts.get(&label).copied().unwrap_or(0);
                vec![present, item.raters - present]
            })
            .collect();
        fleiss_kappa(&rows)
    }

    pub fn per_category_kappa(&self) -> BTreeMap<u32, Option<f64>> {
        self.categories()
            .into_iter()
            .map(|label| (label, self.category_kappa(label)))
            .collect()
    }

    pub fn primary_score(&self, scope: Scope) -> AgreementScore {
        AgreementScore::new(MetricKind::LabelKappa, scope, self.primary_kappa(), self.len())
    }
}

/// Jaccard similarity of two label sets (1.0 when both are empty).
pub fn label_jaccard(a: &BTreeSet<u32>, b: &BTreeSet<u32>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Mean label-set similarity between one annotator and the other members.
pub fn annotator_label_contribution(
    instance: &MatchedInstance,
    annotator: &AnnotatorId,
) -> Option<f64> {
    let own = instance.get(annotator)?;
    let values: Vec<f64> = instance
        .members()
        .iter()
        .filter(|(id, _)| *id != annotator)
        .map(|(_, other)| label_jaccard(&own.action_labels, &other.action_labels))
        .collect();
    mean(&values)
}

/// Per category present in the cluster, the fraction of other members that
/// agree with the annotator on whether the category applies.
pub fn annotator_category_agreement(
    instance: &MatchedInstance,
    annotator: &AnnotatorId,
) -> BTreeMap<u32, f64> {
    let Some(own) = instance.get(annotator) else {
        return BTreeMap::new();
    };
    let others: Vec<_> = instance
        .members()
        .iter()
        .filter(|(id, _)| *id != annotator)
        .map(|(_, r)| r)
        .collect();
    if others.is_empty() {
        return BTreeMap::new();
    }

    let categories: BTreeSet<u32> = instance
        .members()
        .values()
        .flat_map(|r| r.action_labels.iter().copied())
        .collect();
    categories
        .into_iter()
        .map(|label| {
            let mine = own.has_label(label);
            let agreeing = others.iter().filter(|r| r.has_label(label) == mine).count();
            (label, agreeing as f64 / others.len() as f64)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::tests::rec_at;
    use approx::assert_relative_eq;

    const WALK: u32 = 1;
    const JOG: u32 = 2;

    fn set(labels: &[u32]) -> BTreeSet<u32> {
        labels.iter().copied().collect()
    }

    fn add(table: &mut KappaTable, raters: &[&[u32]]) {
        let sets: Vec<BTreeSet<u32>> = raters.iter().map(|l| set(l)).collect();
        let refs: Vec<&BTreeSet<u32>> = sets.iter().collect();
        table.add_label_sets(&refs);
    }

    #[test]
    fn test_fleiss_textbook_example() {
        // Fleiss (1971) style table: 10 items, 14 raters, 5 categories
        let rows = vec![
            vec![0, 0, 0, 0, 14],
            vec![0, 2, 6, 4, 2],
            vec![0, 0, 3, 5, 6],
            vec![0, 3, 9, 2, 0],
            vec![2, 2, 8, 1, 1],
            vec![7, 7, 0, 0, 0],
            vec![3, 2, 6, 3, 0],
            vec![2, 5, 3, 2, 2],
            vec![6, 5, 2, 1, 0],
            vec![0, 2, 2, 3, 7],
        ];
        assert_relative_eq!(fleiss_kappa(&rows).unwrap(), 0.2099, epsilon = 1e-4);
    }

    #[test]
    fn test_perfect_agreement_is_one() {
        let rows = vec![vec![3, 0], vec![0, 3], vec![3, 0]];
        assert_relative_eq!(fleiss_kappa(&rows).unwrap(), 1.0);
    }

    #[test]
    fn test_undefined_cases() {
        // No item with two raters
        assert!(fleiss_kappa(&[vec![1, 0], vec![0, 1]]).is_none());
        assert!(fleiss_kappa(&[]).is_none());
        // A category nobody deviates from: chance agreement is total
        assert!(fleiss_kappa(&[vec![3, 0], vec![2, 0]]).is_none());
    }

    #[test]
    fn test_uniform_two_one_split_is_negative() {
        // {walk, walk, jog} on every item: kappa for walk is -0.5, not clamped
        let mut table = KappaTable::new();
        for _ in 0..20 {
            add(&mut table, &[&[WALK], &[WALK], &[JOG]]);
        }
        assert_relative_eq!(table.category_kappa(WALK).unwrap(), -0.5, epsilon = 1e-12);
        assert_relative_eq!(table.primary_kappa().unwrap(), -0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_no_agreement_beyond_chance_is_zero() {
        // Observed agreement equals chance agreement (both 0.5)
        let mut table = KappaTable::new();
        add(&mut table, &[&[WALK], &[WALK], &[WALK]]);
        add(&mut table, &[&[JOG], &[JOG], &[JOG]]);
        for _ in 0..3 {
            add(&mut table, &[&[WALK], &[WALK], &[JOG]]);
            add(&mut table, &[&[WALK], &[JOG], &[JOG]]);
        }
        assert_relative_eq!(table.category_kappa(WALK).unwrap(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(table.category_kappa(JOG).unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_variable_rater_counts() {
        let rows = vec![vec![2, 0], vec![0, 3], vec![1, 1], vec![1, 0]];
        let kappa = fleiss_kappa(&rows).unwrap();
        // The single-rater item is dropped; the rest is still well defined
        assert!(kappa > -1.0 && kappa < 1.0);
        assert_relative_eq!(kappa, fleiss_kappa(&rows[..3]).unwrap());
    }

    #[test]
    fn test_kappa_bounded() {
        fn next(state: &mut u64, k: u64) -> usize {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((*state >> 33) % k) as usize
        }
        let mut state = 7u64;
        for _ in 0..200 {
            let items = 1 + next(&mut state, 12);
            let categories = 2 + next(&mut state, 4);
            let mut rows = Vec::with_capacity(items);
            for _ in 0..items {
                let row: Vec<usize> = (0..categories).map(|_| next(&mut state, 4)).collect();
                rows.push(row);
            }
            if let Some(kappa) = fleiss_kappa(&rows) {
                assert!(kappa.is_finite());
                assert!((-1.0..=1.0 + 1e-12).contains(&kappa), "kappa {}", kappa);
            }
        }
    }

    #[test]
    fn test_multi_label_per_category() {
        let mut table = KappaTable::new();
        add(&mut table, &[&[WALK, 5], &[WALK, 5], &[WALK]]);
        add(&mut table, &[&[JOG], &[JOG, 5], &[JOG, 5]]);
        add(&mut table, &[&[WALK], &[WALK], &[WALK]]);

        let per_category = table.per_category_kappa();
        assert_eq!(per_category.keys().copied().collect::<Vec<_>>(), vec![WALK, JOG, 5]);
        assert_relative_eq!(per_category[&WALK].unwrap(), 1.0);
        assert_relative_eq!(per_category[&JOG].unwrap(), 1.0);
        // 5 is split 2-1, 2-1 and 0-3: weak agreement
        assert_relative_eq!(per_category[&5].unwrap(), 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_single_rater_instances_ignored() {
        let mut table = KappaTable::new();
        add(&mut table, &[&[WALK]]);
        assert!(table.is_empty());
        assert!(table.primary_kappa().is_none());
        assert!(!table.primary_score(Scope::Clip).is_defined());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let mut a = KappaTable::new();
        add(&mut a, &[&[WALK], &[WALK]]);
        add(&mut a, &[&[WALK], &[JOG]]);
        let mut b = KappaTable::new();
        add(&mut b, &[&[JOG], &[JOG]]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_relative_eq!(ab.primary_kappa().unwrap(), ba.primary_kappa().unwrap(), epsilon = 1e-12);
        assert_eq!(ab.len(), 3);
    }

    #[test]
    fn test_annotator_contributions() {
        let instance = MatchedInstance::from_members(vec![
            rec_at("v", 0, "a", 0, [0.1, 0.1, 0.3, 0.3], &[WALK]),
            rec_at("v", 0, "b", 1, [0.1, 0.1, 0.3, 0.3], &[WALK, 5]),
            rec_at("v", 0, "c", 2, [0.1, 0.1, 0.3, 0.3], &[JOG]),
        ])
        .unwrap();

        let a = AnnotatorId::new("a");
        // jaccard(a, b) = 0.5, jaccard(a, c) = 0
        assert_relative_eq!(annotator_label_contribution(&instance, &a).unwrap(), 0.25);

        let per_category = annotator_category_agreement(&instance, &a);
        assert_relative_eq!(per_category[&WALK], 0.5);
        assert_relative_eq!(per_category[&JOG], 0.5);
        assert_relative_eq!(per_category[&5], 0.5);
    }
}
