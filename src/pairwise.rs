//! Agreement between each pair of annotators.
//!
//! Every member pair of every matched cluster is one joint observation of
//! the two annotators. The table answers "how well do `a` and `b` agree"
//! across the whole run, next to the cohort-wide scores.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::matching::MatchedInstance;
use crate::record::AnnotatorId;
use crate::stats::Distribution;

/// Annotator pair, ordered so that `.0 < .1`.
pub type PairKey = (AnnotatorId, AnnotatorId);

fn pair_key(a: &AnnotatorId, b: &AnnotatorId) -> PairKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// A matched pair whose boxes overlap less than the `good` spatial threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairSample {
    pub video_id: String,
    pub frame_index: u32,
    pub iou: f64,
}

/// Joint observations of one annotator pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairAccumulator {
    ious: Vec<f64>,
    label_matches: usize,
    high_iou_matches: usize,
    low_iou: Vec<PairSample>,
}

impl PairAccumulator {
    pub fn matches(&self) -> usize {
        self.ious.len()
    }

    pub fn merge(&mut self, other: &PairAccumulator) {
        self.ious.extend_from_slice(&other.ious);
        self.label_matches += other.label_matches;
        self.high_iou_matches += other.high_iou_matches;
        self.low_iou.extend(other.low_iou.iter().cloned());
    }
}

/// Record every member pair of a cluster.
///
/// Pairs with IoU at or above `high_iou` count as high-IoU matches; the
/// others are kept as review samples.
pub fn add_instance_pairs(
    table: &mut BTreeMap<PairKey, PairAccumulator>,
    instance: &MatchedInstance,
    high_iou: f64,
) {
    for (a, b) in instance.pairs() {
        let iou = a.bbox.iou(&b.bbox);
        let acc = table.entry(pair_key(&a.annotator_id, &b.annotator_id)).or_default();
        acc.ious.push(iou);
        if a.action_labels == b.action_labels {
            acc.label_matches += 1;
        }
        if iou >= high_iou {
            acc.high_iou_matches += 1;
        } else {
            acc.low_iou.push(PairSample {
                video_id: instance.video_id.clone(),
                frame_index: instance.frame_index,
                iou,
            });
        }
    }
}

/// Merge one clip's pair table into a running total.
pub fn merge_pair_tables(
    into: &mut BTreeMap<PairKey, PairAccumulator>,
    from: &BTreeMap<PairKey, PairAccumulator>,
) {
    for (key, acc) in from {
        into.entry(key.clone()).or_default().merge(acc);
    }
}

/// Report row for one annotator pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairAgreement {
    pub first: AnnotatorId,
    pub second: AnnotatorId,
    /// Clusters both annotators belong to.
    pub matches: usize,
    /// Box IoU over those clusters.
    pub spatial: Option<Distribution>,
    /// Fraction of matches with identical label sets.
    pub label_accuracy: Option<f64>,
    pub high_iou_matches: usize,
    pub low_iou_matches: usize,
    /// Lowest-IoU matches, worst first.
    pub low_iou_samples: Vec<PairSample>,
}

impl PairAgreement {
    pub fn from_accumulator(key: &PairKey, acc: &PairAccumulator, sample_limit: usize) -> Self {
        let mut samples = acc.low_iou.clone();
        samples.sort_by(|a, b| {
            a.iou
                .total_cmp(&b.iou)
                .then_with(|| a.video_id.cmp(&b.video_id))
                .then(a.frame_index.cmp(&b.frame_index))
        });
        samples.truncate(sample_limit);

        let matches = acc.matches();
        Self {
            first: key.0.clone(),
            second: key.1.clone(),
            matches,
            spatial: Distribution::from_values(&acc.ious),
            label_accuracy: (matches > 0).then(|| acc.label_matches as f64 / matches as f64),
            high_iou_matches: acc.high_iou_matches,
            low_iou_matches: acc.low_iou.len(),
            low_iou_samples: samples,
        }
    }

    pub fn involves(&self, annotator: &AnnotatorId) -> bool {
        &self.first == annotator || &self.second == annotator
    }
}

/// Report rows for every pair that shared at least one cluster.
pub fn pair_agreements(
    table: &BTreeMap<PairKey, PairAccumulator>,
    sample_limit: usize,
) -> Vec<PairAgreement> {
    table
        .iter()
        .filter(|(_, acc)| acc.matches() > 0)
        .map(|(key, acc)| PairAgreement::from_accumulator(key, acc, sample_limit))
        .collect()
}
