//! Cross-annotator box matching.
//!
//! Annotators' person ids are not comparable, so "same physical person" is
//! inferred per frame from box overlap alone.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::trace;

use crate::iou::iou_matrix;
use crate::loader::ClipAnnotations;
use crate::record::{AnnotationRecord, AnnotatorId, BBox};
use crate::{Error, Result};

/// Why a record ended up without a partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SingletonReason {
    /// No other annotator drew any box in this frame.
    MissedByOtherAnnotators,
    /// Other annotators drew boxes, but none overlapped enough.
    LowOverlap,
}

impl SingletonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SingletonReason::MissedByOtherAnnotators => "missed-by-other-annotators",
            SingletonReason::LowOverlap => "low-overlap",
        }
    }
}

/// An unmatched record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Singleton {
    pub record: AnnotationRecord,
    pub reason: SingletonReason,
}

/// Records from distinct annotators believed to show the same person.
///
/// Holds at most one record per annotator, and every member pair overlaps
/// with IoU at or above the threshold that formed it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedInstance {
    pub video_id: String,
    pub frame_index: u32,
    members: BTreeMap<AnnotatorId, AnnotationRecord>,
    /// Coordinate-wise mean of member boxes, for reporting only.
    pub consensus_bbox: BBox,
}

impl MatchedInstance {
    /// Build a cluster, refusing two records from one annotator.
    pub fn from_members(records: Vec<AnnotationRecord>) -> Result<Self> {
        let first = records.first().ok_or_else(|| {
            Error::InvariantViolation("matched instance built from no records".to_string())
        })?;
        let video_id = first.video_id.clone();
        let frame_index = first.frame_index;

        let mut members = BTreeMap::new();
        for record in records {
            if record.video_id != video_id || record.frame_index != frame_index {
                return Err(Error::InvariantViolation(format!(
                    "cluster mixes frames: {}@{} and {}@{}",
                    video_id, frame_index, record.video_id, record.frame_index
                )));
            }
            let annotator = record.annotator_id.clone();
            if members.insert(annotator.clone(), record).is_some() {
                return Err(Error::InvariantViolation(format!(
                    "cluster at {}@{} holds two records from annotator '{}'",
                    video_id, frame_index, annotator
                )));
            }
        }

        let consensus_bbox = BBox::centroid(members.values().map(|r| &r.bbox)).ok_or_else(|| {
            Error::InvariantViolation("matched instance has no boxes".to_string())
        })?;

        Ok(Self {
            video_id,
            frame_index,
            members,
            consensus_bbox,
        })
    }

    pub fn members(&self) -> &BTreeMap<AnnotatorId, AnnotationRecord> {
        &self.members
    }

    pub fn get(&self, annotator: &AnnotatorId) -> Option<&AnnotationRecord> {
        self.members.get(annotator)
    }

    pub fn annotators(&self) -> impl Iterator<Item = &AnnotatorId> {
        self.members.keys()
    }

    /// Number of raters in the cluster.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Every unordered member pair, in annotator order.
    pub fn pairs(&self) -> Vec<(&AnnotationRecord, &AnnotationRecord)> {
        let records: Vec<&AnnotationRecord> = self.members.values().collect();
        let mut pairs = Vec::with_capacity(records.len() * records.len().saturating_sub(1) / 2);
        for i in 0..records.len() {
            for j in (i + 1)..records.len() {
                pairs.push((records[i], records[j]));
            }
        }
        pairs
    }

    /// Smallest canonical index among members, used to order clusters.
    pub fn first_canonical_index(&self) -> usize {
        self.members
            .values()
            .map(|r| r.canonical_index)
            .min()
            .unwrap_or(usize::MAX)
    }
}

/// Matching result for one `(video_id, frame_index)` group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameMatch {
    pub video_id: String,
    pub frame_index: u32,
    /// Distinct annotators with at least one box in the frame.
    pub annotators_present: usize,
    pub clusters: Vec<MatchedInstance>,
    pub singletons: Vec<Singleton>,
}

impl FrameMatch {
    /// Frames seen by one annotator only have nothing to agree on.
    pub fn is_single_annotator(&self) -> bool {
        self.annotators_present < 2
    }
}

/// A scored candidate pair; `a` always belongs to the lexically lower annotator.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    iou: f64,
    a: usize,
    b: usize,
}

/// Cluster one frame's records across annotators.
///
/// Candidate pairs (distinct annotators, IoU >= `match_threshold`) are
/// visited from highest IoU down; ties go to the lower annotator id, then to
/// the earlier canonical record. For each pair:
///
/// - both records free: they form a new cluster
/// - one record clustered: the other joins when its annotator slot is free
///   and its IoU with every member is at least the current pair's IoU
/// - both clustered: skipped, clusters never merge
///
/// A record refused by a cluster stays available for later pairs. Records
/// left over become [`Singleton`]s. The threshold only decides where the
/// sweep stops, so raising it can never add clusters.
pub fn match_frame(records: &[AnnotationRecord], match_threshold: f64) -> Result<FrameMatch> {
    let Some(first) = records.first() else {
        return Ok(FrameMatch::default());
    };
    if let Some(stray) = records
        .iter()
        .find(|r| r.video_id != first.video_id || r.frame_index != first.frame_index)
    {
        return Err(Error::InvariantViolation(format!(
            "frame group {}@{} contains a record from {}@{}",
            first.video_id, first.frame_index, stray.video_id, stray.frame_index
        )));
    }

    // Canonical order makes the result independent of input order
    let mut sorted: Vec<&AnnotationRecord> = records.iter().collect();
    sorted.sort_by(|x, y| {
        x.annotator_id
            .cmp(&y.annotator_id)
            .then(x.canonical_index.cmp(&y.canonical_index))
    });

    let annotators: BTreeSet<&AnnotatorId> = sorted.iter().map(|r| &r.annotator_id).collect();
    let mut result = FrameMatch {
        video_id: first.video_id.clone(),
        frame_index: first.frame_index,
        annotators_present: annotators.len(),
        clusters: Vec::new(),
        singletons: Vec::new(),
    };

    let mut cluster_of: Vec<Option<usize>> = vec![None; sorted.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    if annotators.len() >= 2 {
        let boxes: Vec<BBox> = sorted.iter().map(|r| r.bbox).collect();
        let iou = iou_matrix(&boxes, &boxes);

        let mut candidates = Vec::new();
        for i in 0..sorted.len() {
            for j in (i + 1)..sorted.len() {
                if sorted[i].annotator_id == sorted[j].annotator_id {
                    continue;
                }
                let v = iou[(i, j)];
                if v > 0.0 && v >= match_threshold {
                    candidates.push(Candidate { iou: v, a: i, b: j });
                }
            }
        }
        candidates.sort_by(|x, y| compare_candidates(x, y, &sorted));

        for c in candidates {
            match (cluster_of[c.a], cluster_of[c.b]) {
                (None, None) => {
                    cluster_of[c.a] = Some(clusters.len());
                    cluster_of[c.b] = Some(clusters.len());
                    clusters.push(vec![c.a, c.b]);
                }
                (Some(k), None) | (None, Some(k)) => {
                    let joiner = if cluster_of[c.a].is_none() { c.a } else { c.b };
                    let members = &clusters[k];
                    let slot_taken = members
                        .iter()
                        .any(|&m| sorted[m].annotator_id == sorted[joiner].annotator_id);
                    if slot_taken {
                        trace!(
                            "{}@{}: annotator '{}' already in cluster {}",
                            result.video_id, result.frame_index, sorted[joiner].annotator_id, k
                        );
                        continue;
                    }
                    if members.iter().all(|&m| iou[(m, joiner)] >= c.iou) {
                        cluster_of[joiner] = Some(k);
                        clusters[k].push(joiner);
                    }
                }
                (Some(_), Some(_)) => {}
            }
        }
    }

    for members in clusters {
        let records = members.iter().map(|&m| sorted[m].clone()).collect();
        result.clusters.push(MatchedInstance::from_members(records)?);
    }
    result.clusters.sort_by_key(MatchedInstance::first_canonical_index);

    let reason = if annotators.len() >= 2 {
        SingletonReason::LowOverlap
    } else {
        SingletonReason::MissedByOtherAnnotators
    };
    result.singletons = sorted
        .iter()
        .zip(&cluster_of)
        .filter(|(_, cluster)| cluster.is_none())
        .map(|(record, _)| Singleton {
            record: (*record).clone(),
            reason,
        })
        .collect();
    result
        .singletons
        .sort_by_key(|s| s.record.canonical_index);

    Ok(result)
}

fn compare_candidates(x: &Candidate, y: &Candidate, records: &[&AnnotationRecord]) -> Ordering {
    y.iou
        .total_cmp(&x.iou)
        .then_with(|| records[x.a].annotator_id.cmp(&records[y.a].annotator_id))
        .then_with(|| records[x.b].annotator_id.cmp(&records[y.b].annotator_id))
        .then_with(|| records[x.a].canonical_index.cmp(&records[y.a].canonical_index))
        .then_with(|| records[x.b].canonical_index.cmp(&records[y.b].canonical_index))
}

/// Match every frame of a clip, in frame order.
pub fn match_clip(clip: &ClipAnnotations, match_threshold: f64) -> Result<Vec<FrameMatch>> {
    clip.frames
        .values()
        .map(|records| match_frame(records, match_threshold))
        .collect()
}
