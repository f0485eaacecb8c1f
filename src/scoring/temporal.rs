//! Temporal agreement: action segment overlap per matched instance.
//!
//! Segments are built per annotator-local stream, then compared only
//! through matched clusters, so two unrelated people sharing a label never
//! count as agreeing.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::iou::interval_iou;
use crate::matching::MatchedInstance;
use crate::record::{AnnotationRecord, AnnotatorId};
use crate::stats::mean;

use super::{AgreementScore, MetricKind, Scope};

/// Maximal run of consecutive frame indices carrying one label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionSegment {
    pub annotator_id: AnnotatorId,
    pub video_id: String,
    pub label: u32,
    pub local_person_id: i64,
    /// First frame index (inclusive).
    pub start: u32,
    /// Last frame index (inclusive).
    pub end: u32,
}

impl ActionSegment {
    pub fn contains(&self, frame: u32) -> bool {
        self.start <= frame && frame <= self.end
    }

    /// Frames between `frame` and the nearest end of the segment.
    pub fn distance_to(&self, frame: u32) -> u32 {
        if frame < self.start {
            self.start - frame
        } else if frame > self.end {
            frame - self.end
        } else {
            0
        }
    }

    pub fn interval(&self) -> (u32, u32) {
        (self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct StreamKey {
    annotator_id: AnnotatorId,
    video_id: String,
    label: u32,
    person: i64,
}

impl StreamKey {
    fn of(record: &AnnotationRecord, label: u32) -> Self {
        Self {
            annotator_id: record.annotator_id.clone(),
            video_id: record.video_id.clone(),
            label,
            person: record.local_person_id,
        }
    }
}

/// Segments of every `(annotator, video, label, person)` stream.
#[derive(Debug, Clone, Default)]
pub struct SegmentIndex {
    streams: BTreeMap<StreamKey, Vec<ActionSegment>>,
}

impl SegmentIndex {
    /// Segment of the record's stream for `label` that covers the record's
    /// frame, or the closest one when the stream skips that frame.
    ///
    /// Ties in distance go to the earlier segment. `None` means the
    /// annotator never gave this person that label.
    pub fn segment_for(&self, record: &AnnotationRecord, label: u32) -> Option<&ActionSegment> {
        let segments = self.streams.get(&StreamKey::of(record, label))?;
        let frame = record.frame_index;
        segments
            .iter()
            .find(|s| s.contains(frame))
            .or_else(|| segments.iter().min_by_key(|s| (s.distance_to(frame), s.start)))
    }

    /// Number of segments across all streams.
    pub fn len(&self) -> usize {
        self.streams.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Merge consecutive frames of each stream into closed segments.
pub fn build_segments<'a, I>(records: I) -> SegmentIndex
where
    I: IntoIterator<Item = &'a AnnotationRecord>,
{
    let mut frames: BTreeMap<StreamKey, BTreeSet<u32>> = BTreeMap::new();
    for record in records {
        for &label in &record.action_labels {
            frames
                .entry(StreamKey::of(record, label))
                .or_default()
                .insert(record.frame_index);
        }
    }

    let mut index = SegmentIndex::default();
    for (key, stream_frames) in frames {
        let mut segments: Vec<ActionSegment> = Vec::new();
        for frame in stream_frames {
            match segments.last_mut() {
                Some(seg) if seg.end + 1 == frame => seg.end = frame,
                _ => segments.push(ActionSegment {
                    annotator_id: key.annotator_id.clone(),
                    video_id: key.video_id.clone(),
                    label: key.label,
                    local_person_id: key.person,
                    start: frame,
                    end: frame,
                }),
            }
        }
        index.streams.insert(key, segments);
    }
    index
}

/// Temporal IoU of one annotator pair on one label of a matched instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairTemporalScore {
    pub first: AnnotatorId,
    pub second: AnnotatorId,
    pub label: u32,
    /// `None` when one side never assigned the label to this person.
    pub iou: Option<f64>,
}

/// All pair scores of one matched instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TemporalObservation {
    pub pairs: Vec<PairTemporalScore>,
}

impl TemporalObservation {
    fn defined(&self) -> impl Iterator<Item = &PairTemporalScore> {
        self.pairs.iter().filter(|p| p.iou.is_some())
    }

    /// Mean of the defined pair IoUs.
    pub fn score(&self) -> Option<f64> {
        let values: Vec<f64> = self.defined().filter_map(|p| p.iou).collect();
        mean(&values)
    }

    pub fn instance_score(&self) -> AgreementScore {
        AgreementScore::new(
            MetricKind::TemporalIou,
            Scope::Instance,
            self.score(),
            self.defined().count(),
        )
    }

    /// Mean of the defined pair IoUs the annotator takes part in.
    pub fn annotator_mean(&self, annotator: &AnnotatorId) -> Option<f64> {
        let values: Vec<f64> = self
            .defined()
            .filter(|p| &p.first == annotator || &p.second == annotator)
            .filter_map(|p| p.iou)
            .collect();
        mean(&values)
    }

    /// Pairs left undefined because one side lacks the label.
    pub fn undefined_count(&self) -> usize {
        self.pairs.len() - self.defined().count()
    }
}

/// Score every member pair of a cluster on every label any member carries.
///
/// A pair is scored on a label when at least one side carries it at this
/// frame. Each side contributes the segment of its own stream covering the
/// frame (or the nearest one).
pub fn cluster_temporal_scores(instance: &MatchedInstance, index: &SegmentIndex) -> TemporalObservation {
    let labels: BTreeSet<u32> = instance
        .members()
        .values()
        .flat_map(|r| r.action_labels.iter().copied())
        .collect();

    let mut observation = TemporalObservation::default();
    for label in labels {
        for (a, b) in instance.pairs() {
            if !a.has_label(label) && !b.has_label(label) {
                continue;
            }
            let iou = match (index.segment_for(a, label), index.segment_for(b, label)) {
                (Some(sa), Some(sb)) => Some(interval_iou(sa.interval(), sb.interval())),
                _ => None,
            };
            observation.pairs.push(PairTemporalScore {
                first: a.annotator_id.clone(),
                second: b.annotator_id.clone(),
                label,
                iou,
            });
        }
    }
    observation
}
