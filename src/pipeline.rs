//! End-to-end analysis: per-clip work in parallel, then one reduction.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::QualityConfig;
use crate::loader::{load_annotation_dir, ClipAnnotations, LabelMap, LoadedAnnotations};
use crate::matching::{match_clip, MatchedInstance, SingletonReason};
use crate::outliers::AnnotatorAccumulator;
use crate::pairwise::{add_instance_pairs, PairAccumulator, PairKey};
use crate::record::{AnnotationRecord, AnnotatorId};
use crate::report::{FlagReason, FlaggedItem, QualityReport};
use crate::scoring::kappa::label_jaccard;
use crate::scoring::spatial::instance_score;
use crate::scoring::{build_segments, cluster_temporal_scores, KappaTable};
use crate::stats::mean;
use crate::{Error, Result};

/// Reason given for clips that cannot be scored.
pub const NO_OVERLAP_REASON: &str = "no frame annotated by two or more annotators";

/// Immutable result of analysing one clip.
///
/// Produced independently per clip; the reducer combines these without
/// touching any other shared state.
#[derive(Debug, Clone, Default)]
pub struct ClipAnalysis {
    pub video_id: String,
    pub frames: usize,
    pub frames_single_annotator: usize,
    pub records: usize,
    pub annotators: BTreeSet<AnnotatorId>,
    pub matched_clusters: usize,
    pub singletons: BTreeMap<SingletonReason, usize>,
    /// Defined instance-level spatial scores, in frame order.
    pub spatial_values: Vec<f64>,
    /// Defined instance-level temporal scores, in frame order.
    pub temporal_values: Vec<f64>,
    /// Clusters whose temporal score was undefined.
    pub temporal_undefined: usize,
    /// Annotator pairs left without a temporal score, across all clusters.
    pub temporal_undefined_pairs: usize,
    /// Action segments built from the clip's records.
    pub action_segments: usize,
    pub kappa: KappaTable,
    pub accumulators: BTreeMap<AnnotatorId, AnnotatorAccumulator>,
    pub pairs: BTreeMap<PairKey, PairAccumulator>,
    /// Instance-level flags.
    pub flagged: Vec<FlaggedItem>,
    /// Set when the clip has nothing to compare.
    pub excluded: Option<String>,
}

impl ClipAnalysis {
    fn new(clip: &ClipAnnotations) -> Self {
        Self {
            video_id: clip.video_id.clone(),
            records: clip.num_records(),
            annotators: clip.annotators(),
            ..Default::default()
        }
    }

    pub fn singleton_count(&self, reason: SingletonReason) -> usize {
        self.singletons.get(&reason).copied().unwrap_or(0)
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded.is_some()
    }
}

/// Match and score one clip. Pure: the result depends only on the clip's
/// records and the configuration.
pub fn analyze_clip(clip: &ClipAnnotations, config: &QualityConfig) -> Result<ClipAnalysis> {
    let mut analysis = ClipAnalysis::new(clip);
    let segments = build_segments(clip.records());
    analysis.action_segments = segments.len();
    let frame_matches = match_clip(clip, config.match_threshold)?;

    for frame_match in &frame_matches {
        analysis.frames += 1;
        if frame_match.is_single_annotator() {
            analysis.frames_single_annotator += 1;
        }

        let frame_records = clip
            .frames
            .get(&frame_match.frame_index)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        for singleton in &frame_match.singletons {
            *analysis.singletons.entry(singleton.reason).or_default() += 1;
            analysis
                .accumulators
                .entry(singleton.record.annotator_id.clone())
                .or_default()
                .add_singleton();

            let (reason, metric_value) = match singleton.reason {
                SingletonReason::MissedByOtherAnnotators => (FlagReason::MissedByOtherAnnotators, None),
                SingletonReason::LowOverlap => (
                    FlagReason::LowOverlap,
                    best_cross_annotator_iou(&singleton.record, frame_records),
                ),
            };
            analysis.flagged.push(FlaggedItem::instance(
                &singleton.record.video_id,
                singleton.record.frame_index,
                reason,
                vec![singleton.record.annotator_id.clone()],
                metric_value,
            ));
        }

        for instance in &frame_match.clusters {
            analysis.matched_clusters += 1;
            let annotators: Vec<AnnotatorId> = instance.annotators().cloned().collect();

            let spatial = instance_score(instance);
            if let Some(value) = spatial.value {
                analysis.spatial_values.push(value);
                if value < config.spatial_iou_thresholds.good {
                    analysis.flagged.push(
                        FlaggedItem::instance(
                            &instance.video_id,
                            instance.frame_index,
                            FlagReason::LowSpatialAgreement,
                            annotators.clone(),
                            Some(value),
                        )
                        .with_score(spatial),
                    );
                }
            }

            let temporal = cluster_temporal_scores(instance, &segments);
            analysis.temporal_undefined_pairs += temporal.undefined_count();
            let temporal_score = temporal.instance_score();
            match temporal_score.value {
                Some(value) => {
                    analysis.temporal_values.push(value);
                    if value < config.temporal_iou_thresholds.good {
                        analysis.flagged.push(
                            FlaggedItem::instance(
                                &instance.video_id,
                                instance.frame_index,
                                FlagReason::LowTemporalAgreement,
                                annotators.clone(),
                                Some(value),
                            )
                            .with_score(temporal_score),
                        );
                    }
                }
                None => analysis.temporal_undefined += 1,
            }

            add_instance_pairs(&mut analysis.pairs, instance, config.spatial_iou_thresholds.good);

            analysis.kappa.add_instance(instance);
            if let Some(similarity) = label_disagreement(instance) {
                analysis.flagged.push(FlaggedItem::instance(
                    &instance.video_id,
                    instance.frame_index,
                    FlagReason::LabelDisagreement,
                    annotators.clone(),
                    Some(similarity),
                ));
            }

            for annotator in &annotators {
                analysis
                    .accumulators
                    .entry(annotator.clone())
                    .or_default()
                    .add_instance(annotator, instance, &temporal);
            }
        }
    }

    if analysis.frames == analysis.frames_single_annotator {
        debug!("Excluding clip {}: {}", analysis.video_id, NO_OVERLAP_REASON);
        analysis.excluded = Some(NO_OVERLAP_REASON.to_string());
        analysis.flagged.clear();
    }

    Ok(analysis)
}

/// Highest IoU between a record and any other annotator's box in its frame.
fn best_cross_annotator_iou(record: &AnnotationRecord, frame_records: &[AnnotationRecord]) -> Option<f64> {
    frame_records
        .iter()
        .filter(|other| other.annotator_id != record.annotator_id)
        .map(|other| record.bbox.iou(&other.bbox))
        .max_by(f64::total_cmp)
}

/// Mean pairwise label-set similarity, when members disagree on labels.
fn label_disagreement(instance: &MatchedInstance) -> Option<f64> {
    let similarities: Vec<f64> = instance
        .pairs()
        .into_iter()
        .map(|(a, b)| label_jaccard(&a.action_labels, &b.action_labels))
        .collect();
    if similarities.iter().all(|&s| s >= 1.0) {
        return None;
    }
    mean(&similarities)
}

/// Analyse every clip of a loaded dataset and assemble the report.
///
/// Clips run on a worker pool sized by `config.workers`; the merge happens
/// on the calling thread in `video_id` order.
pub fn run(loaded: &LoadedAnnotations, config: &QualityConfig) -> Result<QualityReport> {
    config.validate()?;

    let clips: Vec<ClipAnnotations> = loaded.group_by_clip().into_values().collect();
    info!(
        "Analysing {} clips from {} annotators ({} records)",
        clips.len(),
        loaded.annotators().len(),
        loaded.records().len()
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| Error::ThreadPool(e.to_string()))?;

    let analyses: Vec<ClipAnalysis> = pool.install(|| {
        clips
            .par_iter()
            .map(|clip| analyze_clip(clip, config))
            .collect::<Result<Vec<_>>>()
    })?;

    Ok(QualityReport::assemble(analyses, loaded, config))
}

/// Load the label map (if configured) and the annotation tree, then [`run`].
pub fn run_dir<P: AsRef<Path>>(root: P, config: &QualityConfig) -> Result<QualityReport> {
    config.validate()?;
    let label_map = match &config.label_map {
        Some(path) => {
            let map = LabelMap::from_file(path)?;
            info!("Loaded label map with {} actions from {}", map.len(), path.display());
            Some(map)
        }
        None => None,
    };
    let loaded = load_annotation_dir(root, config, label_map.as_ref())?;
    run(&loaded, config)
}
