//! Spatial agreement: box overlap inside matched clusters.

use crate::matching::MatchedInstance;
use crate::record::AnnotatorId;
use crate::stats::mean;

use super::{AgreementScore, MetricKind, Scope};

/// Mean pairwise IoU over every annotator pair in the cluster.
///
/// # Returns
/// `None` for clusters with fewer than two members.
pub fn cluster_spatial_score(instance: &MatchedInstance) -> Option<f64> {
    let ious: Vec<f64> = instance
        .pairs()
        .into_iter()
        .map(|(a, b)| a.bbox.iou(&b.bbox))
        .collect();
    mean(&ious)
}

/// Instance-scope spatial score.
pub fn instance_score(instance: &MatchedInstance) -> AgreementScore {
    let pairs = instance.len() * instance.len().saturating_sub(1) / 2;
    AgreementScore::new(
        MetricKind::SpatialIou,
        Scope::Instance,
        cluster_spatial_score(instance),
        pairs,
    )
}

/// Mean IoU between one annotator's box and every other member's box.
pub fn annotator_spatial_contribution(
    instance: &MatchedInstance,
    annotator: &AnnotatorId,
) -> Option<f64> {
    let own = instance.get(annotator)?;
    let ious: Vec<f64> = instance
        .members()
        .iter()
        .filter(|(id, _)| *id != annotator)
        .map(|(_, other)| own.bbox.iou(&other.bbox))
        .collect();
    mean(&ious)
}
