//! Per-annotator profiles and outlier detection.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::QualityConfig;
use crate::matching::MatchedInstance;
use crate::record::AnnotatorId;
use crate::scoring::kappa::{annotator_category_agreement, annotator_label_contribution};
use crate::scoring::spatial::annotator_spatial_contribution;
use crate::scoring::temporal::TemporalObservation;
use crate::scoring::MetricKind;
use crate::stats::{mean, median, std_dev, z_score};

/// Contributions of one annotator, collected cluster by cluster.
///
/// Accumulators for the same annotator from different clips merge by
/// concatenation, so they can be built in parallel and combined later.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotatorAccumulator {
    /// Records the annotator contributed.
    pub records: usize,
    /// Records that matched nobody.
    pub singletons: usize,
    /// Matched clusters with two or more raters the annotator belongs to.
    pub participation: usize,
    spatial: Vec<f64>,
    temporal: Vec<f64>,
    label: Vec<f64>,
    per_category: BTreeMap<u32, Vec<f64>>,
}

impl AnnotatorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the annotator's contributions to one matched instance.
    pub fn add_instance(
        &mut self,
        annotator: &AnnotatorId,
        instance: &MatchedInstance,
        temporal: &TemporalObservation,
    ) {
        if instance.len() < 2 || instance.get(annotator).is_none() {
            return;
        }
        self.records += 1;
        self.participation += 1;
        if let Some(v) = annotator_spatial_contribution(instance, annotator) {
            self.spatial.push(v);
        }
        if let Some(v) = temporal.annotator_mean(annotator) {
            self.temporal.push(v);
        }
        if let Some(v) = annotator_label_contribution(instance, annotator) {
            self.label.push(v);
        }
        for (label, v) in annotator_category_agreement(instance, annotator) {
            self.per_category.entry(label).or_default().push(v);
        }
    }

    pub fn add_singleton(&mut self) {
        self.records += 1;
        self.singletons += 1;
    }

    pub fn merge(&mut self, other: &AnnotatorAccumulator) {
        self.records += other.records;
        self.singletons += other.singletons;
        self.participation += other.participation;
        self.spatial.extend_from_slice(&other.spatial);
        self.temporal.extend_from_slice(&other.temporal);
        self.label.extend_from_slice(&other.label);
        for (label, values) in &other.per_category {
            self.per_category
                .entry(*label)
                .or_default()
                .extend_from_slice(values);
        }
    }

    /// Every recorded contribution to a metric.
    pub fn values(&self, metric: MetricKind) -> &[f64] {
        match metric {
            MetricKind::SpatialIou => &self.spatial,
            MetricKind::TemporalIou => &self.temporal,
            MetricKind::LabelKappa => &self.label,
        }
    }

    pub fn mean(&self, metric: MetricKind) -> Option<f64> {
        mean(self.values(metric))
    }

    /// Presence/absence agreement values for one action category.
    pub fn category_values(&self, label: u32) -> &[f64] {
        self.per_category.get(&label).map_or(&[], Vec::as_slice)
    }

    pub fn category_mean(&self, label: u32) -> Option<f64> {
        mean(self.category_values(label))
    }

    pub fn categories(&self) -> impl Iterator<Item = u32> + '_ {
        self.per_category.keys().copied()
    }
}

/// Merge per-annotator accumulators of one clip into a running total.
pub fn merge_accumulators(
    into: &mut BTreeMap<AnnotatorId, AnnotatorAccumulator>,
    from: &BTreeMap<AnnotatorId, AnnotatorAccumulator>,
) {
    for (annotator, acc) in from {
        into.entry(annotator.clone()).or_default().merge(acc);
    }
}

/// One metric of an annotator profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSummary {
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub count: usize,
    /// Standing against the cohort; `None` when the cohort has no spread.
    pub z_score: Option<f64>,
    pub is_outlier: bool,
}

/// Cohort statistics of one metric across annotators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortMetric {
    pub annotators: usize,
    pub mean: f64,
    pub std_dev: f64,
}

impl CohortMetric {
    /// `None` unless at least two annotators have a value.
    fn from_means(means: &[f64]) -> Option<Self> {
        if means.len() < 2 {
            return None;
        }
        Some(Self {
            annotators: means.len(),
            mean: mean(means)?,
            std_dev: std_dev(means)?,
        })
    }
}

/// Aggregated agreement of one annotator against everyone they overlap with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotatorProfile {
    pub annotator_id: AnnotatorId,
    pub records: usize,
    pub singletons: usize,
    pub participation: usize,
    pub spatial: MetricSummary,
    pub temporal: MetricSummary,
    pub label: MetricSummary,
    /// Presence/absence agreement per action category.
    pub per_category_label: BTreeMap<u32, MetricSummary>,
    pub outlier_metrics: Vec<MetricKind>,
    /// Action categories on which the annotator is an outlier.
    pub outlier_categories: Vec<u32>,
    pub is_outlier: bool,
}

impl AnnotatorProfile {
    pub fn metric(&self, metric: MetricKind) -> &MetricSummary {
        match metric {
            MetricKind::SpatialIou => &self.spatial,
            MetricKind::TemporalIou => &self.temporal,
            MetricKind::LabelKappa => &self.label,
        }
    }

    fn metric_mut(&mut self, metric: MetricKind) -> &mut MetricSummary {
        match metric {
            MetricKind::SpatialIou => &mut self.spatial,
            MetricKind::TemporalIou => &mut self.temporal,
            MetricKind::LabelKappa => &mut self.label,
        }
    }
}

/// Profiles of every annotator plus the cohort they were compared with.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CohortAnalysis {
    pub profiles: Vec<AnnotatorProfile>,
    pub cohort: BTreeMap<MetricKind, CohortMetric>,
    /// Cohort of per-category label agreement, keyed by action label.
    pub cohort_categories: BTreeMap<u32, CohortMetric>,
}

impl CohortAnalysis {
    pub fn profile(&self, annotator: &AnnotatorId) -> Option<&AnnotatorProfile> {
        self.profiles.iter().find(|p| &p.annotator_id == annotator)
    }

    pub fn outliers(&self) -> impl Iterator<Item = &AnnotatorProfile> {
        self.profiles.iter().filter(|p| p.is_outlier)
    }
}

fn summarize(
    annotator: &AnnotatorId,
    what: &str,
    values: &[f64],
    participation: usize,
    cohort: Option<&CohortMetric>,
    config: &QualityConfig,
) -> MetricSummary {
    let summary_mean = mean(values);
    let z = match (summary_mean, cohort) {
        (Some(v), Some(cohort)) if participation > 0 => z_score(v, cohort.mean, cohort.std_dev),
        _ => None,
    };
    let below = z.map_or(false, |z| z < config.outlier_zscore_threshold);
    let is_outlier = below && participation >= config.min_participation_for_outlier;
    if below && !is_outlier {
        debug!(
            "Annotator {} below cohort on {} (z = {:.2}) but only {} clusters",
            annotator,
            what,
            z.unwrap_or_default(),
            participation
        );
    }

    MetricSummary {
        mean: summary_mean,
        median: median(values),
        count: values.len(),
        z_score: z,
        is_outlier,
    }
}

/// Build annotator profiles and flag outliers.
///
/// The cohort is every annotator with at least one overlapping cluster. An
/// annotator is an outlier on a metric, or on one action category, when its
/// z-score is below `outlier_zscore_threshold` and it took part in at least
/// `min_participation_for_outlier` clusters.
pub fn build_profiles(
    accumulators: &BTreeMap<AnnotatorId, AnnotatorAccumulator>,
    config: &QualityConfig,
) -> CohortAnalysis {
    let mut analysis = CohortAnalysis::default();
    let overlapping = || accumulators.values().filter(|acc| acc.participation > 0);

    for metric in MetricKind::ALL {
        let means: Vec<f64> = overlapping().filter_map(|acc| acc.mean(metric)).collect();
        if let Some(cohort) = CohortMetric::from_means(&means) {
            analysis.cohort.insert(metric, cohort);
        }
    }

    let categories: BTreeSet<u32> = overlapping().flat_map(|acc| acc.categories()).collect();
    for label in categories {
        let means: Vec<f64> = overlapping()
            .filter_map(|acc| acc.category_mean(label))
            .collect();
        if let Some(cohort) = CohortMetric::from_means(&means) {
            analysis.cohort_categories.insert(label, cohort);
        }
    }

    for (annotator, acc) in accumulators {
        let mut profile = AnnotatorProfile {
            annotator_id: annotator.clone(),
            records: acc.records,
            singletons: acc.singletons,
            participation: acc.participation,
            spatial: MetricSummary::default(),
            temporal: MetricSummary::default(),
            label: MetricSummary::default(),
            per_category_label: BTreeMap::new(),
            outlier_metrics: Vec::new(),
            outlier_categories: Vec::new(),
            is_outlier: false,
        };

        for metric in MetricKind::ALL {
            let summary = summarize(
                annotator,
                metric.as_str(),
                acc.values(metric),
                acc.participation,
                analysis.cohort.get(&metric),
                config,
            );
            if summary.is_outlier {
                profile.outlier_metrics.push(metric);
            }
            *profile.metric_mut(metric) = summary;
        }

        for label in acc.categories() {
            let summary = summarize(
                annotator,
                &format!("action {}", label),
                acc.category_values(label),
                acc.participation,
                analysis.cohort_categories.get(&label),
                config,
            );
            if summary.is_outlier {
                profile.outlier_categories.push(label);
            }
            profile.per_category_label.insert(label, summary);
        }

        profile.is_outlier = !profile.outlier_metrics.is_empty() || !profile.outlier_categories.is_empty();
        if profile.is_outlier {
            warn!(
                "Outlier annotator {} on {:?}, actions {:?} ({} clusters)",
                annotator, profile.outlier_metrics, profile.outlier_categories, acc.participation
            );
        }
        analysis.profiles.push(profile);
    }

    analysis
}
