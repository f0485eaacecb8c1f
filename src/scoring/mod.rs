//! Agreement scorers and shared score types.

pub mod kappa;
pub mod spatial;
pub mod temporal;

use std::fmt;

use serde::Serialize;

use crate::config::Thresholds;
use crate::stats::Distribution;

pub use kappa::{fleiss_kappa, KappaTable};
pub use spatial::cluster_spatial_score;
pub use temporal::{build_segments, cluster_temporal_scores, ActionSegment, SegmentIndex};

/// The three agreement dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    SpatialIou,
    TemporalIou,
    LabelKappa,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [
        MetricKind::SpatialIou,
        MetricKind::TemporalIou,
        MetricKind::LabelKappa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::SpatialIou => "spatial_iou",
            MetricKind::TemporalIou => "temporal_iou",
            MetricKind::LabelKappa => "label_kappa",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level a score was computed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Instance,
    Clip,
    Global,
}

/// Quality classification of an aggregate score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityClass {
    Fail,
    Good,
    Excellent,
}

impl QualityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityClass::Fail => "fail",
            QualityClass::Good => "good",
            QualityClass::Excellent => "excellent",
        }
    }
}

impl fmt::Display for QualityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single agreement value.
///
/// `value` is `None` when the score is undefined (too few raters, zero
/// variance). Undefined is reported as N/A and never folded into a zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AgreementScore {
    pub metric: MetricKind,
    pub scope: Scope,
    pub value: Option<f64>,
    pub sample_size: usize,
}

impl AgreementScore {
    pub fn new(metric: MetricKind, scope: Scope, value: Option<f64>, sample_size: usize) -> Self {
        Self {
            metric,
            scope,
            value: value.filter(|v| v.is_finite()),
            sample_size,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.value.is_some()
    }

    /// Classify against the given thresholds; N/A stays unclassified.
    pub fn classify(&self, thresholds: &Thresholds) -> Option<QualityClass> {
        self.value.map(|v| thresholds.classify(v))
    }
}

/// Distribution of instance-level scores at clip or global scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricAggregate {
    pub metric: MetricKind,
    pub scope: Scope,
    /// `None` when no instance had a defined score.
    pub distribution: Option<Distribution>,
    /// Class of the mean.
    pub class: Option<QualityClass>,
}

impl MetricAggregate {
    pub fn from_values(
        metric: MetricKind,
        scope: Scope,
        values: &[f64],
        thresholds: &Thresholds,
    ) -> Self {
        let distribution = Distribution::from_values(values);
        let class = distribution.as_ref().map(|d| thresholds.classify(d.mean));
        Self {
            metric,
            scope,
            distribution,
            class,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        self.distribution.as_ref().map(|d| d.mean)
    }

    pub fn score(&self) -> AgreementScore {
        AgreementScore::new(
            self.metric,
            self.scope,
            self.mean(),
            self.distribution.as_ref().map(|d| d.count).unwrap_or(0),
        )
    }

    pub fn is_fail(&self) -> bool {
        self.class == Some(QualityClass::Fail)
    }
}
