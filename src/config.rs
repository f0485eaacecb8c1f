//! Quality-analysis configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::scoring::QualityClass;
use crate::{Error, Result};

/// How the second CSV column is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeReference {
    /// 1-based raw frame number of the source video.
    #[default]
    Frame,
    /// Timestamp in seconds from the start of the clip.
    Seconds,
}

/// A `good` / `excellent` threshold pair used to classify an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub good: f64,
    pub excellent: f64,
}

impl Thresholds {
    pub const fn new(good: f64, excellent: f64) -> Self {
        Self { good, excellent }
    }

    /// Classify a value: below `good` fails, at or above `excellent` is excellent.
    pub fn classify(&self, value: f64) -> QualityClass {
        if value >= self.excellent {
            QualityClass::Excellent
        } else if value >= self.good {
            QualityClass::Good
        } else {
            QualityClass::Fail
        }
    }

    fn validate(&self, key: &str, min: f64, max: f64) -> Result<()> {
        for (name, value) in [("good", self.good), ("excellent", self.excellent)] {
            if !value.is_finite() || value < min || value > max {
                return Err(Error::config(
                    &format!("{}.{}", key, name),
                    format!("must be within [{}, {}], got {}", min, max, value),
                ));
            }
        }
        if self.good > self.excellent {
            return Err(Error::config(
                &format!("{}.good", key),
                format!(
                    "must not exceed excellent ({}), got {}",
                    self.excellent, self.good
                ),
            ));
        }
        Ok(())
    }
}

/// Configuration for a quality-analysis run.
///
/// Every field has a default, so a TOML file only needs to name the keys it
/// overrides. Call [`QualityConfig::validate`] before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityConfig {
    /// Minimum IoU for two boxes to be the same person instance.
    pub match_threshold: f64,

    /// Spatial IoU classification thresholds.
    pub spatial_iou_thresholds: Thresholds,

    /// Temporal segment IoU classification thresholds.
    pub temporal_iou_thresholds: Thresholds,

    /// Fleiss' Kappa classification thresholds.
    pub kappa_thresholds: Thresholds,

    /// Minimum overlapping clusters before an annotator can be flagged.
    pub min_participation_for_outlier: usize,

    /// Z-score below which an annotator is an outlier on a metric.
    pub outlier_zscore_threshold: f64,

    /// Annotated samples per second of video.
    pub sampling_rate_fps: u32,

    /// Frame rate of the source video, used for raw frame numbers.
    pub source_fps: u32,

    /// Interpretation of the time column.
    pub time_reference: TimeReference,

    /// Optional label map file used to compact action ids.
    pub label_map: Option<PathBuf>,

    /// Worker threads for per-clip analysis (0 = available cores).
    pub workers: usize,

    /// Maximum number of rejected rows kept as samples in the report.
    pub rejected_sample_limit: usize,

    /// Maximum number of low-IoU samples kept per annotator pair.
    pub pair_sample_limit: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.5,
            spatial_iou_thresholds: Thresholds::new(0.8, 0.9),
            temporal_iou_thresholds: Thresholds::new(0.75, 0.85),
            kappa_thresholds: Thresholds::new(0.6, 0.8),
            min_participation_for_outlier: 10,
            outlier_zscore_threshold: -2.0,
            sampling_rate_fps: 1,
            source_fps: 30,
            time_reference: TimeReference::Frame,
            label_map: None,
            workers: 0,
            rejected_sample_limit: 20,
            pair_sample_limit: 20,
        }
    }
}

impl QualityConfig {
    /// Parse a configuration from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML configuration file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::IoError(std::io::Error::new(
                e.kind(),
                format!(
                    "failed to read config file '{}': {}",
                    path.as_ref().display(),
                    e
                ),
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check every option, failing on the first invalid key.
    pub fn validate(&self) -> Result<()> {
        let t = self.match_threshold;
        if !t.is_finite() || t <= 0.0 || t > 1.0 {
            return Err(Error::config(
                "match_threshold",
                format!("must be within (0, 1], got {}", t),
            ));
        }

        self.spatial_iou_thresholds
            .validate("spatial_iou_thresholds", 0.0, 1.0)?;
        self.temporal_iou_thresholds
            .validate("temporal_iou_thresholds", 0.0, 1.0)?;
        self.kappa_thresholds.validate("kappa_thresholds", -1.0, 1.0)?;

        if self.min_participation_for_outlier == 0 {
            return Err(Error::config(
                "min_participation_for_outlier",
                "must be at least 1",
            ));
        }

        let z = self.outlier_zscore_threshold;
        if !z.is_finite() || z >= 0.0 {
            return Err(Error::config(
                "outlier_zscore_threshold",
                format!("must be a finite negative number, got {}", z),
            ));
        }

        if self.source_fps == 0 {
            return Err(Error::config("source_fps", "must be at least 1"));
        }
        if self.sampling_rate_fps == 0 || self.sampling_rate_fps > self.source_fps {
            return Err(Error::config(
                "sampling_rate_fps",
                format!(
                    "must be within [1, source_fps = {}], got {}",
                    self.source_fps, self.sampling_rate_fps
                ),
            ));
        }

        Ok(())
    }
}
