//! # annotation-qc - Multi-Annotator Agreement Engine
//!
//! Quality control for spatio-temporal action annotations produced
//! independently by several annotators on the same video clips.
//!
//! ## Features
//!
//! - CSV loader with per-row validation and label remapping
//! - Per-frame cross-annotator box matching (greedy, deterministic)
//! - Spatial IoU, temporal segment IoU and Fleiss' Kappa agreement
//! - Outlier annotator detection via cohort z-scores
//! - Pairwise annotator agreement table
//! - JSON quality report and flagged-item CSV export
//!
//! ## Example
//!
//! ```rust,ignore
//! use annotation_qc::{pipeline, QualityConfig};
//!
//! let config = QualityConfig::default();
//! config.validate()?;
//! let report = pipeline::run_dir("annotations/", &config)?;
//! report.write_json("quality_report.json")?;
//! report.write_flagged_csv("flagged_items.csv")?;
//! ```

// Public modules
pub mod config;
pub mod record;
pub mod loader;
pub mod iou;
pub mod matching;
pub mod scoring;
pub mod stats;
pub mod outliers;
pub mod pairwise;
pub mod report;
pub mod pipeline;

// Re-exports for convenience
pub use config::{QualityConfig, Thresholds, TimeReference};
pub use record::{AnnotationRecord, AnnotatorId, BBox};
pub use loader::{LabelMap, LoadedAnnotations, load_annotation_dir};
pub use matching::{match_frame, FrameMatch, MatchedInstance, Singleton, SingletonReason};
pub use scoring::{AgreementScore, MetricKind, QualityClass, Scope};
pub use outliers::AnnotatorProfile;
pub use pairwise::PairAgreement;
pub use report::{FlaggedItem, QualityReport};

// Error types
pub use crate::error::{Error, Result};

mod error {
    use thiserror::Error;

    /// Errors that abort a quality-analysis run.
    ///
    /// Malformed input rows are not errors: they are collected as
    /// [`crate::loader::RejectedRow`] values and surfaced in the report.
    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid configuration for '{key}': {message}")]
        InvalidConfig { key: String, message: String },

        #[error("Internal invariant violated: {0}")]
        InvariantViolation(String),

        #[error("Invalid input: {0}")]
        InvalidInput(String),

        #[error("Label map error: {0}")]
        LabelMap(String),

        #[error("Worker pool error: {0}")]
        ThreadPool(String),

        #[error("IO error: {0}")]
        IoError(#[from] std::io::Error),

        #[error("CSV error: {0}")]
        Csv(#[from] csv::Error),

        #[error("JSON error: {0}")]
        Json(#[from] serde_json::Error),

        #[error("TOML error: {0}")]
        Toml(#[from] toml::de::Error),
    }

    impl Error {
        pub(crate) fn config(key: &str, message: impl Into<String>) -> Self {
            Error::InvalidConfig {
                key: key.to_string(),
                message: message.into(),
            }
        }
    }

    /// Result type for annotation-qc operations
    pub type Result<T> = std::result::Result<T, Error>;
}
