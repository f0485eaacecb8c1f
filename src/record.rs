//! Canonical annotation records.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::iou::box_iou;

/// Identifier of one human annotator (the name of their input directory).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotatorId(String);

impl AnnotatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnnotatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AnnotatorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Reason a box failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxError {
    /// A coordinate is NaN or infinite.
    NonFinite,
    /// A coordinate lies outside [0, 1].
    OutOfRange,
    /// `x1 >= x2` or `y1 >= y2`.
    Degenerate,
}

impl fmt::Display for BoxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoxError::NonFinite => f.write_str("non-finite coordinate"),
            BoxError::OutOfRange => f.write_str("coordinate outside [0, 1]"),
            BoxError::Degenerate => f.write_str("x1 >= x2 or y1 >= y2"),
        }
    }
}

/// Axis-aligned bounding box in normalized image coordinates.
///
/// Always satisfies `0 <= x1 < x2 <= 1` and `0 <= y1 < y2 <= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    /// Create a validated box. Invalid coordinates are rejected, never clamped.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> std::result::Result<Self, BoxError> {
        let coords = [x1, y1, x2, y2];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(BoxError::NonFinite);
        }
        if coords.iter().any(|&c| !(0.0..=1.0).contains(&c)) {
            return Err(BoxError::OutOfRange);
        }
        if x1 >= x2 || y1 >= y2 {
            return Err(BoxError::Degenerate);
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BBox) -> f64 {
        box_iou(self, other)
    }

    /// Coordinates as a `[x1, y1, x2, y2]` row.
    pub fn to_array(&self) -> [f64; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// Coordinate-wise mean of a set of boxes.
    ///
    /// The mean of valid boxes is itself valid, so no re-validation happens.
    pub fn centroid<'a, I>(boxes: I) -> Option<BBox>
    where
        I: IntoIterator<Item = &'a BBox>,
    {
        let mut sum = [0.0; 4];
        let mut n = 0usize;
        for b in boxes {
            for (acc, c) in sum.iter_mut().zip(b.to_array()) {
                *acc += c;
            }
            n += 1;
        }
        if n == 0 {
            return None;
        }
        let k = n as f64;
        Some(BBox {
            x1: sum[0] / k,
            y1: sum[1] / k,
            x2: sum[2] / k,
            y2: sum[3] / k,
        })
    }
}

/// One annotator's claim about one person instance at one sampled frame.
///
/// Records are created by the loader and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotationRecord {
    pub video_id: String,

    /// Normalized sample index (see [`crate::QualityConfig::sampling_rate_fps`]).
    pub frame_index: u32,

    pub bbox: BBox,

    /// Concurrent action labels, never empty.
    pub action_labels: BTreeSet<u32>,

    /// Person id scoped to the issuing annotator only.
    pub local_person_id: i64,

    pub annotator_id: AnnotatorId,

    /// Position in the canonical record order, used for deterministic tie-breaks.
    pub canonical_index: usize,
}

impl AnnotationRecord {
    /// The label used for the single-label agreement view: the smallest id.
    pub fn primary_label(&self) -> u32 {
        self.action_labels.iter().next().copied().unwrap_or_default()
    }

    pub fn has_label(&self, label: u32) -> bool {
        self.action_labels.contains(&label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bbox_valid() {
        let b = BBox::new(0.1, 0.2, 0.5, 0.8).unwrap();
        assert_relative_eq!(b.width(), 0.4, epsilon = 1e-12);
        assert_relative_eq!(b.area(), 0.24, epsilon = 1e-12);
    }

    #[test]
    fn test_bbox_rejects_out_of_range() {
        assert_eq!(BBox::new(-0.1, 0.0, 0.5, 0.5), Err(BoxError::OutOfRange));
        assert_eq!(BBox::new(0.1, 0.0, 1.2, 0.5), Err(BoxError::OutOfRange));
    }

    #[test]
    fn test_bbox_rejects_degenerate() {
        assert_eq!(BBox::new(0.5, 0.1, 0.5, 0.4), Err(BoxError::Degenerate));
        assert_eq!(BBox::new(0.6, 0.1, 0.5, 0.4), Err(BoxError::Degenerate));
        assert_eq!(BBox::new(0.1, 0.4, 0.5, 0.4), Err(BoxError::Degenerate));
    }

    #[test]
    fn test_bbox_rejects_non_finite() {
        assert_eq!(BBox::new(f64::NAN, 0.1, 0.5, 0.4), Err(BoxError::NonFinite));
        assert_eq!(BBox::new(0.1, 0.1, f64::INFINITY, 0.4), Err(BoxError::NonFinite));
    }

    #[test]
    fn test_centroid() {
        let a = BBox::new(0.0, 0.0, 0.4, 0.4).unwrap();
        let b = BBox::new(0.2, 0.2, 0.6, 0.6).unwrap();
        let c = BBox::centroid([&a, &b]).unwrap();
        assert_relative_eq!(c.x1, 0.1, epsilon = 1e-12);
        assert_relative_eq!(c.y2, 0.5, epsilon = 1e-12);
        assert!(BBox::centroid(std::iter::empty()).is_none());
    }

    #[test]
    fn test_primary_label_is_smallest() {
        let record = AnnotationRecord {
            video_id: "v".to_string(),
            frame_index: 0,
            bbox: BBox::new(0.1, 0.1, 0.2, 0.2).unwrap(),
            action_labels: [7, 3, 12].into_iter().collect(),
            local_person_id: 0,
            annotator_id: AnnotatorId::new("alice"),
            canonical_index: 0,
        };
        assert_eq!(record.primary_label(), 3);
        assert!(record.has_label(12));
        assert!(!record.has_label(1));
    }
}
