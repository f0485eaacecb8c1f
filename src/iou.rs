//! IoU (Intersection over Union) for boxes and frame intervals.

use nalgebra::DMatrix;

use crate::record::BBox;

/// IoU of two axis-aligned boxes.
///
/// Exactly 1 for identical boxes, exactly 0 for disjoint ones, and symmetric:
/// every operation below is commutative in its two arguments.
pub fn box_iou(a: &BBox, b: &BBox) -> f64 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter_area = inter_w * inter_h;

    if inter_area <= 0.0 {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let union_area = a.area() + b.area() - inter_area;
    if union_area > 0.0 {
        (inter_area / union_area).min(1.0)
    } else {
        0.0
    }
}

/// Compute the IoU matrix between two sets of boxes.
///
/// # Returns
/// IoU matrix of shape (boxes_a.len(), boxes_b.len())
pub fn iou_matrix(boxes_a: &[BBox], boxes_b: &[BBox]) -> DMatrix<f64> {
    DMatrix::from_fn(boxes_a.len(), boxes_b.len(), |i, j| {
        box_iou(&boxes_a[i], &boxes_b[j])
    })
}

/// IoU of two closed frame intervals `[start, end]`.
///
/// Interval length counts frames, so `[3, 3]` has length 1. Disjoint
/// intervals give exactly 0.
pub fn interval_iou(a: (u32, u32), b: (u32, u32)) -> f64 {
    let (a_start, a_end) = (a.0.min(a.1) as i64, a.0.max(a.1) as i64);
    let (b_start, b_end) = (b.0.min(b.1) as i64, b.0.max(b.1) as i64);

    let overlap = (a_end.min(b_end) - a_start.max(b_start) + 1).max(0);
    if overlap == 0 {
        return 0.0;
    }
    let union = (a_end - a_start + 1) + (b_end - b_start + 1) - overlap;
    overlap as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bbox(x1: f64, y1: f64, x2: f64, y2: f64) -> BBox {
        BBox::new(x1, y1, x2, y2).unwrap()
    }

    #[test]
    fn test_iou_perfect_overlap() {
        let boxes = [
            bbox(0.0, 0.0, 1.0, 1.0),
            bbox(0.13, 0.27, 0.71, 0.93),
            bbox(0.1, 0.1, 0.3, 0.3),
        ];
        for b in &boxes {
            assert_eq!(box_iou(b, b), 1.0);
        }
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = bbox(0.0, 0.0, 0.1, 0.1);
        let b = bbox(0.2, 0.2, 0.3, 0.3);
        assert_eq!(box_iou(&a, &b), 0.0);

        // Touching edges share no area
        let c = bbox(0.1, 0.0, 0.2, 0.1);
        assert_eq!(box_iou(&a, &c), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = bbox(0.0, 0.0, 0.4, 0.4);
        let b = bbox(0.2, 0.2, 0.6, 0.6);
        // Intersection: 0.2x0.2 = 0.04, Union: 0.16 + 0.16 - 0.04 = 0.28
        assert_relative_eq!(box_iou(&a, &b), 0.04 / 0.28, epsilon = 1e-12);
    }

    #[test]
    fn test_iou_symmetric() {
        let pairs = [
            (bbox(0.1, 0.1, 0.3, 0.3), bbox(0.15, 0.15, 0.32, 0.32)),
            (bbox(0.0, 0.2, 0.9, 0.5), bbox(0.3, 0.0, 0.6, 1.0)),
            (bbox(0.1, 0.2, 0.5, 0.8), bbox(0.2, 0.3, 0.6, 0.9)),
        ];
        for (a, b) in &pairs {
            assert_eq!(box_iou(a, b), box_iou(b, a));
        }
    }

    #[test]
    fn test_iou_worked_example() {
        let a = bbox(0.10, 0.10, 0.30, 0.30);
        let b = bbox(0.15, 0.15, 0.32, 0.32);
        // Intersection 0.15^2 = 0.0225, union 0.04 + 0.0289 - 0.0225 = 0.0464
        assert_relative_eq!(box_iou(&a, &b), 0.0225 / 0.0464, epsilon = 1e-12);
        assert!((box_iou(&a, &b) - 0.485).abs() < 0.01);
    }

    #[test]
    fn test_iou_matrix_shape_and_values() {
        let a = [bbox(0.0, 0.0, 0.4, 0.4), bbox(0.5, 0.5, 0.9, 0.9)];
        let b = [
            bbox(0.0, 0.0, 0.4, 0.4),
            bbox(0.2, 0.2, 0.6, 0.6),
            bbox(0.5, 0.5, 0.9, 0.9),
        ];
        let m = iou_matrix(&a, &b);
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m[(0, 0)], 1.0);
        assert_eq!(m[(0, 2)], 0.0);
        assert_eq!(m[(1, 2)], 1.0);
        assert_relative_eq!(m[(0, 1)], 0.04 / 0.28, epsilon = 1e-12);
    }

    #[test]
    fn test_iou_matrix_empty() {
        let a = [bbox(0.0, 0.0, 0.4, 0.4)];
        assert_eq!(iou_matrix(&a, &[]).shape(), (1, 0));
        assert_eq!(iou_matrix(&[], &a).shape(), (0, 1));
    }

    #[test]
    fn test_interval_iou() {
        assert_eq!(interval_iou((0, 9), (0, 9)), 1.0);
        assert_eq!(interval_iou((0, 4), (5, 9)), 0.0);
        // [0,9] vs [5,14]: overlap 5 frames, union 15 frames
        assert_relative_eq!(interval_iou((0, 9), (5, 14)), 5.0 / 15.0, epsilon = 1e-12);
        assert_relative_eq!(interval_iou((3, 3), (3, 5)), 1.0 / 3.0, epsilon = 1e-12);
        assert_eq!(interval_iou((2, 6), (4, 8)), interval_iou((4, 8), (2, 6)));
    }
}
