//! Integration tests for annotation-qc.
//!
//! These tests write annotator tables to temporary directories and run the
//! whole load, match, score and report pipeline over them.

use std::fs;
use std::path::Path;

use approx::assert_relative_eq;
use tempfile::TempDir;

use annotation_qc::report::FlagReason;
use annotation_qc::{
    load_annotation_dir, match_frame, pipeline, AnnotatorId, MetricKind, QualityConfig, SingletonReason,
};

// =============================================================================
// Helpers
// =============================================================================

fn write_table(root: &Path, annotator: &str, file: &str, rows: &[String]) {
    let dir = root.join(annotator);
    fs::create_dir_all(&dir).unwrap();
    let mut text = rows.join("\n");
    text.push('\n');
    fs::write(dir.join(file), text).unwrap();
}

/// One row per sampled frame (1 Hz at 30 fps) for a single person.
fn person_rows(video: &str, frames: u32, bbox: [f64; 4], label: u32, person: i64) -> Vec<String> {
    (0..frames)
        .map(|f| {
            format!(
                "{},{},{:.2},{:.2},{:.2},{:.2},{},{}",
                video,
                f * 30 + 1,
                bbox[0],
                bbox[1],
                bbox[2],
                bbox[3],
                label,
                person
            )
        })
        .collect()
}

const GOOD_BOX: [f64; 4] = [0.20, 0.20, 0.40, 0.40];
const SHIFTED_X: [f64; 4] = [0.23, 0.20, 0.43, 0.40];
const SHIFTED_Y: [f64; 4] = [0.20, 0.23, 0.40, 0.43];

/// Nine careful annotators plus `sloppy` ones whose boxes drift.
fn cohort_dataset(frames: u32, sloppy: &[(&str, [f64; 4])]) -> TempDir {
    let root = tempfile::tempdir().unwrap();
    for i in 0..9 {
        let name = format!("careful{}", i);
        write_table(root.path(), &name, "clip.csv", &person_rows("clip_a", frames, GOOD_BOX, 1, i));
    }
    for (name, bbox) in sloppy {
        write_table(root.path(), name, "clip.csv", &person_rows("clip_a", frames, *bbox, 1, 0));
    }
    root
}

// =============================================================================
// Test 1: Outlier Detection
// =============================================================================

#[test]
fn test_integration_outliers_flagged_and_clip_problematic() {
    let data = cohort_dataset(12, &[("sloppy_x", SHIFTED_X), ("sloppy_y", SHIFTED_Y)]);
    let report = pipeline::run_dir(data.path(), &QualityConfig::default()).unwrap();

    // Eleven boxes per frame form one cluster
    assert_eq!(report.summary.matched_clusters, 12);
    assert_eq!(report.summary.singletons_low_overlap, 0);

    let mut outliers = report.summary.outlier_annotators.clone();
    outliers.sort();
    assert_eq!(outliers, vec![AnnotatorId::new("sloppy_x"), AnnotatorId::new("sloppy_y")]);

    let sloppy = report.annotator(&AnnotatorId::new("sloppy_x")).unwrap();
    assert_eq!(sloppy.participation, 12);
    assert_eq!(sloppy.outlier_metrics, vec![MetricKind::SpatialIou]);
    // Two identical outliers among eleven: z = -sqrt(9 / 2)
    assert_relative_eq!(sloppy.spatial.z_score.unwrap(), -(4.5f64).sqrt(), epsilon = 1e-6);
    // Everyone agrees on time and labels: no spread, no z-score
    assert!(sloppy.temporal.z_score.is_none());
    assert!(sloppy.label.z_score.is_none());

    let careful = report.annotator(&AnnotatorId::new("careful0")).unwrap();
    assert!(!careful.is_outlier);
    assert!(careful.spatial.z_score.unwrap() > 0.0);

    // The clip itself scores well, but it drives two outliers
    let clip = report.clip("clip_a").unwrap();
    assert!(clip.spatial.mean().unwrap() > 0.9);
    assert_eq!(clip.outlier_annotators_driven.len(), 2);
    assert!(clip.problematic);

    let reasons = report.flagged_by_reason();
    assert_eq!(reasons.get(&FlagReason::OutlierAnnotator), Some(&2));
    assert_eq!(reasons.get(&FlagReason::ProblematicClip), Some(&1));
}

#[test]
fn test_integration_pairwise_agreement() {
    let data = cohort_dataset(12, &[("sloppy_x", SHIFTED_X), ("sloppy_y", SHIFTED_Y)]);
    let report = pipeline::run_dir(data.path(), &QualityConfig::default()).unwrap();

    // Every pair of the eleven annotators shares all twelve clusters
    assert_eq!(report.pairwise.len(), 55);
    assert!(report.pairwise.iter().all(|p| p.matches == 12));

    let sloppy = report
        .pair(&AnnotatorId::new("sloppy_y"), &AnnotatorId::new("sloppy_x"))
        .unwrap();
    assert_eq!(sloppy.first, AnnotatorId::new("sloppy_x"));
    // Shifted in opposite directions: 0.0289 / 0.0511
    assert_relative_eq!(sloppy.spatial.as_ref().unwrap().mean, 0.0289 / 0.0511, epsilon = 1e-9);
    assert_eq!(sloppy.high_iou_matches, 0);
    assert_eq!(sloppy.low_iou_matches, 12);
    assert_eq!(sloppy.low_iou_samples.len(), 12);
    assert_eq!(sloppy.label_accuracy, Some(1.0));

    let careful = report
        .pair(&AnnotatorId::new("careful0"), &AnnotatorId::new("careful1"))
        .unwrap();
    assert_eq!(careful.high_iou_matches, 12);
    assert!(careful.low_iou_samples.is_empty());

    let limited = QualityConfig {
        pair_sample_limit: 3,
        ..Default::default()
    };
    let report = pipeline::run_dir(data.path(), &limited).unwrap();
    let sloppy = report
        .pair(&AnnotatorId::new("sloppy_x"), &AnnotatorId::new("sloppy_y"))
        .unwrap();
    assert_eq!(sloppy.low_iou_matches, 12);
    let frames: Vec<u32> = sloppy.low_iou_samples.iter().map(|s| s.frame_index).collect();
    assert_eq!(frames, vec![0, 1, 2]);
}

#[test]
fn test_integration_small_participation_not_flagged() {
    let data = cohort_dataset(3, &[("sloppy_x", SHIFTED_X), ("sloppy_y", SHIFTED_Y)]);
    let report = pipeline::run_dir(data.path(), &QualityConfig::default()).unwrap();

    let sloppy = report.annotator(&AnnotatorId::new("sloppy_x")).unwrap();
    assert_eq!(sloppy.participation, 3);
    assert!(sloppy.spatial.z_score.unwrap() < -2.0);
    assert!(!sloppy.is_outlier);
    assert!(report.summary.outlier_annotators.is_empty());
    assert!(!report.clip("clip_a").unwrap().problematic);
}

#[test]
fn test_integration_min_participation_is_configurable() {
    let data = cohort_dataset(3, &[("sloppy_x", SHIFTED_X), ("sloppy_y", SHIFTED_Y)]);
    let config = QualityConfig::from_toml_str("min_participation_for_outlier = 3").unwrap();
    let report = pipeline::run_dir(data.path(), &config).unwrap();
    assert_eq!(report.summary.outlier_annotators.len(), 2);
}

// =============================================================================
// Test 2: Determinism Under Input Permutation
// =============================================================================

#[test]
fn test_integration_partitioning_and_order_do_not_matter() {
    let mut alice = person_rows("v1", 5, [0.10, 0.10, 0.30, 0.50], 1, 1);
    alice.extend(person_rows("v1", 5, [0.50, 0.10, 0.70, 0.50], 2, 2));
    alice.extend(person_rows("v2", 3, [0.30, 0.30, 0.60, 0.60], 3, 1));
    let mut bob = person_rows("v1", 4, [0.11, 0.10, 0.31, 0.50], 1, 9);
    bob.extend(person_rows("v1", 5, [0.50, 0.12, 0.70, 0.52], 2, 4));
    bob.extend(person_rows("v2", 3, [0.32, 0.30, 0.60, 0.62], 4, 1));

    let one_file = tempfile::tempdir().unwrap();
    write_table(one_file.path(), "alice", "all.csv", &alice);
    write_table(one_file.path(), "bob", "all.csv", &bob);

    let shuffled = tempfile::tempdir().unwrap();
    let mut alice_rev = alice.clone();
    alice_rev.reverse();
    let (first, second) = alice_rev.split_at(6);
    write_table(shuffled.path(), "alice", "b.csv", first);
    write_table(shuffled.path(), "alice", "a.csv", second);
    let mut bob_rot = bob.clone();
    bob_rot.rotate_left(5);
    write_table(shuffled.path(), "bob", "bob.csv", &bob_rot);

    let config = QualityConfig::default();
    let a = pipeline::run_dir(one_file.path(), &config).unwrap();
    let b = pipeline::run_dir(shuffled.path(), &config).unwrap();

    assert_eq!(a.to_json_string().unwrap(), b.to_json_string().unwrap());
    assert_eq!(a.summary.matched_clusters, 12);
}

#[test]
fn test_integration_frame_matching_is_permutation_invariant() {
    let data = tempfile::tempdir().unwrap();
    write_table(
        data.path(),
        "a",
        "t.csv",
        &[
            "v,1,0.10,0.10,0.40,0.40,1,1".to_string(),
            "v,1,0.30,0.30,0.60,0.60,1,2".to_string(),
        ],
    );
    write_table(
        data.path(),
        "b",
        "t.csv",
        &[
            "v,1,0.12,0.12,0.42,0.42,1,1".to_string(),
            "v,1,0.28,0.28,0.58,0.58,1,2".to_string(),
        ],
    );
    write_table(data.path(), "c", "t.csv", &["v,1,0.20,0.20,0.50,0.50,1,1".to_string()]);

    let loaded = load_annotation_dir(data.path(), &QualityConfig::default(), None).unwrap();
    let records = loaded.records().to_vec();
    let expected = match_frame(&records, 0.3).unwrap();

    let mut permuted = records.clone();
    for _ in 0..records.len() {
        permuted.rotate_left(1);
        assert_eq!(match_frame(&permuted, 0.3).unwrap(), expected);
        permuted.swap(0, records.len() - 1);
        assert_eq!(match_frame(&permuted, 0.3).unwrap(), expected);
    }

    for cluster in &expected.clusters {
        let mut seen: Vec<&AnnotatorId> = cluster.annotators().collect();
        seen.dedup();
        assert_eq!(seen.len(), cluster.len());
    }
}

// =============================================================================
// Test 3: Missing Raters
// =============================================================================

#[test]
fn test_integration_missed_by_other_annotators() {
    let data = tempfile::tempdir().unwrap();
    // Frame 1 is shared; at frame 31 only a draws two people
    write_table(
        data.path(),
        "a",
        "t.csv",
        &[
            "v,1,0.10,0.10,0.30,0.30,1,1".to_string(),
            "v,31,0.10,0.10,0.30,0.30,1,1".to_string(),
            "v,31,0.50,0.50,0.70,0.70,2,2".to_string(),
        ],
    );
    write_table(data.path(), "b", "t.csv", &["v,1,0.10,0.10,0.30,0.30,1,5".to_string()]);

    let report = pipeline::run_dir(data.path(), &QualityConfig::default()).unwrap();
    let clip = report.clip("v").unwrap();

    assert_eq!(clip.frames_single_annotator, 1);
    assert_eq!(clip.singletons_missed, 2);
    assert_eq!(clip.matched_clusters, 1);
    // Only the shared frame enters the spatial aggregate
    assert_eq!(clip.spatial.distribution.as_ref().unwrap().count, 1);
    assert_relative_eq!(clip.spatial.mean().unwrap(), 1.0);

    let missed: Vec<_> = report
        .flagged
        .iter()
        .filter(|f| f.reason == FlagReason::MissedByOtherAnnotators)
        .collect();
    assert_eq!(missed.len(), 2);
    assert!(missed.iter().all(|f| f.frame_index == Some(1)));

    let loaded = load_annotation_dir(data.path(), &QualityConfig::default(), None).unwrap();
    let frame_one: Vec<_> = loaded.records().iter().filter(|r| r.frame_index == 1).cloned().collect();
    let m = match_frame(&frame_one, 0.5).unwrap();
    assert!(m.clusters.is_empty());
    assert!(m
        .singletons
        .iter()
        .all(|s| s.reason == SingletonReason::MissedByOtherAnnotators));
}

// =============================================================================
// Test 4: Rejected Rows Are Reported
// =============================================================================

#[test]
fn test_integration_rejections_in_report() {
    let data = tempfile::tempdir().unwrap();
    write_table(
        data.path(),
        "a",
        "t.csv",
        &[
            "v,1,0.10,0.10,0.30,0.30,1,1".to_string(),
            "v,1,0.10,0.10,abc,0.30,1,1".to_string(),
            "v,1,-0.10,0.10,0.30,0.30,1,1".to_string(),
            "v,0,0.10,0.10,0.30,0.30,1,1".to_string(),
        ],
    );
    write_table(data.path(), "b", "t.csv", &["v,1,0.10,0.10,0.30,0.30,1,1".to_string()]);

    let report = pipeline::run_dir(data.path(), &QualityConfig::default()).unwrap();
    let rejected = &report.exclusions.rejected_rows;

    assert_eq!(report.exclusions.rows_read, 5);
    assert_eq!(rejected.total, 3);
    assert_eq!(rejected.by_reason["non-numeric"], 1);
    assert_eq!(rejected.by_reason["coordinate-out-of-range"], 1);
    assert_eq!(rejected.by_reason["invalid-time-reference"], 1);
    assert_eq!(report.summary.matched_clusters, 1);
    assert!(report.summary_text().contains("3 rejected"));
}

#[test]
fn test_integration_colliding_rows_keep_earliest_box() {
    let early = "v,1,0.10,0.10,0.30,0.30,1,1".to_string();
    let late = "v,2,0.50,0.50,0.70,0.70,2,1".to_string();

    let mut reports = Vec::new();
    for rows in [[early.clone(), late.clone()], [late.clone(), early.clone()]] {
        let data = tempfile::tempdir().unwrap();
        write_table(data.path(), "a", "t.csv", &rows);
        write_table(data.path(), "b", "t.csv", &["v,1,0.10,0.10,0.30,0.30,1,1".to_string()]);
        reports.push(pipeline::run_dir(data.path(), &QualityConfig::default()).unwrap());
    }

    assert_eq!(reports[0], reports[1]);
    let report = &reports[0];
    assert_eq!(report.exclusions.conflicting_boxes, 1);
    assert_eq!(report.summary.matched_clusters, 1);
    assert_relative_eq!(report.clip("v").unwrap().spatial.mean().unwrap(), 1.0);
    assert!(report.summary_text().contains("conflicting boxes: 1"));
}

#[test]
fn test_integration_missing_root_is_error() {
    let data = tempfile::tempdir().unwrap();
    let missing = data.path().join("nope");
    assert!(pipeline::run_dir(&missing, &QualityConfig::default()).is_err());
    // Root without annotator directories
    assert!(pipeline::run_dir(data.path(), &QualityConfig::default()).is_err());
}

// =============================================================================
// Test 5: Outputs
// =============================================================================

#[test]
fn test_integration_write_outputs() {
    let data = cohort_dataset(2, &[("sloppy_x", SHIFTED_X)]);
    let report = pipeline::run_dir(data.path(), &QualityConfig::default()).unwrap();

    let out = tempfile::tempdir().unwrap();
    let json_path = out.path().join("nested").join("quality_report.json");
    let csv_path = out.path().join("flagged_items.csv");
    report.write_json(&json_path).unwrap();
    report.write_flagged_csv(&csv_path).unwrap();

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(json["summary"]["annotators"], 10);
    assert_eq!(json["annotators"].as_array().unwrap().len(), 10);
    // A single shared label: kappa is undefined and written as null
    assert!(json["summary"]["kappa"]["value"].is_null());

    let csv = fs::read_to_string(&csv_path).unwrap();
    assert!(csv.starts_with("video_name,frame_index,reason,annotators_involved,metric_value"));
}
