//! Quality report assembly and export.
//!
//! The report is the only artifact handed to external reporting: a JSON
//! document with the global summary, per-clip and per-annotator tables, and
//! a CSV of flagged items for manual review.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::config::QualityConfig;
use crate::loader::{LoadedAnnotations, RejectionSummary};
use crate::matching::SingletonReason;
use crate::outliers::{build_profiles, merge_accumulators, AnnotatorProfile, CohortAnalysis, CohortMetric};
use crate::pairwise::{merge_pair_tables, pair_agreements, PairAgreement};
use crate::pipeline::ClipAnalysis;
use crate::record::AnnotatorId;
use crate::scoring::{AgreementScore, KappaTable, MetricAggregate, MetricKind, QualityClass, Scope};
use crate::{Error, Result};

/// Why an item needs manual review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagReason {
    LowSpatialAgreement,
    LowTemporalAgreement,
    LabelDisagreement,
    MissedByOtherAnnotators,
    LowOverlap,
    ProblematicClip,
    OutlierAnnotator,
}

impl FlagReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagReason::LowSpatialAgreement => "low-spatial-agreement",
            FlagReason::LowTemporalAgreement => "low-temporal-agreement",
            FlagReason::LabelDisagreement => "label-disagreement",
            FlagReason::MissedByOtherAnnotators => SingletonReason::MissedByOtherAnnotators.as_str(),
            FlagReason::LowOverlap => SingletonReason::LowOverlap.as_str(),
            FlagReason::ProblematicClip => "problematic-clip",
            FlagReason::OutlierAnnotator => "outlier-annotator",
        }
    }
}

/// One row of the review list.
///
/// Clip-level flags carry no frame; annotator-level flags carry no clip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlaggedItem {
    pub video_name: Option<String>,
    pub frame_index: Option<u32>,
    pub reason: FlagReason,
    pub annotators_involved: Vec<AnnotatorId>,
    pub metric_value: Option<f64>,
    /// Action category, for flags about a single label.
    pub action_label: Option<u32>,
    /// Instance-scope score behind an agreement flag.
    pub score: Option<AgreementScore>,
}

impl FlaggedItem {
    pub fn instance(
        video_name: &str,
        frame_index: u32,
        reason: FlagReason,
        annotators_involved: Vec<AnnotatorId>,
        metric_value: Option<f64>,
    ) -> Self {
        Self {
            video_name: Some(video_name.to_string()),
            frame_index: Some(frame_index),
            reason,
            annotators_involved,
            metric_value,
            action_label: None,
            score: None,
        }
    }

    pub fn with_score(mut self, score: AgreementScore) -> Self {
        self.score = Some(score);
        self
    }
}

/// CSV shape of a [`FlaggedItem`].
#[derive(Serialize)]
struct FlaggedRow<'a> {
    video_name: Option<&'a str>,
    frame_index: Option<u32>,
    reason: &'static str,
    annotators_involved: String,
    metric_value: Option<String>,
}

impl<'a> From<&'a FlaggedItem> for FlaggedRow<'a> {
    fn from(item: &'a FlaggedItem) -> Self {
        Self {
            video_name: item.video_name.as_deref(),
            frame_index: item.frame_index,
            reason: item.reason.as_str(),
            annotators_involved: item
                .annotators_involved
                .iter()
                .map(AnnotatorId::as_str)
                .collect::<Vec<_>>()
                .join(";"),
            metric_value: item.metric_value.map(|v| format!("{:.4}", v)),
        }
    }
}

/// Per-clip table row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipReport {
    pub video_id: String,
    pub frames: usize,
    pub frames_single_annotator: usize,
    pub records: usize,
    pub annotators: Vec<AnnotatorId>,
    pub matched_clusters: usize,
    pub singletons_missed: usize,
    pub singletons_low_overlap: usize,
    pub spatial: MetricAggregate,
    pub temporal: MetricAggregate,
    pub temporal_undefined: usize,
    pub temporal_undefined_pairs: usize,
    pub action_segments: usize,
    pub kappa: AgreementScore,
    pub kappa_class: Option<QualityClass>,
    pub kappa_per_category: BTreeMap<u32, Option<f64>>,
    /// Outlier annotators whose in-clip agreement sits below the cohort.
    pub outlier_annotators_driven: Vec<AnnotatorId>,
    pub problematic: bool,
    pub problem_reasons: Vec<String>,
}

/// Dataset-wide totals and aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalSummary {
    pub annotators: usize,
    pub clips_total: usize,
    pub clips_analyzed: usize,
    pub clips_excluded: usize,
    pub clips_problematic: usize,
    pub frames: usize,
    pub frames_single_annotator: usize,
    pub records: usize,
    pub matched_clusters: usize,
    pub singletons_missed: usize,
    pub singletons_low_overlap: usize,
    pub spatial: MetricAggregate,
    pub temporal: MetricAggregate,
    pub kappa: AgreementScore,
    pub kappa_class: Option<QualityClass>,
    pub kappa_per_category: BTreeMap<u32, Option<f64>>,
    /// Records per action label over every loaded record.
    pub action_distribution: BTreeMap<u32, ActionCount>,
    pub outlier_annotators: Vec<AnnotatorId>,
    pub flagged_items: usize,
}

/// How often one action label occurs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionCount {
    /// Name from the label map, when one was used.
    pub name: Option<String>,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedClip {
    pub video_id: String,
    pub reason: String,
}

/// Everything left out of the analysis, and why.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExclusionSummary {
    pub rows_read: usize,
    pub rejected_rows: RejectionSummary,
    /// Records whose merged rows disagreed on the box; one box was kept.
    pub conflicting_boxes: usize,
    pub excluded_clips: Vec<ExcludedClip>,
}

/// The structured output of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub summary: GlobalSummary,
    pub clips: Vec<ClipReport>,
    pub annotators: Vec<AnnotatorProfile>,
    pub cohort: BTreeMap<MetricKind, CohortMetric>,
    pub cohort_categories: BTreeMap<u32, CohortMetric>,
    /// Agreement of every annotator pair that shared a cluster.
    pub pairwise: Vec<PairAgreement>,
    pub flagged: Vec<FlaggedItem>,
    pub exclusions: ExclusionSummary,
    pub config: QualityConfig,
}

impl QualityReport {
    /// Reduce per-clip analyses into the final report.
    ///
    /// Analyses are merged in `video_id` order on the calling thread.
    pub fn assemble(
        mut analyses: Vec<ClipAnalysis>,
        loaded: &LoadedAnnotations,
        config: &QualityConfig,
    ) -> Self {
        analyses.sort_by(|a, b| a.video_id.cmp(&b.video_id));

        let mut accumulators = BTreeMap::new();
        let mut pairs = BTreeMap::new();
        let mut kappa = KappaTable::new();
        let mut spatial_values = Vec::new();
        let mut temporal_values = Vec::new();
        for analysis in analyses.iter().filter(|a| !a.is_excluded()) {
            merge_accumulators(&mut accumulators, &analysis.accumulators);
            merge_pair_tables(&mut pairs, &analysis.pairs);
            kappa.merge(&analysis.kappa);
            spatial_values.extend_from_slice(&analysis.spatial_values);
            temporal_values.extend_from_slice(&analysis.temporal_values);
        }
        // Annotators seen only in excluded clips still get a profile
        for analysis in analyses.iter().filter(|a| a.is_excluded()) {
            merge_accumulators(&mut accumulators, &analysis.accumulators);
        }

        let cohort = build_profiles(&accumulators, config);

        let mut clips = Vec::with_capacity(analyses.len());
        let mut flagged = Vec::new();
        let mut excluded_clips = Vec::new();
        for analysis in &analyses {
            if let Some(reason) = &analysis.excluded {
                excluded_clips.push(ExcludedClip {
                    video_id: analysis.video_id.clone(),
                    reason: reason.clone(),
                });
            }
            let clip = clip_report(analysis, &cohort, config);
            flagged.extend(analysis.flagged.iter().cloned());
            if clip.problematic {
                flagged.push(FlaggedItem {
                    video_name: Some(clip.video_id.clone()),
                    frame_index: None,
                    reason: FlagReason::ProblematicClip,
                    annotators_involved: clip.annotators.clone(),
                    metric_value: clip.spatial.mean().or(clip.temporal.mean()),
                    action_label: None,
                    score: None,
                });
            }
            clips.push(clip);
        }

        for profile in cohort.outliers() {
            let by_metric = profile
                .outlier_metrics
                .iter()
                .map(|metric| (None, profile.metric(*metric).z_score));
            let by_category = profile.outlier_categories.iter().map(|label| {
                let z = profile.per_category_label.get(label).and_then(|s| s.z_score);
                (Some(*label), z)
            });
            for (action_label, z) in by_metric.chain(by_category) {
                flagged.push(FlaggedItem {
                    video_name: None,
                    frame_index: None,
                    reason: FlagReason::OutlierAnnotator,
                    annotators_involved: vec![profile.annotator_id.clone()],
                    metric_value: z,
                    action_label,
                    score: None,
                });
            }
        }

        let count_singletons = |reason: SingletonReason| -> usize {
            analyses.iter().map(|a| a.singleton_count(reason)).sum()
        };
        let summary = GlobalSummary {
            annotators: loaded.annotators().len(),
            clips_total: analyses.len(),
            clips_analyzed: analyses.len() - excluded_clips.len(),
            clips_excluded: excluded_clips.len(),
            clips_problematic: clips.iter().filter(|c| c.problematic).count(),
            frames: analyses.iter().map(|a| a.frames).sum(),
            frames_single_annotator: analyses.iter().map(|a| a.frames_single_annotator).sum(),
            records: analyses.iter().map(|a| a.records).sum(),
            matched_clusters: analyses.iter().map(|a| a.matched_clusters).sum(),
            singletons_missed: count_singletons(SingletonReason::MissedByOtherAnnotators),
            singletons_low_overlap: count_singletons(SingletonReason::LowOverlap),
            spatial: MetricAggregate::from_values(
                MetricKind::SpatialIou,
                Scope::Global,
                &spatial_values,
                &config.spatial_iou_thresholds,
            ),
            temporal: MetricAggregate::from_values(
                MetricKind::TemporalIou,
                Scope::Global,
                &temporal_values,
                &config.temporal_iou_thresholds,
            ),
            kappa: kappa.primary_score(Scope::Global),
            kappa_class: kappa.primary_score(Scope::Global).classify(&config.kappa_thresholds),
            kappa_per_category: kappa.per_category_kappa(),
            action_distribution: action_distribution(loaded),
            outlier_annotators: cohort.outliers().map(|p| p.annotator_id.clone()).collect(),
            flagged_items: flagged.len(),
        };

        info!(
            "Report: {} clips analysed, {} excluded, {} problematic, {} flagged items",
            summary.clips_analyzed, summary.clips_excluded, summary.clips_problematic, summary.flagged_items
        );

        Self {
            summary,
            clips,
            annotators: cohort.profiles,
            cohort: cohort.cohort,
            cohort_categories: cohort.cohort_categories,
            pairwise: pair_agreements(&pairs, config.pair_sample_limit),
            flagged,
            exclusions: ExclusionSummary {
                rows_read: loaded.rows_read(),
                rejected_rows: loaded.rejections().clone(),
                conflicting_boxes: loaded.conflicting_boxes(),
                excluded_clips,
            },
            config: config.clone(),
        }
    }

    pub fn clip(&self, video_id: &str) -> Option<&ClipReport> {
        self.clips.iter().find(|c| c.video_id == video_id)
    }

    pub fn annotator(&self, annotator: &AnnotatorId) -> Option<&AnnotatorProfile> {
        self.annotators.iter().find(|p| &p.annotator_id == annotator)
    }

    /// Agreement of two annotators, in either order.
    pub fn pair(&self, a: &AnnotatorId, b: &AnnotatorId) -> Option<&PairAgreement> {
        self.pairwise
            .iter()
            .find(|p| p.involves(a) && p.involves(b) && a != b)
    }

    /// Number of flagged items per reason.
    pub fn flagged_by_reason(&self) -> BTreeMap<FlagReason, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.flagged {
            *counts.entry(item.reason).or_insert(0) += 1;
        }
        counts
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the full report as pretty-printed JSON.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = create_file(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        info!("Wrote quality report to {}", path.as_ref().display());
        Ok(())
    }

    /// Write the flagged items as CSV with a header row.
    pub fn write_flagged_csv_to<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        if self.flagged.is_empty() {
            csv_writer.write_record([
                "video_name",
                "frame_index",
                "reason",
                "annotators_involved",
                "metric_value",
            ])?;
        }
        for item in &self.flagged {
            csv_writer.serialize(FlaggedRow::from(item))?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn write_flagged_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = create_file(path.as_ref())?;
        self.write_flagged_csv_to(BufWriter::new(file))?;
        info!(
            "Wrote {} flagged items to {}",
            self.flagged.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Human-readable summary for the terminal.
    pub fn summary_text(&self) -> String {
        let s = &self.summary;
        let x = &self.exclusions;
        let mut out = String::new();
        let _ = writeln!(out, "Annotation quality report");
        let _ = writeln!(out, "  annotators:        {}", s.annotators);
        let _ = writeln!(
            out,
            "  clips:             {} analysed, {} excluded, {} problematic",
            s.clips_analyzed, s.clips_excluded, s.clips_problematic
        );
        let _ = writeln!(
            out,
            "  rows:              {} read, {} rejected",
            x.rows_read, x.rejected_rows.total
        );
        for (reason, count) in &x.rejected_rows.by_reason {
            let _ = writeln!(out, "    {:<22} {}", reason, count);
        }
        if x.conflicting_boxes > 0 {
            let _ = writeln!(out, "  conflicting boxes: {}", x.conflicting_boxes);
        }
        let _ = writeln!(
            out,
            "  frames:            {} ({} single-annotator)",
            s.frames, s.frames_single_annotator
        );
        let _ = writeln!(
            out,
            "  matched clusters:  {} ({} missed, {} low-overlap singletons)",
            s.matched_clusters, s.singletons_missed, s.singletons_low_overlap
        );
        let _ = writeln!(out, "  spatial IoU:       {}", fmt_aggregate(&s.spatial));
        let _ = writeln!(out, "  temporal IoU:      {}", fmt_aggregate(&s.temporal));
        let _ = writeln!(
            out,
            "  label kappa:       {}{}",
            fmt_value(s.kappa.value),
            fmt_class(s.kappa_class)
        );
        let outliers = if s.outlier_annotators.is_empty() {
            "none".to_string()
        } else {
            s.outlier_annotators
                .iter()
                .map(AnnotatorId::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let _ = writeln!(out, "  outlier annotators: {}", outliers);
        if let Some(worst) = self
            .pairwise
            .iter()
            .filter_map(|p| p.spatial.as_ref().map(|d| (p, d.mean)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
        {
            let _ = writeln!(
                out,
                "  annotator pairs:   {} (lowest: {} vs {}, mean IoU {:.3})",
                self.pairwise.len(),
                worst.0.first,
                worst.0.second,
                worst.1
            );
        }
        let _ = writeln!(out, "  flagged items:     {}", s.flagged_items);
        out
    }
}

fn clip_report(analysis: &ClipAnalysis, cohort: &CohortAnalysis, config: &QualityConfig) -> ClipReport {
    let spatial = MetricAggregate::from_values(
        MetricKind::SpatialIou,
        Scope::Clip,
        &analysis.spatial_values,
        &config.spatial_iou_thresholds,
    );
    let temporal = MetricAggregate::from_values(
        MetricKind::TemporalIou,
        Scope::Clip,
        &analysis.temporal_values,
        &config.temporal_iou_thresholds,
    );
    let kappa = analysis.kappa.primary_score(Scope::Clip);

    let driven: Vec<AnnotatorId> = if analysis.is_excluded() {
        Vec::new()
    } else {
        outliers_driven(analysis, cohort).into_iter().collect()
    };

    let mut problem_reasons = Vec::new();
    if spatial.is_fail() {
        problem_reasons.push(format!("spatial agreement {}", QualityClass::Fail));
    }
    if temporal.is_fail() {
        problem_reasons.push(format!("temporal agreement {}", QualityClass::Fail));
    }
    if driven.len() >= 2 {
        problem_reasons.push(format!("{} outlier annotators below cohort", driven.len()));
    }

    ClipReport {
        video_id: analysis.video_id.clone(),
        frames: analysis.frames,
        frames_single_annotator: analysis.frames_single_annotator,
        records: analysis.records,
        annotators: analysis.annotators.iter().cloned().collect(),
        matched_clusters: analysis.matched_clusters,
        singletons_missed: analysis.singleton_count(SingletonReason::MissedByOtherAnnotators),
        singletons_low_overlap: analysis.singleton_count(SingletonReason::LowOverlap),
        spatial,
        temporal,
        temporal_undefined: analysis.temporal_undefined,
        temporal_undefined_pairs: analysis.temporal_undefined_pairs,
        action_segments: analysis.action_segments,
        kappa_class: kappa.classify(&config.kappa_thresholds),
        kappa,
        kappa_per_category: analysis.kappa.per_category_kappa(),
        outlier_annotators_driven: driven,
        problematic: !problem_reasons.is_empty(),
        problem_reasons,
    }
}

/// Outlier annotators whose mean on a flagged metric or action category
/// within this clip is below the cohort mean.
fn outliers_driven(analysis: &ClipAnalysis, cohort: &CohortAnalysis) -> BTreeSet<AnnotatorId> {
    cohort
        .outliers()
        .filter(|profile| {
            let Some(acc) = analysis.accumulators.get(&profile.annotator_id) else {
                return false;
            };
            let below_on_metric = profile.outlier_metrics.iter().any(|metric| {
                match (acc.mean(*metric), cohort.cohort.get(metric)) {
                    (Some(clip_mean), Some(c)) => clip_mean < c.mean,
                    _ => false,
                }
            });
            let below_on_category = profile.outlier_categories.iter().any(|label| {
                match (acc.category_mean(*label), cohort.cohort_categories.get(label)) {
                    (Some(clip_mean), Some(c)) => clip_mean < c.mean,
                    _ => false,
                }
            });
            acc.participation > 0 && (below_on_metric || below_on_category)
        })
        .map(|profile| profile.annotator_id.clone())
        .collect()
}

fn action_distribution(loaded: &LoadedAnnotations) -> BTreeMap<u32, ActionCount> {
    let names = loaded.label_names();
    loaded
        .label_counts()
        .into_iter()
        .map(|(label, records)| {
            let count = ActionCount {
                name: names.get(&label).cloned(),
                records,
            };
            (label, count)
        })
        .collect()
}

fn create_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    File::create(path).map_err(|e| {
        Error::IoError(std::io::Error::new(
            e.kind(),
            format!("failed to create '{}': {}", path.display(), e),
        ))
    })
}

fn fmt_value(value: Option<f64>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{:.3}", v))
}

fn fmt_class(class: Option<QualityClass>) -> String {
    class.map_or_else(String::new, |c| format!(" ({})", c))
}

fn fmt_aggregate(aggregate: &MetricAggregate) -> String {
    match &aggregate.distribution {
        Some(d) => format!(
            "mean {:.3}, median {:.3}, p10 {:.3}, n = {}{}",
            d.mean,
            d.median,
            d.p10,
            d.count,
            fmt_class(aggregate.class)
        ),
        None => "N/A".to_string(),
    }
}
