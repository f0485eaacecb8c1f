//! Annotation loader and normalizer.
//!
//! Reads one logical table per annotator and produces canonical
//! [`AnnotationRecord`]s:
//!
//! - `RowParser` - validate rows and normalize the time column
//! - `LabelMap` - optional injected action-id remapping
//! - `AnnotationLoader` - coalesce multi-label rows, order records canonically
//!
//! Input layout: one directory per annotator under a common root, any number
//! of header-less CSV files inside it with the columns
//! `video_name, timestamp_or_frame, x1, y1, x2, y2, action_label, person_id`.

mod label_map;
mod row_parser;

pub use label_map::LabelMap;
pub use row_parser::{ParsedRow, RejectReason, RowParser, FIELD_COUNT};

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::QualityConfig;
use crate::record::{AnnotationRecord, AnnotatorId, BBox};
use crate::{Error, Result};

/// A row that failed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    pub annotator_id: AnnotatorId,
    /// File (or other source) the row came from.
    pub source: String,
    /// 1-based line number within the source.
    pub line: u64,
    pub reason: RejectReason,
}

/// Count and sample of rejected rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RejectionSummary {
    pub total: usize,
    pub by_reason: BTreeMap<String, usize>,
    pub samples: Vec<RejectedRow>,
}

impl RejectionSummary {
    fn record(&mut self, row: RejectedRow, sample_limit: usize) {
        self.total += 1;
        *self.by_reason.entry(row.reason.kind().to_string()).or_default() += 1;
        if self.samples.len() < sample_limit {
            self.samples.push(row);
        }
    }
}

/// All records of one clip, grouped by normalized frame index.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipAnnotations {
    pub video_id: String,
    pub frames: BTreeMap<u32, Vec<AnnotationRecord>>,
}

impl ClipAnnotations {
    pub fn num_records(&self) -> usize {
        self.frames.values().map(Vec::len).sum()
    }

    /// Distinct annotators with at least one record in the clip.
    pub fn annotators(&self) -> BTreeSet<AnnotatorId> {
        self.frames
            .values()
            .flatten()
            .map(|r| r.annotator_id.clone())
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &AnnotationRecord> {
        self.frames.values().flatten()
    }
}

/// Output of the loader: canonical records plus rejection bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct LoadedAnnotations {
    records: Vec<AnnotationRecord>,
    annotators: BTreeSet<AnnotatorId>,
    rows_read: usize,
    rejections: RejectionSummary,
    conflicting_boxes: usize,
    label_names: BTreeMap<u32, String>,
}

impl LoadedAnnotations {
    /// Records in canonical order (video, frame, annotator, person, box).
    pub fn records(&self) -> &[AnnotationRecord] {
        &self.records
    }

    /// Every annotator that contributed a table, even one with no valid rows.
    pub fn annotators(&self) -> &BTreeSet<AnnotatorId> {
        &self.annotators
    }

    /// Data rows seen, valid or not (header lines excluded).
    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    pub fn rejections(&self) -> &RejectionSummary {
        &self.rejections
    }

    /// Records built from rows that disagreed on the box.
    pub fn conflicting_boxes(&self) -> usize {
        self.conflicting_boxes
    }

    /// Names of the compact label ids, when a label map was used.
    pub fn label_names(&self) -> &BTreeMap<u32, String> {
        &self.label_names
    }

    /// Number of records carrying each action label.
    pub fn label_counts(&self) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            for label in &record.action_labels {
                *counts.entry(*label).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Group records by clip and frame for the matcher.
    pub fn group_by_clip(&self) -> BTreeMap<String, ClipAnnotations> {
        let mut clips: BTreeMap<String, ClipAnnotations> = BTreeMap::new();
        for record in &self.records {
            clips
                .entry(record.video_id.clone())
                .or_insert_with(|| ClipAnnotations {
                    video_id: record.video_id.clone(),
                    frames: BTreeMap::new(),
                })
                .frames
                .entry(record.frame_index)
                .or_default()
                .push(record.clone());
        }
        clips
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    annotator_id: AnnotatorId,
    video_id: String,
    frame_index: u32,
    person_id: i64,
}

#[derive(Debug)]
struct PendingRecord {
    raw_time: f64,
    bbox: BBox,
    labels: BTreeSet<u32>,
    conflicting: bool,
}

impl PendingRecord {
    /// Representative row order: earliest raw time, then box coordinates.
    fn precedes(raw_time: f64, bbox: &BBox, than: &PendingRecord) -> bool {
        let by_box = bbox
            .to_array()
            .iter()
            .zip(than.bbox.to_array())
            .map(|(a, b)| a.total_cmp(&b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal);
        raw_time.total_cmp(&than.raw_time).then(by_box) == Ordering::Less
    }
}

/// Incremental loader: feed annotator tables, then [`AnnotationLoader::finish`].
pub struct AnnotationLoader<'a> {
    parser: RowParser<'a>,
    label_map: Option<&'a LabelMap>,
    sample_limit: usize,
    pending: HashMap<InstanceKey, PendingRecord>,
    annotators: BTreeSet<AnnotatorId>,
    rows_read: usize,
    rejections: RejectionSummary,
}

impl<'a> AnnotationLoader<'a> {
    pub fn new(config: &QualityConfig, label_map: Option<&'a LabelMap>) -> Self {
        Self {
            parser: RowParser::new(config, label_map),
            label_map,
            sample_limit: config.rejected_sample_limit,
            pending: HashMap::new(),
            annotators: BTreeSet::new(),
            rows_read: 0,
            rejections: RejectionSummary::default(),
        }
    }

    /// Parse one CSV table belonging to `annotator`.
    ///
    /// Invalid rows are recorded and skipped; only I/O failures on the
    /// underlying reader abort.
    pub fn add_reader<R: Read>(
        &mut self,
        annotator: &AnnotatorId,
        source: &str,
        reader: R,
    ) -> Result<()> {
        self.annotators.insert(annotator.clone());

        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut accepted = 0usize;
        let mut rejected = 0usize;
        for (i, result) in csv_reader.records().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(e) if e.is_io_error() => return Err(Error::Csv(e)),
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or(i as u64 + 1);
                    self.rows_read += 1;
                    rejected += 1;
                    self.reject(annotator, source, line, RejectReason::Unreadable {
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            let line = record.position().map(|p| p.line()).unwrap_or(i as u64 + 1);

            if i == 0 && RowParser::is_header(&record) {
                debug!("{}: skipping header row", source);
                continue;
            }
            self.rows_read += 1;

            match self.parser.parse(&record) {
                Ok(row) => {
                    accepted += 1;
                    self.insert(annotator, row);
                }
                Err(reason) => {
                    rejected += 1;
                    self.reject(annotator, source, line, reason);
                }
            }
        }

        debug!(
            "{} ({}): {} rows accepted, {} rejected",
            source, annotator, accepted, rejected
        );
        Ok(())
    }

    /// Parse one CSV file belonging to `annotator`.
    pub fn add_file<P: AsRef<Path>>(&mut self, annotator: &AnnotatorId, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::IoError(std::io::Error::new(
                e.kind(),
                format!("failed to open annotation file '{}': {}", path.display(), e),
            ))
        })?;
        self.add_reader(annotator, &path.display().to_string(), file)
    }

    /// Parse every `*.csv` file below an annotator directory.
    pub fn add_annotator_dir<P: AsRef<Path>>(
        &mut self,
        annotator: &AnnotatorId,
        dir: P,
    ) -> Result<()> {
        let mut files = Vec::new();
        collect_csv_files(dir.as_ref(), &mut files)?;
        if files.is_empty() {
            warn!("annotator '{}' has no CSV files in {}", annotator, dir.as_ref().display());
        }
        self.annotators.insert(annotator.clone());
        for file in files {
            self.add_file(annotator, &file)?;
        }
        Ok(())
    }

    fn insert(&mut self, annotator: &AnnotatorId, row: ParsedRow) {
        let key = InstanceKey {
            annotator_id: annotator.clone(),
            video_id: row.video_id,
            frame_index: row.frame_index,
            person_id: row.person_id,
        };
        // Rows collapsing onto one sample keep a single box whatever their order.
        match self.pending.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(PendingRecord {
                    raw_time: row.raw_time,
                    bbox: row.bbox,
                    labels: BTreeSet::from([row.action_label]),
                    conflicting: false,
                });
            }
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                if pending.bbox != row.bbox {
                    pending.conflicting = true;
                }
                if PendingRecord::precedes(row.raw_time, &row.bbox, pending) {
                    pending.raw_time = row.raw_time;
                    pending.bbox = row.bbox;
                }
                pending.labels.insert(row.action_label);
            }
        }
    }

    fn reject(&mut self, annotator: &AnnotatorId, source: &str, line: u64, reason: RejectReason) {
        if self.rejections.total < self.sample_limit {
            warn!("{}:{} rejected ({}): {}", source, line, annotator, reason);
        }
        self.rejections.record(
            RejectedRow {
                annotator_id: annotator.clone(),
                source: source.to_string(),
                line,
                reason,
            },
            self.sample_limit,
        );
    }

    /// Order records canonically and assign their canonical indices.
    pub fn finish(self) -> LoadedAnnotations {
        let conflicting_boxes = self.pending.values().filter(|p| p.conflicting).count();
        let mut records: Vec<AnnotationRecord> = self
            .pending
            .into_iter()
            .map(|(key, pending)| AnnotationRecord {
                video_id: key.video_id,
                frame_index: key.frame_index,
                bbox: pending.bbox,
                action_labels: pending.labels,
                local_person_id: key.person_id,
                annotator_id: key.annotator_id,
                canonical_index: 0,
            })
            .collect();

        records.sort_by(|a, b| {
            a.video_id
                .cmp(&b.video_id)
                .then(a.frame_index.cmp(&b.frame_index))
                .then(a.annotator_id.cmp(&b.annotator_id))
                .then(a.local_person_id.cmp(&b.local_person_id))
        });
        for (i, record) in records.iter_mut().enumerate() {
            record.canonical_index = i;
        }

        let label_names: BTreeMap<u32, String> = match self.label_map {
            Some(map) => records
                .iter()
                .flat_map(|r| r.action_labels.iter())
                .filter_map(|&label| map.name(label).map(|name| (label, name.to_string())))
                .collect(),
            None => BTreeMap::new(),
        };

        if conflicting_boxes > 0 {
            warn!(
                "{} records merged rows with different boxes; kept the earliest row's box",
                conflicting_boxes
            );
        }
        if self.rejections.total > 0 {
            warn!(
                "{} of {} rows rejected: {:?}",
                self.rejections.total, self.rows_read, self.rejections.by_reason
            );
        }
        info!(
            "loaded {} records from {} annotators ({} rows read)",
            records.len(),
            self.annotators.len(),
            self.rows_read
        );

        LoadedAnnotations {
            records,
            annotators: self.annotators,
            rows_read: self.rows_read,
            rejections: self.rejections,
            conflicting_boxes,
            label_names,
        }
    }
}

/// Load every annotator directory under `root`.
///
/// Each immediate sub-directory is one annotator, named after the directory.
pub fn load_annotation_dir<P: AsRef<Path>>(
    root: P,
    config: &QualityConfig,
    label_map: Option<&LabelMap>,
) -> Result<LoadedAnnotations> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(Error::InvalidInput(format!(
            "annotation root '{}' is not a directory",
            root.display()
        )));
    }

    let mut annotator_dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir() && !is_hidden(p))
        .collect();
    annotator_dirs.sort();

    if annotator_dirs.is_empty() {
        return Err(Error::InvalidInput(format!(
            "no annotator directories found under '{}'",
            root.display()
        )));
    }

    let mut loader = AnnotationLoader::new(config, label_map);
    for dir in &annotator_dirs {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        info!("reading annotator '{}' from {}", name, dir.display());
        loader.add_annotator_dir(&AnnotatorId::new(name), dir)?;
    }
    Ok(loader.finish())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn collect_csv_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| !is_hidden(p))
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_csv_files(&path, out)?;
        } else if path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}
