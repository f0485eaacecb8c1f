//! Per-row parsing and validation of annotator CSV tables.

use std::fmt;

use csv::StringRecord;
use serde::Serialize;

use crate::config::{QualityConfig, TimeReference};
use crate::record::{BBox, BoxError};
use super::LabelMap;

/// Number of logical fields in an annotation row.
pub const FIELD_COUNT: usize = 8;

const COORD_FIELDS: [&str; 4] = ["x1", "y1", "x2", "y2"];

/// Why a row was rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RejectReason {
    WrongFieldCount { got: usize },
    EmptyVideoName,
    NonNumeric { field: String, value: String },
    NonFiniteCoordinate,
    CoordinateOutOfRange,
    DegenerateBox,
    InvalidTimeReference { value: String },
    UnknownLabel { label: u32 },
    Unreadable { message: String },
}

impl RejectReason {
    /// Stable key used to count rejections by kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RejectReason::WrongFieldCount { .. } => "wrong-field-count",
            RejectReason::EmptyVideoName => "empty-video-name",
            RejectReason::NonNumeric { .. } => "non-numeric",
            RejectReason::NonFiniteCoordinate => "non-finite-coordinate",
            RejectReason::CoordinateOutOfRange => "coordinate-out-of-range",
            RejectReason::DegenerateBox => "degenerate-box",
            RejectReason::InvalidTimeReference { .. } => "invalid-time-reference",
            RejectReason::UnknownLabel { .. } => "unknown-label",
            RejectReason::Unreadable { .. } => "unreadable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::WrongFieldCount { got } => {
                write!(f, "expected {} fields, got {}", FIELD_COUNT, got)
            }
            RejectReason::EmptyVideoName => f.write_str("empty video name"),
            RejectReason::NonNumeric { field, value } => {
                write!(f, "field '{}' is not numeric: '{}'", field, value)
            }
            RejectReason::NonFiniteCoordinate => f.write_str("non-finite coordinate"),
            RejectReason::CoordinateOutOfRange => f.write_str("coordinate outside [0, 1]"),
            RejectReason::DegenerateBox => f.write_str("x1 >= x2 or y1 >= y2"),
            RejectReason::InvalidTimeReference { value } => {
                write!(f, "invalid time reference '{}'", value)
            }
            RejectReason::UnknownLabel { label } => {
                write!(f, "action label {} is not in the label map", label)
            }
            RejectReason::Unreadable { message } => write!(f, "unreadable row: {}", message),
        }
    }
}

impl From<BoxError> for RejectReason {
    fn from(e: BoxError) -> Self {
        match e {
            BoxError::NonFinite => RejectReason::NonFiniteCoordinate,
            BoxError::OutOfRange => RejectReason::CoordinateOutOfRange,
            BoxError::Degenerate => RejectReason::DegenerateBox,
        }
    }
}

/// A validated row, before multi-label coalescing.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub video_id: String,
    pub frame_index: u32,
    /// Time column as written (raw frame number or seconds).
    pub raw_time: f64,
    pub bbox: BBox,
    pub action_label: u32,
    pub person_id: i64,
}

/// Converts raw rows into [`ParsedRow`]s using the run configuration.
#[derive(Debug, Clone, Copy)]
pub struct RowParser<'a> {
    time_reference: TimeReference,
    sampling_rate_fps: u32,
    source_fps: u32,
    label_map: Option<&'a LabelMap>,
}

impl<'a> RowParser<'a> {
    pub fn new(config: &QualityConfig, label_map: Option<&'a LabelMap>) -> Self {
        Self {
            time_reference: config.time_reference,
            sampling_rate_fps: config.sampling_rate_fps.max(1),
            source_fps: config.source_fps.max(1),
            label_map,
        }
    }

    /// True when the row is a header line (`video_name,...`).
    pub fn is_header(record: &StringRecord) -> bool {
        record
            .get(0)
            .map(|f| f.trim().eq_ignore_ascii_case("video_name"))
            .unwrap_or(false)
    }

    /// Validate and normalize one row.
    pub fn parse(&self, record: &StringRecord) -> Result<ParsedRow, RejectReason> {
        if record.len() != FIELD_COUNT {
            return Err(RejectReason::WrongFieldCount { got: record.len() });
        }

        let video_id = record[0].trim();
        if video_id.is_empty() {
            return Err(RejectReason::EmptyVideoName);
        }

        let (raw_time, frame_index) = self.sample_time(record[1].trim())?;

        let mut coords = [0.0f64; 4];
        for (i, name) in COORD_FIELDS.iter().enumerate() {
            coords[i] = parse_number::<f64>(name, &record[i + 2])?;
        }
        let bbox = BBox::new(coords[0], coords[1], coords[2], coords[3])?;

        let raw_label = parse_number::<u32>("action_label", &record[6])?;
        let action_label = match self.label_map {
            Some(map) => map
                .remap(raw_label)
                .ok_or(RejectReason::UnknownLabel { label: raw_label })?,
            None => raw_label,
        };

        let person_id = parse_number::<i64>("person_id", &record[7])?;

        Ok(ParsedRow {
            video_id: video_id.to_string(),
            frame_index,
            raw_time,
            bbox,
            action_label,
            person_id,
        })
    }

    /// Normalize the time column to a sample index.
    ///
    /// Raw frames are 1-based: at 30 fps sampled once per second, frames
    /// 1..=30 map to index 0, frames 31..=60 to index 1.
    pub fn frame_index(&self, value: &str) -> Result<u32, RejectReason> {
        self.sample_time(value).map(|(_, index)| index)
    }

    /// Parse the time column into its raw value and its sample index.
    ///
    /// Values whose index does not fit a `u32` are rejected.
    pub fn sample_time(&self, value: &str) -> Result<(f64, u32), RejectReason> {
        let invalid = || RejectReason::InvalidTimeReference {
            value: value.to_string(),
        };
        let raw: f64 = value.parse().map_err(|_| invalid())?;
        if !raw.is_finite() {
            return Err(invalid());
        }

        let index = match self.time_reference {
            TimeReference::Frame => {
                if raw < 1.0 || raw.fract() != 0.0 || raw >= u64::MAX as f64 {
                    return Err(invalid());
                }
                (raw as u64 - 1)
                    .checked_mul(self.sampling_rate_fps as u64)
                    .ok_or_else(invalid)?
                    / self.source_fps as u64
            }
            TimeReference::Seconds => {
                if raw < 0.0 {
                    return Err(invalid());
                }
                let scaled = (raw * self.sampling_rate_fps as f64).floor();
                if !scaled.is_finite() || scaled > u32::MAX as f64 {
                    return Err(invalid());
                }
                scaled as u64
            }
        };
        let index = u32::try_from(index).map_err(|_| invalid())?;
        Ok((raw, index))
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, RejectReason> {
    value.trim().parse().map_err(|_| RejectReason::NonNumeric {
        field: field.to_string(),
        value: value.to_string(),
    })
}
