//! The record payloads flowing through concrete pipelines.
//!
//! The engine treats records as opaque; everything here is private to the
//! stage implementations. A pipeline starts as a stream of per-file
//! [`TimeSeriesFrame`]s and typically ends as [`SampleBatch`]es for the
//! training loop.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use polars::prelude::*;

use nowpipes_core::{CombineFn, KeyFn, PipelineError};

use crate::error::{stage_err, StageError};

/// Canonical name of the time axis column in every frame.
pub const TIMESTAMP_COLUMN: &str = "timestamp_utc";

#[derive(Debug, Clone)]
pub enum Record {
    Frame(TimeSeriesFrame),
    Batch(SampleBatch),
}

/// One contiguous slice of a single source's time series.
#[derive(Debug, Clone)]
pub struct TimeSeriesFrame {
    /// Source tag, e.g. "pv" or "nwp".
    pub source: String,
    /// Reference time of the frame: its newest timestamp.
    pub t0: DateTime<Utc>,
    pub df: DataFrame,
}

impl TimeSeriesFrame {
    /// Names of every column except the time axis, in frame order.
    pub fn value_columns(&self) -> Vec<String> {
        self.df
            .get_column_names()
            .into_iter()
            .filter(|name| name.as_str() != TIMESTAMP_COLUMN)
            .map(|name| name.to_string())
            .collect()
    }
}

/// Flat numeric sample ready for a model, row-major.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub sources: Vec<String>,
    pub t0s: Vec<DateTime<Utc>>,
    pub rows: usize,
    pub width: usize,
    pub values: Vec<f32>,
}

impl Record {
    fn variant_name(&self) -> &'static str {
        match self {
            Record::Frame(_) => "frame",
            Record::Batch(_) => "batch",
        }
    }

    pub fn into_frame(self, stage: &str) -> Result<TimeSeriesFrame, PipelineError> {
        match self {
            Record::Frame(frame) => Ok(frame),
            other => Err(stage_err(
                stage,
                StageError::WrongRecord {
                    expected: "frame",
                    got: other.variant_name(),
                },
            )),
        }
    }

    pub fn into_batch(self, stage: &str) -> Result<SampleBatch, PipelineError> {
        match self {
            Record::Batch(batch) => Ok(batch),
            other => Err(stage_err(
                stage,
                StageError::WrongRecord {
                    expected: "batch",
                    got: other.variant_name(),
                },
            )),
        }
    }
}

/// Parse an RFC 3339 timestamp, falling back to a naive
/// `YYYY-MM-DD HH:MM:SS` read as UTC.
pub(crate) fn parse_utc_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Zip key: a frame's t0 in epoch microseconds.
pub fn frame_time_key(stage: &'static str) -> KeyFn<Record> {
    Arc::new(move |record: &Record| match record {
        Record::Frame(frame) => Ok(frame.t0.timestamp_micros()),
        Record::Batch(_) => Err(stage_err(
            stage,
            StageError::WrongRecord {
                expected: "frame",
                got: "batch",
            },
        )),
    })
}

/// Zip combine: merge time-aligned frames side by side.
///
/// Value columns are prefixed with their source tag; the time axis of the
/// first frame is kept. Frames must have equal heights, which keyed zipping
/// on t0 guarantees only if the upstream slicing agrees.
pub fn merge_frames_combine(stage: &'static str) -> CombineFn<Record> {
    Arc::new(move |row: Vec<Record>| {
        let mut frames = Vec::with_capacity(row.len());
        for record in row {
            frames.push(record.into_frame(stage)?);
        }
        let first = frames
            .first()
            .ok_or_else(|| PipelineError::stage(stage, "zip produced an empty row"))?;
        let height = first.df.height();
        for frame in &frames {
            if frame.df.height() != height {
                return Err(PipelineError::alignment(format!(
                    "`{stage}`: frame heights differ ({} vs {}) for t0 {}",
                    height,
                    frame.df.height(),
                    first.t0
                )));
            }
        }

        let timestamps = first
            .df
            .column(TIMESTAMP_COLUMN)
            .map_err(|err| stage_err(stage, StageError::Polars(err)))?
            .clone();
        let mut columns: Vec<Column> = vec![timestamps];
        for frame in &frames {
            for name in frame.value_columns() {
                let values: Vec<Option<f64>> = frame
                    .df
                    .column(&name)
                    .and_then(|column| column.f64().map(|ca| ca.into_iter().collect()))
                    .map_err(|err| stage_err(stage, StageError::Polars(err)))?;
                let renamed = format!("{}_{}", frame.source, name);
                columns.push(Series::new(renamed.into(), values).into());
            }
        }
        let df = DataFrame::new(columns).map_err(|err| stage_err(stage, StageError::Polars(err)))?;

        let source = frames
            .iter()
            .map(|frame| frame.source.as_str())
            .collect::<Vec<&str>>()
            .join("+");
        Ok(Record::Frame(TimeSeriesFrame {
            source,
            t0: first.t0,
            df,
        }))
    })
}
