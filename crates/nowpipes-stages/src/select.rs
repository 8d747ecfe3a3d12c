//! Select-family stages: narrowing frames along the time axis.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use polars::prelude::*;

use nowpipes_core::{Cursor, PipelineError, RecordCursor, Stage, WorkerContext};

use crate::error::{stage_err, StageError};
use crate::record::{Record, TimeSeriesFrame, TIMESTAMP_COLUMN};

/// Drops frames whose t0 falls outside `[start, end)`.
pub struct FilterTimeRange {
    label: String,
    upstream: Arc<dyn Stage<Record>>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl FilterTimeRange {
    pub fn new(
        label: impl Into<String>,
        upstream: Arc<dyn Stage<Record>>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, PipelineError> {
        if start >= end {
            return Err(PipelineError::configuration(format!(
                "filter_time_range start {start} must precede end {end}"
            )));
        }
        Ok(Self {
            label: label.into(),
            upstream,
            start,
            end,
        })
    }
}

impl Stage<Record> for FilterTimeRange {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<Record>, PipelineError> {
        let inner = self.upstream.iterate(ctx)?;
        Ok(Box::new(FilterTimeRangeCursor {
            label: self.label.clone(),
            inner,
            start: self.start,
            end: self.end,
        }))
    }
}

struct FilterTimeRangeCursor {
    label: String,
    inner: Cursor<Record>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl RecordCursor<Record> for FilterTimeRangeCursor {
    fn next_record(&mut self) -> Option<Result<Record, PipelineError>> {
        loop {
            let record = match self.inner.next_record()? {
                Ok(record) => record,
                Err(err) => return Some(Err(err)),
            };
            let frame = match record.into_frame(&self.label) {
                Ok(frame) => frame,
                Err(err) => return Some(Err(err)),
            };
            if frame.t0 >= self.start && frame.t0 < self.end {
                return Some(Ok(Record::Frame(frame)));
            }
            tracing::debug!(stage = %self.label, t0 = %frame.t0, "frame outside time range");
        }
    }
}

/// Drops frames whose system capacity falls outside `[min, max]`.
///
/// The capacity is read from the first non-null value of the named column;
/// frames without a readable capacity are dropped as well.
pub struct FilterCapacityRange {
    label: String,
    upstream: Arc<dyn Stage<Record>>,
    column: String,
    min: f64,
    max: f64,
}

impl FilterCapacityRange {
    pub fn new(
        label: impl Into<String>,
        upstream: Arc<dyn Stage<Record>>,
        column: impl Into<String>,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Result<Self, PipelineError> {
        if min.is_none() && max.is_none() {
            return Err(PipelineError::configuration(
                "filter_capacity_range needs `min` and/or `max`",
            ));
        }
        let min = min.unwrap_or(f64::NEG_INFINITY);
        let max = max.unwrap_or(f64::INFINITY);
        if min > max {
            return Err(PipelineError::configuration(format!(
                "filter_capacity_range min {min} must not exceed max {max}"
            )));
        }
        Ok(Self {
            label: label.into(),
            upstream,
            column: column.into(),
            min,
            max,
        })
    }
}

impl Stage<Record> for FilterCapacityRange {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<Record>, PipelineError> {
        let inner = self.upstream.iterate(ctx)?;
        Ok(Box::new(FilterCapacityRangeCursor {
            label: self.label.clone(),
            inner,
            column: self.column.clone(),
            min: self.min,
            max: self.max,
        }))
    }
}

struct FilterCapacityRangeCursor {
    label: String,
    inner: Cursor<Record>,
    column: String,
    min: f64,
    max: f64,
}

impl FilterCapacityRangeCursor {
    fn capacity_of(&self, frame: &TimeSeriesFrame) -> Result<Option<f64>, StageError> {
        let capacity = frame
            .df
            .column(&self.column)?
            .f64()?
            .into_iter()
            .flatten()
            .next();
        Ok(capacity)
    }
}

impl RecordCursor<Record> for FilterCapacityRangeCursor {
    fn next_record(&mut self) -> Option<Result<Record, PipelineError>> {
        loop {
            let record = match self.inner.next_record()? {
                Ok(record) => record,
                Err(err) => return Some(Err(err)),
            };
            let frame = match record.into_frame(&self.label) {
                Ok(frame) => frame,
                Err(err) => return Some(Err(err)),
            };
            match self.capacity_of(&frame) {
                Ok(Some(capacity)) if capacity >= self.min && capacity <= self.max => {
                    return Some(Ok(Record::Frame(frame)));
                }
                Ok(capacity) => {
                    tracing::debug!(
                        stage = %self.label,
                        source = %frame.source,
                        ?capacity,
                        "frame outside capacity range"
                    );
                }
                Err(err) => return Some(Err(stage_err(&self.label, err))),
            }
        }
    }
}

/// Keeps only the rows within `history` before each frame's t0, inclusive.
pub struct SelectTimeSlice {
    label: String,
    upstream: Arc<dyn Stage<Record>>,
    history: Duration,
}

impl SelectTimeSlice {
    pub fn new(
        label: impl Into<String>,
        upstream: Arc<dyn Stage<Record>>,
        history: Duration,
    ) -> Result<Self, PipelineError> {
        if history <= Duration::zero() {
            return Err(PipelineError::configuration(
                "select_time_slice history must be positive",
            ));
        }
        Ok(Self {
            label: label.into(),
            upstream,
            history,
        })
    }
}

fn slice_history(frame: TimeSeriesFrame, history: Duration) -> Result<TimeSeriesFrame, StageError> {
    let t0_micros = frame.t0.timestamp_micros();
    let lo = t0_micros - history.num_microseconds().unwrap_or(i64::MAX);

    let timestamps = frame.df.column(TIMESTAMP_COLUMN)?.datetime()?;
    let keep: Vec<bool> = timestamps
        .into_iter()
        .map(|value| value.is_some_and(|micros| micros >= lo && micros <= t0_micros))
        .collect();
    let mask = BooleanChunked::from_slice("keep".into(), &keep);
    let df = frame.df.filter(&mask)?;

    Ok(TimeSeriesFrame {
        source: frame.source,
        t0: frame.t0,
        df,
    })
}

impl Stage<Record> for SelectTimeSlice {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<Record>, PipelineError> {
        let inner = self.upstream.iterate(ctx)?;
        Ok(Box::new(SelectTimeSliceCursor {
            stage: SliceConfig {
                label: self.label.clone(),
                history: self.history,
            },
            inner,
        }))
    }
}

struct SliceConfig {
    label: String,
    history: Duration,
}

struct SelectTimeSliceCursor {
    stage: SliceConfig,
    inner: Cursor<Record>,
}

impl RecordCursor<Record> for SelectTimeSliceCursor {
    fn next_record(&mut self) -> Option<Result<Record, PipelineError>> {
        let record = match self.inner.next_record()? {
            Ok(record) => record,
            Err(err) => return Some(Err(err)),
        };
        let frame = match record.into_frame(&self.stage.label) {
            Ok(frame) => frame,
            Err(err) => return Some(Err(err)),
        };
        Some(
            slice_history(frame, self.stage.history)
                .map(Record::Frame)
                .map_err(|err| stage_err(&self.stage.label, err)),
        )
    }
}
