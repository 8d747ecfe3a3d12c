//! Transform-family stages: per-column numeric adjustments.

use std::sync::Arc;

use polars::prelude::*;

use nowpipes_core::{Cursor, PipelineError, RecordCursor, Stage, WorkerContext};

use crate::error::{stage_err, StageError};
use crate::record::{Record, TimeSeriesFrame};

/// How a [`Normalize`] stage rescales values.
#[derive(Debug, Clone, Copy)]
pub enum NormalizeMode {
    /// Divide every value by a fixed capacity, e.g. installed MWp.
    MaxValue(f64),
    /// Subtract `mean`, divide by `std`.
    MeanStd { mean: f64, std: f64 },
}

/// Rescales every value column of each frame.
pub struct Normalize {
    label: String,
    upstream: Arc<dyn Stage<Record>>,
    mode: NormalizeMode,
}

impl Normalize {
    pub fn new(
        label: impl Into<String>,
        upstream: Arc<dyn Stage<Record>>,
        mode: NormalizeMode,
    ) -> Result<Self, PipelineError> {
        match mode {
            NormalizeMode::MaxValue(max) if max == 0.0 => {
                return Err(PipelineError::configuration(
                    "normalize max_value must be non-zero",
                ));
            }
            NormalizeMode::MeanStd { std, .. } if std == 0.0 => {
                return Err(PipelineError::configuration(
                    "normalize std must be non-zero",
                ));
            }
            _ => {}
        }
        Ok(Self {
            label: label.into(),
            upstream,
            mode,
        })
    }
}

impl Stage<Record> for Normalize {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<Record>, PipelineError> {
        let inner = self.upstream.iterate(ctx)?;
        Ok(Box::new(NormalizeCursor {
            label: self.label.clone(),
            inner,
            mode: self.mode,
        }))
    }
}

struct NormalizeCursor {
    label: String,
    inner: Cursor<Record>,
    mode: NormalizeMode,
}

impl RecordCursor<Record> for NormalizeCursor {
    fn next_record(&mut self) -> Option<Result<Record, PipelineError>> {
        let record = match self.inner.next_record()? {
            Ok(record) => record,
            Err(err) => return Some(Err(err)),
        };
        let frame = match record.into_frame(&self.label) {
            Ok(frame) => frame,
            Err(err) => return Some(Err(err)),
        };
        Some(
            normalize_frame(frame, self.mode)
                .map(Record::Frame)
                .map_err(|err| stage_err(&self.label, err)),
        )
    }
}

fn normalize_frame(
    mut frame: TimeSeriesFrame,
    mode: NormalizeMode,
) -> Result<TimeSeriesFrame, StageError> {
    for name in frame.value_columns() {
        let rescaled: Vec<Option<f64>> = frame
            .df
            .column(&name)?
            .f64()?
            .into_iter()
            .map(|value| {
                value.map(|v| match mode {
                    NormalizeMode::MaxValue(max) => v / max,
                    NormalizeMode::MeanStd { mean, std } => (v - mean) / std,
                })
            })
            .collect();
        frame
            .df
            .with_column(Series::new(name.as_str().into(), rescaled))?;
    }
    Ok(frame)
}
