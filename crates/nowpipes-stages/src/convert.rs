//! Batch-family stages: turning frames into flat numeric samples.

use std::sync::Arc;

use nowpipes_core::{Cursor, PipelineError, RecordCursor, Stage, WorkerContext};

use crate::error::{stage_err, StageError};
use crate::record::{Record, SampleBatch, TimeSeriesFrame};

/// Flattens each frame into a row-major [`SampleBatch`].
///
/// Missing values become `f32::NAN`, matching what a training loop masks
/// out. With no explicit column list, every value column is taken in frame
/// order.
pub struct ConvertToBatch {
    label: String,
    upstream: Arc<dyn Stage<Record>>,
    columns: Option<Vec<String>>,
}

impl ConvertToBatch {
    pub fn new(
        label: impl Into<String>,
        upstream: Arc<dyn Stage<Record>>,
        columns: Option<Vec<String>>,
    ) -> Result<Self, PipelineError> {
        if let Some(columns) = &columns {
            if columns.is_empty() {
                return Err(PipelineError::configuration(
                    "convert_batch column list must not be empty",
                ));
            }
        }
        Ok(Self {
            label: label.into(),
            upstream,
            columns,
        })
    }
}

impl Stage<Record> for ConvertToBatch {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<Record>, PipelineError> {
        let inner = self.upstream.iterate(ctx)?;
        Ok(Box::new(ConvertToBatchCursor {
            label: self.label.clone(),
            inner,
            columns: self.columns.clone(),
        }))
    }
}

struct ConvertToBatchCursor {
    label: String,
    inner: Cursor<Record>,
    columns: Option<Vec<String>>,
}

impl RecordCursor<Record> for ConvertToBatchCursor {
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
            frame_to_batch(&frame, self.columns.as_deref())
                .map(Record::Batch)
                .map_err(|err| stage_err(&self.label, err)),
        )
    }
}

fn frame_to_batch(
    frame: &TimeSeriesFrame,
    columns: Option<&[String]>,
) -> Result<SampleBatch, StageError> {
    let names: Vec<String> = match columns {
        Some(names) => names.to_vec(),
        None => frame.value_columns(),
    };
    let rows = frame.df.height();
    let width = names.len();

    let mut series = Vec::with_capacity(width);
    for name in &names {
        series.push(frame.df.column(name)?.f64()?.clone());
    }
    let mut values = Vec::with_capacity(rows * width);
    for row in 0..rows {
        for column in &series {
            values.push(column.get(row).map(|v| v as f32).unwrap_or(f32::NAN));
        }
    }

    Ok(SampleBatch {
        sources: vec![frame.source.clone()],
        t0s: vec![frame.t0],
        rows,
        width,
        values,
    })
}

/// Concatenates `count` upstream batches into one.
///
/// A shorter final batch is still yielded once the upstream ends. Batches
/// with mismatched widths cannot be stacked.
pub struct StackBatches {
    label: String,
    upstream: Arc<dyn Stage<Record>>,
    count: usize,
}

impl StackBatches {
    pub fn new(
        label: impl Into<String>,
        upstream: Arc<dyn Stage<Record>>,
        count: usize,
    ) -> Result<Self, PipelineError> {
        if count == 0 {
            return Err(PipelineError::configuration(
                "stack_batches count must be at least 1",
            ));
        }
        Ok(Self {
            label: label.into(),
            upstream,
            count,
        })
    }
}

impl Stage<Record> for StackBatches {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<Record>, PipelineError> {
        let inner = self.upstream.iterate(ctx)?;
        Ok(Box::new(StackBatchesCursor {
            label: self.label.clone(),
            inner,
            count: self.count,
        }))
    }
}

struct StackBatchesCursor {
    label: String,
    inner: Cursor<Record>,
    count: usize,
}

impl RecordCursor<Record> for StackBatchesCursor {
    fn next_record(&mut self) -> Option<Result<Record, PipelineError>> {
        let mut stacked: Option<SampleBatch> = None;
        for _ in 0..self.count {
            let record = match self.inner.next_record() {
                Some(Ok(record)) => record,
                Some(Err(err)) => return Some(Err(err)),
                None => break,
            };
            let batch = match record.into_batch(&self.label) {
                Ok(batch) => batch,
                Err(err) => return Some(Err(err)),
            };
            match &mut stacked {
                None => stacked = Some(batch),
                Some(acc) => {
                    if batch.width != acc.width {
                        return Some(Err(stage_err(
                            &self.label,
                            StageError::WidthMismatch {
                                expected: acc.width,
                                got: batch.width,
                            },
                        )));
                    }
                    acc.sources.extend(batch.sources);
                    acc.t0s.extend(batch.t0s);
                    acc.rows += batch.rows;
                    acc.values.extend(batch.values);
                }
            }
        }
        stacked.map(|batch| Ok(Record::Batch(batch)))
    }
}
