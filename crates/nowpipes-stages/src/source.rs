//! Load-family stages: file-backed time-series sources.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use polars::prelude::*;

use nowpipes_core::{Cursor, PipelineError, RecordCursor, Stage, WorkerContext};

use crate::error::{stage_err, StageError};
use crate::record::{parse_utc_timestamp, Record, TimeSeriesFrame, TIMESTAMP_COLUMN};

/// Source over a directory of per-period CSV files.
///
/// The sorted path list is the deterministic total ordering that sharding
/// partitions: worker `i` owns every path at position `p` with
/// `p % num_workers == i`. Files are opened lazily, one per pull, so a
/// worker never reads outside its shard.
///
/// Expected layout: a `timestamp_utc` column followed by numeric value
/// columns. A file's t0 is its newest timestamp.
pub struct CsvTimeSeriesSource {
    label: String,
    source: String,
    paths: Vec<PathBuf>,
}

impl CsvTimeSeriesSource {
    pub fn from_glob(
        label: impl Into<String>,
        source: impl Into<String>,
        pattern: &str,
    ) -> Result<Self, PipelineError> {
        let label = label.into();
        let entries = glob::glob(pattern).map_err(|err| {
            stage_err(
                &label,
                StageError::Schema {
                    path: pattern.to_string(),
                    message: format!("invalid glob pattern: {err}"),
                },
            )
        })?;
        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => paths.push(path),
                Err(err) => {
                    return Err(stage_err(
                        &label,
                        StageError::Io {
                            path: pattern.to_string(),
                            source: err.into_error(),
                        },
                    ))
                }
            }
        }
        Ok(Self::from_paths(label, source, paths))
    }

    pub fn from_paths(
        label: impl Into<String>,
        source: impl Into<String>,
        mut paths: Vec<PathBuf>,
    ) -> Self {
        paths.sort();
        Self {
            label: label.into(),
            source: source.into(),
            paths,
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Stage<Record> for CsvTimeSeriesSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<Record>, PipelineError> {
        let shard: Vec<PathBuf> = self
            .paths
            .iter()
            .enumerate()
            .filter(|(position, _)| ctx.owns_position(*position))
            .map(|(_, path)| path.clone())
            .collect();
        tracing::debug!(
            stage = %self.label,
            source = %self.source,
            worker = ctx.worker_index,
            files = shard.len(),
            "sharded source files"
        );
        Ok(Box::new(CsvSourceCursor {
            label: self.label.clone(),
            source: self.source.clone(),
            paths: shard.into_iter(),
        }))
    }
}

struct CsvSourceCursor {
    label: String,
    source: String,
    paths: std::vec::IntoIter<PathBuf>,
}

impl RecordCursor<Record> for CsvSourceCursor {
    fn next_record(&mut self) -> Option<Result<Record, PipelineError>> {
        let path = self.paths.next()?;
        Some(
            read_time_series_csv(&path, &self.source)
                .map(Record::Frame)
                .map_err(|err| stage_err(&self.label, err)),
        )
    }
}

pub(crate) fn read_time_series_csv(
    path: &Path,
    source: &str,
) -> Result<TimeSeriesFrame, StageError> {
    let display = path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| StageError::Csv {
            path: display.clone(),
            source: err,
        })?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| StageError::Csv {
            path: display.clone(),
            source: err,
        })?
        .iter()
        .map(|field| field.to_string())
        .collect();
    if headers.first().map(String::as_str) != Some(TIMESTAMP_COLUMN) {
        return Err(StageError::Schema {
            path: display,
            message: format!("first column must be `{TIMESTAMP_COLUMN}`, got {headers:?}"),
        });
    }
    let value_names: Vec<String> = headers[1..].to_vec();

    let mut timestamps: Vec<i64> = Vec::new();
    let mut values: Vec<Vec<Option<f64>>> = vec![Vec::new(); value_names.len()];
    for (row_index, row) in reader.records().enumerate() {
        let row = row.map_err(|err| StageError::Csv {
            path: display.clone(),
            source: err,
        })?;
        let raw_ts = row.get(0).unwrap_or_default();
        let ts = parse_utc_timestamp(raw_ts).ok_or_else(|| StageError::Row {
            path: display.clone(),
            row: row_index,
            message: format!("unparseable timestamp `{raw_ts}`"),
        })?;
        timestamps.push(ts.timestamp_micros());
        for (column, slot) in values.iter_mut().enumerate() {
            let field = row.get(column + 1).unwrap_or_default();
            if field.is_empty() {
                slot.push(None);
            } else {
                let number = field.parse::<f64>().map_err(|_| StageError::Row {
                    path: display.clone(),
                    row: row_index,
                    message: format!(
                        "column `{}` has non-numeric value `{field}`",
                        value_names[column]
                    ),
                })?;
                slot.push(Some(number));
            }
        }
    }

    let newest = timestamps.iter().copied().max().ok_or_else(|| StageError::Schema {
        path: display.clone(),
        message: "file contains no data rows".to_string(),
    })?;
    let t0 = DateTime::<Utc>::from_timestamp_micros(newest).ok_or_else(|| StageError::Schema {
        path: display.clone(),
        message: format!("timestamp {newest} out of range"),
    })?;

    let ts_series = Series::new(TIMESTAMP_COLUMN.into(), timestamps)
        .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?;
    let mut columns: Vec<Column> = vec![ts_series.into()];
    for (name, data) in value_names.iter().zip(values) {
        columns.push(Series::new(name.as_str().into(), data).into());
    }
    let df = DataFrame::new(columns)?;

    Ok(TimeSeriesFrame {
        source: source.to_string(),
        t0,
        df,
    })
}
