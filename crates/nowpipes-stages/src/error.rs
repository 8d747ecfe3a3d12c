use nowpipes_core::PipelineError;
use polars::prelude::PolarsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("I/O error in {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} row {row} invalid: {message}")]
    Row {
        path: String,
        row: usize,
        message: String,
    },

    #[error("{path}: {message}")]
    Schema { path: String, message: String },

    #[error("expected a {expected} record, got a {got} record")]
    WrongRecord {
        expected: &'static str,
        got: &'static str,
    },

    #[error("batch width {got} does not match {expected}")]
    WidthMismatch { expected: usize, got: usize },
}

/// Surface a stage-local failure through the engine's error taxonomy.
pub(crate) fn stage_err(stage: &str, err: StageError) -> PipelineError {
    PipelineError::stage(stage, err.to_string())
}
