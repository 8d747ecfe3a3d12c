//! Concrete pipeline stages for time-series training data.
//!
//! Everything here flows [`Record`]s through the `nowpipes-core` engine:
//! CSV-backed sources produce per-file [`TimeSeriesFrame`]s, select and
//! transform stages narrow and rescale them, and convert stages turn them
//! into flat [`SampleBatch`]es. [`register_builtin_stages`] exposes the
//! whole catalog under stable names for declarative pipeline descriptions.

pub mod convert;
pub mod error;
pub mod record;
pub mod register;
pub mod select;
pub mod source;
pub mod transform;

pub use convert::{ConvertToBatch, StackBatches};
pub use error::StageError;
pub use record::{
    frame_time_key, merge_frames_combine, Record, SampleBatch, TimeSeriesFrame, TIMESTAMP_COLUMN,
};
pub use register::{builtin_stage_descriptors, register_builtin_stages, BuiltinStageDescriptor};
pub use select::{FilterCapacityRange, FilterTimeRange, SelectTimeSlice};
pub use source::CsvTimeSeriesSource;
pub use transform::{Normalize, NormalizeMode};

#[cfg(test)]
mod tests;
