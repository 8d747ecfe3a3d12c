//! Registration of the builtin stage catalog.
//!
//! Each builtin is a thin constructor closure around one of the concrete
//! stage types, translating free-form description parameters into the
//! stage's validated constructor arguments. Workers call
//! [`register_builtin_stages`] once at startup and then assemble pipelines
//! purely from declarative descriptions.

use std::sync::Arc;

use once_cell::sync::Lazy;

use nowpipes_core::{
    Concatenate, PipelineError, Result, ShuffleStage, Stage, StageParams, StageRegistry, Zip,
    DEFAULT_LOOKAHEAD,
};

use crate::convert::{ConvertToBatch, StackBatches};
use crate::record::{frame_time_key, merge_frames_combine, parse_utc_timestamp, Record};
use crate::select::{FilterCapacityRange, FilterTimeRange, SelectTimeSlice};
use crate::source::CsvTimeSeriesSource;
use crate::transform::{Normalize, NormalizeMode};

/// Catalog entry for one builtin stage.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinStageDescriptor {
    pub name: &'static str,
    pub family: &'static str,
    pub description: &'static str,
}

static BUILTIN_STAGES: Lazy<Vec<BuiltinStageDescriptor>> = Lazy::new(|| {
    vec![
        BuiltinStageDescriptor {
            name: "csv_source",
            family: "load",
            description: "per-file CSV time-series source over a glob pattern",
        },
        BuiltinStageDescriptor {
            name: "filter_time_range",
            family: "select",
            description: "drop frames whose t0 falls outside [start, end)",
        },
        BuiltinStageDescriptor {
            name: "filter_capacity_range",
            family: "select",
            description: "drop frames whose system capacity is outside [min, max]",
        },
        BuiltinStageDescriptor {
            name: "select_time_slice",
            family: "select",
            description: "keep only the trailing history window of each frame",
        },
        BuiltinStageDescriptor {
            name: "normalize",
            family: "transform",
            description: "rescale value columns by capacity or mean/std",
        },
        BuiltinStageDescriptor {
            name: "convert_batch",
            family: "convert",
            description: "flatten each frame into a row-major numeric batch",
        },
        BuiltinStageDescriptor {
            name: "stack_batches",
            family: "convert",
            description: "concatenate a fixed number of batches into one",
        },
        BuiltinStageDescriptor {
            name: "shuffle",
            family: "order",
            description: "windowed shuffle with a deterministic per-epoch seed",
        },
        BuiltinStageDescriptor {
            name: "zip_time",
            family: "combine",
            description: "merge frames from several upstreams aligned on t0",
        },
        BuiltinStageDescriptor {
            name: "concatenate",
            family: "combine",
            description: "drain each upstream in turn",
        },
    ]
});

pub fn builtin_stage_descriptors() -> &'static [BuiltinStageDescriptor] {
    &BUILTIN_STAGES
}

/// Register every builtin stage under its catalog name.
pub fn register_builtin_stages(registry: &mut StageRegistry<Record>) -> Result<()> {
    registry.register_fn("csv_source", |upstreams, params| {
        expect_upstreams("csv_source", 0, &upstreams)?;
        let pattern = params.require_str("pattern")?;
        let source = params.require_str("source")?;
        let stage = CsvTimeSeriesSource::from_glob("csv_source", source, pattern)?;
        Ok(Arc::new(stage) as Arc<dyn Stage<Record>>)
    })?;

    registry.register_fn("filter_time_range", |mut upstreams, params| {
        expect_upstreams("filter_time_range", 1, &upstreams)?;
        let start = required_timestamp(params, "start")?;
        let end = required_timestamp(params, "end")?;
        let upstream = upstreams.remove(0);
        let stage = FilterTimeRange::new("filter_time_range", upstream, start, end)?;
        Ok(Arc::new(stage) as Arc<dyn Stage<Record>>)
    })?;

    registry.register_fn("filter_capacity_range", |mut upstreams, params| {
        expect_upstreams("filter_capacity_range", 1, &upstreams)?;
        let column = params.get_str("column")?.unwrap_or("capacity_mwp").to_string();
        let min = params.get_f64("min")?;
        let max = params.get_f64("max")?;
        let upstream = upstreams.remove(0);
        let stage = FilterCapacityRange::new("filter_capacity_range", upstream, column, min, max)?;
        Ok(Arc::new(stage) as Arc<dyn Stage<Record>>)
    })?;

    registry.register_fn("select_time_slice", |mut upstreams, params| {
        expect_upstreams("select_time_slice", 1, &upstreams)?;
        let minutes = params.require_u64("history_minutes")? as i64;
        let upstream = upstreams.remove(0);
        let stage = SelectTimeSlice::new(
            "select_time_slice",
            upstream,
            chrono::Duration::minutes(minutes),
        )?;
        Ok(Arc::new(stage) as Arc<dyn Stage<Record>>)
    })?;

    registry.register_fn("normalize", |mut upstreams, params| {
        expect_upstreams("normalize", 1, &upstreams)?;
        let mode = normalize_mode(params)?;
        let upstream = upstreams.remove(0);
        let stage = Normalize::new("normalize", upstream, mode)?;
        Ok(Arc::new(stage) as Arc<dyn Stage<Record>>)
    })?;

    registry.register_fn("convert_batch", |mut upstreams, params| {
        expect_upstreams("convert_batch", 1, &upstreams)?;
        let columns = optional_string_list(params, "columns")?;
        let upstream = upstreams.remove(0);
        let stage = ConvertToBatch::new("convert_batch", upstream, columns)?;
        Ok(Arc::new(stage) as Arc<dyn Stage<Record>>)
    })?;

    registry.register_fn("stack_batches", |mut upstreams, params| {
        expect_upstreams("stack_batches", 1, &upstreams)?;
        let count = params.require_u64("count")? as usize;
        let upstream = upstreams.remove(0);
        let stage = StackBatches::new("stack_batches", upstream, count)?;
        Ok(Arc::new(stage) as Arc<dyn Stage<Record>>)
    })?;

    registry.register_fn("shuffle", |mut upstreams, params| {
        expect_upstreams("shuffle", 1, &upstreams)?;
        let buffer_size = params.get_u64("buffer_size")?.unwrap_or(128) as usize;
        let upstream = upstreams.remove(0);
        let stage = ShuffleStage::new("shuffle", upstream, buffer_size)?;
        Ok(Arc::new(stage) as Arc<dyn Stage<Record>>)
    })?;

    registry.register_fn("zip_time", |upstreams, params| {
        if upstreams.len() < 2 {
            return Err(PipelineError::configuration(
                "`zip_time` requires at least two inputs",
            ));
        }
        let lookahead = params
            .get_u64("lookahead")?
            .unwrap_or(DEFAULT_LOOKAHEAD as u64) as usize;
        let stage = Zip::keyed(
            "zip_time",
            upstreams,
            frame_time_key("zip_time"),
            lookahead,
            merge_frames_combine("zip_time"),
        )?;
        Ok(Arc::new(stage) as Arc<dyn Stage<Record>>)
    })?;

    registry.register_fn("concatenate", |upstreams, _params| {
        let stage = Concatenate::new("concatenate", upstreams)?;
        Ok(Arc::new(stage) as Arc<dyn Stage<Record>>)
    })?;

    Ok(())
}

fn expect_upstreams(name: &str, expected: usize, upstreams: &[Arc<dyn Stage<Record>>]) -> Result<()> {
    if upstreams.len() != expected {
        return Err(PipelineError::configuration(format!(
            "`{name}` takes {expected} input(s), got {}",
            upstreams.len()
        )));
    }
    Ok(())
}

fn required_timestamp(params: &StageParams, key: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    let raw = params.require_str(key)?;
    parse_utc_timestamp(raw).ok_or_else(|| {
        PipelineError::configuration(format!("parameter `{key}` has unparseable timestamp `{raw}`"))
    })
}

fn normalize_mode(params: &StageParams) -> Result<NormalizeMode> {
    let max_value = params.get_f64("max_value")?;
    let mean = params.get_f64("mean")?;
    let std = params.get_f64("std")?;
    match (max_value, mean, std) {
        (Some(max), None, None) => Ok(NormalizeMode::MaxValue(max)),
        (None, Some(mean), Some(std)) => Ok(NormalizeMode::MeanStd { mean, std }),
        _ => Err(PipelineError::configuration(
            "`normalize` takes either `max_value` or both `mean` and `std`",
        )),
    }
}

fn optional_string_list(params: &StageParams, key: &str) -> Result<Option<Vec<String>>> {
    match params.get(key) {
        None => Ok(None),
        Some(serde_json::Value::Array(items)) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(name) => names.push(name.to_string()),
                    None => {
                        return Err(PipelineError::configuration(format!(
                            "parameter `{key}` must be a list of strings, got {item}"
                        )))
                    }
                }
            }
            Ok(Some(names))
        }
        Some(other) => Err(PipelineError::configuration(format!(
            "parameter `{key}` must be a list of strings, got {other}"
        ))),
    }
}
