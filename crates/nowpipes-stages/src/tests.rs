use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use nowpipes_core::{
    assemble, Cursor, PipelineDescription, PipelineError, RecordCursor, Result, Stage,
    StageRegistry, VecCursor, WorkerContext,
};

use crate::convert::{ConvertToBatch, StackBatches};
use crate::record::{Record, SampleBatch, TimeSeriesFrame};
use crate::register::{builtin_stage_descriptors, register_builtin_stages};
use crate::select::{FilterCapacityRange, FilterTimeRange, SelectTimeSlice};
use crate::source::CsvTimeSeriesSource;
use crate::transform::{Normalize, NormalizeMode};

fn fixture_glob(sub: &str) -> String {
    format!("{}/tests/data/{}/*.csv", env!("CARGO_MANIFEST_DIR"), sub)
}

fn fixture_path(rel: &str) -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(rel)
}

fn ts(raw: &str) -> DateTime<Utc> {
    raw.parse().expect("fixture timestamp")
}

fn pv_source() -> Arc<dyn Stage<Record>> {
    Arc::new(
        CsvTimeSeriesSource::from_glob("pv", "pv", &fixture_glob("pv")).expect("pv fixture glob"),
    )
}

fn drain(stage: &dyn Stage<Record>, ctx: &WorkerContext) -> Vec<Record> {
    let mut cursor = stage.iterate(ctx).expect("iterate");
    let mut out = Vec::new();
    while let Some(item) = cursor.next_record() {
        out.push(item.expect("record"));
    }
    out
}

fn frames(records: Vec<Record>) -> Vec<TimeSeriesFrame> {
    records
        .into_iter()
        .map(|record| record.into_frame("test").expect("frame record"))
        .collect()
}

fn column_values(frame: &TimeSeriesFrame, name: &str) -> Vec<Option<f64>> {
    frame
        .df
        .column(name)
        .expect("column")
        .f64()
        .expect("f64 column")
        .into_iter()
        .collect()
}

// Loose enough to absorb an f32 round-trip.
fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

/// Fixed-order in-memory stage for exercising downstream stages directly.
struct ListStage {
    label: String,
    records: Vec<Record>,
}

impl ListStage {
    fn shared(label: &str, records: Vec<Record>) -> Arc<dyn Stage<Record>> {
        Arc::new(Self {
            label: label.to_string(),
            records,
        })
    }
}

impl Stage<Record> for ListStage {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, _ctx: &WorkerContext) -> Result<Cursor<Record>> {
        Ok(Box::new(VecCursor::new(self.records.clone())))
    }
}

fn sample_batch(width: usize, rows: usize) -> SampleBatch {
    SampleBatch {
        sources: vec!["test".to_string()],
        t0s: vec![ts("2021-06-01T01:30:00Z")],
        rows,
        width,
        values: vec![0.0; rows * width],
    }
}

// -- csv_source ------------------------------------------------------------

#[test]
fn csv_source_orders_and_parses_files() {
    let source = pv_source();
    let frames = frames(drain(source.as_ref(), &WorkerContext::default()));

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].source, "pv");
    assert_eq!(frames[0].t0, ts("2021-06-01T01:30:00Z"));
    assert_eq!(frames[1].t0, ts("2021-06-02T01:30:00Z"));
    assert_eq!(frames[2].t0, ts("2021-06-03T01:30:00Z"));
    assert_eq!(frames[0].df.height(), 4);
    assert_eq!(
        frames[0].value_columns(),
        vec!["generation_mw".to_string(), "capacity_mwp".to_string()]
    );
    assert_eq!(
        column_values(&frames[0], "generation_mw"),
        vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]
    );
}

#[test]
fn csv_source_reads_empty_fields_as_missing() {
    let source = pv_source();
    let frames = frames(drain(source.as_ref(), &WorkerContext::default()));
    let generation = column_values(&frames[1], "generation_mw");
    assert_eq!(generation, vec![Some(2.0), Some(4.0), None, Some(8.0)]);
}

#[test]
fn csv_source_shards_partition_the_file_set() {
    let source = pv_source();
    let full: Vec<DateTime<Utc>> = frames(drain(source.as_ref(), &WorkerContext::default()))
        .into_iter()
        .map(|frame| frame.t0)
        .collect();

    let mut union = Vec::new();
    for worker in 0..2 {
        let ctx = WorkerContext::new(worker, 2, 0).expect("worker context");
        for frame in frames(drain(source.as_ref(), &ctx)) {
            assert!(!union.contains(&frame.t0), "duplicate frame across workers");
            union.push(frame.t0);
        }
    }
    union.sort();
    assert_eq!(union, full);
}

#[test]
fn csv_source_empty_glob_yields_nothing() {
    let source = CsvTimeSeriesSource::from_glob("none", "none", &fixture_glob("missing"))
        .expect("empty glob is not an error");
    assert!(source.is_empty());
    assert!(drain(&source, &WorkerContext::default()).is_empty());
}

#[test]
fn csv_source_rejects_wrong_header() {
    let source = CsvTimeSeriesSource::from_paths(
        "bad",
        "bad",
        vec![fixture_path("bad/wrong_header.csv")],
    );
    let mut cursor = source.iterate(&WorkerContext::default()).expect("iterate");
    let err = cursor.next_record().expect("one item").unwrap_err();
    assert!(err.to_string().contains("first column"), "got: {err}");
}

#[test]
fn csv_source_rejects_non_numeric_values() {
    let source =
        CsvTimeSeriesSource::from_paths("bad", "bad", vec![fixture_path("bad/bad_value.csv")]);
    let mut cursor = source.iterate(&WorkerContext::default()).expect("iterate");
    let err = cursor.next_record().expect("one item").unwrap_err();
    assert!(err.to_string().contains("non-numeric"), "got: {err}");
}

// -- select ----------------------------------------------------------------

#[test]
fn filter_time_range_keeps_half_open_interval() {
    let stage = FilterTimeRange::new(
        "range",
        pv_source(),
        ts("2021-06-02T00:00:00Z"),
        ts("2021-06-03T01:30:00Z"),
    )
    .expect("valid range");

    let kept = frames(drain(&stage, &WorkerContext::default()));
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].t0, ts("2021-06-02T01:30:00Z"));
}

#[test]
fn filter_time_range_rejects_inverted_bounds() {
    let err = FilterTimeRange::new(
        "range",
        pv_source(),
        ts("2021-06-03T00:00:00Z"),
        ts("2021-06-02T00:00:00Z"),
    )
    .err()
    .expect("inverted bounds must fail");
    assert!(matches!(err, PipelineError::Configuration { .. }));
}

#[test]
fn filter_capacity_range_keeps_systems_in_range() {
    let kept = FilterCapacityRange::new(
        "cap",
        pv_source(),
        "capacity_mwp",
        Some(5.0),
        Some(20.0),
    )
    .expect("valid range");
    assert_eq!(frames(drain(&kept, &WorkerContext::default())).len(), 3);

    let dropped = FilterCapacityRange::new("cap", pv_source(), "capacity_mwp", Some(20.0), None)
        .expect("valid range");
    assert!(drain(&dropped, &WorkerContext::default()).is_empty());
}

#[test]
fn filter_capacity_range_validates_bounds() {
    let err = FilterCapacityRange::new("cap", pv_source(), "capacity_mwp", None, None)
        .err()
        .expect("at least one bound is required");
    assert!(matches!(err, PipelineError::Configuration { .. }));
    assert!(
        FilterCapacityRange::new("cap", pv_source(), "capacity_mwp", Some(9.0), Some(1.0))
            .is_err()
    );
}

#[test]
fn filter_capacity_range_fails_on_a_missing_column() {
    let stage = FilterCapacityRange::new("cap", pv_source(), "no_such_column", Some(1.0), None)
        .expect("valid range");
    let mut cursor = stage.iterate(&WorkerContext::default()).expect("iterate");
    let err = cursor.next_record().expect("one item").unwrap_err();
    assert!(matches!(err, PipelineError::Stage { .. }));
}

#[test]
fn select_time_slice_keeps_trailing_window() {
    let stage = SelectTimeSlice::new("slice", pv_source(), Duration::minutes(30))
        .expect("positive history");
    let sliced = frames(drain(&stage, &WorkerContext::default()));

    assert_eq!(sliced.len(), 3);
    for frame in &sliced {
        assert_eq!(frame.df.height(), 2);
    }
    assert_eq!(
        column_values(&sliced[0], "generation_mw"),
        vec![Some(3.0), Some(4.0)]
    );
}

#[test]
fn select_time_slice_requires_positive_history() {
    let err = SelectTimeSlice::new("slice", pv_source(), Duration::zero())
        .err()
        .expect("zero history must fail");
    assert!(matches!(err, PipelineError::Configuration { .. }));
}

// -- transform -------------------------------------------------------------

#[test]
fn normalize_divides_by_capacity() {
    let stage = Normalize::new("norm", pv_source(), NormalizeMode::MaxValue(10.0))
        .expect("non-zero capacity");
    let scaled = frames(drain(&stage, &WorkerContext::default()));

    let generation = column_values(&scaled[0], "generation_mw");
    for (got, want) in generation.iter().zip([0.1, 0.2, 0.3, 0.4]) {
        assert!(close(got.expect("value"), want));
    }
    let capacity = column_values(&scaled[0], "capacity_mwp");
    assert!(capacity.iter().all(|v| close(v.expect("value"), 1.0)));
}

#[test]
fn normalize_applies_mean_std() {
    let stage = Normalize::new(
        "norm",
        pv_source(),
        NormalizeMode::MeanStd {
            mean: 2.0,
            std: 2.0,
        },
    )
    .expect("non-zero std");
    let scaled = frames(drain(&stage, &WorkerContext::default()));

    let generation = column_values(&scaled[0], "generation_mw");
    for (got, want) in generation.iter().zip([-0.5, 0.0, 0.5, 1.0]) {
        assert!(close(got.expect("value"), want));
    }
}

#[test]
fn normalize_rejects_zero_divisors() {
    assert!(Normalize::new("norm", pv_source(), NormalizeMode::MaxValue(0.0)).is_err());
    assert!(Normalize::new(
        "norm",
        pv_source(),
        NormalizeMode::MeanStd {
            mean: 1.0,
            std: 0.0
        }
    )
    .is_err());
}

// -- convert ---------------------------------------------------------------

#[test]
fn convert_batch_flattens_row_major() {
    let stage = ConvertToBatch::new("batch", pv_source(), None).expect("valid config");
    let mut cursor = stage.iterate(&WorkerContext::default()).expect("iterate");
    let batch = cursor
        .next_record()
        .expect("first batch")
        .expect("ok")
        .into_batch("test")
        .expect("batch record");

    assert_eq!(batch.rows, 4);
    assert_eq!(batch.width, 2);
    assert_eq!(batch.sources, vec!["pv".to_string()]);
    assert_eq!(batch.t0s, vec![ts("2021-06-01T01:30:00Z")]);
    // Row 0 is (generation_mw, capacity_mwp) at the oldest timestamp.
    assert!(close(batch.values[0] as f64, 1.0));
    assert!(close(batch.values[1] as f64, 10.0));
    assert!(close(batch.values[2] as f64, 2.0));
}

#[test]
fn convert_batch_missing_values_become_nan() {
    let stage =
        ConvertToBatch::new("batch", pv_source(), Some(vec!["generation_mw".to_string()]))
            .expect("valid config");
    let batches: Vec<SampleBatch> = drain(&stage, &WorkerContext::default())
        .into_iter()
        .map(|record| record.into_batch("test").expect("batch record"))
        .collect();

    assert_eq!(batches[1].width, 1);
    assert!(batches[1].values[2].is_nan());
    assert!(close(batches[1].values[3] as f64, 8.0));
}

#[test]
fn stack_batches_concatenates_and_flushes_partial() {
    let convert = Arc::new(
        ConvertToBatch::new("batch", pv_source(), None).expect("valid config"),
    ) as Arc<dyn Stage<Record>>;
    let stage = StackBatches::new("stack", convert, 2).expect("valid count");
    let batches: Vec<SampleBatch> = drain(&stage, &WorkerContext::default())
        .into_iter()
        .map(|record| record.into_batch("test").expect("batch record"))
        .collect();

    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].rows, 8);
    assert_eq!(batches[0].t0s.len(), 2);
    assert_eq!(batches[0].values.len(), 16);
    // The trailing partial stack is still yielded.
    assert_eq!(batches[1].rows, 4);
    assert_eq!(batches[1].t0s.len(), 1);
}

#[test]
fn stack_batches_rejects_width_mismatch() {
    let upstream = ListStage::shared(
        "list",
        vec![
            Record::Batch(sample_batch(1, 2)),
            Record::Batch(sample_batch(2, 2)),
        ],
    );
    let stage = StackBatches::new("stack", upstream, 2).expect("valid count");
    let mut cursor = stage.iterate(&WorkerContext::default()).expect("iterate");
    let err = cursor.next_record().expect("one item").unwrap_err();
    assert!(err.to_string().contains("width"), "got: {err}");
}

#[test]
fn frame_stages_reject_batch_records() {
    let upstream = ListStage::shared("list", vec![Record::Batch(sample_batch(1, 1))]);
    let stage = SelectTimeSlice::new("slice", upstream, Duration::minutes(30))
        .expect("positive history");
    let mut cursor = stage.iterate(&WorkerContext::default()).expect("iterate");
    let err = cursor.next_record().expect("one item").unwrap_err();
    assert!(err.to_string().contains("expected a frame"), "got: {err}");
}

// -- registry and descriptions ---------------------------------------------

#[test]
fn builtin_catalog_registers_every_descriptor() {
    let mut registry = StageRegistry::new();
    register_builtin_stages(&mut registry).expect("fresh registry");
    for descriptor in builtin_stage_descriptors() {
        assert!(registry.contains(descriptor.name), "{}", descriptor.name);
    }
    assert_eq!(registry.names().len(), builtin_stage_descriptors().len());
}

#[test]
fn builtin_registration_is_additive_only() {
    let mut registry = StageRegistry::new();
    register_builtin_stages(&mut registry).expect("fresh registry");
    let err = register_builtin_stages(&mut registry).unwrap_err();
    assert!(matches!(err, PipelineError::DuplicateName { .. }));
}

#[test]
fn description_rejects_normalize_without_mode() {
    let mut registry = StageRegistry::new();
    register_builtin_stages(&mut registry).expect("fresh registry");
    let raw = format!(
        r#"
[[stage]]
id = "pv"
stage = "csv_source"
params = {{ pattern = "{pv}", source = "pv" }}

[[stage]]
id = "norm"
stage = "normalize"
inputs = ["pv"]
"#,
        pv = fixture_glob("pv"),
    );
    let description = PipelineDescription::from_toml_str(&raw).expect("valid toml");
    let err = assemble(&registry, &description).unwrap_err();
    assert!(matches!(err, PipelineError::Configuration { .. }));
}

#[test]
fn zip_time_description_merges_sources() {
    let mut registry = StageRegistry::new();
    register_builtin_stages(&mut registry).expect("fresh registry");
    let raw = format!(
        r#"
pipeline = "pv_and_irradiance"

[[stage]]
id = "pv"
stage = "csv_source"
params = {{ pattern = "{pv}", source = "pv" }}

[[stage]]
id = "irr"
stage = "csv_source"
params = {{ pattern = "{irr}", source = "irr" }}

[[stage]]
id = "merged"
stage = "zip_time"
inputs = ["pv", "irr"]
"#,
        pv = fixture_glob("pv"),
        irr = fixture_glob("irr"),
    );
    let description = PipelineDescription::from_toml_str(&raw).expect("valid toml");
    let graph = assemble(&registry, &description).expect("assembles");

    for _epoch in 0..2 {
        let merged: Vec<TimeSeriesFrame> = graph
            .iterate(&WorkerContext::default())
            .expect("epoch")
            .map(|item| item.expect("record").into_frame("test").expect("frame"))
            .collect();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].source, "pv+irr");
        assert_eq!(
            merged[0].value_columns(),
            vec![
                "pv_generation_mw".to_string(),
                "pv_capacity_mwp".to_string(),
                "irr_irradiance_wm2".to_string(),
            ]
        );
        let irradiance = column_values(&merged[2], "irr_irradiance_wm2");
        assert_eq!(
            irradiance,
            vec![Some(120.0), Some(220.0), Some(320.0), Some(420.0)]
        );
    }
}

#[test]
fn full_chain_description_produces_training_batches() {
    let mut registry = StageRegistry::new();
    register_builtin_stages(&mut registry).expect("fresh registry");
    let raw = format!(
        r#"
pipeline = "pv_training"

[[stage]]
id = "pv"
stage = "csv_source"
params = {{ pattern = "{pv}", source = "pv" }}

[[stage]]
id = "recent"
stage = "select_time_slice"
inputs = ["pv"]
params = {{ history_minutes = 30 }}

[[stage]]
id = "scaled"
stage = "normalize"
inputs = ["recent"]
params = {{ max_value = 10.0 }}

[[stage]]
id = "samples"
stage = "convert_batch"
inputs = ["scaled"]
params = {{ columns = ["generation_mw"] }}

[[stage]]
id = "batched"
stage = "stack_batches"
inputs = ["samples"]
params = {{ count = 3 }}
"#,
        pv = fixture_glob("pv"),
    );
    let description = PipelineDescription::from_toml_str(&raw).expect("valid toml");
    let graph = assemble(&registry, &description).expect("assembles");

    let batches: Vec<SampleBatch> = graph
        .iterate(&WorkerContext::default())
        .expect("epoch")
        .map(|item| item.expect("record").into_batch("test").expect("batch"))
        .collect();

    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].rows, 6);
    assert_eq!(batches[0].width, 1);
    assert_eq!(batches[0].t0s.len(), 3);
    assert!(close(batches[0].values[0] as f64, 0.3));
    assert!(close(batches[0].values[1] as f64, 0.4));
    assert!(batches[0].values[2].is_nan());
    assert!(close(batches[0].values[3] as f64, 0.8));
    assert!(close(batches[0].values[5] as f64, 1.2));
}
